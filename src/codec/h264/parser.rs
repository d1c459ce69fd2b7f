// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 syntax structures, as filled by the bitstream parser.
//!
//! Parsing itself happens outside of this crate. Only the syntax elements that reference picture
//! management and output need are represented here, with the names they have in the
//! specification.

use std::rc::Rc;

use enumn::N;

use crate::codec::h264::picture::Field;

/// Maximum number of frames the DPB can hold, as per Annex A.
pub const DPB_MAX_SIZE: usize = 16;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value indicating "no long-term frame indices".
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// Values of `memory_management_control_operation`. See table 7-9.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MmcoOp {
    End = 0,
    MarkShortTermUnused = 1,
    MarkLongTermUnused = 2,
    AssignLongTermFrameIdx = 3,
    SetMaxLongTermFrameIdx = 4,
    MarkAllUnused = 5,
    MarkCurrentLongTerm = 6,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Specifies a control operation to be applied to affect the reference picture marking, see
    /// [`MmcoOp`].
    pub memory_management_control_operation: u8,

    /// Used (with memory_management_control_operation equal to 3 or 1) to assign a long-term
    /// frame index to a short-term reference picture or to mark a short-term reference picture as
    /// "unused for reference".
    pub difference_of_pic_nums_minus1: u32,

    /// Used (with memory_management_control_operation equal to 2) to mark a long-term reference
    /// picture as "unused for reference".
    pub long_term_pic_num: u32,

    /// Used (with memory_management_control_operation equal to 3 or 6) to assign a long-term
    /// frame index to a picture.
    pub long_term_frame_idx: u32,

    /// Specifies the maximum value of long-term frame index allowed for long-term reference
    /// pictures (until receipt of another value of `max_long_term_frame_idx_plus1`).
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

impl RefPicMarkingInner {
    pub fn op(&self) -> Option<MmcoOp> {
        MmcoOp::n(self.memory_management_control_operation)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture buffer are treated
    /// after decoding of an IDR picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// If set, the current IDR picture is marked "used for long-term reference" and is assigned
    /// `LongTermFrameIdx` equal to 0.
    pub long_term_reference_flag: bool,

    /// Selects the reference picture marking mode of the currently decoded picture as specified in
    /// Table 7-8.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// The memory management control operations, in syntax order.
    pub inner: Vec<RefPicMarkingInner>,
}

impl RefPicMarking {
    /// Whether one of the operations is a `MarkAllUnused` one.
    pub fn has_mmco_5(&self) -> bool {
        self.adaptive_ref_pic_marking_mode_flag
            && self
                .inner
                .iter()
                .any(|m| m.op() == Some(MmcoOp::MarkAllUnused))
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 of ITU-T H.264.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Builds a slice type from the value of `slice_type`, which can be above 4.
    pub fn from_value(slice_type: u8) -> Option<Self> {
        Self::n(slice_type % 5)
    }

    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }

    /// Whether slices of this type use reference picture list 0.
    pub fn uses_list0(&self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp | SliceType::B)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub bitstream_restriction_flag: bool,
    /// Maximum number of frames preceding any frame in decoding order and following it in output
    /// order.
    pub max_num_reorder_frames: u32,
    /// Required size of the DPB in frames.
    pub max_dec_frame_buffering: u32,
}

/// A H264 Sequence Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub level_idc: Level,

    pub log2_max_frame_num_minus4: u8,

    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,

    // Calculated
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Size of a picture in macroblocks.
    pub const fn pic_size_in_mbs(&self) -> u32 {
        (self.width() / 16) * (self.height() / 16)
    }

    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    fn bitstream_restriction(&self) -> Option<&VuiParams> {
        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            Some(&self.vui_parameters)
        } else {
            None
        }
    }

    /// Size of the DPB in frames, from table A-1 and the VUI.
    pub fn max_dpb_frames(&self) -> usize {
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(level, Level::L1_1)
            && (self.profile_idc == 66 || self.profile_idc == 77)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        };

        // Table A.1
        let max_dpb_mbs = match level {
            Level::L1 => 396,
            Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        };

        let max_dpb_frames = std::cmp::min(
            max_dpb_mbs / self.pic_size_in_mbs().max(1),
            DPB_MAX_SIZE as u32,
        ) as usize;

        let mut max_dpb_frames = std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize);

        if let Some(vui) = self.bitstream_restriction() {
            max_dpb_frames = std::cmp::max(1, vui.max_dec_frame_buffering as usize);
        }

        max_dpb_frames.min(DPB_MAX_SIZE)
    }

    /// Number of frames that may precede any frame in decoding order and follow it in output
    /// order.
    pub fn max_num_reorder_frames(&self) -> u32 {
        match self.bitstream_restriction() {
            Some(vui) => vui.max_num_reorder_frames,
            None => self.max_dpb_frames() as u32,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// Specifies the coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,

    pub pic_parameter_set_id: u8,

    /// Used as an identifier for pictures and shall be represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,

    /// If set, specifies that the slice is a slice of a coded field.
    pub field_pic_flag: bool,

    /// If set, specifies that the slice is part of a coded bottom field.
    pub bottom_field_flag: bool,

    pub idr_pic_id: u16,

    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    /// Decoded reference picture marking parsed using 7.3.3.3
    pub dec_ref_pic_marking: RefPicMarking,

    /// Same as `MaxPicNum` in ITU-T H.264.
    pub max_pic_num: u32,
}

impl SliceHeader {
    /// Returns the field that is coded by this header.
    pub fn field(&self) -> Field {
        if self.field_pic_flag {
            if self.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        }
    }
}

/// A H264 slice, together with the parameter set it refers to.
#[derive(Clone, Debug)]
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub sps: Rc<Sps>,
    /// `nal_ref_idc` of the NAL unit carrying the slice.
    pub nal_ref_idc: u8,
    /// Whether the NAL unit is an IDR slice.
    pub idr: bool,
    /// View of the slice in a multiview stream, 0 for the base view.
    pub view_id: u32,
    /// Slice data, handed as-is to the hardware.
    pub data: &'a [u8],
}
