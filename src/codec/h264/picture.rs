// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::parser::RefPicMarking;
use crate::decoder::fb_list::BufferId;
use crate::decoder::fb_list::BufferRef;
use crate::decoder::fb_list::HwOutput;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity.
    pub fn opposite(&self) -> Option<Self> {
        match *self {
            Field::Frame => None,
            Field::Top => Some(Field::Bottom),
            Field::Bottom => Some(Field::Top),
        }
    }

    /// Index of the field in per-field arrays, `None` for frames.
    pub fn index(&self) -> Option<usize> {
        match *self {
            Field::Frame => None,
            Field::Top => Some(0),
            Field::Bottom => Some(1),
        }
    }

    /// Fields of a buffer covered by this picture structure.
    pub fn mask(&self) -> HwOutput {
        match *self {
            Field::Frame => HwOutput::FRAME,
            Field::Top => HwOutput::FIELD_TOP,
            Field::Bottom => HwOutput::FIELD_BOT,
        }
    }

    /// Indices of the fields covered by this picture structure.
    pub fn indices(&self) -> &'static [usize] {
        match *self {
            Field::Frame => &[0, 1],
            Field::Top => &[0],
            Field::Bottom => &[1],
        }
    }
}

/// Reference marking of one field of a DPB entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RefStatus {
    /// Decoded, but not used for reference.
    Unused,
    /// Inferred from a gap in `frame_num`. Counts as a short-term reference, but has no buffer.
    NonExisting,
    ShortTerm,
    LongTerm,
    /// Nothing decoded.
    #[default]
    Empty,
}

impl RefStatus {
    pub fn is_short_term(&self) -> bool {
        matches!(self, RefStatus::ShortTerm | RefStatus::NonExisting)
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self, RefStatus::LongTerm)
    }

    pub fn is_reference(&self) -> bool {
        self.is_short_term() || self.is_long_term()
    }

    /// Whether the field is a reference backed by actual picture data.
    pub fn is_existing_reference(&self) -> bool {
        matches!(self, RefStatus::ShortTerm | RefStatus::LongTerm)
    }
}

/// An entry of the DPB, holding a frame or a pair of fields.
#[derive(Debug, Default)]
pub struct DpbPicture {
    /// Buffer the picture is decoded into. `None` for non-existing frames.
    pub mem_idx: Option<BufferId>,
    /// `PicNum` of each field, or of the frame in both elements when decoding frames.
    pub pic_num: [i32; 2],
    pub frame_num: u32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: u32,
    /// `LongTermPicNum` of each field, or of the frame in both elements when decoding frames.
    pub long_term_pic_num: [i32; 2],
    pub pic_order_cnt: [i32; 2],
    pub status: [RefStatus; 2],
    /// Fields decoded so far.
    pub fields: HwOutput,
    pub to_be_displayed: bool,
    pub is_idr: bool,
    pub decode_id: u32,
    pub timestamp: u64,
    pub num_err_mbs: u32,
    /// Decoded from a damaged reference set.
    pub concealed: bool,
    /// HRD output time, if the stream carries timing information.
    pub output_time: Option<u64>,
    pub view_id: u32,
    /// Held while any field is an existing reference.
    pub(crate) reference: Option<BufferRef>,
    /// Held while the picture waits for output.
    pub(crate) display: Option<BufferRef>,
}

impl DpbPicture {
    /// Whether nothing is stored in this entry.
    pub fn is_empty(&self) -> bool {
        self.status.iter().all(|s| *s == RefStatus::Empty)
    }

    pub fn is_non_existing(&self) -> bool {
        self.status.iter().any(|s| *s == RefStatus::NonExisting)
    }

    /// Whether any field is used for reference.
    pub fn is_reference(&self) -> bool {
        self.status.iter().any(RefStatus::is_reference)
    }

    pub fn is_short_term(&self) -> bool {
        self.status.iter().any(RefStatus::is_short_term)
    }

    pub fn is_long_term(&self) -> bool {
        self.status.iter().any(RefStatus::is_long_term)
    }

    /// Whether both fields are short-term references.
    pub fn is_short_term_frame(&self) -> bool {
        self.status.iter().all(RefStatus::is_short_term)
    }

    /// Whether both fields are long-term references.
    pub fn is_long_term_frame(&self) -> bool {
        self.status.iter().all(RefStatus::is_long_term)
    }

    /// Whether both fields have been decoded.
    pub fn is_complete(&self) -> bool {
        self.fields.contains(HwOutput::FRAME)
    }

    /// Picture order count of the entry, i.e. the lowest one among the decoded fields.
    pub fn poc(&self) -> i32 {
        match (
            self.fields.contains(HwOutput::FIELD_TOP),
            self.fields.contains(HwOutput::FIELD_BOT),
        ) {
            (true, false) => self.pic_order_cnt[0],
            (false, true) => self.pic_order_cnt[1],
            _ => self.pic_order_cnt[0].min(self.pic_order_cnt[1]),
        }
    }

    /// Picture order count among the fields currently used for reference, as used to order
    /// fields for B slices.
    pub fn ref_poc(&self, long_term: bool) -> Option<i32> {
        self.status
            .iter()
            .zip(self.pic_order_cnt.iter())
            .filter(|(s, _)| {
                if long_term {
                    s.is_long_term()
                } else {
                    s.is_short_term()
                }
            })
            .map(|(_, poc)| *poc)
            .min()
    }

    /// Marks `field` with `status`.
    pub fn set_status(&mut self, field: Field, status: RefStatus) {
        for &i in field.indices() {
            self.status[i] = status;
        }
    }

    /// Marks every reference field of the entry as unused.
    pub fn unmark(&mut self) {
        for status in self.status.iter_mut() {
            if status.is_reference() {
                *status = RefStatus::Unused;
            }
        }
    }

    /// `PicNum` of a field of parity `parity`, seen from a field of parity `current`.
    pub fn field_pic_num(&self, parity: Field, current: Field) -> i32 {
        if parity == current {
            2 * self.frame_num_wrap + 1
        } else {
            2 * self.frame_num_wrap
        }
    }

    /// `LongTermPicNum` of a field of parity `parity`, seen from a field of parity `current`.
    pub fn field_long_term_pic_num(&self, parity: Field, current: Field) -> i32 {
        if parity == current {
            2 * self.long_term_frame_idx as i32 + 1
        } else {
            2 * self.long_term_frame_idx as i32
        }
    }
}

/// Reference to a picture of the DPB from a reference picture list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefPic {
    /// Index of the entry in the DPB.
    pub index: usize,
    /// Referenced field, or `Field::Frame` for the whole frame.
    pub field: Field,
}

/// A reference picture list, `None` standing for "no reference picture".
pub type RefPicList = Vec<Option<RefPic>>;

/// Description of the picture being decoded, as needed by the marking and storage processes.
#[derive(Clone, Debug, Default)]
pub struct CurrentPicture {
    pub frame_num: u32,
    pub field: Field,
    /// Top and bottom field order counts. Only the relevant one is used for field pictures.
    pub pic_order_cnt: [i32; 2],
    pub is_idr: bool,
    /// Whether `nal_ref_idc` is not 0.
    pub is_reference: bool,
    pub marking: RefPicMarking,
    pub decode_id: u32,
    pub timestamp: u64,
    pub num_err_mbs: u32,
    pub concealed: bool,
    pub output_time: Option<u64>,
    pub view_id: u32,
}

impl CurrentPicture {
    /// Picture order count of the current picture, as used by list initialization.
    pub fn poc(&self) -> i32 {
        match self.field {
            Field::Frame => self.pic_order_cnt[0].min(self.pic_order_cnt[1]),
            Field::Top => self.pic_order_cnt[0],
            Field::Bottom => self.pic_order_cnt[1],
        }
    }
}

/// A picture leaving the DPB in output order.
#[derive(Debug)]
pub struct DpbOutPicture {
    /// Keeps the buffer out of the pool until the picture reaches the output FIFO.
    pub buffer: BufferRef,
    /// Output counter of the DPB.
    pub pic_id: u32,
    pub decode_id: u32,
    pub timestamp: u64,
    pub pic_order_cnt: i32,
    pub is_idr: bool,
    /// Fields decoded into the buffer.
    pub fields: HwOutput,
    pub interlaced: bool,
    pub num_err_mbs: u32,
    pub concealed: bool,
    pub view_id: u32,
}

impl DpbOutPicture {
    pub fn id(&self) -> BufferId {
        self.buffer.id()
    }
}
