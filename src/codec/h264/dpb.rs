// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 decoded picture buffer.
//!
//! Pictures live in an arena of `dpb_size + 1` entries, the extra entry holding the picture being
//! decoded. Reference picture lists are lists of indices into that arena. Pictures leaving the
//! DPB in output order are queued in an output ring, from which the decoder moves them to the
//! output FIFO of the [`FrameBufferList`].

use std::cmp::Reverse;

use log::debug;
use thiserror::Error;

use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::MmcoOp;
use crate::codec::h264::parser::RefPicListModification;
use crate::codec::h264::parser::SliceType;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::DPB_MAX_SIZE;
use crate::codec::h264::picture::CurrentPicture;
use crate::codec::h264::picture::DpbOutPicture;
use crate::codec::h264::picture::DpbPicture;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::RefPic;
use crate::codec::h264::picture::RefPicList;
use crate::codec::h264::picture::RefStatus;
use crate::decoder::fb_list::BufferId;
use crate::decoder::fb_list::FrameBufferList;
use crate::decoder::fb_list::HwOutput;
use crate::decoder::fb_list::ListError;
use crate::decoder::BlockingMode;

/// Errors of the decoded reference picture marking process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MmcoError {
    #[error("no short-term reference picture with PicNum {0}")]
    NoShortTermPicture(i32),
    #[error("no long-term reference picture with LongTermPicNum {0}")]
    NoLongTermPicture(i32),
    #[error("LongTermFrameIdx {idx} is above MaxLongTermFrameIdx {max:?}")]
    LongTermFrameIdxTooLarge { idx: u32, max: MaxLongTermFrameIdx },
    #[error("invalid memory_management_control_operation {0}")]
    InvalidOperation(u8),
    #[error("difference_of_pic_nums_minus1 {0} is out of range")]
    InvalidPicNumDifference(u32),
    #[error("no short-term reference picture left for the sliding window")]
    SlidingWindowEmpty,
    #[error("{count} reference frames, the stream allows {max}")]
    TooManyReferences { count: usize, max: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DpbError {
    #[error("the DPB is not initialized")]
    NotInitialized,
    #[error("invalid DPB size {0}")]
    InvalidSize(usize),
    #[error("invalid MaxFrameNum {0}")]
    InvalidMaxFrameNum(u32),
    #[error("no picture is being decoded")]
    NoCurrentPicture,
    #[error("no free DPB entry")]
    NoFreeEntry,
    #[error("the output ring is full")]
    OutputOverflow,
    #[error("gap in frame_num: {prev} followed by {curr}")]
    FrameNumGap { prev: u32, curr: u32 },
    #[error("reference picture with the same frame_num {0} as the previous one")]
    DuplicateFrameNum(u32),
    #[error("reordering refers to a missing short-term picture, PicNum {0}")]
    ReorderMissingShortTerm(i32),
    #[error("reordering refers to a missing long-term picture, LongTermPicNum {0}")]
    ReorderMissingLongTerm(i32),
    #[error("invalid modification_of_pic_nums_idc {0}")]
    InvalidModification(u8),
    #[error("abs_diff_pic_num_minus1 {0} is out of range")]
    InvalidAbsDiffPicNum(u32),
    #[error("more reordering commands than reference indices")]
    TooManyModifications,
    #[error("{count} reference pictures missing among the active entries")]
    MissingReferences { count: usize },
    #[error(transparent)]
    Mmco(#[from] MmcoError),
    #[error(transparent)]
    List(#[from] ListError),
}

/// Parameters of the DPB, usually derived from the active SPS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DpbParams {
    pub dpb_size: usize,
    /// `max_num_ref_frames`. Values below 1 are treated as 1.
    pub max_ref_frames: u32,
    pub max_frame_num: u32,
    /// Output every picture as soon as it is decoded.
    pub no_reordering: bool,
    pub num_reorder_frames: u32,
    pub interlaced: bool,
}

impl DpbParams {
    pub fn from_sps(sps: &Sps, no_reordering: bool) -> Self {
        let dpb_size = sps.max_dpb_frames();

        Self {
            dpb_size,
            max_ref_frames: u32::from(sps.max_num_ref_frames),
            max_frame_num: sps.max_frame_num(),
            no_reordering,
            num_reorder_frames: sps.max_num_reorder_frames().min(dpb_size as u32),
            interlaced: !sps.frame_mbs_only_flag,
        }
    }
}

/// Ring of pictures waiting to be moved to the output FIFO.
#[derive(Debug, Default)]
struct OutputRing {
    out_buf: Vec<Option<DpbOutPicture>>,
    out_index_w: usize,
    out_index_r: usize,
    num_out: usize,
}

impl OutputRing {
    fn new(capacity: usize) -> Self {
        Self {
            out_buf: (0..capacity).map(|_| None).collect(),
            ..Default::default()
        }
    }

    fn is_full(&self) -> bool {
        self.num_out == self.out_buf.len()
    }

    /// Must not be called on a full ring.
    fn push(&mut self, pic: DpbOutPicture) {
        self.out_buf[self.out_index_w] = Some(pic);
        self.out_index_w = (self.out_index_w + 1) % self.out_buf.len();
        self.num_out += 1;
    }

    fn pop(&mut self) -> Option<DpbOutPicture> {
        if self.num_out == 0 {
            return None;
        }

        let pic = self.out_buf[self.out_index_r].take();
        self.out_index_r = (self.out_index_r + 1) % self.out_buf.len();
        self.num_out -= 1;
        pic
    }

    fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.out_buf.iter().flatten().map(DpbOutPicture::id)
    }

    fn clear(&mut self) {
        while self.pop().is_some() {}
        self.out_index_w = 0;
        self.out_index_r = 0;
    }
}

#[derive(Clone, Copy, Debug)]
struct CurrentEntry {
    index: usize,
    /// Whether the picture is the second field of the entry.
    second_field: bool,
}

#[derive(Debug)]
pub struct Dpb {
    /// `dpb_size + 1` entries once initialized.
    buffer: Vec<DpbPicture>,
    out: OutputRing,
    fb_list: FrameBufferList,
    /// Entry the picture being decoded goes into.
    current: Option<CurrentEntry>,
    /// Stored first field still waiting for its second field.
    pending_field: Option<usize>,
    dpb_size: usize,
    max_ref_frames: u32,
    max_frame_num: u32,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    num_ref_frames: u32,
    /// Number of stored entries.
    fullness: usize,
    prev_ref_frame_num: u32,
    last_contains_mmco5: bool,
    no_reordering: bool,
    num_reorder_frames: u32,
    bumping_flag: bool,
    flushed: bool,
    interlaced: bool,
    /// Set by error recovery until the next IDR picture.
    concealing: bool,
    next_pic_id: u32,
}

impl Dpb {
    pub fn new(fb_list: FrameBufferList) -> Self {
        Self {
            buffer: Vec::new(),
            out: OutputRing::default(),
            fb_list,
            current: None,
            pending_field: None,
            dpb_size: 0,
            max_ref_frames: 0,
            max_frame_num: 0,
            max_long_term_frame_idx: Default::default(),
            num_ref_frames: 0,
            fullness: 0,
            prev_ref_frame_num: 0,
            last_contains_mmco5: false,
            no_reordering: false,
            num_reorder_frames: 0,
            bumping_flag: false,
            flushed: false,
            interlaced: false,
            concealing: false,
            next_pic_id: 0,
        }
    }

    /// (Re)initializes the DPB, dropping everything it holds, including pictures not yet taken
    /// from the output ring.
    pub fn init(&mut self, params: DpbParams) -> Result<(), DpbError> {
        if params.dpb_size == 0 || params.dpb_size > DPB_MAX_SIZE {
            return Err(DpbError::InvalidSize(params.dpb_size));
        }

        if params.max_frame_num < 16 || !params.max_frame_num.is_power_of_two() {
            return Err(DpbError::InvalidMaxFrameNum(params.max_frame_num));
        }

        self.reset();

        let max_ref_frames = params.max_ref_frames.clamp(1, DPB_MAX_SIZE as u32);
        let dpb_size = params.dpb_size.max(max_ref_frames as usize);

        self.buffer = (0..=dpb_size).map(|_| DpbPicture::default()).collect();
        self.out = OutputRing::new(dpb_size + 1);
        self.dpb_size = dpb_size;
        self.max_ref_frames = max_ref_frames;
        self.max_frame_num = params.max_frame_num;
        self.no_reordering = params.no_reordering;
        self.num_reorder_frames = params.num_reorder_frames.min(dpb_size as u32);
        self.interlaced = params.interlaced;

        debug!(
            "DPB initialized: size {}, {} reference frames, {} reorder frames",
            dpb_size, max_ref_frames, self.num_reorder_frames
        );

        Ok(())
    }

    /// Drops every picture, including the ones in the output ring, and resets the marking state.
    pub fn reset(&mut self) {
        self.release_current();
        for pic in self.buffer.iter_mut() {
            *pic = DpbPicture::default();
        }
        self.out.clear();

        self.pending_field = None;
        self.fullness = 0;
        self.num_ref_frames = 0;
        self.prev_ref_frame_num = 0;
        self.last_contains_mmco5 = false;
        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        self.bumping_flag = false;
        self.flushed = false;
        self.concealing = false;
    }

    pub fn is_initialized(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn dpb_size(&self) -> usize {
        self.dpb_size
    }

    pub fn max_ref_frames(&self) -> u32 {
        self.max_ref_frames
    }

    pub fn fullness(&self) -> usize {
        self.fullness
    }

    pub fn num_ref_frames(&self) -> u32 {
        self.num_ref_frames
    }

    pub fn max_long_term_frame_idx(&self) -> MaxLongTermFrameIdx {
        self.max_long_term_frame_idx
    }

    pub fn prev_ref_frame_num(&self) -> u32 {
        self.prev_ref_frame_num
    }

    /// Whether the last marked picture contained a `MarkAllUnused` operation.
    pub fn last_contains_mmco5(&self) -> bool {
        self.last_contains_mmco5
    }

    pub fn bumping_flag(&self) -> bool {
        self.bumping_flag
    }

    pub fn flushed(&self) -> bool {
        self.flushed
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn concealing(&self) -> bool {
        self.concealing
    }

    pub fn fb_list(&self) -> &FrameBufferList {
        &self.fb_list
    }

    pub fn picture(&self, index: usize) -> Option<&DpbPicture> {
        self.buffer.get(index)
    }

    /// Non-empty entries with their index.
    pub fn pictures(&self) -> impl Iterator<Item = (usize, &DpbPicture)> {
        self.buffer.iter().enumerate().filter(|(_, p)| !p.is_empty())
    }

    /// Buffer of the picture referenced by `pic`, `None` for non-existing frames.
    pub fn ref_buffer(&self, pic: RefPic) -> Option<BufferId> {
        self.buffer.get(pic.index)?.mem_idx
    }

    /// Number of pictures waiting in the output ring.
    pub fn num_out(&self) -> usize {
        self.out.num_out
    }

    /// Takes the next picture of the output ring.
    pub fn output_picture(&mut self) -> Option<DpbOutPicture> {
        self.out.pop()
    }

    fn current_index(&self) -> Option<usize> {
        self.current.map(|c| c.index)
    }

    fn free_entry(&self) -> Option<usize> {
        let current = self.current_index();
        (0..self.buffer.len()).find(|&i| self.buffer[i].is_empty() && Some(i) != current)
    }

    fn count_ref_frames(&self) -> usize {
        self.buffer.iter().filter(|p| p.is_reference()).count()
    }

    /// Claims a buffer and an entry for a new frame or first field.
    ///
    /// Buffers still held by the DPB or waiting in the output ring are avoided when possible, so
    /// that a picture is not decoded into the buffer it was just displayed from.
    pub fn allocate_image(&mut self, mode: BlockingMode) -> Result<BufferId, DpbError> {
        if !self.is_initialized() {
            return Err(DpbError::NotInitialized);
        }

        if self.current.is_some() {
            log::warn!("previous picture was never stored, dropping it");
            self.release_current();
        }

        // A field left unpaired until now stays unpaired.
        self.pending_field = None;
        self.flushed = false;

        let index = self.free_entry().ok_or(DpbError::NoFreeEntry)?;
        let avoid: Vec<BufferId> = self
            .buffer
            .iter()
            .filter_map(|p| p.mem_idx)
            .chain(self.out.ids())
            .collect();

        let (id, waited) = self.fb_list.get_free_pic_buffer(&avoid, mode)?;
        if waited {
            debug!("had to wait for a free picture buffer");
        }

        self.buffer[index] = DpbPicture {
            mem_idx: Some(id),
            ..Default::default()
        };
        self.current = Some(CurrentEntry {
            index,
            second_field: false,
        });

        debug!("decoding into buffer {:?}, DPB entry {}", id, index);

        Ok(id)
    }

    /// Makes the field awaiting its pair the target of the second field `field`, if they match.
    ///
    /// Returns the buffer of the first field, or `None` if the picture must be decoded as a new
    /// one.
    pub fn attach_second_field(
        &mut self,
        frame_num: u32,
        field: Field,
        is_reference: bool,
    ) -> Option<BufferId> {
        let index = self.pending_field?;
        let pic = &self.buffer[index];

        if field == Field::Frame
            || pic.frame_num != frame_num
            || pic.fields.intersects(field.mask())
            || pic.is_reference() != is_reference
        {
            return None;
        }

        let mem_idx = pic.mem_idx?;
        if self.current.is_some() {
            self.release_current();
        }

        // The buffer is held through the references of the first field only.
        if let Err(e) = self.fb_list.allocate_id_used(mem_idx) {
            log::warn!("cannot decode the second field into {:?}: {}", mem_idx, e);
            return None;
        }

        self.current = Some(CurrentEntry {
            index,
            second_field: true,
        });

        Some(mem_idx)
    }

    /// Gives up the picture being decoded, returning its buffer to the pool. The first field of a
    /// second field being decoded is kept.
    pub fn release_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };

        let pic = &mut self.buffer[current.index];
        if let Some(id) = pic.mem_idx {
            if let Err(e) = self.fb_list.release_id(id) {
                log::error!("failed to release buffer {:?}: {}", id, e);
            }
        }

        if !current.second_field {
            *pic = DpbPicture::default();
        }
    }

    /// Computes `FrameNumWrap`, `PicNum` and `LongTermPicNum` of every reference picture for the
    /// picture with `curr_frame_num` and structure `field`, as per 8.2.4.1.
    pub fn set_pic_nums(&mut self, curr_frame_num: u32, field: Field) {
        let max_frame_num = self.max_frame_num as i32;

        for pic in self.buffer.iter_mut().filter(|p| p.is_reference()) {
            if pic.is_short_term() {
                pic.frame_num_wrap = if pic.frame_num > curr_frame_num {
                    pic.frame_num as i32 - max_frame_num
                } else {
                    pic.frame_num as i32
                };
            }

            match field {
                Field::Frame => {
                    pic.pic_num = [pic.frame_num_wrap; 2];
                    pic.long_term_pic_num = [pic.long_term_frame_idx as i32; 2];
                }
                _ => {
                    for (i, parity) in [Field::Top, Field::Bottom].into_iter().enumerate() {
                        pic.pic_num[i] = pic.field_pic_num(parity, field);
                        pic.long_term_pic_num[i] = pic.field_long_term_pic_num(parity, field);
                    }
                }
            }
        }
    }

    fn find_short_term(
        &self,
        pic_num: i32,
        field: Field,
        allow_non_existing: bool,
    ) -> Option<RefPic> {
        let usable = |s: &RefStatus| {
            if allow_non_existing {
                s.is_short_term()
            } else {
                *s == RefStatus::ShortTerm
            }
        };

        self.find_in_fields(field, |pic, i| {
            usable(&pic.status[i]) && pic.pic_num[i] == pic_num
        })
    }

    fn find_long_term(&self, long_term_pic_num: i32, field: Field) -> Option<RefPic> {
        self.find_in_fields(field, |pic, i| {
            pic.status[i].is_long_term() && pic.long_term_pic_num[i] == long_term_pic_num
        })
    }

    /// Finds a frame whose both fields match, or a single matching field when decoding fields.
    fn find_in_fields<F>(&self, field: Field, matches: F) -> Option<RefPic>
    where
        F: Fn(&DpbPicture, usize) -> bool,
    {
        match field {
            Field::Frame => self
                .buffer
                .iter()
                .position(|p| matches(p, 0) && matches(p, 1))
                .map(|index| RefPic {
                    index,
                    field: Field::Frame,
                }),
            _ => self.buffer.iter().enumerate().find_map(|(index, p)| {
                [Field::Top, Field::Bottom]
                    .into_iter()
                    .enumerate()
                    .find(|&(i, _)| matches(p, i))
                    .map(|(_, parity)| RefPic {
                        index,
                        field: parity,
                    })
            }),
        }
    }

    /// Builds the initial reference picture lists of 8.2.4.2 for a slice of `slice_type`.
    ///
    /// The lists are returned whole. [`Dpb::reorder_ref_pic_list`] sizes them to the number of
    /// active references.
    pub fn init_ref_pic_list(
        &self,
        slice_type: SliceType,
        field: Field,
        curr_poc: i32,
    ) -> (RefPicList, RefPicList) {
        let (list0, list1) = if slice_type.is_b() {
            self.init_b_lists(field, curr_poc)
        } else if slice_type.uses_list0() {
            (self.init_p_list(field), vec![])
        } else {
            (vec![], vec![])
        };

        (
            list0.into_iter().map(Some).collect(),
            list1.into_iter().map(Some).collect(),
        )
    }

    fn indices_where<F>(&self, pred: F) -> Vec<usize>
    where
        F: Fn(&DpbPicture) -> bool,
    {
        (0..self.buffer.len())
            .filter(|&i| pred(&self.buffer[i]))
            .collect()
    }

    fn as_frames(indices: &[usize]) -> impl Iterator<Item = RefPic> + '_ {
        indices.iter().map(|&index| RefPic {
            index,
            field: Field::Frame,
        })
    }

    fn init_p_list(&self, field: Field) -> Vec<RefPic> {
        match field {
            Field::Frame => {
                let mut short = self.indices_where(DpbPicture::is_short_term_frame);
                short.sort_by_key(|&i| Reverse(self.buffer[i].pic_num[0]));

                let mut long = self.indices_where(DpbPicture::is_long_term_frame);
                long.sort_by_key(|&i| self.buffer[i].long_term_pic_num[0]);

                Self::as_frames(&short)
                    .chain(Self::as_frames(&long))
                    .collect()
            }
            _ => {
                let mut short = self.indices_where(DpbPicture::is_short_term);
                short.sort_by_key(|&i| Reverse(self.buffer[i].frame_num_wrap));

                let mut long = self.indices_where(DpbPicture::is_long_term);
                long.sort_by_key(|&i| self.buffer[i].long_term_frame_idx);

                let mut list = self.alternate_fields(&short, field, RefStatus::is_short_term);
                list.extend(self.alternate_fields(&long, field, RefStatus::is_long_term));
                list
            }
        }
    }

    fn init_b_lists(&self, field: Field, curr_poc: i32) -> (Vec<RefPic>, Vec<RefPic>) {
        let (list0, mut list1) = match field {
            Field::Frame => {
                let short =
                    self.indices_where(|p| p.is_short_term_frame() && !p.is_non_existing());
                let (before, after) =
                    self.split_by_poc(&short, |poc| poc < curr_poc, |p| Some(p.poc()));

                let mut long = self.indices_where(DpbPicture::is_long_term_frame);
                long.sort_by_key(|&i| self.buffer[i].long_term_pic_num[0]);

                let list0: Vec<RefPic> = Self::as_frames(&before)
                    .chain(Self::as_frames(&after))
                    .chain(Self::as_frames(&long))
                    .collect();
                let list1: Vec<RefPic> = Self::as_frames(&after)
                    .chain(Self::as_frames(&before))
                    .chain(Self::as_frames(&long))
                    .collect();

                (list0, list1)
            }
            _ => {
                let short = self.indices_where(|p| p.is_short_term() && !p.is_non_existing());
                let (before, after) =
                    self.split_by_poc(&short, |poc| poc <= curr_poc, |p| p.ref_poc(false));

                let mut long = self.indices_where(DpbPicture::is_long_term);
                long.sort_by_key(|&i| self.buffer[i].long_term_frame_idx);
                let long = self.alternate_fields(&long, field, RefStatus::is_long_term);

                let frames0: Vec<usize> = before.iter().chain(after.iter()).copied().collect();
                let frames1: Vec<usize> = after.iter().chain(before.iter()).copied().collect();

                let mut list0 = self.alternate_fields(&frames0, field, RefStatus::is_short_term);
                list0.extend(long.iter().copied());
                let mut list1 = self.alternate_fields(&frames1, field, RefStatus::is_short_term);
                list1.extend(long);

                (list0, list1)
            }
        };

        if list1.len() > 1 && list0 == list1 {
            list1.swap(0, 1);
        }

        (list0, list1)
    }

    /// Splits `indices` into the entries whose POC satisfies `is_before`, by descending POC, and
    /// the others, by ascending POC.
    fn split_by_poc<B, P>(
        &self,
        indices: &[usize],
        is_before: B,
        poc_of: P,
    ) -> (Vec<usize>, Vec<usize>)
    where
        B: Fn(i32) -> bool,
        P: Fn(&DpbPicture) -> Option<i32>,
    {
        let mut with_poc: Vec<(usize, i32)> = indices
            .iter()
            .filter_map(|&i| poc_of(&self.buffer[i]).map(|poc| (i, poc)))
            .collect();
        with_poc.sort_by_key(|&(_, poc)| poc);

        let (mut before, after): (Vec<_>, Vec<_>) =
            with_poc.into_iter().partition(|&(_, poc)| is_before(poc));
        before.reverse();

        (
            before.into_iter().map(|(i, _)| i).collect(),
            after.into_iter().map(|(i, _)| i).collect(),
        )
    }

    /// Orders the fields of `frames` by alternating parity, starting with the parity of
    /// `current`, as per 8.2.4.2.5.
    fn alternate_fields(
        &self,
        frames: &[usize],
        current: Field,
        pred: fn(&RefStatus) -> bool,
    ) -> Vec<RefPic> {
        let pick = |parity: Field| -> Vec<RefPic> {
            let i = parity.index().unwrap_or(0);
            frames
                .iter()
                .filter(|&&index| pred(&self.buffer[index].status[i]))
                .map(|&index| RefPic {
                    index,
                    field: parity,
                })
                .collect()
        };

        let same = pick(current);
        let opposite = pick(current.opposite().unwrap_or(Field::Bottom));

        let mut list = Vec::with_capacity(same.len() + opposite.len());
        for i in 0..same.len().max(opposite.len()) {
            list.extend(same.get(i));
            list.extend(opposite.get(i));
        }

        list
    }

    /// Sizes `list` to `num_active` entries and applies the modification commands of 8.2.4.3.
    pub fn reorder_ref_pic_list(
        &self,
        list: &mut RefPicList,
        modifications: &[RefPicListModification],
        num_active: usize,
        curr_frame_num: u32,
        field: Field,
    ) -> Result<(), DpbError> {
        list.resize(num_active, None);

        let (max_pic_num, curr_pic_num) = match field {
            Field::Frame => (self.max_frame_num as i32, curr_frame_num as i32),
            _ => (
                2 * self.max_frame_num as i32,
                2 * curr_frame_num as i32 + 1,
            ),
        };

        let mut pic_num_pred = curr_pic_num;
        let mut ref_idx = 0;

        for m in modifications {
            let target = match m.modification_of_pic_nums_idc {
                idc @ (0 | 1) => {
                    let abs_diff_pic_num = i32::try_from(m.abs_diff_pic_num_minus1)
                        .ok()
                        .and_then(|v| v.checked_add(1))
                        .filter(|&v| v <= max_pic_num)
                        .ok_or(DpbError::InvalidAbsDiffPicNum(m.abs_diff_pic_num_minus1))?;
                    let no_wrap = if idc == 0 {
                        let v = pic_num_pred - abs_diff_pic_num;
                        if v < 0 {
                            v + max_pic_num
                        } else {
                            v
                        }
                    } else {
                        let v = pic_num_pred + abs_diff_pic_num;
                        if v >= max_pic_num {
                            v - max_pic_num
                        } else {
                            v
                        }
                    };
                    pic_num_pred = no_wrap;

                    let pic_num = if no_wrap > curr_pic_num {
                        no_wrap - max_pic_num
                    } else {
                        no_wrap
                    };

                    self.find_short_term(pic_num, field, false)
                        .ok_or(DpbError::ReorderMissingShortTerm(pic_num))?
                }
                2 => {
                    let long_term_pic_num = m.long_term_pic_num as i32;
                    self.find_long_term(long_term_pic_num, field)
                        .ok_or(DpbError::ReorderMissingLongTerm(long_term_pic_num))?
                }
                3 => break,
                other => return Err(DpbError::InvalidModification(other)),
            };

            if ref_idx > list.len() {
                return Err(DpbError::TooManyModifications);
            }

            list.insert(ref_idx, Some(target));
            ref_idx += 1;

            let mut i = ref_idx;
            while i < list.len() {
                if list[i] == Some(target) {
                    list.remove(i);
                } else {
                    i += 1;
                }
            }
            list.truncate(num_active);
        }

        Ok(())
    }

    fn is_usable(&self, pic: RefPic) -> bool {
        self.buffer.get(pic.index).map_or(false, |p| {
            p.mem_idx.is_some()
                && pic
                    .field
                    .indices()
                    .iter()
                    .all(|&i| p.status[i].is_existing_reference())
        })
    }

    /// Fails if one of the first `num_active` entries of `list` is missing or refers to a picture
    /// that cannot be used for prediction.
    pub fn check_ref_pic_list(&self, list: &RefPicList, num_active: usize) -> Result<(), DpbError> {
        let count = (0..num_active)
            .filter(|&i| !list.get(i).copied().flatten().map_or(false, |r| self.is_usable(r)))
            .count();

        if count > 0 {
            return Err(DpbError::MissingReferences { count });
        }

        Ok(())
    }

    /// Replaces the unusable entries among the first `num_active` ones of `list` by the closest
    /// usable entry before them, or by any usable reference. Returns the number of replaced
    /// entries.
    pub fn conceal_ref_pic_list(&self, list: &mut RefPicList, num_active: usize) -> usize {
        if list.len() < num_active {
            list.resize(num_active, None);
        }

        let fallback = list
            .iter()
            .take(num_active)
            .flatten()
            .copied()
            .find(|&r| self.is_usable(r))
            .or_else(|| {
                self.buffer
                    .iter()
                    .position(|p| p.mem_idx.is_some() && p.status.iter().all(RefStatus::is_existing_reference))
                    .map(|index| RefPic {
                        index,
                        field: Field::Frame,
                    })
            });

        let mut last_good = fallback;
        let mut replaced = 0;
        for entry in list.iter_mut().take(num_active) {
            match *entry {
                Some(r) if self.is_usable(r) => last_good = Some(r),
                _ => {
                    *entry = last_good;
                    replaced += 1;
                }
            }
        }

        if replaced > 0 {
            log::warn!("concealed {} missing reference pictures", replaced);
        }

        replaced
    }

    /// Runs the decoded reference picture marking process of 8.2.5 for the picture being
    /// decoded, then stores it and outputs what has to be output.
    ///
    /// Marking errors do not prevent the picture from being stored. The first one is returned
    /// once the picture is in the DPB.
    pub fn mark_dec_ref_pic(&mut self, cur: &CurrentPicture) -> Result<(), DpbError> {
        let current = self.current.ok_or(DpbError::NoCurrentPicture)?;
        let index = current.index;
        let mmco5 = cur.marking.has_mmco_5();
        let mut error = None;

        self.set_pic_nums(cur.frame_num, cur.field);

        if cur.is_reference {
            if cur.is_idr && !current.second_field {
                self.idr_marking(index, cur.marking.no_output_of_prior_pics_flag)?;

                let pic = &mut self.buffer[index];
                if cur.marking.long_term_reference_flag {
                    pic.set_status(cur.field, RefStatus::LongTerm);
                    pic.long_term_frame_idx = 0;
                    self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
                } else {
                    pic.set_status(cur.field, RefStatus::ShortTerm);
                    self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
                }
            } else {
                let mut long_term = false;
                let adaptive = cur.marking.adaptive_ref_pic_marking_mode_flag;

                if adaptive {
                    let (marked_long_term, err) = self.adaptive_marking(index, cur);
                    long_term = marked_long_term;
                    error = err;
                } else if !(current.second_field && self.buffer[index].is_reference()) {
                    if let Err(e) = self.sliding_window() {
                        error = Some(e);
                    }
                }

                if !long_term {
                    let pic = &mut self.buffer[index];
                    let status = if current.second_field && pic.is_long_term() {
                        RefStatus::LongTerm
                    } else {
                        RefStatus::ShortTerm
                    };
                    pic.set_status(cur.field, status);
                }

                let count = self.count_ref_frames();
                if adaptive && count > self.max_ref_frames as usize {
                    log::warn!(
                        "memory management operations left {} reference frames for {} allowed, \
                         stream is likely not conformant",
                        count,
                        self.max_ref_frames
                    );
                    error.get_or_insert(MmcoError::TooManyReferences {
                        count,
                        max: self.max_ref_frames,
                    });
                }
            }

            self.prev_ref_frame_num = if mmco5 { 0 } else { cur.frame_num };
        } else {
            self.buffer[index].set_status(cur.field, RefStatus::Unused);
        }

        self.last_contains_mmco5 = mmco5;
        let stored = self.store_current(current, cur, mmco5);
        self.num_ref_frames = self.count_ref_frames() as u32;
        stored?;

        match error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn idr_marking(&mut self, index: usize, no_output_of_prior_pics: bool) -> Result<(), DpbError> {
        for (i, pic) in self.buffer.iter_mut().enumerate() {
            if i != index {
                pic.unmark();
            }
        }

        if no_output_of_prior_pics {
            debug!("IDR picture without output of prior pictures");
            for (i, pic) in self.buffer.iter_mut().enumerate() {
                if i != index {
                    *pic = DpbPicture::default();
                }
            }
            self.fullness = 0;
            self.pending_field = None;
        } else {
            while self.bump_one(Some(index))? {}
            for i in 0..self.buffer.len() {
                if i != index {
                    self.release_unused(i);
                }
            }
        }

        self.concealing = false;
        self.prev_ref_frame_num = 0;

        Ok(())
    }

    /// Applies the memory management control operations of the current picture in syntax order.
    ///
    /// Returns whether the current picture was marked as long-term, and the first error met.
    /// Failing operations are skipped.
    fn adaptive_marking(&mut self, index: usize, cur: &CurrentPicture) -> (bool, Option<MmcoError>) {
        let field = cur.field;
        let curr_pic_num = match field {
            Field::Frame => cur.frame_num as i32,
            _ => 2 * cur.frame_num as i32 + 1,
        };

        let mut current_long_term = false;
        let mut first_error = None;

        for op in &cur.marking.inner {
            let pic_num_x = i32::try_from(op.difference_of_pic_nums_minus1)
                .ok()
                .and_then(|v| v.checked_add(1))
                .and_then(|v| curr_pic_num.checked_sub(v))
                .ok_or(MmcoError::InvalidPicNumDifference(
                    op.difference_of_pic_nums_minus1,
                ));

            let result = match op.op() {
                Some(MmcoOp::End) => break,
                Some(MmcoOp::MarkShortTermUnused) => {
                    pic_num_x.and_then(|pic_num_x| self.mmco_short_term_unused(pic_num_x, field))
                }
                Some(MmcoOp::MarkLongTermUnused) => {
                    self.mmco_long_term_unused(op.long_term_pic_num as i32, field)
                }
                Some(MmcoOp::AssignLongTermFrameIdx) => pic_num_x.and_then(|pic_num_x| {
                    self.mmco_assign_long_term(pic_num_x, op.long_term_frame_idx, field)
                }),
                Some(MmcoOp::SetMaxLongTermFrameIdx) => {
                    self.mmco_set_max_long_term(op.max_long_term_frame_idx);
                    Ok(())
                }
                Some(MmcoOp::MarkAllUnused) => {
                    self.mmco_mark_all_unused(index);
                    Ok(())
                }
                Some(MmcoOp::MarkCurrentLongTerm) => self
                    .mmco_current_long_term(index, op.long_term_frame_idx, field)
                    .map(|()| current_long_term = true),
                None => Err(MmcoError::InvalidOperation(
                    op.memory_management_control_operation,
                )),
            };

            if let Err(e) = result {
                log::warn!("memory management operation failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        (current_long_term, first_error)
    }

    fn check_long_term_frame_idx(&self, idx: u32) -> Result<(), MmcoError> {
        if self.max_long_term_frame_idx < idx {
            return Err(MmcoError::LongTermFrameIdxTooLarge {
                idx,
                max: self.max_long_term_frame_idx,
            });
        }

        Ok(())
    }

    fn unmark_fields(&mut self, pic: RefPic) {
        for &i in pic.field.indices() {
            self.buffer[pic.index].status[i] = RefStatus::Unused;
        }
        self.release_unused(pic.index);
    }

    /// Frees `idx` from any long-term picture other than the frame at `keep`.
    fn free_long_term_frame_idx(&mut self, idx: u32, keep: usize) {
        for i in 0..self.buffer.len() {
            let pic = &mut self.buffer[i];
            if i == keep || !pic.is_long_term() || pic.long_term_frame_idx != idx {
                continue;
            }

            debug!("LongTermFrameIdx {} taken over, unmarking entry {}", idx, i);
            pic.unmark();
            self.release_unused(i);
        }
    }

    fn mmco_short_term_unused(&mut self, pic_num: i32, field: Field) -> Result<(), MmcoError> {
        let target = self
            .find_short_term(pic_num, field, true)
            .ok_or(MmcoError::NoShortTermPicture(pic_num))?;

        debug!("MMCO 1: unmarking PicNum {} (entry {})", pic_num, target.index);
        self.unmark_fields(target);

        Ok(())
    }

    fn mmco_long_term_unused(&mut self, long_term_pic_num: i32, field: Field) -> Result<(), MmcoError> {
        let target = self
            .find_long_term(long_term_pic_num, field)
            .ok_or(MmcoError::NoLongTermPicture(long_term_pic_num))?;

        debug!("MMCO 2: unmarking LongTermPicNum {}", long_term_pic_num);
        self.unmark_fields(target);

        Ok(())
    }

    fn mmco_assign_long_term(&mut self, pic_num: i32, idx: u32, field: Field) -> Result<(), MmcoError> {
        self.check_long_term_frame_idx(idx)?;

        let target = self
            .find_short_term(pic_num, field, false)
            .ok_or(MmcoError::NoShortTermPicture(pic_num))?;

        self.free_long_term_frame_idx(idx, target.index);

        let pic = &mut self.buffer[target.index];
        for &i in target.field.indices() {
            pic.status[i] = RefStatus::LongTerm;
        }
        pic.long_term_frame_idx = idx;
        match target.field {
            Field::Frame => pic.long_term_pic_num = [idx as i32; 2],
            _ => {
                for (i, parity) in [Field::Top, Field::Bottom].into_iter().enumerate() {
                    pic.long_term_pic_num[i] = pic.field_long_term_pic_num(parity, field);
                }
            }
        }

        debug!("MMCO 3: PicNum {} gets LongTermFrameIdx {}", pic_num, idx);

        Ok(())
    }

    fn mmco_set_max_long_term(&mut self, max: MaxLongTermFrameIdx) {
        debug!("MMCO 4: MaxLongTermFrameIdx {:?}", max);
        self.max_long_term_frame_idx = max;

        for i in 0..self.buffer.len() {
            let pic = &mut self.buffer[i];
            if pic.is_long_term() && max < pic.long_term_frame_idx {
                for status in pic.status.iter_mut().filter(|s| s.is_long_term()) {
                    *status = RefStatus::Unused;
                }
                self.release_unused(i);
            }
        }
    }

    fn mmco_mark_all_unused(&mut self, index: usize) {
        debug!("MMCO 5: unmarking every reference picture");

        for i in 0..self.buffer.len() {
            if i != index {
                self.buffer[i].unmark();
                self.release_unused(i);
            }
        }

        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
    }

    fn mmco_current_long_term(&mut self, index: usize, idx: u32, field: Field) -> Result<(), MmcoError> {
        self.check_long_term_frame_idx(idx)?;
        self.free_long_term_frame_idx(idx, index);

        let pic = &mut self.buffer[index];
        pic.set_status(field, RefStatus::LongTerm);
        pic.long_term_frame_idx = idx;

        debug!("MMCO 6: current picture gets LongTermFrameIdx {}", idx);

        Ok(())
    }

    /// Sliding window marking of 8.2.5.3: unmarks the short-term pictures with the smallest
    /// `FrameNumWrap` until there is room for one more reference frame.
    fn sliding_window(&mut self) -> Result<(), MmcoError> {
        let exclude = self.current_index();

        loop {
            let num_refs = self
                .buffer
                .iter()
                .enumerate()
                .filter(|&(i, p)| Some(i) != exclude && p.is_reference())
                .count();

            if num_refs < self.max_ref_frames as usize {
                return Ok(());
            }

            let victim = self
                .buffer
                .iter()
                .enumerate()
                .filter(|&(i, p)| Some(i) != exclude && p.is_short_term())
                .min_by_key(|(_, p)| p.frame_num_wrap)
                .map(|(i, _)| i);

            let Some(victim) = victim else {
                log::warn!("sliding window: every reference picture is long-term");
                return Err(MmcoError::SlidingWindowEmpty);
            };

            debug!(
                "sliding window: unmarking frame_num {}",
                self.buffer[victim].frame_num
            );

            for status in self.buffer[victim].status.iter_mut() {
                if status.is_short_term() {
                    *status = RefStatus::Unused;
                }
            }
            self.release_unused(victim);
        }
    }

    /// Takes and drops the buffer references of entry `index` according to its state, and frees
    /// the entry if it is neither a reference nor waiting for output.
    fn release_unused(&mut self, index: usize) {
        let is_current = self.current_index() == Some(index);
        let pic = &mut self.buffer[index];

        if !pic.status.iter().any(RefStatus::is_existing_reference) {
            pic.reference = None;
        }

        if pic.is_empty() || pic.is_reference() || pic.to_be_displayed || is_current {
            return;
        }

        *pic = DpbPicture::default();
        self.fullness = self.fullness.saturating_sub(1);
        if self.pending_field == Some(index) {
            self.pending_field = None;
        }
    }

    fn acquire_refs(&mut self, index: usize) -> Result<(), DpbError> {
        let pic = &mut self.buffer[index];
        let Some(id) = pic.mem_idx else {
            return Ok(());
        };

        if pic.to_be_displayed && pic.display.is_none() {
            pic.display = Some(self.fb_list.acquire(id)?);
        }

        if pic.status.iter().any(RefStatus::is_existing_reference) && pic.reference.is_none() {
            pic.reference = Some(self.fb_list.acquire(id)?);
        }

        Ok(())
    }

    /// Entries that may be output: waiting for display and not waiting for a second field.
    fn outputable(&self) -> impl Iterator<Item = usize> + '_ {
        let current = self.current_index();
        (0..self.buffer.len()).filter(move |&i| {
            self.buffer[i].to_be_displayed && Some(i) != self.pending_field && Some(i) != current
        })
    }

    /// Outputs the picture with the smallest POC, except `exclude`. Returns whether a picture
    /// was output.
    fn bump_one(&mut self, exclude: Option<usize>) -> Result<bool, DpbError> {
        let candidate = self
            .outputable()
            .filter(|&i| Some(i) != exclude)
            .min_by_key(|&i| (self.buffer[i].poc(), self.buffer[i].decode_id));

        match candidate {
            Some(i) => {
                self.output_entry(i)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn bump_for_reorder(&mut self) -> Result<(), DpbError> {
        if self.no_reordering {
            while self.bump_one(None)? {}
            return Ok(());
        }

        while self.outputable().count() > self.num_reorder_frames as usize {
            if !self.bump_one(None)? {
                break;
            }
        }

        Ok(())
    }

    fn output_entry(&mut self, index: usize) -> Result<(), DpbError> {
        if self.out.is_full() {
            log::error!("output ring overflow");
            return Err(DpbError::OutputOverflow);
        }

        let pic_id = self.next_pic_id;
        let interlaced = self.interlaced;
        let pic = &mut self.buffer[index];
        pic.to_be_displayed = false;

        let Some(buffer) = pic.display.take() else {
            log::error!("picture in DPB entry {} has no buffer to output", index);
            self.release_unused(index);
            return Ok(());
        };

        let out = DpbOutPicture {
            buffer,
            pic_id,
            decode_id: pic.decode_id,
            timestamp: pic.timestamp,
            pic_order_cnt: pic.poc(),
            is_idr: pic.is_idr,
            fields: pic.fields,
            interlaced,
            num_err_mbs: pic.num_err_mbs,
            concealed: pic.concealed,
            view_id: pic.view_id,
        };

        debug!(
            "output buffer {:?}, POC {}, pic_id {}",
            out.id(),
            out.pic_order_cnt,
            pic_id
        );

        self.next_pic_id = self.next_pic_id.wrapping_add(1);
        self.out.push(out);
        self.release_unused(index);

        Ok(())
    }

    /// Drops the oldest short-term reference other than `exclude`, to make room when nothing can
    /// be output. Returns whether a picture was dropped.
    fn drop_oldest_short_term(&mut self, exclude: Option<usize>) -> bool {
        let victim = self
            .buffer
            .iter()
            .enumerate()
            .filter(|&(i, p)| Some(i) != exclude && p.is_short_term())
            .min_by_key(|(_, p)| p.frame_num_wrap)
            .map(|(i, _)| i);

        let Some(victim) = victim else {
            return false;
        };

        log::warn!(
            "DPB full of references, dropping frame_num {}",
            self.buffer[victim].frame_num
        );

        for status in self.buffer[victim].status.iter_mut() {
            if status.is_short_term() {
                *status = RefStatus::Unused;
            }
        }
        self.release_unused(victim);

        true
    }

    fn store_current(
        &mut self,
        current: CurrentEntry,
        cur: &CurrentPicture,
        mmco5: bool,
    ) -> Result<(), DpbError> {
        let index = current.index;
        let concealing = self.concealing;

        let pic = &mut self.buffer[index];
        if current.second_field {
            if let Some(i) = cur.field.index() {
                pic.pic_order_cnt[i] = cur.pic_order_cnt[i];
            }
            pic.fields.insert(cur.field.mask());
            pic.num_err_mbs = pic.num_err_mbs.saturating_add(cur.num_err_mbs);
            pic.concealed |= cur.concealed;
        } else {
            pic.frame_num = cur.frame_num;
            pic.pic_order_cnt = cur.pic_order_cnt;
            pic.fields = cur.field.mask();
            pic.is_idr = cur.is_idr;
            pic.decode_id = cur.decode_id;
            pic.timestamp = cur.timestamp;
            pic.num_err_mbs = cur.num_err_mbs;
            pic.concealed = cur.concealed || concealing;
            pic.output_time = cur.output_time;
            pic.view_id = cur.view_id;
            pic.to_be_displayed = true;
        }

        if mmco5 {
            // The picture is now the first one of a new sequence of POCs and frame_nums.
            pic.frame_num = 0;
            match cur.field {
                Field::Frame => {
                    let temp = pic.pic_order_cnt[0].min(pic.pic_order_cnt[1]);
                    pic.pic_order_cnt[0] -= temp;
                    pic.pic_order_cnt[1] -= temp;
                }
                Field::Top => pic.pic_order_cnt[0] = 0,
                Field::Bottom => pic.pic_order_cnt[1] = 0,
            }
        }

        if let Err(e) = self.acquire_refs(index) {
            self.release_current();
            return Err(e);
        }

        if current.second_field {
            self.current = None;
            if let Some(id) = self.buffer[index].mem_idx {
                self.fb_list.mark_id_free(id)?;
            }
            if self.pending_field == Some(index) {
                self.pending_field = None;
            }
            self.release_unused(index);
            return self.bump_for_reorder();
        }

        // From here on the entry holds the buffer through its references.
        self.current = None;
        if let Some(id) = self.buffer[index].mem_idx {
            self.fb_list.mark_id_free(id)?;
        }

        if mmco5 {
            while self.bump_one(Some(index))? {}
        }

        let is_first_field = cur.field != Field::Frame;
        if is_first_field {
            self.pending_field = Some(index);
        }

        let may_skip_dpb =
            !self.buffer[index].is_reference() && !is_first_field && !self.no_reordering;

        while self.fullness >= self.dpb_size {
            if may_skip_dpb {
                let poc = self.buffer[index].poc();
                let has_earlier = self
                    .outputable()
                    .any(|i| i != index && self.buffer[i].poc() < poc);

                if !has_earlier {
                    debug!("outputting non-reference picture POC {} without storing it", poc);
                    self.fullness += 1;
                    return self.output_entry(index);
                }
            }

            if self.bump_one(Some(index))? {
                continue;
            }

            if !self.drop_oldest_short_term(Some(index)) {
                log::error!("no room in the DPB for the current picture");
                if self.pending_field == Some(index) {
                    self.pending_field = None;
                }
                self.buffer[index] = DpbPicture::default();
                return Err(DpbError::NoFreeEntry);
            }
        }

        self.fullness += 1;
        debug!(
            "stored frame_num {} POC {} in entry {}, fullness {}",
            self.buffer[index].frame_num,
            self.buffer[index].poc(),
            index,
            self.fullness
        );

        self.bump_for_reorder()
    }

    /// Detects a gap in `frame_num` before decoding a picture, and fills it with non-existing
    /// frames if `gaps_allowed`, as per 8.2.5.2.
    pub fn check_gaps_in_frame_num(
        &mut self,
        frame_num: u32,
        is_ref: bool,
        gaps_allowed: bool,
    ) -> Result<(), DpbError> {
        if !self.is_initialized() {
            return Err(DpbError::NotInitialized);
        }

        let prev = self.prev_ref_frame_num;
        if frame_num == prev {
            if is_ref && self.count_ref_frames() > 0 && !self.last_contains_mmco5 {
                log::warn!("reference picture repeats frame_num {}", frame_num);
                return Err(DpbError::DuplicateFrameNum(frame_num));
            }
            return Ok(());
        }

        let max_frame_num = self.max_frame_num;
        if frame_num == (prev + 1) % max_frame_num {
            return Ok(());
        }

        if !gaps_allowed {
            log::warn!("gap in frame_num: {} followed by {}", prev, frame_num);
            return Err(DpbError::FrameNumGap {
                prev,
                curr: frame_num,
            });
        }

        debug!("filling frame_num gap between {} and {}", prev, frame_num);

        let mut unused_short_term_frame_num = (prev + 1) % max_frame_num;
        while unused_short_term_frame_num != frame_num {
            self.store_non_existing(unused_short_term_frame_num)?;
            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    fn store_non_existing(&mut self, frame_num: u32) -> Result<(), DpbError> {
        self.set_pic_nums(frame_num, Field::Frame);
        if let Err(e) = self.sliding_window() {
            log::warn!("non-existing frame {}: {}", frame_num, e);
        }

        while self.fullness >= self.dpb_size {
            if !self.bump_one(None)? && !self.drop_oldest_short_term(None) {
                return Err(DpbError::NoFreeEntry);
            }
        }

        let index = self.free_entry().ok_or(DpbError::NoFreeEntry)?;
        self.buffer[index] = DpbPicture {
            frame_num,
            frame_num_wrap: frame_num as i32,
            pic_num: [frame_num as i32; 2],
            status: [RefStatus::NonExisting; 2],
            fields: HwOutput::FRAME,
            ..Default::default()
        };

        self.fullness += 1;
        self.prev_ref_frame_num = frame_num;
        self.num_ref_frames = self.count_ref_frames() as u32;

        Ok(())
    }

    /// Outputs the pictures whose HRD output time is not after `now`, in output time order.
    /// Returns the number of output pictures.
    pub fn hrd_bumping(&mut self, now: u64) -> Result<usize, DpbError> {
        let mut count = 0;

        loop {
            let due = self
                .outputable()
                .filter(|&i| self.buffer[i].output_time.map_or(false, |t| t <= now))
                .min_by_key(|&i| (self.buffer[i].output_time, self.buffer[i].poc()));

            let Some(index) = due else {
                break;
            };

            self.output_entry(index)?;
            count += 1;
        }

        self.bumping_flag = count > 0;

        Ok(count)
    }

    /// Outputs every picture in POC order and marks everything as unused.
    pub fn flush(&mut self) -> Result<(), DpbError> {
        self.release_current();
        self.pending_field = None;

        for pic in self.buffer.iter_mut() {
            pic.unmark();
        }

        while self.bump_one(None)? {}

        for i in 0..self.buffer.len() {
            self.release_unused(i);
        }

        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        self.num_ref_frames = 0;
        self.prev_ref_frame_num = 0;
        self.flushed = true;

        debug!("DPB flushed, {} pictures in the output ring", self.out.num_out);

        Ok(())
    }

    /// Drops every stored picture without output. Pictures already in the output ring are kept.
    pub fn empty(&mut self) {
        self.release_current();

        for pic in self.buffer.iter_mut() {
            *pic = DpbPicture::default();
        }

        self.pending_field = None;
        self.fullness = 0;
        self.num_ref_frames = 0;
        self.prev_ref_frame_num = 0;
        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
    }

    /// Recovers from an inconsistency between the stream and the DPB before decoding the picture
    /// with `curr_frame_num` and `curr_poc`.
    ///
    /// References sharing the frame_num of the current picture and non-existing frames are
    /// dropped, pictures preceding the current one in output order are output and the following
    /// pictures are flagged as concealed until the next IDR picture.
    pub fn recover(&mut self, curr_frame_num: u32, curr_poc: i32) -> Result<(), DpbError> {
        log::warn!(
            "recovering DPB at frame_num {}, POC {}",
            curr_frame_num,
            curr_poc
        );

        let exclude = self.current_index();
        for i in 0..self.buffer.len() {
            let pic = &mut self.buffer[i];
            if Some(i) == exclude
                || !(pic.is_non_existing() || (pic.is_short_term() && pic.frame_num == curr_frame_num))
            {
                continue;
            }

            for status in pic.status.iter_mut() {
                if status.is_short_term() {
                    *status = RefStatus::Unused;
                }
            }
            self.release_unused(i);
        }

        loop {
            let next = self
                .outputable()
                .filter(|&i| self.buffer[i].poc() < curr_poc)
                .min_by_key(|&i| self.buffer[i].poc());

            let Some(index) = next else {
                break;
            };

            self.output_entry(index)?;
        }

        self.prev_ref_frame_num = curr_frame_num;
        self.num_ref_frames = self.count_ref_frames() as u32;
        self.concealing = true;

        Ok(())
    }
}
