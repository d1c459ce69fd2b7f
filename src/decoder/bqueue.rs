// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference slot rotation for codecs with a small, fixed set of references.
//!
//! Such codecs (VP8 with its last/golden/altref pictures, MPEG-2 and friends with their two
//! anchors) do not need a full DPB. The decoder passes the slots currently used as references
//! to [`BufferQueue::next`], which hands back the least recently used slot among the others.
//!
//! When the client holds output pictures, slots can additionally be marked as used by output,
//! and [`BufferQueue::next_blocking`] waits for the chosen slot to be returned before handing it
//! out.

use std::sync::Arc;

use thiserror::Error;

use crate::sync;
use crate::sync::Abortable;
use crate::sync::Aborted;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::MAX_FRAME_BUFFER_NUMBER;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum BqueueError {
    #[error("every slot is used as a reference")]
    NoFreeSlot,
    #[error("invalid queue size {0}")]
    InvalidSize(usize),
    #[error("invalid slot {0}")]
    InvalidSlot(usize),
    #[error("operation aborted")]
    Aborted,
}

impl From<Aborted> for BqueueError {
    fn from(_: Aborted) -> Self {
        BqueueError::Aborted
    }
}

#[derive(Debug)]
struct BqState {
    /// Generation at which each slot was last handed out, 0 meaning never or discarded.
    pic_i: Vec<u32>,
    ctr: u32,
    prev_anchor_slot: Option<usize>,
    /// Slots held by the output path.
    buf_used: Vec<bool>,
}

impl BqState {
    fn check_slot(&self, slot: usize) -> Result<(), BqueueError> {
        if slot >= self.pic_i.len() {
            log::error!("invalid buffer queue slot {}", slot);
            return Err(BqueueError::InvalidSlot(slot));
        }

        Ok(())
    }

    fn next(&mut self, refs: [Option<usize>; 3], is_b_pic: bool) -> Result<usize, BqueueError> {
        let out = self
            .pic_i
            .iter()
            .enumerate()
            .filter(|(i, _)| !refs.contains(&Some(*i)))
            .min_by_key(|(_, generation)| **generation)
            .map(|(i, _)| i)
            .ok_or(BqueueError::NoFreeSlot)?;

        self.pic_i[out] = self.ctr;
        self.ctr = self.ctr.wrapping_add(1).max(1);

        if !is_b_pic {
            self.prev_anchor_slot = Some(out);
        }

        log::trace!("buffer queue: slot {} for refs {:?}", out, refs);
        Ok(out)
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<Abortable<BqState>>,
    not_in_use: Condvar,
}

/// A rotating set of picture slots.
///
/// This is a handle: clones share the same queue.
#[derive(Clone, Debug)]
pub struct BufferQueue(Arc<Shared>);

impl BufferQueue {
    pub fn new(size: usize) -> Result<Self, BqueueError> {
        if size == 0 || size > MAX_FRAME_BUFFER_NUMBER {
            return Err(BqueueError::InvalidSize(size));
        }

        Ok(Self(Arc::new(Shared {
            state: Mutex::new(Abortable::new(BqState {
                pic_i: vec![0; size],
                ctr: 1,
                prev_anchor_slot: None,
                buf_used: vec![false; size],
            })),
            not_in_use: Condvar::new(),
        })))
    }

    pub fn size(&self) -> usize {
        self.0.state.lock().pic_i.len()
    }

    /// Returns the least recently used slot that is not one of `refs`, and records it as the most
    /// recently used one. Unless `is_b_pic` is set, the slot also becomes the previous anchor.
    pub fn next(&self, refs: [Option<usize>; 3], is_b_pic: bool) -> Result<usize, BqueueError> {
        self.0.state.lock().next(refs, is_b_pic)
    }

    /// Same as [`BufferQueue::next`], but waits until the output path returned the chosen slot.
    pub fn next_blocking(
        &self,
        refs: [Option<usize>; 3],
        is_b_pic: bool,
    ) -> Result<usize, BqueueError> {
        let mut state = self.0.state.lock();
        state.check_running()?;

        let out = state.next(refs, is_b_pic)?;
        sync::wait_while(&self.0.not_in_use, state, |s| s.buf_used[out])?;

        Ok(out)
    }

    /// Makes `slot` the first candidate of the next call to [`BufferQueue::next`].
    pub fn discard(&self, slot: usize) -> Result<(), BqueueError> {
        let mut state = self.0.state.lock();
        state.check_slot(slot)?;
        state.pic_i[slot] = 0;
        Ok(())
    }

    /// Last slot handed out for a picture other than a B picture.
    pub fn prev_anchor_slot(&self) -> Option<usize> {
        self.0.state.lock().prev_anchor_slot
    }

    /// Marks `slot` as held by the output path.
    pub fn set_buffer_as_used(&self, slot: usize) -> Result<(), BqueueError> {
        let mut state = self.0.state.lock();
        state.check_slot(slot)?;
        state.buf_used[slot] = true;
        Ok(())
    }

    /// Returns `slot` from the output path.
    pub fn picture_release(&self, slot: usize) -> Result<(), BqueueError> {
        let mut state = self.0.state.lock();
        state.check_slot(slot)?;
        state.buf_used[slot] = false;
        self.0.not_in_use.notify_all();
        Ok(())
    }

    pub fn is_buffer_used(&self, slot: usize) -> bool {
        self.0
            .state
            .lock()
            .buf_used
            .get(slot)
            .copied()
            .unwrap_or(false)
    }

    /// Waits until the output path returned `slot`.
    pub fn wait_buf_not_in_use(&self, slot: usize) -> Result<(), BqueueError> {
        let state = self.0.state.lock();
        state.check_slot(slot)?;
        if !state.buf_used[slot] {
            return Ok(());
        }

        sync::wait_while(&self.0.not_in_use, state, |s| s.buf_used[slot])?;
        Ok(())
    }

    /// Waits until the output path returned every slot.
    pub fn wait_not_in_use(&self) -> Result<(), BqueueError> {
        let state = self.0.state.lock();
        if !state.buf_used.iter().any(|u| *u) {
            return Ok(());
        }

        sync::wait_while(&self.0.not_in_use, state, |s| s.buf_used.iter().any(|u| *u))?;
        Ok(())
    }

    /// Wakes every blocked thread with [`BqueueError::Aborted`].
    pub fn set_abort(&self) {
        let mut state = self.0.state.lock();
        state.abort();
        self.0.not_in_use.notify_all();
    }

    pub fn clear_abort(&self) {
        self.0.state.lock().clear_abort();
    }

    /// Forgets the usage history and every slot held by the output path.
    pub fn empty(&self) {
        let mut state = self.0.state.lock();
        state.pic_i.iter_mut().for_each(|g| *g = 0);
        state.buf_used.iter_mut().for_each(|u| *u = false);
        state.ctr = 1;
        state.prev_anchor_slot = None;
        self.0.not_in_use.notify_all();
    }
}
