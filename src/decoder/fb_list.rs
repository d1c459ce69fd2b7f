// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The frame buffer list: the pool of picture buffers of a decoder instance.
//!
//! Every picture buffer lives in a slot identified by a [`BufferId`]. A slot is kept out of the
//! free pool for as long as any of the following holds:
//!
//! * it is [`UsageFlags::ALLOCATED`], i.e. claimed as a decode target and not released yet,
//! * it is [`UsageFlags::OUTPUT`], i.e. pending in the output FIFO or held by the client,
//! * a [`BufferRef`] to it is alive, which is how the DPB keeps reference and not yet displayed
//!   pictures around.
//!
//! The output FIFO hands pictures to the consumer in the order they were pushed. Popping a picture
//! additionally waits for the hardware to have written all the fields it needs, as reported
//! through [`FrameBufferList::mark_hw_output`].

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::decoder::BlockingMode;
use crate::decoder::DecodedPicture;
use crate::memory::LinearMem;
use crate::sync;
use crate::sync::Abortable;
use crate::sync::Aborted;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::sync::RunState;
use crate::MAX_FRAME_BUFFER_NUMBER;

/// Index of a slot in a [`FrameBufferList`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// Usage of a slot, besides the references held on it.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct UsageFlags: u32 {
        /// Claimed as a decode target.
        const ALLOCATED = 0x01;
        /// Pending in the output FIFO or held by the client.
        const OUTPUT = 0x02;
    }
}

bitflags! {
    /// Fields of a buffer written by the hardware.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct HwOutput: u32 {
        const FIELD_TOP = 0x10;
        const FIELD_BOT = 0x20;
        const FRAME = Self::FIELD_TOP.bits() | Self::FIELD_BOT.bits();
    }
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ListError {
    #[error("no free buffer available")]
    NoFreeBuffer,
    #[error("operation aborted")]
    Aborted,
    #[error("invalid buffer id {0:?}")]
    InvalidId(BufferId),
    #[error("reference count underflow on buffer {0:?}")]
    RefCountUnderflow(BufferId),
    #[error("buffer {0:?} is already pending output")]
    AlreadyOutput(BufferId),
    #[error("invalid number of buffers: {0} (must be between 1 and {max})", max = MAX_FRAME_BUFFER_NUMBER)]
    InvalidCapacity(usize),
    #[error("buffers are still in use")]
    InUse,
    #[error("output FIFO is full")]
    FifoFull,
}

impl From<Aborted> for ListError {
    fn from(_: Aborted) -> Self {
        ListError::Aborted
    }
}

/// An element of the output FIFO.
#[derive(Clone, Debug)]
pub enum OutElement {
    Picture(DecodedPicture),
    /// Pushed once all the pictures of the stream have been pushed.
    EndOfStream,
}

#[derive(Debug, Default)]
struct Slot {
    flags: UsageFlags,
    ref_count: u32,
    hw_out: HwOutput,
    num_err_mbs: u32,
    data: Option<LinearMem>,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.flags.is_empty() && self.ref_count == 0
    }

    fn claim(&mut self) {
        self.flags.insert(UsageFlags::ALLOCATED);
        self.hw_out = HwOutput::empty();
        self.num_err_mbs = 0;
    }
}

#[derive(Debug)]
struct ListState {
    slots: Vec<Slot>,
    free_buffers: usize,
    out_fifo: Vec<Option<OutElement>>,
    wr_id: usize,
    rd_id: usize,
    num_out: usize,
}

impl ListState {
    fn slot(&self, id: BufferId) -> Result<&Slot, ListError> {
        self.slots.get(id.0).ok_or_else(|| {
            log::error!("access to invalid buffer {:?}", id);
            ListError::InvalidId(id)
        })
    }

    fn slot_mut(&mut self, id: BufferId) -> Result<&mut Slot, ListError> {
        self.slots.get_mut(id.0).ok_or_else(|| {
            log::error!("access to invalid buffer {:?}", id);
            ListError::InvalidId(id)
        })
    }

    /// Applies `f` to slot `id`, keeping the free count up to date. Returns whether the slot became
    /// free.
    fn update_slot<F>(&mut self, id: BufferId, f: F) -> Result<bool, ListError>
    where
        F: FnOnce(&mut Slot) -> Result<(), ListError>,
    {
        let slot = self.slot_mut(id)?;
        let was_free = slot.is_free();
        f(slot)?;
        let is_free = slot.is_free();

        match (was_free, is_free) {
            (true, false) => self.free_buffers -= 1,
            (false, true) => self.free_buffers += 1,
            _ => (),
        }

        Ok(!was_free && is_free)
    }

    fn all_idle(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.ref_count == 0 && !s.flags.contains(UsageFlags::OUTPUT))
    }

    fn fifo_front(&self) -> Option<&OutElement> {
        if self.num_out == 0 {
            return None;
        }

        self.out_fifo[self.rd_id].as_ref()
    }

    /// Whether the element at the head of the FIFO can be handed out.
    fn front_ready(&self) -> bool {
        match self.fifo_front() {
            None => false,
            Some(OutElement::EndOfStream) => true,
            Some(OutElement::Picture(pic)) => self
                .slots
                .get(pic.id.0)
                .map(|s| s.hw_out.contains(pic.fields))
                .unwrap_or(true),
        }
    }

    fn fifo_full(&self) -> bool {
        self.num_out == self.out_fifo.len()
    }

    fn push(&mut self, element: OutElement) -> Result<(), ListError> {
        if self.fifo_full() {
            log::error!("output FIFO overflow");
            return Err(ListError::FifoFull);
        }

        let len = self.out_fifo.len();
        self.out_fifo[self.wr_id] = Some(element);
        self.wr_id = (self.wr_id + 1) % len;
        self.num_out += 1;
        Ok(())
    }

    /// Drops one reference on `id`. Returns whether the slot became free.
    fn unref(&mut self, id: BufferId) -> Result<bool, ListError> {
        self.update_slot(id, |s| {
            if s.ref_count == 0 {
                debug_assert!(false, "reference count underflow on buffer {:?}", id);
                log::error!("reference count underflow on buffer {:?}", id);
                return Err(ListError::RefCountUnderflow(id));
            }

            s.ref_count -= 1;
            Ok(())
        })
    }

    fn pop(&mut self) -> Option<OutElement> {
        if self.num_out == 0 {
            return None;
        }

        let len = self.out_fifo.len();
        let element = self.out_fifo[self.rd_id].take();
        self.rd_id = (self.rd_id + 1) % len;
        self.num_out -= 1;
        element
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<Abortable<ListState>>,
    /// A slot went back to the free pool.
    freed: Condvar,
    /// An element was pushed to the output FIFO.
    out_available: Condvar,
    /// The output FIFO became empty.
    out_empty: Condvar,
    /// The hardware finished writing a buffer.
    hw_ready: Condvar,
    /// No slot is referenced or pending output anymore.
    not_in_use: Condvar,
    /// Number of elements in the output FIFO, readable without taking the lock.
    pending: AtomicUsize,
}

/// The pool of picture buffers of a decoder.
///
/// This is a handle: clones share the same pool.
#[derive(Clone, Debug)]
pub struct FrameBufferList(Arc<Shared>);

impl FrameBufferList {
    /// Creates a list of `capacity` empty slots.
    pub fn new(capacity: usize) -> Result<Self, ListError> {
        if capacity == 0 || capacity > MAX_FRAME_BUFFER_NUMBER {
            return Err(ListError::InvalidCapacity(capacity));
        }

        let state = ListState {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            free_buffers: capacity,
            // One extra element so the end of stream marker always fits.
            out_fifo: vec![None; capacity + 1],
            wr_id: 0,
            rd_id: 0,
            num_out: 0,
        };

        Ok(Self(Arc::new(Shared {
            state: Mutex::new(Abortable::new(state)),
            freed: Condvar::new(),
            out_available: Condvar::new(),
            out_empty: Condvar::new(),
            hw_ready: Condvar::new(),
            not_in_use: Condvar::new(),
            pending: AtomicUsize::new(0),
        })))
    }

    /// Creates a list with one free slot per buffer of `buffers`.
    pub fn with_buffers(buffers: Vec<LinearMem>) -> Result<Self, ListError> {
        let list = Self::new(buffers.len())?;
        list.replace_buffers(buffers)?;
        Ok(list)
    }

    pub fn capacity(&self) -> usize {
        self.0.state.lock().slots.len()
    }

    /// Replaces the buffers attached to the slots with `buffers`, starting from slot 0. All the
    /// slots must be free. Returns the previous buffers.
    pub fn replace_buffers(&self, buffers: Vec<LinearMem>) -> Result<Vec<LinearMem>, ListError> {
        let mut state = self.0.state.lock();

        if buffers.is_empty() || buffers.len() > state.slots.len() {
            return Err(ListError::InvalidCapacity(buffers.len()));
        }

        if state.free_buffers != state.slots.len() {
            return Err(ListError::InUse);
        }

        let old = state.slots.iter_mut().filter_map(|s| s.data.take()).collect();

        for (slot, data) in state.slots.iter_mut().zip(buffers) {
            slot.data = Some(data);
        }

        Ok(old)
    }

    fn notify_slot_freed(&self, state: &ListState) {
        self.0.freed.notify_all();
        if state.all_idle() {
            self.0.not_in_use.notify_all();
        }
    }

    /// Waits until `pick` finds a slot in the pool, or fails immediately in non-blocking mode.
    /// Returns the slot and whether we had to wait for it.
    fn claim_with<F>(&self, mode: BlockingMode, pick: F) -> Result<(BufferId, bool), ListError>
    where
        F: Fn(&ListState) -> Option<usize>,
    {
        let mut state = self.0.state.lock();
        state.check_running()?;

        let mut waited = false;
        let index = loop {
            if let Some(index) = pick(&state) {
                break index;
            }

            if mode == BlockingMode::NonBlocking {
                return Err(ListError::NoFreeBuffer);
            }

            log::debug!("waiting for a free buffer");
            waited = true;
            state = sync::wait_while(&self.0.freed, state, |s| pick(s).is_none())?;
        };

        let id = BufferId(index);
        state.update_slot(id, |s| {
            s.claim();
            Ok(())
        })?;

        Ok((id, waited))
    }

    /// Claims the lowest free slot and attaches `data` to it.
    pub fn allocate_id_free(
        &self,
        data: LinearMem,
        mode: BlockingMode,
    ) -> Result<BufferId, ListError> {
        let (id, _) = self.claim_with(mode, |s| s.slots.iter().position(Slot::is_free))?;

        let mut state = self.0.state.lock();
        state.slot_mut(id)?.data = Some(data);
        log::debug!("allocated buffer {:?}", id);

        Ok(id)
    }

    /// Claims slot `id` again as a decode target while it is still referenced or pending output,
    /// e.g. to decode the second field of a pair into it. The fields already written by the
    /// hardware are kept.
    pub fn allocate_id_used(&self, id: BufferId) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        state.check_running()?;
        state.update_slot(id, |s| {
            s.flags.insert(UsageFlags::ALLOCATED);
            Ok(())
        })?;

        Ok(())
    }

    /// Claims a free slot with a buffer attached, preferring slots not in `avoid`.
    ///
    /// Returns the slot and whether the call had to wait for it.
    pub fn get_free_pic_buffer(
        &self,
        avoid: &[BufferId],
        mode: BlockingMode,
    ) -> Result<(BufferId, bool), ListError> {
        self.claim_with(mode, |s| {
            let mut fallback = None;
            for (i, slot) in s.slots.iter().enumerate() {
                if !slot.is_free() || slot.data.is_none() {
                    continue;
                }

                if !avoid.contains(&BufferId(i)) {
                    return Some(i);
                }

                fallback.get_or_insert(i);
            }

            fallback
        })
    }

    /// Drops the decode target claim on `id`. The slot returns to the pool if nothing else holds
    /// it.
    pub fn release_id(&self, id: BufferId) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        let freed = state.update_slot(id, |s| {
            s.flags.remove(UsageFlags::ALLOCATED);
            Ok(())
        })?;

        if freed {
            log::debug!("buffer {:?} back to the pool", id);
            self.notify_slot_freed(&state);
        }

        Ok(())
    }

    /// Same as [`FrameBufferList::release_id`]. Used when the DPB drops its claim.
    pub fn mark_id_free(&self, id: BufferId) -> Result<(), ListError> {
        self.release_id(id)
    }

    pub(crate) fn increment_ref_usage(&self, id: BufferId) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        state.update_slot(id, |s| {
            s.ref_count += 1;
            Ok(())
        })?;

        Ok(())
    }

    pub(crate) fn decrement_ref_usage(&self, id: BufferId) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        let freed = state.unref(id)?;

        if freed {
            log::debug!("buffer {:?} back to the pool", id);
            self.notify_slot_freed(&state);
        }

        Ok(())
    }

    /// Takes a reference on `id`, which keeps the slot out of the pool until dropped.
    pub fn acquire(&self, id: BufferId) -> Result<BufferRef, ListError> {
        self.increment_ref_usage(id)?;

        Ok(BufferRef {
            list: self.clone(),
            id,
            released: false,
        })
    }

    pub fn free_buffer_count(&self) -> usize {
        self.0.state.lock().free_buffers
    }

    pub fn ref_count(&self, id: BufferId) -> Result<u32, ListError> {
        Ok(self.0.state.lock().slot(id)?.ref_count)
    }

    pub fn usage(&self, id: BufferId) -> Result<UsageFlags, ListError> {
        Ok(self.0.state.lock().slot(id)?.flags)
    }

    pub fn is_buffer_referenced(&self, id: BufferId) -> bool {
        self.0
            .state
            .lock()
            .slot(id)
            .map(|s| s.ref_count > 0)
            .unwrap_or(false)
    }

    pub fn is_buffer_output(&self, id: BufferId) -> bool {
        self.0
            .state
            .lock()
            .slot(id)
            .map(|s| s.flags.contains(UsageFlags::OUTPUT))
            .unwrap_or(false)
    }

    pub fn data_by_id(&self, id: BufferId) -> Option<LinearMem> {
        self.0.state.lock().slot(id).ok()?.data.clone()
    }

    /// Records `mask` as written by the hardware on `id` and drops `holds`, the references the
    /// finished job kept on its target and on the pictures it read. Returns `true` if this
    /// completes the frame, which happens only once per decode.
    ///
    /// Both happen under the same lock, so a slot freed here is claimed again only after its
    /// hardware output was recorded, and the claim clears it.
    pub fn mark_hw_output(
        &self,
        id: BufferId,
        mask: HwOutput,
        holds: Vec<BufferRef>,
    ) -> Result<bool, ListError> {
        let mut state = self.0.state.lock();

        let complete = state.slot_mut(id).map(|slot| {
            let was_complete = slot.hw_out.contains(HwOutput::FRAME);
            slot.hw_out.insert(mask);
            !was_complete && slot.hw_out.contains(HwOutput::FRAME)
        });

        let mut freed = false;
        for mut hold in holds {
            hold.released = true;
            match state.unref(hold.id) {
                Ok(f) => freed |= f,
                Err(e) => log::error!("failed to release reference to {:?}: {}", hold.id, e),
            }
        }

        self.0.hw_ready.notify_all();
        if freed {
            self.notify_slot_freed(&state);
        }

        complete
    }

    /// Forgets that the hardware wrote `mask` on `id`, before the buffer is decoded into again.
    pub fn clear_hw_output(&self, id: BufferId, mask: HwOutput) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        state.slot_mut(id)?.hw_out.remove(mask);
        Ok(())
    }

    pub fn hw_output(&self, id: BufferId) -> Result<HwOutput, ListError> {
        Ok(self.0.state.lock().slot(id)?.hw_out)
    }

    /// Adds `errors` erroneous macroblocks to the count of `id`.
    pub fn mark_output_pic_corrupt(&self, id: BufferId, errors: u32) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        let slot = state.slot_mut(id)?;
        slot.num_err_mbs = slot.num_err_mbs.saturating_add(errors);
        Ok(())
    }

    /// Queues `pic` for output. The slot stays reserved until the picture is consumed.
    pub fn push_output_pic(&self, pic: DecodedPicture) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        if state.fifo_full() {
            log::error!("output FIFO overflow");
            return Err(ListError::FifoFull);
        }

        let id = pic.id;
        state.update_slot(id, |s| {
            if s.flags.contains(UsageFlags::OUTPUT) {
                return Err(ListError::AlreadyOutput(id));
            }

            s.flags.insert(UsageFlags::OUTPUT);
            Ok(())
        })?;

        log::debug!("output picture {:?} pic_id {}", id, pic.pic_id);
        state.push(OutElement::Picture(pic))?;
        self.0.pending.store(state.num_out, Ordering::Release);
        self.0.out_available.notify_all();

        Ok(())
    }

    /// Queues the end of stream marker, after all the pictures pushed so far.
    pub fn push_end_of_stream(&self) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        state.push(OutElement::EndOfStream)?;
        self.0.pending.store(state.num_out, Ordering::Release);
        self.0.out_available.notify_all();

        Ok(())
    }

    /// Takes the oldest element of the output FIFO.
    ///
    /// In blocking mode, waits for an element to be pushed and for the hardware to finish the
    /// picture. In non-blocking mode, returns `None` if no element is ready yet.
    pub fn pop_output_pic(&self, mode: BlockingMode) -> Result<Option<OutElement>, ListError> {
        let mut state = self.0.state.lock();
        state.check_running()?;

        if !state.front_ready() {
            if mode == BlockingMode::NonBlocking {
                return Ok(None);
            }

            state = sync::wait_while(&self.0.out_available, state, |s| s.num_out == 0)?;
            state = sync::wait_while(&self.0.hw_ready, state, |s| !s.front_ready())?;
        }

        let mut element = state.pop();
        if let Some(OutElement::Picture(pic)) = element.as_mut() {
            if let Ok(slot) = state.slot(pic.id) {
                pic.num_err_mbs = pic.num_err_mbs.max(slot.num_err_mbs);
            }
        }

        self.0.pending.store(state.num_out, Ordering::Release);
        if state.num_out == 0 {
            self.0.out_empty.notify_all();
        }

        Ok(element)
    }

    /// Returns a copy of the oldest element of the output FIFO without removing it.
    pub fn peek_output_pic(&self) -> Option<OutElement> {
        self.0.state.lock().fifo_front().cloned()
    }

    /// Number of elements in the output FIFO. Does not take the lock.
    pub fn num_pending_outputs(&self) -> usize {
        self.0.pending.load(Ordering::Acquire)
    }

    /// Returns the output buffer `id` to the pool, once the client is done with it.
    pub fn clear_output(&self, id: BufferId) -> Result<(), ListError> {
        let mut state = self.0.state.lock();
        let freed = state.update_slot(id, |s| {
            s.flags.remove(UsageFlags::OUTPUT);
            Ok(())
        })?;

        if freed {
            log::debug!("buffer {:?} back to the pool", id);
        }
        self.notify_slot_freed(&state);

        Ok(())
    }

    /// Waits until the consumer has popped every element of the output FIFO.
    pub fn wait_output_empty(&self) -> Result<(), ListError> {
        let state = self.0.state.lock();
        if state.num_out == 0 {
            return Ok(());
        }

        sync::wait_while(&self.0.out_empty, state, |s| s.num_out != 0)?;
        Ok(())
    }

    /// Waits until no slot is referenced or held for output anymore.
    pub fn wait_list_not_in_use(&self) -> Result<(), ListError> {
        let state = self.0.state.lock();
        if state.all_idle() {
            return Ok(());
        }

        sync::wait_while(&self.0.not_in_use, state, |s| !s.all_idle())?;
        Ok(())
    }

    /// Wakes every blocked thread with [`ListError::Aborted`], and makes allocations and pops
    /// fail until [`FrameBufferList::clear_abort`] is called.
    pub fn abort(&self) {
        let mut state = self.0.state.lock();
        state.abort();
        log::debug!("frame buffer list aborted, {} waiters", state.waiters());

        self.0.freed.notify_all();
        self.0.out_available.notify_all();
        self.0.out_empty.notify_all();
        self.0.hw_ready.notify_all();
        self.0.not_in_use.notify_all();
    }

    pub fn clear_abort(&self) {
        self.0.state.lock().clear_abort();
    }

    pub fn run_state(&self) -> RunState {
        self.0.state.lock().run_state()
    }

    /// Drops every pending element of the output FIFO, returning their buffers.
    pub fn reset_out_fifo(&self) {
        let mut state = self.0.state.lock();

        while let Some(element) = state.pop() {
            if let OutElement::Picture(pic) = element {
                let _ = state.update_slot(pic.id, |s| {
                    s.flags.remove(UsageFlags::OUTPUT);
                    Ok(())
                });
            }
        }

        state.wr_id = 0;
        state.rd_id = 0;
        self.0.pending.store(0, Ordering::Release);

        self.0.out_empty.notify_all();
        self.notify_slot_freed(&state);
    }
}

/// A reference to a slot of a [`FrameBufferList`].
///
/// The slot cannot return to the pool while a reference is alive. Cloning takes another
/// reference, dropping releases it.
#[derive(Debug)]
pub struct BufferRef {
    list: FrameBufferList,
    id: BufferId,
    released: bool,
}

impl BufferRef {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Releases the reference, reporting any inconsistency in the list.
    pub fn release(mut self) -> Result<(), ListError> {
        self.released = true;
        self.list.decrement_ref_usage(self.id)
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        if let Err(e) = self.list.increment_ref_usage(self.id) {
            log::error!("failed to clone reference to {:?}: {}", self.id, e);
        }

        Self {
            list: self.list.clone(),
            id: self.id,
            released: false,
        }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(e) = self.list.decrement_ref_usage(self.id) {
            log::error!("failed to release reference to {:?}: {}", self.id, e);
        }
    }
}
