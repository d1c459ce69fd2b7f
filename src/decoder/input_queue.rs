// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A pool of linear buffers handed out one at a time.
//!
//! Used for post-processor output buffers and for the raster copies of tiled reference pictures.
//! A buffer is in one of three states:
//!
//! * free, waiting in the free FIFO,
//! * pending, handed out by [`InputQueue::get_buffer`] and being written,
//! * used, handed to the client as an output picture.
//!
//! [`InputQueue::return_buffer`] brings a buffer back to the free FIFO from either of the last two
//! states.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::decoder::BlockingMode;
use crate::memory::LinearMem;
use crate::sync;
use crate::sync::Abortable;
use crate::sync::Aborted;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::MAX_PIC_BUFFERS;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("no free buffer available")]
    NoFreeBuffer,
    #[error("queue already holds {max} buffers", max = MAX_PIC_BUFFERS)]
    Full,
    #[error("buffer at {0:#x} does not belong to the queue")]
    UnknownBuffer(u64),
    #[error("invalid buffer index {0}")]
    InvalidIndex(usize),
    #[error("operation aborted")]
    Aborted,
}

impl From<Aborted> for QueueError {
    fn from(_: Aborted) -> Self {
        QueueError::Aborted
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferStatus {
    #[default]
    Free,
    Pending,
    Used,
}

#[derive(Debug, Default)]
struct QueueState {
    buffers: Vec<LinearMem>,
    status: Vec<BufferStatus>,
    free: VecDeque<usize>,
}

impl QueueState {
    fn position(&self, bus_address: u64) -> Option<usize> {
        self.buffers
            .iter()
            .position(|b| b.bus_address == bus_address)
    }

    fn any(&self, status: BufferStatus) -> bool {
        self.status.iter().any(|s| *s == status)
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<Abortable<QueueState>>,
    /// A buffer went back to the free FIFO.
    returned: Condvar,
}

/// A FIFO of free linear buffers.
///
/// This is a handle: clones share the same queue.
#[derive(Clone, Debug, Default)]
pub struct InputQueue(Arc<Shared>);

impl InputQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a queue with all of `buffers` free.
    pub fn with_buffers(buffers: Vec<LinearMem>) -> Result<Self, QueueError> {
        let queue = Self::new();
        for buffer in buffers {
            queue.add_buffer(buffer)?;
        }

        Ok(queue)
    }

    /// Adds a free buffer to the queue and returns its index.
    pub fn add_buffer(&self, buffer: LinearMem) -> Result<usize, QueueError> {
        let mut state = self.0.state.lock();
        if state.buffers.len() >= MAX_PIC_BUFFERS {
            return Err(QueueError::Full);
        }

        let index = state.buffers.len();
        state.buffers.push(buffer);
        state.status.push(BufferStatus::Free);
        state.free.push_back(index);
        self.0.returned.notify_all();

        Ok(index)
    }

    /// Replaces the buffer at `index`.
    pub fn update_buffer(&self, index: usize, buffer: LinearMem) -> Result<(), QueueError> {
        let mut state = self.0.state.lock();
        let slot = state
            .buffers
            .get_mut(index)
            .ok_or(QueueError::InvalidIndex(index))?;
        *slot = buffer;
        Ok(())
    }

    pub fn num_buffers(&self) -> usize {
        self.0.state.lock().buffers.len()
    }

    pub fn num_free(&self) -> usize {
        self.0.state.lock().free.len()
    }

    pub fn buffers(&self) -> Vec<LinearMem> {
        self.0.state.lock().buffers.clone()
    }

    pub fn status(&self, index: usize) -> Option<BufferStatus> {
        self.0.state.lock().status.get(index).copied()
    }

    pub fn find_buffer_id(&self, bus_address: u64) -> Option<usize> {
        self.0.state.lock().position(bus_address)
    }

    /// Takes the oldest free buffer, waiting for one to be returned in blocking mode.
    pub fn get_buffer(&self, mode: BlockingMode) -> Result<LinearMem, QueueError> {
        let mut state = self.0.state.lock();
        state.check_running()?;

        if state.free.is_empty() {
            if mode == BlockingMode::NonBlocking {
                return Err(QueueError::NoFreeBuffer);
            }

            state = sync::wait_while(&self.0.returned, state, |s| s.free.is_empty())?;
        }

        let index = state.free.pop_front().ok_or(QueueError::NoFreeBuffer)?;
        state.status[index] = BufferStatus::Pending;

        Ok(state.buffers[index].clone())
    }

    /// Brings the buffer at `bus_address` back to the free FIFO.
    pub fn return_buffer(&self, bus_address: u64) -> Result<(), QueueError> {
        let mut state = self.0.state.lock();
        let index = state
            .position(bus_address)
            .ok_or(QueueError::UnknownBuffer(bus_address))?;

        if state.status[index] == BufferStatus::Free {
            log::warn!("buffer {:#x} returned twice", bus_address);
            return Ok(());
        }

        state.status[index] = BufferStatus::Free;
        state.free.push_back(index);
        self.0.returned.notify_all();

        Ok(())
    }

    /// Records that the pending buffer at `bus_address` was handed to the client.
    pub fn set_buf_as_used(&self, bus_address: u64) -> Result<(), QueueError> {
        let mut state = self.0.state.lock();
        let index = state
            .position(bus_address)
            .ok_or(QueueError::UnknownBuffer(bus_address))?;

        if state.status[index] == BufferStatus::Pending {
            state.status[index] = BufferStatus::Used;
            // Waiters on pending buffers may be done now.
            self.0.returned.notify_all();
        }

        Ok(())
    }

    /// Waits until no buffer is being written.
    pub fn wait_pending(&self) -> Result<(), QueueError> {
        let state = self.0.state.lock();
        if !state.any(BufferStatus::Pending) {
            return Ok(());
        }

        sync::wait_while(&self.0.returned, state, |s| s.any(BufferStatus::Pending))?;
        Ok(())
    }

    /// Waits until the client returned every buffer it was handed.
    pub fn wait_not_used(&self) -> Result<(), QueueError> {
        let state = self.0.state.lock();
        if !state.any(BufferStatus::Used) {
            return Ok(());
        }

        sync::wait_while(&self.0.returned, state, |s| s.any(BufferStatus::Used))?;
        Ok(())
    }

    /// Wakes every blocked thread with [`QueueError::Aborted`].
    pub fn set_abort(&self) {
        let mut state = self.0.state.lock();
        state.abort();
        self.0.returned.notify_all();
    }

    pub fn clear_abort(&self) {
        self.0.state.lock().clear_abort();
    }

    /// Marks every buffer as free again, in index order.
    pub fn reset(&self) {
        let mut state = self.0.state.lock();
        let count = state.buffers.len();
        state.status.iter_mut().for_each(|s| *s = BufferStatus::Free);
        state.free = (0..count).collect();
        self.0.returned.notify_all();
    }

    /// Removes every buffer from the queue and returns them.
    pub fn release(&self) -> Vec<LinearMem> {
        let mut state = self.0.state.lock();
        state.status.clear();
        state.free.clear();
        std::mem::take(&mut state.buffers)
    }
}
