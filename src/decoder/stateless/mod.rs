// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the hardware interface targeted by these decoders: the accelerator
//! reconstructs one picture at a time from the parameters it is given, while the decoder keeps
//! the reference picture state and the buffer bookkeeping.
//!
//! The hardware reports the end of a picture through a [`HwCompletion`] handle, possibly from
//! another thread. The client is notified through the [`DecoderClient`] trait.

pub mod h264;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::h264::dpb::DpbError;
use crate::decoder::fb_list::BufferId;
use crate::decoder::fb_list::BufferRef;
use crate::decoder::fb_list::FrameBufferList;
use crate::decoder::fb_list::HwOutput;
use crate::decoder::fb_list::ListError;
use crate::decoder::input_queue::QueueError;
use crate::decoder::BlockingMode;
use crate::decoder::DecodedPicture;
use crate::memory::LinearMem;
use crate::sync;
use crate::sync::Abortable;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::Resolution;

/// Outcome of a successful call to a decoder's `decode` method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The input was consumed without producing a picture, e.g. it was skipped.
    Ok,
    /// A picture was submitted to the hardware.
    PicDecoded,
    /// New stream parameters were found. The input was not consumed and must be submitted again
    /// once the pictures of the previous sequence have been consumed.
    HdrsReady,
    /// No picture buffer is available. The input was not consumed and must be submitted again
    /// once a picture has been consumed.
    WaitingForBuffer,
    /// The input was consumed and the stream has ended.
    StrmProcessed,
}

/// Result of a picture decoded by the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HwStatus {
    Ok,
    /// The picture was decoded, but this many macroblocks contain errors.
    Errors(u32),
    BusError,
    Timeout,
    SystemError,
}

impl HwStatus {
    /// Whether the hardware failed to decode the picture at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HwStatus::BusError | HwStatus::Timeout | HwStatus::SystemError
        )
    }

    /// The error to report to the caller of `decode` for this status, if any.
    pub fn to_error(self) -> Option<DecodeError> {
        match self {
            HwStatus::Ok | HwStatus::Errors(_) => None,
            HwStatus::BusError => Some(DecodeError::HwBusError),
            HwStatus::Timeout => Some(DecodeError::HwTimeout),
            HwStatus::SystemError => Some(DecodeError::SystemError),
        }
    }
}

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("hardware bus error")]
    BusError,
    #[error("hardware timeout")]
    Timeout,
    #[error("hardware system error")]
    SystemError,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Error returned by the decoders.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decoding aborted")]
    Aborted,
    #[error("hardware bus error")]
    HwBusError,
    #[error("hardware timeout")]
    HwTimeout,
    #[error("hardware system error")]
    SystemError,
    #[error("memory allocation failed: {0:#}")]
    MemFail(anyhow::Error),
    #[error("invalid parameter: {0}")]
    ParamError(String),
    #[error("decoder is not initialized")]
    NotInitialized,
    #[error("stream error: {0:#}")]
    StreamError(anyhow::Error),
    #[error(transparent)]
    DecoderError(#[from] anyhow::Error),
}

impl From<ListError> for DecodeError {
    fn from(err: ListError) -> Self {
        match err {
            ListError::Aborted => DecodeError::Aborted,
            e @ ListError::InvalidCapacity(_) => DecodeError::MemFail(e.into()),
            e => DecodeError::DecoderError(e.into()),
        }
    }
}

impl From<QueueError> for DecodeError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Aborted => DecodeError::Aborted,
            e @ QueueError::Full => DecodeError::MemFail(e.into()),
            e => DecodeError::DecoderError(e.into()),
        }
    }
}

impl From<DpbError> for DecodeError {
    fn from(err: DpbError) -> Self {
        match err {
            DpbError::List(e) => e.into(),
            DpbError::NotInitialized => DecodeError::NotInitialized,
            e @ (DpbError::InvalidSize(_) | DpbError::InvalidMaxFrameNum(_)) => {
                DecodeError::StreamError(e.into())
            }
            e @ (DpbError::NoCurrentPicture | DpbError::OutputOverflow) => {
                DecodeError::DecoderError(e.into())
            }
            e => DecodeError::StreamError(e.into()),
        }
    }
}

impl From<StatelessBackendError> for DecodeError {
    fn from(err: StatelessBackendError) -> Self {
        match err {
            StatelessBackendError::BusError => DecodeError::HwBusError,
            StatelessBackendError::Timeout => DecodeError::HwTimeout,
            StatelessBackendError::SystemError => DecodeError::SystemError,
            StatelessBackendError::Other(e) => DecodeError::DecoderError(e),
        }
    }
}

/// Decoder implementations can use this enum to represent their decoding state.
///
/// `F` is a type containing the parsed stream format.
#[derive(Default)]
enum DecodingState<F> {
    /// Decoder will ignore all input until format and resolution information passes by.
    #[default]
    AwaitingStreamInfo,
    /// New stream parameters were found. Decoding resumes with them once the buffers of the
    /// previous sequence are no longer in use.
    AwaitingBuffers(F),
    /// Decoder is currently decoding input.
    Decoding,
    /// Decoder has been reset after a flush or an abort, and can resume with the current
    /// parameters after seeing a key frame.
    Reset,
}

/// Callbacks through which the client learns about the progress of the decoder.
///
/// The callbacks are invoked from whichever thread completes the corresponding transition and
/// must not call back into the decoder.
pub trait DecoderClient: Send + Sync {
    /// A picture is ready to be displayed. Only called by the output thread.
    fn picture_ready(&self, _picture: &DecodedPicture) {}

    /// The hardware finished writing a frame or a field into the buffer `id`.
    fn buffer_decoded(&self, _id: BufferId) {}

    /// The hardware failed to decode the picture in buffer `id`.
    fn notify_error(&self, _id: BufferId, _status: HwStatus) {}

    /// Every picture of the stream has been handed out. Only called by the output thread.
    fn end_of_stream(&self) {}
}

/// A post-processor turning decoded pictures into their final representation.
pub trait PostProcessor: Send {
    /// Starts processing `input` into `output`.
    fn start(
        &mut self,
        input: &LinearMem,
        output: &LinearMem,
        resolution: Resolution,
    ) -> anyhow::Result<()>;

    /// Waits for the processing started by the last call to `start` to finish.
    fn wait(&mut self) -> anyhow::Result<()>;
}

/// Configuration of a decoder.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Whether to wait for the hardware after each picture.
    pub blocking_mode: BlockingMode,
    /// Whether to wait for a picture buffer when none is free, rather than returning
    /// [`DecodeStatus::WaitingForBuffer`].
    pub buffer_wait: BlockingMode,
    /// Picture buffers to allocate on top of what the stream requires, e.g. for the client to
    /// hold on to displayed pictures.
    pub extra_buffers: usize,
    /// Output pictures in decoding order, as soon as they are decoded.
    pub no_reordering: bool,
    /// Output pictures containing errors rather than dropping them.
    pub output_corrupted: bool,
    /// Deliver pictures to the client from a dedicated thread, through
    /// [`DecoderClient::picture_ready`].
    pub output_thread: bool,
    /// Number of post-processor output buffers. Post-processing is disabled if 0.
    pub num_pp_buffers: usize,
    /// Decode the second view of stereo streams and output both views as pairs.
    pub two_view: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            blocking_mode: BlockingMode::Blocking,
            buffer_wait: BlockingMode::Blocking,
            extra_buffers: 1,
            no_reordering: false,
            output_corrupted: true,
            output_thread: false,
            num_pp_buffers: 0,
            two_view: false,
        }
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    /// Pictures submitted and not completed yet.
    pending: usize,
    /// First fatal hardware error not reported to the caller of `decode` yet.
    error: Option<HwStatus>,
    /// Macroblocks per picture, counted as erroneous when the hardware fails.
    pic_size_in_mbs: u32,
    /// Buffers held by the pictures in flight, by target buffer and in submission order. They
    /// stay out of the pool until the hardware is done with them.
    in_flight: HashMap<BufferId, VecDeque<Vec<BufferRef>>>,
}

impl CompletionState {
    fn take_holds(&mut self, mem_idx: BufferId) -> Option<Vec<BufferRef>> {
        let queue = self.in_flight.get_mut(&mem_idx)?;
        let holds = queue.pop_front();
        if queue.is_empty() {
            self.in_flight.remove(&mem_idx);
        }
        holds
    }
}

struct CompletionShared {
    fb_list: FrameBufferList,
    client: Option<Arc<dyn DecoderClient>>,
    state: Mutex<Abortable<CompletionState>>,
    idle: Condvar,
}

/// Handle through which the hardware reports finished pictures.
///
/// This is a handle: clones share the same state. [`HwCompletion::picture_done`] only updates
/// lock-protected state and signals waiters, so it can be called from an interrupt handler or a
/// worker thread.
#[derive(Clone)]
pub struct HwCompletion(Arc<CompletionShared>);

impl HwCompletion {
    pub(crate) fn new(fb_list: FrameBufferList, client: Option<Arc<dyn DecoderClient>>) -> Self {
        Self(Arc::new(CompletionShared {
            fb_list,
            client,
            state: Mutex::new(Abortable::new(Default::default())),
            idle: Condvar::new(),
        }))
    }

    pub(crate) fn set_pic_size_in_mbs(&self, pic_size_in_mbs: u32) {
        self.0.state.lock().pic_size_in_mbs = pic_size_in_mbs;
    }

    /// Records a picture decoded into `mem_idx` as submitted to the hardware. `holds` are
    /// released once the picture is done.
    pub(crate) fn picture_started(&self, mem_idx: BufferId, holds: Vec<BufferRef>) {
        let mut state = self.0.state.lock();
        state.pending += 1;
        state.in_flight.entry(mem_idx).or_default().push_back(holds);
    }

    /// Reports that core `core_id` finished writing fields `mask` of buffer `mem_idx`.
    pub fn picture_done(&self, core_id: usize, mem_idx: BufferId, mask: HwOutput, status: HwStatus) {
        log::debug!(
            "core {} done with buffer {:?} ({:?}): {:?}",
            core_id,
            mem_idx,
            mask,
            status
        );

        let mut state = self.0.state.lock();

        // Completions of pictures forgotten by an abort must not touch buffers that may have
        // been claimed again since.
        let Some(holds) = state.take_holds(mem_idx) else {
            log::warn!("no picture in flight in buffer {:?}, ignoring completion", mem_idx);
            return;
        };

        let errors = match status {
            HwStatus::Ok => 0,
            HwStatus::Errors(n) => n,
            _ => state.pic_size_in_mbs.max(1),
        };

        if errors > 0 {
            if let Err(e) = self.0.fb_list.mark_output_pic_corrupt(mem_idx, errors) {
                log::error!("cannot flag buffer {:?} as corrupt: {}", mem_idx, e);
            }
        }

        if let Err(e) = self.0.fb_list.mark_hw_output(mem_idx, mask, holds) {
            log::error!("cannot mark hardware output of {:?}: {}", mem_idx, e);
        }

        if status.is_fatal() {
            state.error.get_or_insert(status);
        }

        state.pending = state.pending.saturating_sub(1);

        if state.pending == 0 {
            self.0.idle.notify_all();
        }

        drop(state);

        if let Some(client) = &self.0.client {
            client.buffer_decoded(mem_idx);
            if status.is_fatal() {
                client.notify_error(mem_idx, status);
            }
        }
    }

    /// Number of pictures submitted and not completed yet.
    pub fn pending(&self) -> usize {
        self.0.state.lock().pending
    }

    /// Takes the first fatal hardware error reported since the last call.
    pub(crate) fn take_error(&self) -> Option<HwStatus> {
        self.0.state.lock().error.take()
    }

    /// Waits until the hardware completed every submitted picture.
    pub(crate) fn wait_idle(&self) -> Result<(), DecodeError> {
        let state = self.0.state.lock();
        if state.pending == 0 {
            return Ok(());
        }

        sync::wait_while(&self.0.idle, state, |s| s.pending != 0)
            .map_err(|_| DecodeError::Aborted)?;
        Ok(())
    }

    pub(crate) fn abort(&self) {
        let mut state = self.0.state.lock();
        state.abort();
        self.0.idle.notify_all();
    }

    /// Resumes normal operation, forgetting about pictures the hardware will never complete.
    pub(crate) fn clear_abort(&self) {
        let mut state = self.0.state.lock();
        state.clear_abort();
        state.pending = 0;
        state.error = None;
        let in_flight = std::mem::take(&mut state.in_flight);
        drop(state);

        drop(in_flight);
    }
}
