// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[cfg(test)]
mod dummy;

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::dpb::DpbParams;
use crate::codec::h264::parser::RefPicListModification;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::SliceType;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::CurrentPicture;
use crate::codec::h264::picture::DpbOutPicture;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::RefPicList;
use crate::decoder::fb_list::BufferId;
use crate::decoder::fb_list::BufferRef;
use crate::decoder::fb_list::FrameBufferList;
use crate::decoder::fb_list::ListError;
use crate::decoder::output::OutputEvent;
use crate::decoder::output::OutputStage;
use crate::decoder::output::OutputThread;
use crate::decoder::output::PictureConsumer;
use crate::decoder::output::PostProcessing;
use crate::decoder::output::SharedQueue;
use crate::decoder::raster_buffer::RasterBufferMgr;
use crate::decoder::raster_buffer::RasterBufferParams;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::DecodeStatus;
use crate::decoder::stateless::DecoderClient;
use crate::decoder::stateless::DecoderConfig;
use crate::decoder::stateless::DecodingState;
use crate::decoder::stateless::HwCompletion;
use crate::decoder::stateless::HwStatus;
use crate::decoder::stateless::PostProcessor;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::BlockingMode;
use crate::decoder::DecodedPicture;
use crate::memory::LinearAllocator;
use crate::memory::LinearMem;
use crate::memory::MemType;
use crate::Resolution;
use crate::MAX_FRAME_BUFFER_NUMBER;

/// A reference picture as seen by the hardware.
#[derive(Clone, Debug)]
pub struct RefBuffer {
    pub mem: LinearMem,
    /// Referenced field, `Field::Frame` when referencing a frame.
    pub field: Field,
    pub long_term: bool,
}

/// A slice to decode, with its final reference picture lists.
#[derive(Clone, Debug)]
pub struct SliceJob {
    pub slice_type: SliceType,
    pub first_mb_in_slice: u32,
    /// `None` entries stand for missing references.
    pub ref_pic_list0: Vec<Option<RefBuffer>>,
    pub ref_pic_list1: Vec<Option<RefBuffer>>,
    pub data: Bytes,
}

/// Everything the hardware needs to decode a frame or a field.
#[derive(Clone, Debug)]
pub struct PictureJob {
    /// Slot of the output buffer, to be passed back to [`HwCompletion::picture_done`].
    pub mem_idx: BufferId,
    pub output: LinearMem,
    /// Raster copy of `output`, when the hardware writes tiled pictures.
    pub raster_output: Option<LinearMem>,
    pub field: Field,
    /// Whether `output` already holds the first field of the pair.
    pub second_field: bool,
    pub frame_num: u32,
    pub pic_order_cnt: [i32; 2],
    pub is_idr: bool,
    pub is_reference: bool,
    pub view_id: u32,
    pub decode_id: u32,
    pub resolution: Resolution,
    pub slices: Vec<SliceJob>,
}

/// Stateless backend methods specific to H.264.
pub trait StatelessH264DecoderBackend {
    /// Called when a new SPS is activated, once its picture buffers are allocated.
    fn new_sequence(&mut self, sps: &Sps) -> StatelessBackendResult<()>;

    /// Size in bytes of a picture buffer for `sps`.
    fn picture_buffer_size(&self, sps: &Sps) -> usize {
        let luma = sps.width() as usize * sps.height() as usize;
        luma + luma / 2
    }

    /// Whether the hardware writes pictures in a tiled layout, along with a raster copy for the
    /// post-processor.
    fn tiled_output(&self) -> bool {
        false
    }

    /// Starts decoding `job` and returns the core it runs on.
    ///
    /// The end of the picture must be reported through `completion`, from any thread.
    fn start_picture(
        &mut self,
        job: PictureJob,
        completion: HwCompletion,
    ) -> StatelessBackendResult<usize>;

    /// Waits until `core_id` has finished every picture started on it.
    ///
    /// An error means that the pictures of the core will never be reported through their
    /// completion handle.
    fn wait(&mut self, core_id: usize) -> StatelessBackendResult<()>;

    /// Whether `core_id` still has pictures to finish.
    fn query(&self, core_id: usize) -> bool;
}

/// Picture order count of a picture, as computed before decoding it.
#[derive(Clone, Copy, Debug, Default)]
struct PocInfo {
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
    frame_num_offset: i32,
    top_field_order_cnt: i32,
    bottom_field_order_cnt: i32,
}

/// State carried from picture to picture by the picture order count derivations of 8.2.1.
#[derive(Clone, Debug, Default)]
struct PocState {
    prev_pic_order_cnt_msb: i32,
    prev_pic_order_cnt_lsb: i32,
    /// `TopFieldOrderCnt` of the previous reference picture, after memory management.
    prev_ref_top_field_order_cnt: i32,
    prev_ref_has_mmco5: bool,
    prev_ref_is_bottom_field: bool,
    prev_frame_num: u32,
    prev_frame_num_offset: i32,
    prev_has_mmco5: bool,
}

impl PocState {
    fn compute(
        &self,
        sps: &Sps,
        hdr: &SliceHeader,
        is_idr: bool,
        nal_ref_idc: u8,
    ) -> anyhow::Result<PocInfo> {
        match sps.pic_order_cnt_type {
            0 => Ok(self.compute_type_0(sps, hdr, is_idr)),
            1 => self.compute_type_1(sps, hdr, is_idr, nal_ref_idc),
            2 => Ok(self.compute_type_2(sps, hdr, is_idr, nal_ref_idc)),
            t => Err(anyhow!("invalid pic_order_cnt_type {}", t)),
        }
    }

    // 8.2.1.1
    fn compute_type_0(&self, sps: &Sps, hdr: &SliceHeader, is_idr: bool) -> PocInfo {
        let (prev_msb, prev_lsb) = if is_idr {
            (0, 0)
        } else if self.prev_ref_has_mmco5 {
            if self.prev_ref_is_bottom_field {
                (0, 0)
            } else {
                (0, self.prev_ref_top_field_order_cnt)
            }
        } else {
            (self.prev_pic_order_cnt_msb, self.prev_pic_order_cnt_lsb)
        };

        let max_lsb = sps.max_pic_order_cnt_lsb();
        let lsb = i32::from(hdr.pic_order_cnt_lsb);

        let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
            prev_msb + max_lsb
        } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
            prev_msb - max_lsb
        } else {
            prev_msb
        };

        let mut info = PocInfo {
            pic_order_cnt_msb: msb,
            pic_order_cnt_lsb: lsb,
            ..Default::default()
        };

        match hdr.field() {
            Field::Frame => {
                info.top_field_order_cnt = msb + lsb;
                info.bottom_field_order_cnt = msb + lsb + hdr.delta_pic_order_cnt_bottom;
            }
            Field::Top => info.top_field_order_cnt = msb + lsb,
            Field::Bottom => info.bottom_field_order_cnt = msb + lsb,
        }

        info
    }

    /// `FrameNumOffset` of 8.2.1.2 and 8.2.1.3.
    fn frame_num_offset(&self, sps: &Sps, frame_num: u32, is_idr: bool) -> i32 {
        if is_idr {
            return 0;
        }

        let prev_offset = if self.prev_has_mmco5 {
            0
        } else {
            self.prev_frame_num_offset
        };

        if self.prev_frame_num > frame_num {
            prev_offset + sps.max_frame_num() as i32
        } else {
            prev_offset
        }
    }

    // 8.2.1.2
    fn compute_type_1(
        &self,
        sps: &Sps,
        hdr: &SliceHeader,
        is_idr: bool,
        nal_ref_idc: u8,
    ) -> anyhow::Result<PocInfo> {
        let frame_num = u32::from(hdr.frame_num);
        let frame_num_offset = self.frame_num_offset(sps, frame_num, is_idr);
        let cycle_len = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);

        let mut abs_frame_num = if cycle_len != 0 {
            frame_num_offset + frame_num as i32
        } else {
            0
        };

        if nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected_poc = 0;
        if abs_frame_num > 0 {
            let poc_cycle_cnt = (abs_frame_num - 1) / cycle_len;
            let frame_num_in_cycle = ((abs_frame_num - 1) % cycle_len) as usize;

            expected_poc = poc_cycle_cnt * sps.expected_delta_per_pic_order_cnt_cycle;
            for i in 0..=frame_num_in_cycle {
                expected_poc += sps
                    .offset_for_ref_frame
                    .get(i)
                    .ok_or_else(|| anyhow!("offset_for_ref_frame[{}] missing", i))?;
            }
        }

        if nal_ref_idc == 0 {
            expected_poc += sps.offset_for_non_ref_pic;
        }

        let mut info = PocInfo {
            frame_num_offset,
            ..Default::default()
        };

        match hdr.field() {
            Field::Frame => {
                info.top_field_order_cnt = expected_poc + hdr.delta_pic_order_cnt[0];
                info.bottom_field_order_cnt = info.top_field_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + hdr.delta_pic_order_cnt[1];
            }
            Field::Top => info.top_field_order_cnt = expected_poc + hdr.delta_pic_order_cnt[0],
            Field::Bottom => {
                info.bottom_field_order_cnt = expected_poc
                    + sps.offset_for_top_to_bottom_field
                    + hdr.delta_pic_order_cnt[0];
            }
        }

        Ok(info)
    }

    // 8.2.1.3
    fn compute_type_2(&self, sps: &Sps, hdr: &SliceHeader, is_idr: bool, nal_ref_idc: u8) -> PocInfo {
        let frame_num = u32::from(hdr.frame_num);
        let frame_num_offset = self.frame_num_offset(sps, frame_num, is_idr);

        let poc = if is_idr {
            0
        } else if nal_ref_idc == 0 {
            2 * (frame_num_offset + frame_num as i32) - 1
        } else {
            2 * (frame_num_offset + frame_num as i32)
        };

        let mut info = PocInfo {
            frame_num_offset,
            ..Default::default()
        };

        match hdr.field() {
            Field::Frame => {
                info.top_field_order_cnt = poc;
                info.bottom_field_order_cnt = poc;
            }
            Field::Top => info.top_field_order_cnt = poc,
            Field::Bottom => info.bottom_field_order_cnt = poc,
        }

        info
    }

    /// Records the decoded picture `info` for the pictures that follow it.
    fn update(&mut self, info: &PocInfo, cur: &CurrentPicture) {
        let mmco5 = cur.marking.has_mmco_5();

        if cur.is_reference {
            self.prev_ref_has_mmco5 = mmco5;
            self.prev_ref_is_bottom_field = cur.field == Field::Bottom;
            self.prev_ref_top_field_order_cnt = match (mmco5, cur.field) {
                (false, _) => info.top_field_order_cnt,
                (true, Field::Frame) => {
                    info.top_field_order_cnt
                        - info.top_field_order_cnt.min(info.bottom_field_order_cnt)
                }
                (true, _) => 0,
            };
            self.prev_pic_order_cnt_msb = info.pic_order_cnt_msb;
            self.prev_pic_order_cnt_lsb = info.pic_order_cnt_lsb;
        }

        self.prev_has_mmco5 = mmco5;
        self.prev_frame_num = if mmco5 { 0 } else { cur.frame_num };
        self.prev_frame_num_offset = info.frame_num_offset;
    }
}

/// Reference state of one view of the stream.
struct ViewState {
    dpb: Dpb,
    poc: PocState,
}

/// Handle aborting the blocking operations of a [`Decoder`] from another thread.
#[derive(Clone)]
pub struct AbortHandle {
    fb_list: FrameBufferList,
    completion: HwCompletion,
    pp_queue: SharedQueue,
}

impl AbortHandle {
    /// Makes every blocked or future wait of the decoder fail with [`DecodeError::Aborted`], until
    /// [`Decoder::abort_after`] is called.
    pub fn abort(&self) {
        log::debug!("aborting decoder");
        self.fb_list.abort();
        self.completion.abort();
        if let Some(queue) = self.pp_queue.lock().as_ref() {
            queue.set_abort();
        }
    }

    fn clear(&self) {
        self.fb_list.clear_abort();
        self.completion.clear_abort();
        if let Some(queue) = self.pp_queue.lock().as_ref() {
            queue.clear_abort();
        }
    }
}

/// H.264 decoder driving a hardware accelerator.
///
/// The caller parses the stream and hands the slices of one picture at a time to
/// [`Decoder::decode`]. Decoded pictures are taken in display order from
/// [`Decoder::next_picture`], or delivered to the client from an output thread, and must be given
/// back through [`Decoder::picture_consumed`] once displayed.
pub struct Decoder {
    backend: Box<dyn StatelessH264DecoderBackend>,
    allocator: Box<dyn LinearAllocator>,
    config: DecoderConfig,
    client: Option<Arc<dyn DecoderClient>>,
    /// Post-processor to install at the next buffer allocation.
    post_processor: Option<Box<dyn PostProcessor>>,

    decoding_state: DecodingState<Rc<Sps>>,
    active_sps: Option<Rc<Sps>>,
    resolution: Resolution,

    fb_list: FrameBufferList,
    /// Picture buffers owned by the decoder, in slot order.
    buffers: Vec<LinearMem>,
    /// Raster copies of the picture buffers, by bus address of the tiled buffer.
    raster_buffers: HashMap<u64, LinearMem>,

    /// Base view first, then the second view of stereo streams.
    views: Vec<ViewState>,

    completion: HwCompletion,
    /// Cores with pictures started in non-blocking mode.
    busy_cores: Vec<usize>,

    /// `None` while the output thread owns the stage.
    output: Option<OutputStage>,
    output_thread: Option<OutputThread>,
    consumer: PictureConsumer,
    abort_handle: AbortHandle,

    decode_id: u32,
}

impl Decoder {
    /// Creates a new decoder using `backend`, with picture buffers obtained from `allocator`.
    ///
    /// `client` is notified of hardware completions and, if `config.output_thread` is set, gets
    /// the decoded pictures.
    pub fn new(
        backend: Box<dyn StatelessH264DecoderBackend>,
        allocator: Box<dyn LinearAllocator>,
        config: DecoderConfig,
        client: Option<Arc<dyn DecoderClient>>,
    ) -> anyhow::Result<Self> {
        if config.output_thread && client.is_none() {
            return Err(anyhow!("an output thread needs a client to deliver pictures to"));
        }

        let fb_list = FrameBufferList::new(MAX_FRAME_BUFFER_NUMBER)?;
        let num_views = if config.two_view { 2 } else { 1 };
        let views = (0..num_views)
            .map(|_| ViewState {
                dpb: Dpb::new(fb_list.clone()),
                poc: Default::default(),
            })
            .collect();

        let completion = HwCompletion::new(fb_list.clone(), client.clone());
        let output = OutputStage::new(fb_list.clone(), config.output_corrupted, config.two_view);
        let consumer = output.consumer();
        let abort_handle = AbortHandle {
            fb_list: fb_list.clone(),
            completion: completion.clone(),
            pp_queue: output.shared_pp_queue(),
        };

        Ok(Self {
            backend,
            allocator,
            config,
            client,
            post_processor: None,
            decoding_state: Default::default(),
            active_sps: None,
            resolution: Default::default(),
            fb_list,
            buffers: Vec::new(),
            raster_buffers: HashMap::new(),
            views,
            completion,
            busy_cores: Vec::new(),
            output: Some(output),
            output_thread: None,
            consumer,
            abort_handle,
            decode_id: 0,
        })
    }

    /// Sets the post-processor used once the next sequence starts. Requires
    /// `config.num_pp_buffers` to be non-zero.
    pub fn set_post_processor(&mut self, processor: Box<dyn PostProcessor>) {
        self.post_processor = Some(processor);
    }

    /// Resolution of the current sequence.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Number of picture buffers allocated for the current sequence.
    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn active_sps(&self) -> Option<&Sps> {
        self.active_sps.as_deref()
    }

    /// Number of elements waiting in the output FIFO.
    pub fn num_pending_outputs(&self) -> usize {
        self.fb_list.num_pending_outputs()
    }

    /// Returns a handle through which displayed pictures can be given back from another thread.
    pub fn consumer(&self) -> PictureConsumer {
        self.consumer.clone()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Decodes the slices of one picture.
    ///
    /// On [`DecodeStatus::HdrsReady`] and [`DecodeStatus::WaitingForBuffer`] the slices were not
    /// consumed and must be submitted again.
    pub fn decode(
        &mut self,
        timestamp: u64,
        slices: &[Slice<'_>],
    ) -> Result<DecodeStatus, DecodeError> {
        let first = slices
            .first()
            .ok_or_else(|| DecodeError::ParamError("no slice to decode".into()))?;

        self.check_hw_error()?;

        match &self.decoding_state {
            DecodingState::AwaitingStreamInfo | DecodingState::Reset => {
                if !first.idr {
                    log::debug!("skipping non-IDR picture while waiting for a key frame");
                    return Ok(DecodeStatus::Ok);
                }

                if matches!(self.decoding_state, DecodingState::Reset)
                    && self.is_active(&first.sps)
                {
                    self.decoding_state = DecodingState::Decoding;
                } else {
                    self.decoding_state = DecodingState::AwaitingBuffers(Rc::clone(&first.sps));
                    return Ok(DecodeStatus::HdrsReady);
                }
            }
            DecodingState::Decoding => {
                if !self.is_active(&first.sps) {
                    if !first.idr {
                        log::warn!("SPS change on a non-IDR picture, skipping it");
                        return Ok(DecodeStatus::Ok);
                    }

                    log::debug!("new sequence parameters, draining the current sequence");
                    self.drain()?;
                    self.decoding_state = DecodingState::AwaitingBuffers(Rc::clone(&first.sps));
                    return Ok(DecodeStatus::HdrsReady);
                }
            }
            DecodingState::AwaitingBuffers(sps) => {
                let sps = Rc::clone(sps);
                if !self.activate(&sps)? {
                    return Ok(DecodeStatus::WaitingForBuffer);
                }
                self.decoding_state = DecodingState::Decoding;
            }
        }

        self.decode_picture(timestamp, slices)
    }

    /// Returns the next decoded picture in display order, if any.
    ///
    /// Fails if pictures are delivered by the output thread.
    pub fn next_picture(
        &mut self,
        mode: BlockingMode,
    ) -> Result<Option<OutputEvent>, DecodeError> {
        if self.config.output_thread {
            return Err(DecodeError::ParamError(
                "pictures are delivered by the output thread".into(),
            ));
        }

        match self.output.as_mut() {
            Some(stage) => stage.next_event(mode),
            None => Err(DecodeError::NotInitialized),
        }
    }

    /// Gives `pic` back to the decoder once the client is done with it.
    pub fn picture_consumed(&self, pic: &DecodedPicture) -> Result<(), DecodeError> {
        self.consumer.picture_consumed(pic)
    }

    /// Outputs every remaining picture followed by the end of stream marker. Decoding resumes at
    /// the next IDR picture.
    ///
    /// Like [`Decoder::decode`], fails without doing anything if the hardware failed on a picture
    /// started in non-blocking mode.
    pub fn end_of_stream(&mut self) -> Result<DecodeStatus, DecodeError> {
        self.check_hw_error()?;
        self.drain()?;
        self.fb_list.push_end_of_stream()?;

        if self.config.blocking_mode == BlockingMode::Blocking {
            self.wait_hw_idle()?;
        }

        if matches!(self.decoding_state, DecodingState::Decoding) {
            self.decoding_state = DecodingState::Reset;
        }

        Ok(DecodeStatus::StrmProcessed)
    }

    /// Outputs every remaining picture. Decoding resumes at the next IDR picture.
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        self.drain()?;

        if matches!(self.decoding_state, DecodingState::Decoding) {
            self.decoding_state = DecodingState::Reset;
        }

        Ok(())
    }

    /// Aborts every blocking operation of the decoder. See [`AbortHandle::abort`].
    pub fn abort(&self) {
        self.abort_handle.abort();
    }

    /// Resumes operation after [`Decoder::abort`].
    ///
    /// Every picture not handed to the client yet is dropped, and decoding resumes at the next
    /// IDR picture.
    pub fn abort_after(&mut self) -> Result<(), DecodeError> {
        self.abort_handle.abort();
        self.stop_hw();

        if let Some(thread) = self.output_thread.take() {
            self.output = Some(thread.join()?);
        }

        for view in self.views.iter_mut() {
            view.dpb.reset();
            view.poc = Default::default();
        }

        self.fb_list.reset_out_fifo();
        if let Some(stage) = self.output.as_mut() {
            stage.reset();
        }

        self.abort_handle.clear();

        self.decoding_state = match self.decoding_state {
            DecodingState::AwaitingStreamInfo => DecodingState::AwaitingStreamInfo,
            _ if self.active_sps.is_some() => DecodingState::Reset,
            _ => DecodingState::AwaitingStreamInfo,
        };

        self.start_output_thread()
    }

    /// Returns the first fatal error reported by the hardware since the last call, for pictures
    /// whose completion was not waited for.
    fn check_hw_error(&self) -> Result<(), DecodeError> {
        match self.completion.take_error().and_then(HwStatus::to_error) {
            Some(e) => {
                log::warn!("hardware failed on a previous picture: {}", e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn is_active(&self, sps: &Rc<Sps>) -> bool {
        self.active_sps
            .as_ref()
            .map_or(false, |active| Rc::ptr_eq(active, sps) || **active == **sps)
    }

    /// Activates `sps`, reallocating the picture buffers if needed. Returns `false` if the buffers
    /// of the previous sequence are still in use and the decoder must not wait for them.
    fn activate(&mut self, sps: &Rc<Sps>) -> Result<bool, DecodeError> {
        let params = DpbParams::from_sps(sps, self.config.no_reordering);
        let per_view = params.dpb_size.max(params.max_ref_frames as usize) + 1;
        let count = per_view * self.views.len() + self.config.extra_buffers;
        if count > MAX_FRAME_BUFFER_NUMBER {
            return Err(DecodeError::MemFail(anyhow!(
                "{} picture buffers needed, at most {} supported",
                count,
                MAX_FRAME_BUFFER_NUMBER
            )));
        }

        let size = self.backend.picture_buffer_size(sps);
        let reallocate = self.buffers.len() != count || self.buffers.iter().any(|b| b.size < size);

        if reallocate {
            if self.config.buffer_wait == BlockingMode::NonBlocking
                && self.fb_list.free_buffer_count() != self.fb_list.capacity()
            {
                log::debug!("buffers of the previous sequence still in use");
                return Ok(false);
            }

            self.wait_hw_idle()?;
            self.fb_list.wait_list_not_in_use()?;
            self.reallocate(count, size)?;
        }

        self.resolution = Resolution::from((sps.width(), sps.height()));
        for view in self.views.iter_mut() {
            view.dpb.init(params)?;
            view.poc = Default::default();
        }

        self.completion.set_pic_size_in_mbs(sps.pic_size_in_mbs());
        self.backend.new_sequence(sps)?;
        self.active_sps = Some(Rc::clone(sps));

        log::info!(
            "sequence {}x{}, DPB size {}, {} picture buffers",
            self.resolution.width,
            self.resolution.height,
            params.dpb_size,
            self.buffers.len()
        );

        Ok(true)
    }

    /// Replaces every picture buffer with `count` buffers of `size` bytes, and rebuilds the
    /// post-processing stage for them.
    fn reallocate(&mut self, count: usize, size: usize) -> Result<(), DecodeError> {
        if let Some(mut pp) = self.with_output_stage(|stage| stage.set_post_processing(None))? {
            pp.raster.release(self.allocator.as_mut());
            if self.post_processor.is_none() {
                self.post_processor = Some(pp.processor);
            }
        }
        self.raster_buffers.clear();

        let mut buffers = Vec::with_capacity(count);
        for i in 0..count {
            match self.allocator.alloc_linear(size, MemType::Dpb) {
                Ok(mem) => buffers.push(mem),
                Err(e) => {
                    for mem in buffers {
                        self.allocator.free_linear(mem);
                    }
                    return Err(DecodeError::MemFail(
                        e.context(format!("allocating picture buffer {} of {}", i, count)),
                    ));
                }
            }
        }

        let old = match self.fb_list.replace_buffers(buffers.clone()) {
            Ok(old) => old,
            Err(e) => {
                for mem in buffers {
                    self.allocator.free_linear(mem);
                }
                return Err(e.into());
            }
        };

        for mem in old {
            self.allocator.free_linear(mem);
        }
        self.buffers = buffers;

        if self.config.num_pp_buffers == 0 {
            return Ok(());
        }

        let Some(processor) = self.post_processor.take() else {
            log::warn!("post-processor buffers requested without a post-processor");
            return Ok(());
        };

        let tiled_buffers = if self.backend.tiled_output() {
            self.buffers.clone()
        } else {
            Vec::new()
        };

        let raster = match RasterBufferMgr::new(
            RasterBufferParams {
                tiled_buffers: tiled_buffers.clone(),
                raster_size: size,
                num_pp_buffers: self.config.num_pp_buffers,
                pp_size: size,
            },
            self.allocator.as_mut(),
        ) {
            Ok(raster) => raster,
            Err(e) => {
                self.post_processor = Some(processor);
                return Err(DecodeError::MemFail(e));
            }
        };

        for tiled in tiled_buffers.iter() {
            if let Some(mem) = raster.raster_for(tiled.bus_address) {
                self.raster_buffers.insert(tiled.bus_address, mem);
            }
        }

        self.with_output_stage(|stage| {
            stage.set_post_processing(Some(PostProcessing { raster, processor }))
        })?;

        Ok(())
    }

    /// Runs `f` on the output stage, stopping the output thread for the duration of the call.
    fn with_output_stage<R>(
        &mut self,
        f: impl FnOnce(&mut OutputStage) -> R,
    ) -> Result<R, DecodeError> {
        if let Some(thread) = self.output_thread.take() {
            self.fb_list.abort();
            let stage = thread.join();
            self.fb_list.clear_abort();
            self.output = Some(stage?);
        }

        let stage = self
            .output
            .as_mut()
            .ok_or_else(|| anyhow!("the output stage was lost"))?;
        let result = f(stage);

        self.start_output_thread()?;

        Ok(result)
    }

    fn start_output_thread(&mut self) -> Result<(), DecodeError> {
        if !self.config.output_thread || self.output_thread.is_some() {
            return Ok(());
        }

        let (Some(client), Some(stage)) = (self.client.clone(), self.output.take()) else {
            return Ok(());
        };

        self.output_thread = Some(OutputThread::spawn(stage, client)?);
        Ok(())
    }

    /// Waits for every picture started on the hardware to complete.
    fn wait_hw_idle(&mut self) -> Result<(), DecodeError> {
        for core in std::mem::take(&mut self.busy_cores) {
            if self.backend.query(core) {
                self.backend.wait(core)?;
            }
        }

        self.completion.wait_idle()
    }

    /// Waits for the hardware to stop writing into the picture buffers, ignoring its errors.
    fn stop_hw(&mut self) {
        for core in std::mem::take(&mut self.busy_cores) {
            if self.backend.query(core) {
                if let Err(e) = self.backend.wait(core) {
                    log::warn!("core {} did not stop cleanly: {}", core, e);
                }
            }
        }
    }

    /// Outputs every picture of every view.
    fn drain(&mut self) -> Result<(), DecodeError> {
        for view in self.views.iter_mut() {
            if view.dpb.is_initialized() {
                view.dpb.flush()?;
            }
        }

        // Both views of a picture must reach the FIFO one after the other.
        loop {
            let mut pushed = false;
            for view in 0..self.views.len() {
                if let Some(out) = self.views[view].dpb.output_picture() {
                    self.push_output(out)?;
                    pushed = true;
                }
            }

            if !pushed {
                return Ok(());
            }
        }
    }

    /// Moves the pictures output by the DPB of `view` to the output FIFO.
    fn push_outputs(&mut self, view: usize) -> Result<(), DecodeError> {
        while let Some(out) = self.views[view].dpb.output_picture() {
            self.push_output(out)?;
        }

        Ok(())
    }

    fn push_output(&self, out: DpbOutPicture) -> Result<(), DecodeError> {
        let id = out.id();
        let mem = self
            .fb_list
            .data_by_id(id)
            .ok_or(ListError::InvalidId(id))?;

        self.fb_list.push_output_pic(DecodedPicture {
            id,
            mem,
            pic_id: out.pic_id,
            decode_id: out.decode_id,
            timestamp: out.timestamp,
            pic_order_cnt: out.pic_order_cnt,
            resolution: self.resolution,
            is_idr: out.is_idr,
            interlaced: out.interlaced,
            fields: out.fields,
            num_err_mbs: out.num_err_mbs,
            concealed: out.concealed,
            view_id: out.view_id,
            post_processed: false,
        })?;

        // The FIFO now keeps the buffer out of the pool.
        out.buffer.release()?;

        Ok(())
    }

    fn decode_picture(
        &mut self,
        timestamp: u64,
        slices: &[Slice<'_>],
    ) -> Result<DecodeStatus, DecodeError> {
        let first = slices
            .first()
            .ok_or_else(|| DecodeError::ParamError("no slice to decode".into()))?;

        let view = match (first.view_id, self.config.two_view) {
            (0, _) => 0,
            (_, true) => 1,
            (view_id, false) => {
                log::debug!("skipping picture of view {}", view_id);
                return Ok(DecodeStatus::Ok);
            }
        };

        let sps = Rc::clone(&first.sps);
        let hdr = &first.header;
        let field = hdr.field();
        let frame_num = u32::from(hdr.frame_num);
        let is_reference = first.nal_ref_idc != 0;

        let poc = self.views[view]
            .poc
            .compute(&sps, hdr, first.idr, first.nal_ref_idc)
            .map_err(DecodeError::StreamError)?;

        let mut cur = CurrentPicture {
            frame_num,
            field,
            pic_order_cnt: [poc.top_field_order_cnt, poc.bottom_field_order_cnt],
            is_idr: first.idr,
            is_reference,
            marking: hdr.dec_ref_pic_marking.clone(),
            decode_id: self.decode_id,
            timestamp,
            view_id: first.view_id,
            ..Default::default()
        };

        let (target, second_field) = match self.views[view]
            .dpb
            .attach_second_field(frame_num, field, is_reference)
        {
            Some(id) => (id, true),
            None => match self.new_picture(view, &sps, &cur)? {
                Some(id) => (id, false),
                None => return Ok(DecodeStatus::WaitingForBuffer),
            },
        };

        self.views[view].dpb.set_pic_nums(frame_num, field);

        // Buffers the hardware touches, kept out of the pool until it is done with the picture.
        let mut used = vec![target];
        let mut slice_jobs = Vec::with_capacity(slices.len());
        for slice in slices {
            let (list0, list1, concealed) = self.build_ref_pic_lists(view, &slice.header, &cur);
            cur.concealed |= concealed;

            slice_jobs.push(SliceJob {
                slice_type: slice.header.slice_type,
                first_mb_in_slice: slice.header.first_mb_in_slice,
                ref_pic_list0: self.ref_buffers(view, &list0, &mut used),
                ref_pic_list1: self.ref_buffers(view, &list1, &mut used),
                data: Bytes::copy_from_slice(slice.data),
            });
        }

        used.sort();
        used.dedup();
        let holds = used
            .into_iter()
            .map(|id| self.fb_list.acquire(id))
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .fb_list
            .data_by_id(target)
            .ok_or(ListError::InvalidId(target))?;

        let job = PictureJob {
            mem_idx: target,
            raster_output: self.raster_buffers.get(&output.bus_address).cloned(),
            output,
            field,
            second_field,
            frame_num,
            pic_order_cnt: cur.pic_order_cnt,
            is_idr: cur.is_idr,
            is_reference,
            view_id: cur.view_id,
            decode_id: cur.decode_id,
            resolution: self.resolution,
            slices: slice_jobs,
        };

        // The picture is stored even if the hardware failed, so that the reference state keeps
        // following the stream.
        let hw_result = self.submit(job, holds);

        let marking = self.views[view].dpb.mark_dec_ref_pic(&cur);
        self.views[view].poc.update(&poc, &cur);
        self.decode_id = self.decode_id.wrapping_add(1);
        self.push_outputs(view)?;

        match marking {
            Ok(()) => (),
            Err(DpbError::Mmco(e)) => {
                log::warn!("reference marking of picture {}: {}", cur.decode_id, e)
            }
            Err(e) => return Err(e.into()),
        }

        hw_result?;

        Ok(DecodeStatus::PicDecoded)
    }

    /// Claims a buffer for a new frame or first field, after handling gaps in `frame_num`.
    /// Returns `None` if no buffer is free and the decoder must not wait for one.
    fn new_picture(
        &mut self,
        view: usize,
        sps: &Sps,
        cur: &CurrentPicture,
    ) -> Result<Option<BufferId>, DecodeError> {
        let dpb = &mut self.views[view].dpb;

        if !cur.is_idr {
            match dpb.check_gaps_in_frame_num(
                cur.frame_num,
                cur.is_reference,
                sps.gaps_in_frame_num_value_allowed_flag,
            ) {
                Ok(()) => (),
                Err(e @ (DpbError::FrameNumGap { .. } | DpbError::DuplicateFrameNum(_))) => {
                    log::warn!("{}", e);
                    dpb.recover(cur.frame_num, cur.poc())?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.push_outputs(view)?;

        match self.views[view].dpb.allocate_image(self.config.buffer_wait) {
            Ok(id) => Ok(Some(id)),
            Err(DpbError::List(ListError::NoFreeBuffer)) => {
                log::debug!("no free picture buffer");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Builds the final reference picture lists of `hdr`. The last element is set if references
    /// had to be concealed.
    fn build_ref_pic_lists(
        &self,
        view: usize,
        hdr: &SliceHeader,
        cur: &CurrentPicture,
    ) -> (RefPicList, RefPicList, bool) {
        let dpb = &self.views[view].dpb;
        let (list0, list1) = dpb.init_ref_pic_list(hdr.slice_type, cur.field, cur.poc());

        let mut concealed = false;

        let list0 = if hdr.slice_type.uses_list0() {
            let modifications = if hdr.ref_pic_list_modification_flag_l0 {
                hdr.ref_pic_list_modification_l0.as_slice()
            } else {
                &[]
            };
            let num_active = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
            finish_ref_pic_list(dpb, list0, modifications, num_active, cur, &mut concealed)
        } else {
            list0
        };

        let list1 = if hdr.slice_type.is_b() {
            let modifications = if hdr.ref_pic_list_modification_flag_l1 {
                hdr.ref_pic_list_modification_l1.as_slice()
            } else {
                &[]
            };
            let num_active = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;
            finish_ref_pic_list(dpb, list1, modifications, num_active, cur, &mut concealed)
        } else {
            list1
        };

        (list0, list1, concealed)
    }

    /// Resolves the entries of `list` into buffers, adding their slots to `used`.
    fn ref_buffers(
        &self,
        view: usize,
        list: &RefPicList,
        used: &mut Vec<BufferId>,
    ) -> Vec<Option<RefBuffer>> {
        let dpb = &self.views[view].dpb;

        list.iter()
            .map(|entry| {
                let pic = (*entry)?;
                let id = dpb.ref_buffer(pic)?;
                let mem = self.fb_list.data_by_id(id)?;
                let long_term = dpb.picture(pic.index).map_or(false, |p| p.is_long_term());
                used.push(id);

                Some(RefBuffer {
                    mem,
                    field: pic.field,
                    long_term,
                })
            })
            .collect()
    }

    /// Hands `job` to the hardware, and waits for it in blocking mode. `holds` keep the buffers
    /// of the job out of the pool until the hardware reports it done.
    fn submit(&mut self, job: PictureJob, holds: Vec<BufferRef>) -> Result<(), DecodeError> {
        let mem_idx = job.mem_idx;
        let mask = job.field.mask();

        self.completion.picture_started(mem_idx, holds);
        let core = match self.backend.start_picture(job, self.completion.clone()) {
            Ok(core) => core,
            Err(e) => {
                log::error!("cannot start picture in buffer {:?}: {}", mem_idx, e);
                self.completion
                    .picture_done(0, mem_idx, mask, HwStatus::SystemError);
                self.completion.take_error();
                return Err(e.into());
            }
        };

        if self.config.blocking_mode == BlockingMode::NonBlocking {
            if !self.busy_cores.contains(&core) {
                self.busy_cores.push(core);
            }
            return Ok(());
        }

        if let Err(e) = self.backend.wait(core) {
            log::error!("core {} failed on buffer {:?}: {}", core, mem_idx, e);
            self.completion
                .picture_done(core, mem_idx, mask, HwStatus::Timeout);
            self.completion.take_error();
            return Err(e.into());
        }

        match self.completion.take_error().and_then(HwStatus::to_error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Applies the modifications to `list`, sized to `num_active` entries, and conceals the missing
/// references.
fn finish_ref_pic_list(
    dpb: &Dpb,
    mut list: RefPicList,
    modifications: &[RefPicListModification],
    num_active: usize,
    cur: &CurrentPicture,
    concealed: &mut bool,
) -> RefPicList {
    if let Err(e) =
        dpb.reorder_ref_pic_list(&mut list, modifications, num_active, cur.frame_num, cur.field)
    {
        log::warn!("reference list modification: {}", e);
        list.resize(num_active, None);
        *concealed = true;
    }

    if let Err(e) = dpb.check_ref_pic_list(&list, num_active) {
        log::warn!("{}", e);
        let replaced = dpb.conceal_ref_pic_list(&mut list, num_active);
        log::debug!("{} references concealed", replaced);
        *concealed = true;
    }

    list
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.abort_handle.abort();

        if let Some(thread) = self.output_thread.take() {
            match thread.join() {
                Ok(stage) => self.output = Some(stage),
                Err(e) => log::error!("{}", e),
            }
        }

        self.stop_hw();

        for view in self.views.iter_mut() {
            view.dpb.reset();
        }

        if let Some(stage) = self.output.as_mut() {
            if let Some(mut pp) = stage.set_post_processing(None) {
                pp.raster.release(self.allocator.as_mut());
            }
        }

        for mem in self.buffers.drain(..) {
            self.allocator.free_linear(mem);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::dummy::Backend;
    use super::dummy::HeldBackend;
    use super::*;
    use crate::codec::h264::parser::Level;
    use crate::codec::h264::parser::MmcoOp;
    use crate::codec::h264::parser::RefPicMarking;
    use crate::codec::h264::parser::RefPicMarkingInner;
    use crate::codec::h264::parser::VuiParams;
    use crate::memory::SystemAllocator;
    use crate::sync::Mutex;

    const PAYLOAD: &[u8] = &[0x25, 0xb8, 0x40, 0x07, 0xf1];

    fn sps(width_in_mbs: u16, height_in_mbs: u16, pic_order_cnt_type: u8) -> Sps {
        Sps {
            profile_idc: 100,
            level_idc: Level::L3,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4: 2,
            max_num_ref_frames: 2,
            pic_width_in_mbs_minus1: width_in_mbs - 1,
            pic_height_in_map_units_minus1: height_in_mbs - 1,
            frame_mbs_only_flag: true,
            vui_parameters_present_flag: true,
            vui_parameters: VuiParams {
                bitstream_restriction_flag: true,
                max_num_reorder_frames: 2,
                max_dec_frame_buffering: 2,
            },
            ..Default::default()
        }
    }

    #[derive(Clone, Debug, Default)]
    struct Pic {
        slice_type: SliceType,
        frame_num: u16,
        poc_lsb: u16,
        reference: bool,
        idr: bool,
        field: Field,
        marking: RefPicMarking,
        view_id: u32,
    }

    fn idr(poc_lsb: u16) -> Pic {
        Pic {
            slice_type: SliceType::I,
            poc_lsb,
            reference: true,
            idr: true,
            ..Default::default()
        }
    }

    fn p(frame_num: u16, poc_lsb: u16) -> Pic {
        Pic {
            slice_type: SliceType::P,
            frame_num,
            poc_lsb,
            reference: true,
            ..Default::default()
        }
    }

    fn b(frame_num: u16, poc_lsb: u16) -> Pic {
        Pic {
            slice_type: SliceType::B,
            frame_num,
            poc_lsb,
            ..Default::default()
        }
    }

    /// Splits `pic` in two slices.
    fn slices(sps: &Rc<Sps>, pic: &Pic) -> Vec<Slice<'static>> {
        (0..2)
            .map(|i| Slice {
                header: SliceHeader {
                    first_mb_in_slice: i as u32 * sps.pic_size_in_mbs() / 2,
                    slice_type: pic.slice_type,
                    frame_num: pic.frame_num,
                    field_pic_flag: pic.field != Field::Frame,
                    bottom_field_flag: pic.field == Field::Bottom,
                    pic_order_cnt_lsb: pic.poc_lsb,
                    dec_ref_pic_marking: pic.marking.clone(),
                    ..Default::default()
                },
                sps: Rc::clone(sps),
                nal_ref_idc: u8::from(pic.reference),
                idr: pic.idr,
                view_id: pic.view_id,
                data: &PAYLOAD[i..],
            })
            .collect()
    }

    fn stream(sps: Sps, pics: Vec<Pic>) -> Vec<(Rc<Sps>, Pic)> {
        let sps = Rc::new(sps);
        pics.into_iter().map(|pic| (Rc::clone(&sps), pic)).collect()
    }

    /// I P B B P B B in decoding order, 0 2 4 6 8 10 12 in display order.
    fn ipbb() -> Vec<Pic> {
        vec![
            idr(0),
            p(1, 6),
            b(2, 2),
            b(2, 4),
            p(2, 12),
            b(3, 8),
            b(3, 10),
        ]
    }

    /// What the client saw of a picture.
    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Frame {
        poc: i32,
        crc: String,
        view_id: u32,
        corrupt: bool,
        size: usize,
    }

    fn test_config(blocking_mode: BlockingMode) -> DecoderConfig {
        DecoderConfig {
            blocking_mode,
            buffer_wait: BlockingMode::NonBlocking,
            ..Default::default()
        }
    }

    /// Records and gives back the pictures of `event`. Returns `false` at the end of the stream.
    fn record(decoder: &Decoder, event: OutputEvent, frames: &mut Vec<Frame>) -> bool {
        let pics = match event {
            OutputEvent::Picture(pic) => vec![pic],
            OutputEvent::ViewPair(base, second) => vec![base, second],
            OutputEvent::EndOfStream => return false,
        };

        for pic in pics {
            frames.push(Frame {
                poc: pic.pic_order_cnt,
                crc: format!("{:08x}", pic.crc32().unwrap()),
                view_id: pic.view_id,
                corrupt: pic.is_corrupt(),
                size: pic.mem.size,
            });
            decoder.picture_consumed(&pic).unwrap();
        }

        true
    }

    fn next_blocking(decoder: &mut Decoder, frames: &mut Vec<Frame>) {
        assert!(
            decoder.num_pending_outputs() > 0,
            "no pending picture to wait for"
        );
        let event = decoder.next_picture(BlockingMode::Blocking).unwrap().unwrap();
        record(decoder, event, frames);
    }

    /// Decodes `stream` the way a simple playback loop would, returning the pictures in display
    /// order.
    fn decode_stream(decoder: &mut Decoder, stream: &[(Rc<Sps>, Pic)]) -> Vec<Frame> {
        let mut frames = Vec::new();

        for (timestamp, (sps, pic)) in stream.iter().enumerate() {
            let slices = slices(sps, pic);

            loop {
                match decoder.decode(timestamp as u64, &slices) {
                    Ok(DecodeStatus::HdrsReady) => {
                        while decoder.num_pending_outputs() > 0 {
                            next_blocking(decoder, &mut frames);
                        }
                    }
                    Ok(DecodeStatus::WaitingForBuffer) => {
                        if decoder.num_pending_outputs() > 0 {
                            next_blocking(decoder, &mut frames);
                        } else {
                            // Buffers are held by pictures the hardware is still decoding.
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    Ok(_) => break,
                    Err(e) => panic!("decoding picture {}: {}", timestamp, e),
                }
            }

            while let Some(event) = decoder.next_picture(BlockingMode::NonBlocking).unwrap() {
                record(decoder, event, &mut frames);
            }
        }

        assert_eq!(decoder.end_of_stream().unwrap(), DecodeStatus::StrmProcessed);
        while let Some(event) = decoder.next_picture(BlockingMode::Blocking).unwrap() {
            if !record(decoder, event, &mut frames) {
                break;
            }
        }

        frames
    }

    /// Run `stream` using the dummy decoder, in both blocking and non-blocking modes, and check
    /// that both modes give the same pictures.
    fn test_decoder_dummy(stream: &[(Rc<Sps>, Pic)], blocking_mode: BlockingMode) -> Vec<Frame> {
        let mut decoder = Decoder::new_dummy(Backend::new(), test_config(blocking_mode)).unwrap();
        let frames = decode_stream(&mut decoder, stream);

        let other_mode = match blocking_mode {
            BlockingMode::Blocking => BlockingMode::NonBlocking,
            BlockingMode::NonBlocking => BlockingMode::Blocking,
        };
        let mut decoder = Decoder::new_dummy(Backend::new(), test_config(other_mode)).unwrap();
        assert_eq!(decode_stream(&mut decoder, stream), frames);

        frames
    }

    fn pocs(frames: &[Frame]) -> Vec<i32> {
        frames.iter().map(|f| f.poc).collect()
    }

    #[test]
    fn test_i_p_block() {
        let mut pics = vec![idr(0)];
        pics.extend((1..5).map(|i| p(i, 2 * i)));
        let frames = test_decoder_dummy(&stream(sps(4, 4, 0), pics), BlockingMode::Blocking);

        assert_eq!(pocs(&frames), vec![0, 2, 4, 6, 8]);
        assert!(frames.iter().all(|f| !f.corrupt && f.size == 64 * 64 * 3 / 2));
    }

    #[test]
    fn test_ipbb_block() {
        let frames = test_decoder_dummy(&stream(sps(4, 4, 0), ipbb()), BlockingMode::Blocking);
        assert_eq!(pocs(&frames), vec![0, 2, 4, 6, 8, 10, 12]);
    }

    #[test]
    fn test_ipbb_nonblock() {
        let frames = test_decoder_dummy(&stream(sps(4, 4, 0), ipbb()), BlockingMode::NonBlocking);
        assert_eq!(pocs(&frames), vec![0, 2, 4, 6, 8, 10, 12]);

        // Pictures predicted from different references do not look alike.
        let mut crcs: Vec<_> = frames.iter().map(|f| f.crc.clone()).collect();
        crcs.sort();
        crcs.dedup();
        assert_eq!(crcs.len(), frames.len());
    }

    #[test]
    fn test_poc_type_2_block() {
        let pics = vec![idr(0), p(1, 0), p(2, 0), p(3, 0)];
        let frames = test_decoder_dummy(&stream(sps(2, 2, 2), pics), BlockingMode::Blocking);
        assert_eq!(pocs(&frames), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_poc_type_1_nonblock() {
        let sps = Sps {
            num_ref_frames_in_pic_order_cnt_cycle: 1,
            offset_for_ref_frame: vec![4],
            expected_delta_per_pic_order_cnt_cycle: 4,
            offset_for_non_ref_pic: -2,
            ..sps(2, 2, 1)
        };
        // The non-reference picture is displayed before the reference picture preceding it.
        let pics = vec![idr(0), p(1, 0), b(2, 0), p(2, 0)];
        let frames = test_decoder_dummy(&stream(sps, pics), BlockingMode::NonBlocking);
        assert_eq!(pocs(&frames), vec![0, 2, 4, 8]);
    }

    #[test]
    fn test_frame_num_wrap_block() {
        // MaxFrameNum is 16.
        let mut pics = vec![idr(0)];
        pics.extend((1..20).map(|i| p(i % 16, 0)));
        let frames = test_decoder_dummy(&stream(sps(2, 2, 2), pics), BlockingMode::Blocking);

        assert_eq!(pocs(&frames), (0..20).map(|i| 2 * i).collect::<Vec<_>>());
    }

    fn field(mut pic: Pic, field: Field, poc_lsb: u16) -> Pic {
        pic.field = field;
        pic.poc_lsb = poc_lsb;
        pic
    }

    #[test]
    fn test_field_pairs_nonblock() {
        let sps = Sps {
            frame_mbs_only_flag: false,
            ..sps(4, 2, 0)
        };
        let pics = vec![
            field(idr(0), Field::Top, 0),
            // The second field of an IDR picture is not an IDR picture itself.
            field(p(0, 0), Field::Bottom, 1),
            field(p(1, 0), Field::Top, 4),
            field(p(1, 0), Field::Bottom, 5),
        ];
        let frames = test_decoder_dummy(&stream(sps, pics), BlockingMode::NonBlocking);

        assert_eq!(pocs(&frames), vec![0, 4]);
        assert!(frames.iter().all(|f| !f.corrupt));
    }

    #[test]
    fn test_unpaired_field_block() {
        let sps = Sps {
            frame_mbs_only_flag: false,
            ..sps(4, 2, 0)
        };
        let pics = vec![
            field(idr(0), Field::Top, 0),
            field(p(0, 0), Field::Bottom, 1),
            field(p(1, 0), Field::Top, 4),
            p(2, 8),
        ];
        let frames = test_decoder_dummy(&stream(sps, pics), BlockingMode::Blocking);
        assert_eq!(pocs(&frames), vec![0, 4, 8]);
    }

    #[test]
    fn test_gaps_allowed_block() {
        let sps = Sps {
            gaps_in_frame_num_value_allowed_flag: true,
            ..sps(2, 2, 0)
        };
        let pics = vec![idr(0), p(1, 2), p(4, 8), p(5, 10)];
        let frames = test_decoder_dummy(&stream(sps, pics), BlockingMode::Blocking);

        // Frames inferred from the gap are never output, and predicting from them conceals.
        assert_eq!(pocs(&frames), vec![0, 2, 8, 10]);
        let corrupt: Vec<_> = frames.iter().map(|f| f.corrupt).collect();
        assert_eq!(corrupt, vec![false, false, true, false]);
    }

    #[test]
    fn test_gaps_not_allowed_nonblock() {
        let pics = vec![idr(0), p(1, 2), p(4, 8), p(5, 10), idr(0), p(1, 2)];
        let frames = test_decoder_dummy(&stream(sps(2, 2, 0), pics), BlockingMode::NonBlocking);

        assert_eq!(pocs(&frames), vec![0, 2, 8, 10, 0, 2]);
        let corrupt: Vec<_> = frames.iter().map(|f| f.corrupt).collect();
        // Concealment lasts until the next IDR picture.
        assert_eq!(corrupt, vec![false, false, true, true, false, false]);
    }

    #[test]
    fn test_no_output_of_prior_pics_block() {
        let mut second_idr = idr(0);
        second_idr.marking.no_output_of_prior_pics_flag = true;

        // The last P picture is still waiting for output when the second IDR comes in.
        let pics = vec![idr(0), p(1, 6), b(2, 2), second_idr, p(1, 2)];
        let frames = test_decoder_dummy(&stream(sps(2, 2, 0), pics), BlockingMode::Blocking);
        assert_eq!(pocs(&frames), vec![0, 2, 0, 2]);
    }

    #[test]
    fn test_mmco5_nonblock() {
        let mut reset = p(2, 12);
        reset.marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: vec![RefPicMarkingInner {
                memory_management_control_operation: MmcoOp::MarkAllUnused as u8,
                ..Default::default()
            }],
            ..Default::default()
        };

        // After the reset, counting starts over from the reset picture.
        let pics = vec![idr(0), p(1, 4), reset, p(1, 4), p(2, 8)];
        let frames = test_decoder_dummy(&stream(sps(2, 2, 0), pics), BlockingMode::NonBlocking);
        assert_eq!(pocs(&frames), vec![0, 4, 0, 4, 8]);
    }

    #[test]
    fn test_resolution_change_block() {
        let mut stream_ = stream(sps(2, 2, 0), vec![idr(0), p(1, 2)]);
        stream_.extend(stream(sps(4, 4, 0), vec![idr(0), p(1, 2), p(2, 4)]));

        let frames = test_decoder_dummy(&stream_, BlockingMode::Blocking);
        let sizes: Vec<_> = frames.iter().map(|f| f.size).collect();
        assert_eq!(
            sizes,
            vec![32 * 32 * 3 / 2, 32 * 32 * 3 / 2, 96 * 64, 96 * 64, 96 * 64]
        );
        assert_eq!(pocs(&frames), vec![0, 2, 0, 2, 4]);
    }

    #[test]
    fn test_resolution_change_waits_for_buffers() {
        let mut decoder =
            Decoder::new_dummy(Backend::new(), test_config(BlockingMode::Blocking)).unwrap();
        let small = Rc::new(sps(2, 2, 0));
        let large = Rc::new(sps(4, 4, 0));

        assert_eq!(
            decoder.decode(0, &slices(&small, &idr(0))).unwrap(),
            DecodeStatus::HdrsReady
        );
        assert_eq!(
            decoder.decode(0, &slices(&small, &idr(0))).unwrap(),
            DecodeStatus::PicDecoded
        );
        assert_eq!(decoder.resolution(), Resolution::from((32, 32)));

        assert_eq!(
            decoder.decode(1, &slices(&large, &idr(0))).unwrap(),
            DecodeStatus::HdrsReady
        );

        // The first picture is still held by the client.
        let event = decoder.next_picture(BlockingMode::Blocking).unwrap().unwrap();
        let OutputEvent::Picture(pic) = event else {
            panic!("expected a picture");
        };
        assert_eq!(
            decoder.decode(1, &slices(&large, &idr(0))).unwrap(),
            DecodeStatus::WaitingForBuffer
        );

        decoder.picture_consumed(&pic).unwrap();
        assert_eq!(
            decoder.decode(1, &slices(&large, &idr(0))).unwrap(),
            DecodeStatus::PicDecoded
        );
        assert_eq!(decoder.resolution(), Resolution::from((64, 64)));
    }

    #[test]
    fn test_non_idr_start_is_skipped() {
        let mut decoder =
            Decoder::new_dummy(Backend::new(), test_config(BlockingMode::Blocking)).unwrap();
        let sps = Rc::new(sps(2, 2, 0));

        assert_eq!(
            decoder.decode(0, &slices(&sps, &p(1, 2))).unwrap(),
            DecodeStatus::Ok
        );
        assert_eq!(decoder.num_buffers(), 0);
        assert!(matches!(decoder.decode(0, &[]), Err(DecodeError::ParamError(_))));
    }

    #[test]
    fn test_hw_error_block() {
        let backend = Backend::new().with_failure(1, HwStatus::Timeout);
        let mut decoder = Decoder::new_dummy(backend, test_config(BlockingMode::Blocking)).unwrap();
        let sps = Rc::new(sps(2, 2, 0));

        assert_eq!(
            decoder.decode(0, &slices(&sps, &idr(0))).unwrap(),
            DecodeStatus::HdrsReady
        );
        decoder.decode(0, &slices(&sps, &idr(0))).unwrap();
        assert!(matches!(
            decoder.decode(1, &slices(&sps, &p(1, 2))),
            Err(DecodeError::HwTimeout)
        ));
        decoder.decode(2, &slices(&sps, &p(2, 4))).unwrap();
        decoder.end_of_stream().unwrap();

        let mut frames = Vec::new();
        while let Some(event) = decoder.next_picture(BlockingMode::Blocking).unwrap() {
            if !record(&decoder, event, &mut frames) {
                break;
            }
        }

        let corrupt: Vec<_> = frames.iter().map(|f| f.corrupt).collect();
        assert_eq!(corrupt, vec![false, true, false]);
    }

    /// Pops the next picture, waiting for it, and gives it back. Returns its POC.
    fn pop_consume(decoder: &mut Decoder) -> i32 {
        let mut frames = Vec::new();
        next_blocking(decoder, &mut frames);
        frames[0].poc
    }

    fn output_address(job: &PictureJob) -> u64 {
        job.output.bus_address
    }

    fn ref0_address(job: &PictureJob) -> Option<u64> {
        job.slices[0].ref_pic_list0[0]
            .as_ref()
            .map(|r| r.mem.bus_address)
    }

    #[test]
    fn test_pending_reference_not_reused_nonblock() {
        let backend = HeldBackend::new();
        let hw = backend.jobs();
        let config = DecoderConfig {
            no_reordering: true,
            ..test_config(BlockingMode::NonBlocking)
        };
        let mut decoder = Decoder::new_dummy(backend, config).unwrap();
        let sps = Rc::new(Sps {
            max_num_ref_frames: 1,
            vui_parameters: VuiParams {
                bitstream_restriction_flag: true,
                max_num_reorder_frames: 0,
                max_dec_frame_buffering: 1,
            },
            ..sps(2, 2, 0)
        });

        assert_eq!(
            decoder.decode(0, &slices(&sps, &idr(0))).unwrap(),
            DecodeStatus::HdrsReady
        );
        decoder.decode(0, &slices(&sps, &idr(0))).unwrap();
        assert_eq!(decoder.num_buffers(), 3);
        hw.complete(0, HwStatus::Ok);
        assert_eq!(pop_consume(&mut decoder), 0);

        // The second P picture drops the IDR picture from the references while the first one is
        // still reading it.
        assert_eq!(
            decoder.decode(1, &slices(&sps, &p(1, 2))).unwrap(),
            DecodeStatus::PicDecoded
        );
        assert_eq!(
            decoder.decode(2, &slices(&sps, &p(2, 4))).unwrap(),
            DecodeStatus::PicDecoded
        );
        assert_eq!(hw.pending(), vec![1, 2]);

        let jobs = hw.jobs();
        assert_eq!(ref0_address(&jobs[1]), Some(output_address(&jobs[0])));
        assert_eq!(ref0_address(&jobs[2]), Some(output_address(&jobs[1])));
        assert_ne!(output_address(&jobs[2]), output_address(&jobs[0]));
        assert_ne!(output_address(&jobs[2]), output_address(&jobs[1]));

        // Every buffer is taken until the first P picture is done.
        assert_eq!(
            decoder.decode(3, &slices(&sps, &p(3, 6))).unwrap(),
            DecodeStatus::WaitingForBuffer
        );

        hw.complete(2, HwStatus::Ok);
        hw.complete(1, HwStatus::Ok);
        assert_eq!(pop_consume(&mut decoder), 2);
        assert_eq!(pop_consume(&mut decoder), 4);
        assert_eq!(
            decoder.decode(3, &slices(&sps, &p(3, 6))).unwrap(),
            DecodeStatus::PicDecoded
        );
        assert_eq!(output_address(&hw.jobs()[3]), output_address(&jobs[0]));
        hw.complete(3, HwStatus::Ok);
        assert_eq!(pop_consume(&mut decoder), 6);
    }

    #[test]
    fn test_late_completion_does_not_release_new_picture_nonblock() {
        let backend = HeldBackend::new();
        let hw = backend.jobs();
        let mut decoder = Decoder::new_dummy(backend, test_config(BlockingMode::NonBlocking)).unwrap();
        let sps = Rc::new(sps(2, 2, 0));

        let mut second_idr = idr(0);
        second_idr.marking.no_output_of_prior_pics_flag = true;

        assert_eq!(
            decoder.decode(0, &slices(&sps, &idr(0))).unwrap(),
            DecodeStatus::HdrsReady
        );
        for (timestamp, pic) in [idr(0), p(1, 6), second_idr, p(1, 2)].iter().enumerate() {
            assert_eq!(
                decoder.decode(timestamp as u64, &slices(&sps, pic)).unwrap(),
                DecodeStatus::PicDecoded
            );
        }
        assert_eq!(decoder.num_buffers(), 4);

        // The pictures of the first sequence are dropped while still being decoded: their buffers
        // are not handed to the new sequence.
        let jobs = hw.jobs();
        let old: Vec<_> = jobs[..2].iter().map(output_address).collect();
        assert!(!old.contains(&output_address(&jobs[2])));
        assert!(!old.contains(&output_address(&jobs[3])));

        decoder.end_of_stream().unwrap();
        hw.complete(2, HwStatus::Ok);
        assert_eq!(pop_consume(&mut decoder), 0);

        // Completing the dropped pictures now does not make the last picture look decoded.
        hw.complete(0, HwStatus::Ok);
        hw.complete(1, HwStatus::Ok);
        assert!(decoder
            .next_picture(BlockingMode::NonBlocking)
            .unwrap()
            .is_none());

        hw.complete(3, HwStatus::Ok);
        assert_eq!(pop_consume(&mut decoder), 2);
        assert!(matches!(
            decoder.next_picture(BlockingMode::Blocking).unwrap(),
            Some(OutputEvent::EndOfStream)
        ));
    }

    #[test]
    fn test_hw_error_reported_later_nonblock() {
        let backend = HeldBackend::new();
        let hw = backend.jobs();
        let mut decoder = Decoder::new_dummy(backend, test_config(BlockingMode::NonBlocking)).unwrap();
        let sps = Rc::new(sps(2, 2, 0));

        decoder.decode(0, &slices(&sps, &idr(0))).unwrap();
        decoder.decode(0, &slices(&sps, &idr(0))).unwrap();
        decoder.decode(1, &slices(&sps, &p(1, 2))).unwrap();
        hw.complete(0, HwStatus::Ok);
        hw.complete(1, HwStatus::Timeout);

        // The failure is returned once, and the picture is not consumed.
        assert!(matches!(
            decoder.decode(2, &slices(&sps, &p(2, 4))),
            Err(DecodeError::HwTimeout)
        ));
        assert_eq!(hw.pending(), Vec::<u32>::new());
        assert_eq!(
            decoder.decode(2, &slices(&sps, &p(2, 4))).unwrap(),
            DecodeStatus::PicDecoded
        );

        hw.complete(2, HwStatus::BusError);
        assert!(matches!(
            decoder.end_of_stream(),
            Err(DecodeError::HwBusError)
        ));
        assert_eq!(decoder.end_of_stream().unwrap(), DecodeStatus::StrmProcessed);

        let mut frames = Vec::new();
        while let Some(event) = decoder.next_picture(BlockingMode::Blocking).unwrap() {
            if !record(&decoder, event, &mut frames) {
                break;
            }
        }
        let corrupt: Vec<_> = frames.iter().map(|f| (f.poc, f.corrupt)).collect();
        assert_eq!(corrupt, vec![(0, false), (2, true), (4, true)]);
    }

    #[test]
    fn test_corrupt_pictures_dropped_nonblock() {
        let backend = Backend::new().with_failure(1, HwStatus::Errors(3));
        let config = DecoderConfig {
            output_corrupted: false,
            ..test_config(BlockingMode::NonBlocking)
        };
        let mut decoder = Decoder::new_dummy(backend, config).unwrap();

        let frames = decode_stream(
            &mut decoder,
            &stream(sps(2, 2, 0), vec![idr(0), p(1, 2), p(2, 4)]),
        );
        assert_eq!(pocs(&frames), vec![0, 4]);
    }

    #[test]
    fn test_no_reordering_block() {
        let config = DecoderConfig {
            no_reordering: true,
            ..test_config(BlockingMode::Blocking)
        };
        let mut decoder = Decoder::new_dummy(Backend::new(), config).unwrap();

        let frames = decode_stream(&mut decoder, &stream(sps(4, 4, 0), ipbb()));
        assert_eq!(pocs(&frames), vec![0, 6, 2, 4, 12, 8, 10]);
    }

    #[test]
    fn test_reference_lists_reach_the_hardware() {
        let backend = Backend::new();
        let jobs = backend.job_log();
        let mut decoder = Decoder::new_dummy(backend, test_config(BlockingMode::Blocking)).unwrap();

        decode_stream(&mut decoder, &stream(sps(4, 4, 0), ipbb()));

        let jobs = jobs.lock();
        assert_eq!(jobs.len(), 7);
        let bus = |job: &PictureJob| job.output.bus_address;

        // The first B picture predicts from the I picture and the P picture.
        let b_slice = &jobs[2].slices[0];
        assert_eq!(b_slice.slice_type, SliceType::B);
        assert_eq!(
            b_slice.ref_pic_list0[0].as_ref().map(|r| r.mem.bus_address),
            Some(bus(&jobs[0]))
        );
        assert_eq!(
            b_slice.ref_pic_list1[0].as_ref().map(|r| r.mem.bus_address),
            Some(bus(&jobs[1]))
        );

        // Both slices of a picture share its lists, but keep their own data.
        assert_eq!(jobs[2].slices[1].first_mb_in_slice, 8);
        assert_eq!(&jobs[2].slices[1].data[..], &PAYLOAD[1..]);
    }

    #[test]
    fn test_two_views_block() {
        let config = DecoderConfig {
            two_view: true,
            extra_buffers: 4,
            ..test_config(BlockingMode::Blocking)
        };
        let mut decoder = Decoder::new_dummy(Backend::new(), config).unwrap();

        let mut pics = Vec::new();
        for pic in [idr(0), p(1, 2), p(2, 4)] {
            let mut second = pic.clone();
            second.view_id = 1;
            pics.push(pic);
            pics.push(second);
        }

        let frames = decode_stream(&mut decoder, &stream(sps(2, 2, 0), pics));
        let views: Vec<_> = frames.iter().map(|f| (f.poc, f.view_id)).collect();
        assert_eq!(views, vec![(0, 0), (0, 1), (2, 0), (2, 1), (4, 0), (4, 1)]);
    }

    #[test]
    fn test_second_view_skipped_block() {
        let mut pics = Vec::new();
        for pic in [idr(0), p(1, 2)] {
            let mut second = pic.clone();
            second.view_id = 1;
            pics.push(pic);
            pics.push(second);
        }

        let frames = test_decoder_dummy(&stream(sps(2, 2, 0), pics), BlockingMode::Blocking);
        assert!(frames.iter().all(|f| f.view_id == 0));
        assert_eq!(pocs(&frames), vec![0, 2]);
    }

    /// Inverts every byte of the picture.
    struct Inverter;

    impl PostProcessor for Inverter {
        fn start(
            &mut self,
            input: &LinearMem,
            output: &LinearMem,
            _resolution: Resolution,
        ) -> anyhow::Result<()> {
            let data = input
                .with_mapping(|d| d.to_vec())
                .ok_or_else(|| anyhow!("unmapped input"))?;
            output
                .with_mapping(|out| {
                    for (o, i) in out.iter_mut().zip(data) {
                        *o = !i;
                    }
                })
                .ok_or_else(|| anyhow!("unmapped output"))
        }

        fn wait(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_post_processing_nonblock() {
        let stream = stream(sps(4, 4, 0), ipbb());
        let mut decoder =
            Decoder::new_dummy(Backend::new(), test_config(BlockingMode::NonBlocking)).unwrap();
        let plain = decode_stream(&mut decoder, &stream);

        let config = DecoderConfig {
            num_pp_buffers: 2,
            ..test_config(BlockingMode::NonBlocking)
        };
        let mut decoder = Decoder::new_dummy(Backend::new(), config).unwrap();
        decoder.set_post_processor(Box::new(Inverter));
        let processed = decode_stream(&mut decoder, &stream);

        assert_eq!(pocs(&processed), pocs(&plain));
        assert!(processed
            .iter()
            .zip(plain.iter())
            .all(|(p, f)| p.crc != f.crc && p.size == f.size));
    }

    #[test]
    fn test_tiled_output_uses_raster_buffers() {
        let backend = Backend::new().with_tiled_output();
        let jobs = backend.job_log();
        let config = DecoderConfig {
            num_pp_buffers: 1,
            ..test_config(BlockingMode::Blocking)
        };
        let mut decoder = Decoder::new_dummy(backend, config).unwrap();
        decoder.set_post_processor(Box::new(Inverter));

        let frames = decode_stream(&mut decoder, &stream(sps(2, 2, 0), vec![idr(0), p(1, 2)]));
        assert_eq!(pocs(&frames), vec![0, 2]);
        assert!(jobs.lock().iter().all(|job| job.raster_output.is_some()));
    }

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<DecodedPicture>>,
        decoded: Mutex<usize>,
        eos: Mutex<bool>,
    }

    impl DecoderClient for Collector {
        fn picture_ready(&self, picture: &DecodedPicture) {
            self.frames.lock().push(picture.clone());
        }

        fn buffer_decoded(&self, _id: BufferId) {
            *self.decoded.lock() += 1;
        }

        fn end_of_stream(&self) {
            *self.eos.lock() = true;
        }
    }

    #[test]
    fn test_output_thread_nonblock() {
        let client = Arc::new(Collector::default());
        let config = DecoderConfig {
            output_thread: true,
            buffer_wait: BlockingMode::Blocking,
            blocking_mode: BlockingMode::NonBlocking,
            ..Default::default()
        };
        let mut decoder =
            Decoder::new_dummy_with_client(Backend::new(), config, client.clone()).unwrap();
        let consumer = decoder.consumer();

        assert!(matches!(
            decoder.next_picture(BlockingMode::NonBlocking),
            Err(DecodeError::ParamError(_))
        ));

        // Give pictures back from the client side as they come.
        let returner = {
            let client = client.clone();
            thread::spawn(move || loop {
                let frames: Vec<_> = client.frames.lock().drain(..).collect();
                let mut pocs = Vec::new();
                for frame in frames {
                    consumer.picture_consumed(&frame).unwrap();
                    pocs.push(frame.pic_order_cnt);
                }
                if !pocs.is_empty() {
                    return pocs;
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        for (timestamp, (sps, pic)) in stream(sps(4, 4, 0), vec![idr(0)]).iter().enumerate() {
            let slices = slices(sps, pic);
            while decoder.decode(timestamp as u64, &slices).unwrap() == DecodeStatus::HdrsReady {}
        }
        decoder.end_of_stream().unwrap();

        assert_eq!(returner.join().unwrap(), vec![0]);
        while !*client.eos.lock() || *client.decoded.lock() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*client.decoded.lock(), 1);
    }

    #[test]
    fn test_output_thread_needs_client() {
        let config = DecoderConfig {
            output_thread: true,
            ..Default::default()
        };
        assert!(Decoder::new_dummy(Backend::new(), config).is_err());
    }

    #[test]
    fn test_abort_unblocks_buffer_wait() {
        let config = DecoderConfig {
            buffer_wait: BlockingMode::Blocking,
            extra_buffers: 0,
            ..Default::default()
        };
        let mut decoder = Decoder::new_dummy(Backend::new(), config).unwrap();
        let sps = Rc::new(sps(2, 2, 2));
        let abort = decoder.abort_handle();

        let mut units = vec![idr(0)];
        units.extend((1..4).map(|i| p(i, 0)));

        assert_eq!(
            decoder.decode(0, &slices(&sps, &units[0])).unwrap(),
            DecodeStatus::HdrsReady
        );

        // Nobody consumes the output: the decoder ends up waiting for a buffer.
        let aborter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            abort.abort();
        });

        let result = units
            .iter()
            .enumerate()
            .map(|(i, pic)| decoder.decode(i as u64, &slices(&sps, pic)))
            .find(Result::is_err);
        assert!(matches!(result, Some(Err(DecodeError::Aborted))));
        aborter.join().unwrap();

        decoder.abort_after().unwrap();
        assert_eq!(decoder.num_pending_outputs(), 0);

        // Decoding resumes at the next IDR picture.
        assert_eq!(
            decoder.decode(4, &slices(&sps, &p(4, 0))).unwrap(),
            DecodeStatus::Ok
        );
        assert_eq!(
            decoder.decode(5, &slices(&sps, &idr(0))).unwrap(),
            DecodeStatus::PicDecoded
        );
    }

    #[test]
    fn test_flush_resumes_at_idr() {
        let mut decoder =
            Decoder::new_dummy(Backend::new(), test_config(BlockingMode::Blocking)).unwrap();
        let sps = Rc::new(sps(2, 2, 0));

        decoder.decode(0, &slices(&sps, &idr(0))).unwrap();
        decoder.decode(0, &slices(&sps, &idr(0))).unwrap();
        decoder.decode(1, &slices(&sps, &p(1, 2))).unwrap();
        decoder.flush().unwrap();

        let mut frames = Vec::new();
        while let Some(event) = decoder.next_picture(BlockingMode::NonBlocking).unwrap() {
            record(&decoder, event, &mut frames);
        }
        assert_eq!(pocs(&frames), vec![0, 2]);

        assert_eq!(
            decoder.decode(2, &slices(&sps, &p(2, 4))).unwrap(),
            DecodeStatus::Ok
        );
        assert_eq!(
            decoder.decode(3, &slices(&sps, &idr(0))).unwrap(),
            DecodeStatus::PicDecoded
        );
    }

    #[test]
    fn poc_type_0_wraps_lsb() {
        let sps = sps(2, 2, 0);
        let mut state = PocState::default();
        let cur = CurrentPicture {
            is_reference: true,
            ..Default::default()
        };

        let hdr = |lsb| SliceHeader {
            pic_order_cnt_lsb: lsb,
            ..Default::default()
        };

        // MaxPicOrderCntLsb is 64.
        let expected = [
            (0, 0),
            (20, 20),
            (40, 40),
            (60, 60),
            (8, 72),
            (30, 94),
            (50, 114),
            (6, 134),
        ];
        for (i, (lsb, poc)) in expected.into_iter().enumerate() {
            let info = state.compute(&sps, &hdr(lsb), i == 0, 1).unwrap();
            assert_eq!(info.top_field_order_cnt, poc);
            state.update(&info, &cur);
        }

        // Going back by more than half the range is a wrap too.
        let info = state.compute(&sps, &hdr(40), false, 1).unwrap();
        assert_eq!(info.top_field_order_cnt, 104);
    }

    #[test]
    fn poc_type_1_needs_offsets() {
        let sps = Sps {
            num_ref_frames_in_pic_order_cnt_cycle: 2,
            offset_for_ref_frame: vec![2],
            ..sps(2, 2, 1)
        };
        let state = PocState {
            prev_frame_num: 1,
            ..Default::default()
        };
        let hdr = SliceHeader {
            frame_num: 2,
            ..Default::default()
        };

        assert!(state.compute(&sps, &hdr, false, 1).is_err());
    }
}
