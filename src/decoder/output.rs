// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery of decoded pictures to the client.
//!
//! Pictures are taken from the output FIFO of the [`FrameBufferList`] by an [`OutputStage`],
//! either on the client's request or from an [`OutputThread`]. The stage optionally runs them
//! through a post-processor and pairs the two views of stereo streams.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use anyhow::anyhow;
use anyhow::Context;

use crate::decoder::fb_list::FrameBufferList;
use crate::decoder::fb_list::OutElement;
use crate::decoder::input_queue::InputQueue;
use crate::decoder::input_queue::QueueError;
use crate::decoder::raster_buffer::RasterBufferMgr;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::DecoderClient;
use crate::decoder::stateless::PostProcessor;
use crate::decoder::BlockingMode;
use crate::decoder::DecodedPicture;
use crate::sync::Mutex;

/// What the client gets when asking for the next picture.
#[derive(Debug)]
pub enum OutputEvent {
    Picture(DecodedPicture),
    /// Base and second view of a stereo picture, in that order.
    ViewPair(DecodedPicture, DecodedPicture),
    /// Every picture of the stream has been handed out.
    EndOfStream,
}

/// Post-processing stage: pictures are converted into buffers of the raster manager's
/// post-processor queue.
pub struct PostProcessing {
    pub raster: RasterBufferMgr,
    pub processor: Box<dyn PostProcessor>,
}

/// Post-processor queue of the current post-processing stage, if any.
pub(crate) type SharedQueue = Arc<Mutex<Option<InputQueue>>>;

/// Takes decoded pictures out of the output FIFO.
pub struct OutputStage {
    fb_list: FrameBufferList,
    pp: Option<PostProcessing>,
    /// Post-processor queue, shared with the consumers.
    pp_queue: SharedQueue,
    output_corrupted: bool,
    two_view: bool,
    /// Base view waiting for its second view.
    pending_base: Option<DecodedPicture>,
    /// Picture popped from the FIFO while no post-processor buffer was free.
    stalled: Option<DecodedPicture>,
    eos_pending: bool,
}

impl OutputStage {
    pub fn new(fb_list: FrameBufferList, output_corrupted: bool, two_view: bool) -> Self {
        Self {
            fb_list,
            pp: None,
            pp_queue: Default::default(),
            output_corrupted,
            two_view,
            pending_base: None,
            stalled: None,
            eos_pending: false,
        }
    }

    /// Sets the post-processing stage, returning the previous one.
    pub fn set_post_processing(&mut self, pp: Option<PostProcessing>) -> Option<PostProcessing> {
        *self.pp_queue.lock() = pp.as_ref().map(|pp| pp.raster.pp_queue().clone());
        std::mem::replace(&mut self.pp, pp)
    }

    pub fn post_processing(&self) -> Option<&PostProcessing> {
        self.pp.as_ref()
    }

    /// Returns a handle through which pictures handed out by this stage are given back.
    pub fn consumer(&self) -> PictureConsumer {
        PictureConsumer {
            fb_list: self.fb_list.clone(),
            pp_queue: Arc::clone(&self.pp_queue),
        }
    }

    pub(crate) fn shared_pp_queue(&self) -> SharedQueue {
        Arc::clone(&self.pp_queue)
    }

    /// Forgets the pictures held by the stage, returning their buffers.
    pub fn reset(&mut self) {
        let consumer = self.consumer();
        for pic in [self.pending_base.take(), self.stalled.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = consumer.picture_consumed(&pic) {
                log::warn!("cannot return picture {:?}: {}", pic.id, e);
            }
        }
        self.eos_pending = false;
    }

    /// Returns the next event, waiting for it in blocking mode.
    ///
    /// In non-blocking mode, `None` means that nothing is ready yet.
    pub fn next_event(&mut self, mode: BlockingMode) -> Result<Option<OutputEvent>, DecodeError> {
        if self.eos_pending {
            self.eos_pending = false;
            return Ok(Some(OutputEvent::EndOfStream));
        }

        loop {
            let pic = match self.stalled.take() {
                Some(pic) => pic,
                None => match self.fb_list.pop_output_pic(mode)? {
                    None => return Ok(None),
                    Some(OutElement::EndOfStream) => {
                        if let Some(base) = self.pending_base.take() {
                            log::warn!("base view {} left without second view", base.pic_id);
                            self.eos_pending = true;
                            return Ok(Some(OutputEvent::Picture(base)));
                        }
                        return Ok(Some(OutputEvent::EndOfStream));
                    }
                    Some(OutElement::Picture(pic)) => {
                        if pic.is_corrupt() && !self.output_corrupted {
                            log::debug!(
                                "dropping corrupt picture {} ({} erroneous macroblocks)",
                                pic.pic_id,
                                pic.num_err_mbs
                            );
                            self.fb_list.clear_output(pic.id)?;
                            continue;
                        }
                        pic
                    }
                },
            };

            let Some(pic) = self.post_process(pic, mode)? else {
                return Ok(None);
            };

            if !self.two_view {
                return Ok(Some(OutputEvent::Picture(pic)));
            }

            match (pic.view_id, self.pending_base.take()) {
                (0, None) => self.pending_base = Some(pic),
                (0, Some(previous)) => {
                    log::warn!("base view {} left without second view", previous.pic_id);
                    self.pending_base = Some(pic);
                    return Ok(Some(OutputEvent::Picture(previous)));
                }
                (_, Some(base)) => return Ok(Some(OutputEvent::ViewPair(base, pic))),
                (_, None) => {
                    log::warn!("second view {} without base view", pic.pic_id);
                    return Ok(Some(OutputEvent::Picture(pic)));
                }
            }
        }
    }

    /// Runs `pic` through the post-processor, if any. The decoded buffer is returned to the pool
    /// once processed. Returns `None` if no post-processor buffer is free in non-blocking mode.
    fn post_process(
        &mut self,
        mut pic: DecodedPicture,
        mode: BlockingMode,
    ) -> Result<Option<DecodedPicture>, DecodeError> {
        let Some(pp) = self.pp.as_mut() else {
            return Ok(Some(pic));
        };

        let output = match pp.raster.get_pp_buffer(mode) {
            Ok(output) => output,
            Err(QueueError::NoFreeBuffer) => {
                self.stalled = Some(pic);
                return Ok(None);
            }
            Err(QueueError::Aborted) => {
                self.stalled = Some(pic);
                return Err(DecodeError::Aborted);
            }
            Err(e) => {
                log::warn!("dropping picture {}: {}", pic.pic_id, e);
                self.fb_list.clear_output(pic.id)?;
                return Err(e.into());
            }
        };

        let input = pp
            .raster
            .raster_for(pic.mem.bus_address)
            .unwrap_or_else(|| pic.mem.clone());

        let processed = pp
            .processor
            .start(&input, &output, pic.resolution)
            .and_then(|()| pp.processor.wait())
            .with_context(|| format!("post-processing picture {}", pic.pic_id));

        if let Err(e) = processed {
            log::warn!("dropping picture {}: {:#}", pic.pic_id, e);
            self.fb_list.clear_output(pic.id)?;
            pp.raster.return_pp_buffer(output.bus_address)?;
            return Err(DecodeError::DecoderError(e));
        }

        pp.raster.pp_queue().set_buf_as_used(output.bus_address)?;
        self.fb_list.clear_output(pic.id)?;

        pic.mem = output;
        pic.post_processed = true;

        Ok(Some(pic))
    }
}

/// Handle through which the client gives pictures back once it is done with them.
///
/// This is a handle: it can be cloned and sent to the thread consuming the pictures.
#[derive(Clone, Debug)]
pub struct PictureConsumer {
    fb_list: FrameBufferList,
    pp_queue: SharedQueue,
}

impl PictureConsumer {
    pub fn picture_consumed(&self, pic: &DecodedPicture) -> Result<(), DecodeError> {
        if !pic.post_processed {
            if !self.fb_list.is_buffer_output(pic.id) {
                return Err(DecodeError::ParamError(format!(
                    "picture {} in buffer {:?} is not held by the client",
                    pic.pic_id, pic.id
                )));
            }
            self.fb_list.clear_output(pic.id)?;
            return Ok(());
        }

        let queue = self.pp_queue.lock();
        let queue = queue
            .as_ref()
            .ok_or_else(|| anyhow!("post-processed picture without post-processor"))?;
        queue.return_buffer(pic.mem.bus_address)?;

        Ok(())
    }
}

/// A thread handing every picture of an [`OutputStage`] to a [`DecoderClient`].
pub struct OutputThread {
    handle: JoinHandle<OutputStage>,
}

impl OutputThread {
    pub fn spawn(stage: OutputStage, client: Arc<dyn DecoderClient>) -> anyhow::Result<Self> {
        let handle = thread::Builder::new()
            .name("decoder-output".into())
            .spawn(move || Self::run(stage, client))
            .context("spawning the output thread")?;

        Ok(Self { handle })
    }

    /// Every error other than an abort drops the picture it happened on, so the loop always
    /// makes progress.
    fn run(mut stage: OutputStage, client: Arc<dyn DecoderClient>) -> OutputStage {
        loop {
            match stage.next_event(BlockingMode::Blocking) {
                Ok(Some(OutputEvent::Picture(pic))) => client.picture_ready(&pic),
                Ok(Some(OutputEvent::ViewPair(base, second))) => {
                    client.picture_ready(&base);
                    client.picture_ready(&second);
                }
                Ok(Some(OutputEvent::EndOfStream)) => client.end_of_stream(),
                Ok(None) => (),
                Err(DecodeError::Aborted) => break,
                Err(e) => log::error!("output thread: {}", e),
            }
        }

        log::debug!("output thread stopped");
        stage
    }

    /// Waits for the thread to stop, which it does once the frame buffer list is aborted, and
    /// returns its stage.
    pub fn join(self) -> anyhow::Result<OutputStage> {
        self.handle
            .join()
            .map_err(|_| anyhow!("the output thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::decoder::fb_list::BufferId;
    use crate::decoder::fb_list::HwOutput;
    use crate::decoder::raster_buffer::RasterBufferParams;
    use crate::memory::LinearAllocator;
    use crate::memory::LinearMem;
    use crate::memory::MemType;
    use crate::memory::SystemAllocator;
    use crate::Resolution;

    fn list(alloc: &mut SystemAllocator, count: usize) -> FrameBufferList {
        let buffers = (0..count)
            .map(|_| alloc.alloc_linear(16, MemType::Dpb).unwrap())
            .collect();
        FrameBufferList::with_buffers(buffers).unwrap()
    }

    /// Claims a buffer, fills it with `value` and queues it for output.
    fn push(list: &FrameBufferList, pic_id: u32, view_id: u32, value: u8) -> BufferId {
        let (id, _) = list.get_free_pic_buffer(&[], BlockingMode::NonBlocking).unwrap();
        let mem = list.data_by_id(id).unwrap();
        mem.with_mapping(|data| data.fill(value)).unwrap();
        list.mark_hw_output(id, HwOutput::FRAME, vec![]).unwrap();
        list.push_output_pic(DecodedPicture {
            id,
            mem,
            pic_id,
            view_id,
            fields: HwOutput::FRAME,
            ..Default::default()
        })
        .unwrap();
        list.release_id(id).unwrap();
        id
    }

    fn expect_picture(stage: &mut OutputStage) -> DecodedPicture {
        match stage.next_event(BlockingMode::NonBlocking).unwrap() {
            Some(OutputEvent::Picture(pic)) => pic,
            other => panic!("expected a picture, got {:?}", other),
        }
    }

    #[test]
    fn corrupt_pictures_can_be_dropped() {
        let mut alloc = SystemAllocator::new();
        let list = list(&mut alloc, 3);
        let mut stage = OutputStage::new(list.clone(), false, false);

        push(&list, 0, 0, 1);
        let corrupt = push(&list, 1, 0, 2);
        list.mark_output_pic_corrupt(corrupt, 4).unwrap();
        push(&list, 2, 0, 3);
        list.push_end_of_stream().unwrap();

        let first = expect_picture(&mut stage);
        assert_eq!(first.pic_id, 0);
        let third = expect_picture(&mut stage);
        assert_eq!(third.pic_id, 2);
        assert!(matches!(
            stage.next_event(BlockingMode::NonBlocking).unwrap(),
            Some(OutputEvent::EndOfStream)
        ));
        assert!(stage.next_event(BlockingMode::NonBlocking).unwrap().is_none());

        // The dropped picture went straight back to the pool.
        assert!(!list.is_buffer_output(corrupt));
        let consumer = stage.consumer();
        consumer.picture_consumed(&first).unwrap();
        consumer.picture_consumed(&third).unwrap();
        assert_eq!(list.free_buffer_count(), 3);

        // A picture cannot be given back twice.
        assert!(matches!(
            consumer.picture_consumed(&first),
            Err(DecodeError::ParamError(_))
        ));
    }

    /// Copies the input to the output, then adds one to every byte.
    struct Incrementer {
        started: bool,
    }

    impl PostProcessor for Incrementer {
        fn start(
            &mut self,
            input: &LinearMem,
            output: &LinearMem,
            _resolution: Resolution,
        ) -> anyhow::Result<()> {
            let data = input.with_mapping(|d| d.to_vec()).context("unmapped input")?;
            output
                .with_mapping(|out| {
                    for (o, i) in out.iter_mut().zip(data) {
                        *o = i.wrapping_add(1);
                    }
                })
                .context("unmapped output")?;
            self.started = true;
            Ok(())
        }

        fn wait(&mut self) -> anyhow::Result<()> {
            if !self.started {
                return Err(anyhow!("nothing started"));
            }
            self.started = false;
            Ok(())
        }
    }

    #[test]
    fn post_processing_frees_the_decoded_buffer() {
        let mut alloc = SystemAllocator::new();
        let list = list(&mut alloc, 2);
        let raster = RasterBufferMgr::new(
            RasterBufferParams {
                num_pp_buffers: 1,
                pp_size: 16,
                ..Default::default()
            },
            &mut alloc,
        )
        .unwrap();

        let mut stage = OutputStage::new(list.clone(), true, false);
        let consumer = stage.consumer();
        stage.set_post_processing(Some(PostProcessing {
            raster,
            processor: Box::new(Incrementer { started: false }),
        }));

        push(&list, 0, 0, 7);
        push(&list, 1, 0, 9);

        let pic = expect_picture(&mut stage);
        assert!(pic.post_processed);
        assert_eq!(pic.crc32(), Some(crc32fast::hash(&[8; 16])));
        assert_eq!(list.free_buffer_count(), 1);

        // Only one post-processor buffer: the second picture waits for the first one.
        assert!(stage.next_event(BlockingMode::NonBlocking).unwrap().is_none());
        consumer.picture_consumed(&pic).unwrap();

        let pic = expect_picture(&mut stage);
        assert_eq!(pic.pic_id, 1);
        assert_eq!(pic.crc32(), Some(crc32fast::hash(&[10; 16])));
        assert_eq!(list.free_buffer_count(), 2);
        consumer.picture_consumed(&pic).unwrap();

        let mut pp = stage.set_post_processing(None).unwrap();
        pp.raster.release(&mut alloc);
    }

    #[test]
    fn views_are_paired() {
        let mut alloc = SystemAllocator::new();
        let list = list(&mut alloc, 6);
        let mut stage = OutputStage::new(list.clone(), true, true);

        push(&list, 0, 0, 0);
        push(&list, 1, 1, 0);
        push(&list, 2, 0, 0);
        push(&list, 3, 0, 0);
        list.push_end_of_stream().unwrap();

        match stage.next_event(BlockingMode::NonBlocking).unwrap() {
            Some(OutputEvent::ViewPair(base, second)) => {
                assert_eq!((base.pic_id, second.pic_id), (0, 1));
            }
            other => panic!("expected a pair, got {:?}", other),
        }

        // Unpaired base views come out on their own.
        assert_eq!(expect_picture(&mut stage).pic_id, 2);
        assert_eq!(expect_picture(&mut stage).pic_id, 3);
        assert!(matches!(
            stage.next_event(BlockingMode::NonBlocking).unwrap(),
            Some(OutputEvent::EndOfStream)
        ));
    }

    #[derive(Default)]
    struct Collector {
        pictures: Mutex<Vec<u32>>,
        eos: AtomicBool,
    }

    impl DecoderClient for Collector {
        fn picture_ready(&self, picture: &DecodedPicture) {
            self.pictures.lock().push(picture.pic_id);
        }

        fn end_of_stream(&self) {
            self.eos.store(true, Ordering::SeqCst);
        }
    }

    struct Broken;

    impl PostProcessor for Broken {
        fn start(
            &mut self,
            _input: &LinearMem,
            _output: &LinearMem,
            _resolution: Resolution,
        ) -> anyhow::Result<()> {
            Err(anyhow!("device lost"))
        }

        fn wait(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn output_thread_drops_pictures_it_cannot_process() {
        let mut alloc = SystemAllocator::new();
        let list = list(&mut alloc, 3);
        let raster = RasterBufferMgr::new(
            RasterBufferParams {
                num_pp_buffers: 1,
                pp_size: 16,
                ..Default::default()
            },
            &mut alloc,
        )
        .unwrap();

        let mut stage = OutputStage::new(list.clone(), true, false);
        stage.set_post_processing(Some(PostProcessing {
            raster,
            processor: Box::new(Broken),
        }));
        let client = Arc::new(Collector::default());
        let thread = OutputThread::spawn(stage, client.clone()).unwrap();

        for i in 0..3 {
            push(&list, i, 0, 0);
        }
        list.push_end_of_stream().unwrap();

        while !client.eos.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        assert!(client.pictures.lock().is_empty());
        assert_eq!(list.free_buffer_count(), 3);

        list.abort();
        let mut stage = thread.join().unwrap();
        list.clear_abort();

        let mut pp = stage.set_post_processing(None).unwrap();
        assert_eq!(pp.raster.pp_queue().num_free(), 1);
        pp.raster.release(&mut alloc);
    }

    #[test]
    fn output_thread_delivers_until_aborted() {
        let mut alloc = SystemAllocator::new();
        let list = list(&mut alloc, 4);
        let stage = OutputStage::new(list.clone(), true, false);
        let consumer = stage.consumer();
        let client = Arc::new(Collector::default());
        let thread = OutputThread::spawn(stage, client.clone()).unwrap();

        let ids: Vec<_> = (0..3).map(|i| push(&list, i, 0, 0)).collect();
        list.push_end_of_stream().unwrap();

        while !client.eos.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        assert_eq!(*client.pictures.lock(), vec![0, 1, 2]);

        list.abort();
        let stage = thread.join().unwrap();
        list.clear_abort();

        for id in ids {
            consumer
                .picture_consumed(&DecodedPicture {
                    id,
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(list.free_buffer_count(), 4);
        drop(stage);
    }
}
