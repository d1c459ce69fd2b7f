// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software stand-ins for the decoding hardware, used to test the decoder without a device.
//!
//! [`Backend`] "decodes" pictures on a worker thread, the way the hardware works next to the CPU.
//! [`HeldBackend`] runs every picture on its own core and completes it only when the test says
//! so, in any order. The contents of each picture are derived from its parameters, its slice data
//! and the contents of its references, so a wrong reference shows up as a different checksum.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::Field;
use crate::decoder::stateless::h264::Decoder;
use crate::decoder::stateless::h264::PictureJob;
use crate::decoder::stateless::h264::StatelessH264DecoderBackend;
use crate::decoder::stateless::DecoderClient;
use crate::decoder::stateless::DecoderConfig;
use crate::decoder::stateless::HwCompletion;
use crate::decoder::stateless::HwStatus;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::memory::SystemAllocator;
use crate::sync::Condvar;
use crate::sync::Mutex;

/// Every job started on the backend, in decoding order.
pub type JobLog = Arc<Mutex<Vec<PictureJob>>>;

struct Task {
    job: PictureJob,
    completion: HwCompletion,
    status: HwStatus,
}

/// Number of jobs started and not completed yet.
type Progress = Arc<(Mutex<usize>, Condvar)>;

pub struct Backend {
    sender: Option<mpsc::Sender<Task>>,
    worker: Option<JoinHandle<()>>,
    progress: Progress,
    /// Status to report for the picture with the given decode id.
    failures: HashMap<u32, HwStatus>,
    log: JobLog,
    tiled: bool,
}

impl Backend {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Task>();
        let progress: Progress = Default::default();

        let worker = {
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                for task in receiver {
                    render(&task.job);
                    task.completion.picture_done(
                        0,
                        task.job.mem_idx,
                        task.job.field.mask(),
                        task.status,
                    );

                    let (outstanding, cond) = &*progress;
                    *outstanding.lock() -= 1;
                    cond.notify_all();
                }
            })
        };

        Self {
            sender: Some(sender),
            worker: Some(worker),
            progress,
            failures: HashMap::new(),
            log: Default::default(),
            tiled: false,
        }
    }

    /// Makes the picture with `decode_id` complete with `status`.
    pub fn with_failure(mut self, decode_id: u32, status: HwStatus) -> Self {
        self.failures.insert(decode_id, status);
        self
    }

    pub fn with_tiled_output(mut self) -> Self {
        self.tiled = true;
        self
    }

    pub fn job_log(&self) -> JobLog {
        Arc::clone(&self.log)
    }
}

/// Fills the output of `job` with bytes depending on everything the picture was decoded from.
fn render(job: &PictureJob) {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&job.frame_num.to_le_bytes());
    hasher.update(&job.pic_order_cnt[0].to_le_bytes());
    hasher.update(&job.pic_order_cnt[1].to_le_bytes());
    hasher.update(&job.field.mask().bits().to_le_bytes());

    for slice in &job.slices {
        hasher.update(&slice.data);
        for entry in slice.ref_pic_list0.iter().chain(slice.ref_pic_list1.iter()) {
            let head = entry
                .as_ref()
                .and_then(|r| r.mem.with_mapping(|d| d.iter().take(4).copied().collect::<Vec<_>>()))
                .unwrap_or_else(|| vec![0xff]);
            hasher.update(&head);
        }
    }

    let seed = hasher.finalize().to_le_bytes();

    job.output.with_mapping(|out| {
        for (i, byte) in out.iter_mut().enumerate() {
            let written = match job.field {
                Field::Frame => true,
                Field::Top => i % 2 == 0,
                Field::Bottom => i % 2 == 1,
            };

            if written {
                *byte = seed[i % seed.len()] ^ (i as u8);
            } else if !job.second_field {
                *byte = 0;
            }
        }
    });

    if let Some(raster) = &job.raster_output {
        if let Some(data) = job.output.with_mapping(|d| d.to_vec()) {
            raster.with_mapping(|out| {
                for (o, i) in out.iter_mut().zip(data) {
                    *o = i;
                }
            });
        }
    }
}

impl StatelessH264DecoderBackend for Backend {
    fn new_sequence(&mut self, _sps: &Sps) -> StatelessBackendResult<()> {
        Ok(())
    }

    fn tiled_output(&self) -> bool {
        self.tiled
    }

    fn start_picture(
        &mut self,
        job: PictureJob,
        completion: HwCompletion,
    ) -> StatelessBackendResult<usize> {
        let status = self
            .failures
            .get(&job.decode_id)
            .copied()
            .unwrap_or(HwStatus::Ok);

        self.log.lock().push(job.clone());
        *self.progress.0.lock() += 1;

        let sender = self.sender.as_ref().ok_or(StatelessBackendError::SystemError)?;
        if sender
            .send(Task {
                job,
                completion,
                status,
            })
            .is_err()
        {
            *self.progress.0.lock() -= 1;
            return Err(StatelessBackendError::SystemError);
        }

        Ok(0)
    }

    fn wait(&mut self, _core_id: usize) -> StatelessBackendResult<()> {
        let (outstanding, cond) = &*self.progress;
        let _guard = cond.wait_while(outstanding.lock(), |n| *n > 0);
        Ok(())
    }

    fn query(&self, _core_id: usize) -> bool {
        *self.progress.0.lock() > 0
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct HeldJob {
    job: PictureJob,
    completion: HwCompletion,
    done: bool,
}

#[derive(Default)]
struct HeldState {
    jobs: Mutex<Vec<HeldJob>>,
    completed: Condvar,
}

/// Jobs started on a [`HeldBackend`]. The core of a job is its index.
#[derive(Clone, Default)]
pub struct HeldJobs(Arc<HeldState>);

impl HeldJobs {
    /// Every job started so far, in decoding order.
    pub fn jobs(&self) -> Vec<PictureJob> {
        self.0.jobs.lock().iter().map(|j| j.job.clone()).collect()
    }

    /// Decode ids of the jobs not completed yet.
    pub fn pending(&self) -> Vec<u32> {
        self.0
            .jobs
            .lock()
            .iter()
            .filter(|j| !j.done)
            .map(|j| j.job.decode_id)
            .collect()
    }

    /// Writes the picture with `decode_id` and reports it done with `status`.
    pub fn complete(&self, decode_id: u32, status: HwStatus) {
        let (core, job, completion) = {
            let jobs = self.0.jobs.lock();
            let core = jobs
                .iter()
                .position(|j| j.job.decode_id == decode_id && !j.done)
                .unwrap_or_else(|| panic!("no pending job for picture {}", decode_id));
            (core, jobs[core].job.clone(), jobs[core].completion.clone())
        };

        render(&job);
        completion.picture_done(core, job.mem_idx, job.field.mask(), status);

        self.0.jobs.lock()[core].done = true;
        self.0.completed.notify_all();
    }
}

/// A backend whose pictures stay in flight until completed through [`HeldJobs::complete`].
///
/// Waiting for a core blocks until its picture is completed from another thread, so decoders
/// using it run in non-blocking mode and get every job completed before being dropped.
#[derive(Default)]
pub struct HeldBackend {
    jobs: HeldJobs,
}

impl HeldBackend {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn jobs(&self) -> HeldJobs {
        self.jobs.clone()
    }
}

impl StatelessH264DecoderBackend for HeldBackend {
    fn new_sequence(&mut self, _sps: &Sps) -> StatelessBackendResult<()> {
        Ok(())
    }

    fn start_picture(
        &mut self,
        job: PictureJob,
        completion: HwCompletion,
    ) -> StatelessBackendResult<usize> {
        let mut jobs = self.jobs.0.jobs.lock();
        jobs.push(HeldJob {
            job,
            completion,
            done: false,
        });

        Ok(jobs.len() - 1)
    }

    fn wait(&mut self, core_id: usize) -> StatelessBackendResult<()> {
        let state = &self.jobs.0;
        let _guard = state.completed.wait_while(state.jobs.lock(), |jobs| {
            jobs.get(core_id).map_or(false, |j| !j.done)
        });
        Ok(())
    }

    fn query(&self, core_id: usize) -> bool {
        self.jobs
            .0
            .jobs
            .lock()
            .get(core_id)
            .map_or(false, |j| !j.done)
    }
}

impl Decoder {
    /// Creates a decoder running on a dummy backend, with buffers in system memory.
    pub fn new_dummy(
        backend: impl StatelessH264DecoderBackend + 'static,
        config: DecoderConfig,
    ) -> anyhow::Result<Self> {
        Self::new(
            Box::new(backend),
            Box::new(SystemAllocator::new()),
            config,
            None,
        )
    }

    pub fn new_dummy_with_client(
        backend: impl StatelessH264DecoderBackend + 'static,
        config: DecoderConfig,
        client: Arc<dyn DecoderClient>,
    ) -> anyhow::Result<Self> {
        Self::new(
            Box::new(backend),
            Box::new(SystemAllocator::new()),
            config,
            Some(client),
        )
    }
}
