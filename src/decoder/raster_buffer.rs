// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Raster buffers for pipelines that convert the tiled output of the decoder.
//!
//! Each tiled reference buffer gets a raster buffer of its own, and post-processed pictures are
//! written into a separate pool of buffers managed through an [`InputQueue`].

use anyhow::anyhow;
use anyhow::Context;

use crate::decoder::input_queue::InputQueue;
use crate::decoder::input_queue::QueueError;
use crate::decoder::BlockingMode;
use crate::memory::LinearAllocator;
use crate::memory::LinearMem;
use crate::memory::MemType;
use crate::MAX_PIC_BUFFERS;

#[derive(Clone, Debug, Default)]
pub struct RasterBufferParams {
    /// Reference buffers written by the decoder, in tiled layout.
    pub tiled_buffers: Vec<LinearMem>,
    /// Size of the raster copy of a tiled buffer.
    pub raster_size: usize,
    /// Number of post-processor output buffers to allocate.
    pub num_pp_buffers: usize,
    pub pp_size: usize,
}

/// A tiled buffer and its raster copy.
#[derive(Clone, Debug)]
struct RasterPair {
    tiled: LinearMem,
    raster: LinearMem,
}

#[derive(Debug)]
pub struct RasterBufferMgr {
    pairs: Vec<RasterPair>,
    pp_queue: InputQueue,
}

impl RasterBufferMgr {
    /// Allocates the raster buffers described by `params`. Everything allocated so far is freed
    /// again if an allocation fails.
    pub fn new(params: RasterBufferParams, alloc: &mut dyn LinearAllocator) -> anyhow::Result<Self> {
        if params.tiled_buffers.len() > MAX_PIC_BUFFERS || params.num_pp_buffers > MAX_PIC_BUFFERS
        {
            return Err(anyhow!(
                "too many raster buffers requested: {} tiled, {} post-processed",
                params.tiled_buffers.len(),
                params.num_pp_buffers
            ));
        }

        let mut mgr = Self {
            pairs: Vec::with_capacity(params.tiled_buffers.len()),
            pp_queue: InputQueue::new(),
        };

        if let Err(e) = mgr.allocate(params, alloc) {
            mgr.release(alloc);
            return Err(e);
        }

        Ok(mgr)
    }

    fn allocate(
        &mut self,
        params: RasterBufferParams,
        alloc: &mut dyn LinearAllocator,
    ) -> anyhow::Result<()> {
        for tiled in params.tiled_buffers {
            let raster = alloc
                .alloc_linear(params.raster_size, MemType::Dpb)
                .with_context(|| format!("raster buffer for {:#x}", tiled.bus_address))?;

            self.pairs.push(RasterPair { tiled, raster });
        }

        for i in 0..params.num_pp_buffers {
            let buffer = alloc
                .alloc_linear(params.pp_size, MemType::Dpb)
                .with_context(|| format!("post-processor buffer {}", i))?;

            if let Err(e) = self.pp_queue.add_buffer(buffer.clone()) {
                alloc.free_linear(buffer);
                return Err(e.into());
            }
        }

        log::debug!(
            "allocated {} raster buffers and {} post-processor buffers",
            self.pairs.len(),
            params.num_pp_buffers
        );

        Ok(())
    }

    /// Raster copy of the tiled buffer at `tiled_bus_address`.
    pub fn raster_for(&self, tiled_bus_address: u64) -> Option<LinearMem> {
        self.pairs
            .iter()
            .find(|p| p.tiled.bus_address == tiled_bus_address)
            .map(|p| p.raster.clone())
    }

    /// Tiled buffer whose raster copy is at `raster_bus_address`.
    pub fn tiled_for(&self, raster_bus_address: u64) -> Option<LinearMem> {
        self.pairs
            .iter()
            .find(|p| p.raster.bus_address == raster_bus_address)
            .map(|p| p.tiled.clone())
    }

    /// Adds a post-processor output buffer provided by the client.
    pub fn add_pp_buffer(&self, buffer: LinearMem) -> Result<usize, QueueError> {
        self.pp_queue.add_buffer(buffer)
    }

    pub fn get_pp_buffer(&self, mode: BlockingMode) -> Result<LinearMem, QueueError> {
        self.pp_queue.get_buffer(mode)
    }

    pub fn return_pp_buffer(&self, bus_address: u64) -> Result<(), QueueError> {
        self.pp_queue.return_buffer(bus_address)
    }

    /// Queue of the post-processor output buffers.
    pub fn pp_queue(&self) -> &InputQueue {
        &self.pp_queue
    }

    pub fn set_abort(&self) {
        self.pp_queue.set_abort();
    }

    pub fn clear_abort(&self) {
        self.pp_queue.clear_abort();
    }

    /// Frees every buffer allocated by the manager. Client buffers added through
    /// [`RasterBufferMgr::add_pp_buffer`] are freed as well, so they must come from `alloc`.
    pub fn release(&mut self, alloc: &mut dyn LinearAllocator) {
        for pair in self.pairs.drain(..) {
            alloc.free_linear(pair.raster);
        }

        for buffer in self.pp_queue.release() {
            alloc.free_linear(buffer);
        }
    }
}
