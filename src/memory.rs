// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Linear memory descriptors and the allocator contract of the hardware driver.
//!
//! Picture buffers are identified by their bus address. The CPU mapping is optional: buffers only
//! visible to the hardware have none, while buffers shared with software stages are backed by a
//! [`BytesMut`].

use std::sync::Arc;

use anyhow::anyhow;
use bytes::BytesMut;

use crate::sync::Mutex;

/// CPU mapping of a linear buffer.
pub type VirtualMem = Arc<Mutex<BytesMut>>;

/// Kind of memory requested from the driver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MemType {
    /// Mapped for the CPU, not accessed by the hardware.
    Cpu,
    /// Stream input.
    Slice,
    /// Decoded picture buffers.
    #[default]
    Dpb,
    /// Hardware scratch memory that also needs a CPU mapping.
    VpuWorking,
    /// Hardware scratch memory without a CPU mapping.
    VpuOnly,
}

impl MemType {
    /// Whether memory of this kind gets a CPU mapping.
    pub fn is_mapped(&self) -> bool {
        !matches!(self, MemType::VpuOnly)
    }
}

/// A linear buffer allocated by the driver.
#[derive(Clone, Debug, Default)]
pub struct LinearMem {
    pub virtual_address: Option<VirtualMem>,
    pub bus_address: u64,
    /// Allocated size in bytes.
    pub size: usize,
    /// Size in bytes actually used by the picture stored in the buffer.
    pub logical_size: usize,
    pub mem_type: MemType,
}

impl LinearMem {
    /// Runs `f` on the CPU mapping of the buffer, limited to its logical size.
    pub fn with_mapping<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mapping = self.virtual_address.as_ref()?;
        let mut bytes = mapping.lock();
        let len = self.logical_size.min(bytes.len());
        Some(f(&mut bytes[..len]))
    }

    /// CRC32 of the logical contents of the buffer, if it is mapped.
    pub fn crc32(&self) -> Option<u32> {
        self.with_mapping(|data| crc32fast::hash(data))
    }

    /// Whether `self` and `other` describe the same allocation.
    pub fn same_buffer(&self, other: &LinearMem) -> bool {
        self.bus_address == other.bus_address
    }
}

/// Allocation contract of the hardware driver.
pub trait LinearAllocator {
    /// Allocates a buffer of `size` bytes.
    fn alloc_linear(&mut self, size: usize, mem_type: MemType) -> anyhow::Result<LinearMem>;
    /// Returns a buffer previously obtained from `alloc_linear`.
    fn free_linear(&mut self, mem: LinearMem);
}

/// Allocator backing every buffer with system memory and handing out fake, page-aligned bus
/// addresses. Used by software-only pipelines and tests.
#[derive(Debug)]
pub struct SystemAllocator {
    next_bus_address: u64,
    live: usize,
}

impl SystemAllocator {
    const PAGE_SIZE: u64 = 4096;

    pub fn new() -> Self {
        Self {
            next_bus_address: Self::PAGE_SIZE,
            live: 0,
        }
    }

    /// Number of buffers allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.live
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearAllocator for SystemAllocator {
    fn alloc_linear(&mut self, size: usize, mem_type: MemType) -> anyhow::Result<LinearMem> {
        if size == 0 {
            return Err(anyhow!("cannot allocate an empty buffer"));
        }

        let bus_address = self.next_bus_address;
        let pages = (size as u64).div_ceil(Self::PAGE_SIZE);
        self.next_bus_address = bus_address
            .checked_add(pages * Self::PAGE_SIZE)
            .ok_or_else(|| anyhow!("bus address space exhausted"))?;

        let virtual_address = if mem_type.is_mapped() {
            Some(Arc::new(Mutex::new(BytesMut::zeroed(size))))
        } else {
            None
        };

        self.live += 1;

        Ok(LinearMem {
            virtual_address,
            bus_address,
            size,
            logical_size: size,
            mem_type,
        })
    }

    fn free_linear(&mut self, mem: LinearMem) {
        if mem.bus_address == 0 {
            return;
        }

        self.live = self.live.saturating_sub(1);
    }
}
