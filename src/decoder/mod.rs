// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer pools and decoders.
//!
//! The pools in this module are shared between the thread feeding the decoder, the hardware
//! completion path and the thread consuming decoded pictures. They are all cheap to clone handles
//! to a state protected by a single lock.

pub mod bqueue;
pub mod fb_list;
pub mod input_queue;
pub mod output;
pub mod raster_buffer;
pub mod stateless;

use crate::decoder::fb_list::BufferId;
use crate::decoder::fb_list::HwOutput;
use crate::memory::LinearMem;
use crate::Resolution;

/// Whether an operation that may have to wait for a resource should block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// A picture ready to be displayed, as handed to the client.
///
/// The buffer stays reserved for the client until it is returned through
/// [`FrameBufferList::clear_output`](fb_list::FrameBufferList::clear_output), usually by way of the
/// decoder's `picture_consumed` method.
#[derive(Clone, Debug, Default)]
pub struct DecodedPicture {
    /// Slot of the picture buffer in the frame buffer list.
    pub id: BufferId,
    pub mem: LinearMem,
    /// Output counter, increasing in display order.
    pub pic_id: u32,
    /// Decode counter, increasing in decode order.
    pub decode_id: u32,
    /// Timestamp of the input unit this picture was decoded from.
    pub timestamp: u64,
    /// Picture order count, lowest of the two fields for frames.
    pub pic_order_cnt: i32,
    pub resolution: Resolution,
    pub is_idr: bool,
    pub interlaced: bool,
    /// Fields the hardware must have written before the picture can be handed out.
    pub fields: HwOutput,
    /// Number of macroblocks reported erroneous by the hardware.
    pub num_err_mbs: u32,
    /// Whether the picture was decoded from a damaged reference set.
    pub concealed: bool,
    /// View the picture belongs to, 0 for the base view.
    pub view_id: u32,
    /// Whether `mem` is a post-processor output buffer rather than the decoded buffer `id`.
    pub post_processed: bool,
}

impl DecodedPicture {
    /// Whether the picture contains decoding errors.
    pub fn is_corrupt(&self) -> bool {
        self.num_err_mbs > 0 || self.concealed
    }

    /// CRC32 of the picture contents, if the buffer is mapped.
    pub fn crc32(&self) -> Option<u32> {
        self.mem.crc32()
    }
}
