// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture, frame buffer and output management for hardware-accelerated video decoders.
//!
//! The bitstream is parsed in software by an external parser, and macroblock reconstruction is done
//! by a hardware accelerator. This crate sits in between: it decides which buffer each picture is
//! decoded into, keeps track of which pictures are still needed for reference or for display, and
//! hands decoded pictures to the client in display order.
//!
//! The main pieces are:
//!
//! * [`decoder::fb_list::FrameBufferList`], the reference-counted pool of picture buffers shared
//!   between the decoding thread, the hardware completion path and the client's output thread.
//! * [`codec::h264::dpb::Dpb`], the H.264 decoded picture buffer.
//! * [`decoder::bqueue::BufferQueue`], [`decoder::input_queue::InputQueue`] and
//!   [`decoder::raster_buffer::RasterBufferMgr`], simpler pools used by other codecs and by the
//!   post-processing stage.
//! * [`decoder::stateless::h264::Decoder`], which ties everything together for H.264.

pub mod codec;
pub mod decoder;
pub mod memory;
pub mod sync;

/// Maximum number of picture buffers a [`decoder::fb_list::FrameBufferList`] can track.
pub const MAX_FRAME_BUFFER_NUMBER: usize = 78;

/// Maximum number of buffers an [`decoder::input_queue::InputQueue`] can hold.
pub const MAX_PIC_BUFFERS: usize = 78;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}
