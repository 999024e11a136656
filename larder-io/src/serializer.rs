// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{os::fd::RawFd, sync::Arc};

use larder_common::{
    error::{Error, ErrorKind, Result},
    BlockId,
};
use larder_runtime::{CoroContext, SharedBuffer};

use crate::{
    device::Device,
    error::IoResult,
    reactor::Reactor,
    request::{IoHandle, IoOp},
};

/// Reads and writes whole blocks of a [`Device`] through a [`Reactor`].
#[derive(Debug, Clone)]
pub struct Serializer {
    device: Arc<dyn Device>,
    reactor: Reactor,
}

impl Serializer {
    /// Create a serializer for `device`, submitting through `reactor`.
    pub fn new(device: Arc<dyn Device>, reactor: Reactor) -> Self {
        Self { device, reactor }
    }

    /// The device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The reactor.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Size of a block in bytes.
    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    fn locate(&self, block: BlockId, buffer: &SharedBuffer) -> Result<(RawFd, u64)> {
        if block >= self.device.blocks() {
            return Err(Error::new(ErrorKind::OutOfRange, "block id beyond the device")
                .with_context("block", block)
                .with_context("blocks", self.device.blocks()));
        }
        if buffer.len() != self.device.block_size() {
            return Err(Error::new(ErrorKind::OutOfRange, "buffer does not span exactly one block")
                .with_context("block", block)
                .with_context("len", buffer.len()));
        }
        Ok(self.device.translate(block))
    }

    fn submit<F>(&self, op: IoOp, block: BlockId, buffer: SharedBuffer, on_io_complete: F) -> Result<IoHandle>
    where
        F: FnOnce(SharedBuffer, IoResult<()>) + 'static,
    {
        let (fd, offset) = self.locate(block, &buffer)?;
        self.reactor
            .submit(op, fd, offset, buffer, on_io_complete)
            .map_err(|e| Error::from(e).with_context("block", block))
    }

    /// Submit a read of `block` into `buffer` without waiting.
    ///
    /// `on_io_complete` is called from the reactor once the read completes.
    pub fn submit_read<F>(&self, block: BlockId, buffer: SharedBuffer, on_io_complete: F) -> Result<IoHandle>
    where
        F: FnOnce(SharedBuffer, IoResult<()>) + 'static,
    {
        self.submit(IoOp::Read, block, buffer, on_io_complete)
    }

    /// Submit a write of `buffer` to `block` without waiting.
    ///
    /// `on_io_complete` is called from the reactor once the write completes.
    pub fn submit_write<F>(&self, block: BlockId, buffer: SharedBuffer, on_io_complete: F) -> Result<IoHandle>
    where
        F: FnOnce(SharedBuffer, IoResult<()>) + 'static,
    {
        self.submit(IoOp::Write, block, buffer, on_io_complete)
    }

    /// Read `block` into `buffer`, suspending the calling coroutine until done.
    pub async fn read_block(&self, ctx: &CoroContext, block: BlockId, buffer: SharedBuffer) -> Result<SharedBuffer> {
        let (fd, offset) = self.locate(block, &buffer)?;
        self.reactor
            .read(ctx, fd, offset, buffer)
            .await
            .map_err(|e| Error::from(e).with_context("block", block))
    }

    /// Write `buffer` to `block`, suspending the calling coroutine until done.
    pub async fn write_block(&self, ctx: &CoroContext, block: BlockId, buffer: SharedBuffer) -> Result<SharedBuffer> {
        let (fd, offset) = self.locate(block, &buffer)?;
        self.reactor
            .write(ctx, fd, offset, buffer)
            .await
            .map_err(|e| Error::from(e).with_context("block", block))
    }
}
