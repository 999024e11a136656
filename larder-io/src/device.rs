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

use std::{
    fmt::Debug,
    fs::{File, OpenOptions},
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use larder_common::{
    bits::{is_aligned, PAGE},
    BlockId,
};

use crate::error::{IoError, IoResult};

/// Maps block ids onto file ranges.
pub trait Device: Send + Sync + Debug + 'static {
    /// Size of a block in bytes. A multiple of [`PAGE`].
    fn block_size(&self) -> usize;

    /// Number of addressable blocks.
    fn blocks(&self) -> u64;

    /// File and byte offset of `block`. `block` must be below [`Device::blocks`].
    fn translate(&self, block: BlockId) -> (RawFd, u64);

    /// Capacity in bytes.
    fn capacity(&self) -> u64 {
        self.blocks() * self.block_size() as u64
    }
}

fn verify_block_size(block_size: usize) -> IoResult<()> {
    if block_size == 0 || !is_aligned(PAGE, block_size) {
        return Err(IoError::other(format!(
            "block size ({block_size}) must be a positive multiple of PAGE ({PAGE})"
        )));
    }
    Ok(())
}

/// Builder for a [`FileDevice`].
#[derive(Debug)]
pub struct FileDeviceBuilder {
    path: PathBuf,
    block_size: usize,
    capacity: usize,
    direct: bool,
}

impl FileDeviceBuilder {
    const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

    /// Use the given file path as the device file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().into(),
            block_size: PAGE,
            capacity: Self::DEFAULT_CAPACITY,
            direct: false,
        }
    }

    /// Set the block size.
    ///
    /// Default: [`PAGE`].
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the capacity in bytes. Rounded down to a whole number of blocks on build.
    ///
    /// Default: 64 MiB.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set whether the file is opened with `O_DIRECT`.
    pub fn with_direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    /// Open (or create) the file and size it to the capacity.
    pub fn build(self) -> IoResult<FileDevice> {
        verify_block_size(self.block_size)?;
        let blocks = (self.capacity / self.block_size) as u64;
        if blocks == 0 {
            return Err(IoError::other(format!(
                "capacity ({}) must hold at least one block ({})",
                self.capacity, self.block_size
            )));
        }

        let mut opts = OpenOptions::new();
        opts.create(true).truncate(false).write(true).read(true);
        #[cfg(target_os = "linux")]
        if self.direct {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(libc::O_DIRECT | libc::O_NOATIME);
        }

        let file = opts.open(&self.path)?;
        file.set_len(blocks * self.block_size as u64)?;
        tracing::debug!(path = ?self.path, blocks, block_size = self.block_size, "[device]: file device opened");

        Ok(FileDevice {
            inner: Arc::new(FileDeviceInner {
                file,
                path: self.path,
                block_size: self.block_size,
                blocks,
            }),
        })
    }
}

#[derive(Debug)]
struct FileDeviceInner {
    file: File,
    path: PathBuf,
    block_size: usize,
    blocks: u64,
}

/// A device upon a single file.
#[derive(Debug, Clone)]
pub struct FileDevice {
    inner: Arc<FileDeviceInner>,
}

impl FileDevice {
    /// Path of the device file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Device for FileDevice {
    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn blocks(&self) -> u64 {
        self.inner.blocks
    }

    fn translate(&self, block: BlockId) -> (RawFd, u64) {
        (self.inner.file.as_raw_fd(), block * self.inner.block_size as u64)
    }
}

/// Device for the simulated disk of a [`crate::MemoryBackend`]. There is no file behind it.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    block_size: usize,
    blocks: u64,
}

impl MemoryDevice {
    /// Create a device of `blocks` blocks of `block_size` bytes.
    pub fn new(block_size: usize, blocks: u64) -> IoResult<Self> {
        verify_block_size(block_size)?;
        Ok(Self { block_size, blocks })
    }
}

impl Device for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn blocks(&self) -> u64 {
        self.blocks
    }

    fn translate(&self, block: BlockId) -> (RawFd, u64) {
        (-1, block * self.block_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_file_device_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDeviceBuilder::new(dir.path().join("device"))
            .with_capacity(10 * PAGE + 100)
            .build()
            .unwrap();
        assert_eq!(device.blocks(), 10);
        assert_eq!(device.capacity(), 10 * PAGE as u64);
        assert_eq!(std::fs::metadata(device.path()).unwrap().len(), 10 * PAGE as u64);
        assert_eq!(device.translate(3).1, 3 * PAGE as u64);
    }

    #[test_log::test]
    fn test_invalid_geometry() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileDeviceBuilder::new(dir.path().join("a")).with_block_size(1000).build().is_err());
        assert!(FileDeviceBuilder::new(dir.path().join("b")).with_capacity(PAGE - 1).build().is_err());
        assert!(MemoryDevice::new(0, 16).is_err());
        assert_eq!(MemoryDevice::new(2 * PAGE, 16).unwrap().translate(2), (-1, 4 * PAGE as u64));
    }
}
