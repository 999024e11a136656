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

use std::{fmt::Display, os::fd::RawFd};

/// Opaque key of an in-flight request, echoed back by its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoHandle(u64);

impl IoHandle {
    /// Build a handle from the value carried by the kernel.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The value handed to the kernel.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    /// Read from the file into the buffer.
    Read,
    /// Write the buffer to the file.
    Write,
}

/// Identity of the completion-notification target a request reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyTarget(pub RawFd);

/// An I/O request ready for submission.
///
/// The buffer behind `ptr` must stay alive and unaliased by writers until the completion with the
/// same `handle` is delivered.
#[derive(Debug)]
pub struct IoRequest {
    /// Completion key.
    pub handle: IoHandle,
    /// Direction.
    pub op: IoOp,
    /// Target file.
    pub fd: RawFd,
    /// Byte offset in the file.
    pub offset: u64,
    /// Buffer address.
    pub ptr: *mut u8,
    /// Buffer length.
    pub len: usize,
    /// Where the completion is signalled. Set by `Reactor::prep`.
    pub notify: Option<NotifyTarget>,
}

// Safety: the buffer is owned by the reactor's pending table until completion.
unsafe impl Send for IoRequest {}

/// A completion retrieved from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Key of the completed request.
    pub handle: IoHandle,
    /// Transferred bytes, or a negated errno.
    pub result: i64,
}
