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

//! Asynchronous disk I/O for larder.
//!
//! An [`AioBackend`] wraps the OS completion primitive. The [`Reactor`] submits requests through
//! it and, when the backend's descriptor becomes readable, retrieves completions in bounded
//! batches and resumes the coroutines waiting on them. The [`Serializer`] maps block ids onto a
//! [`Device`].

/// OS async-I/O primitives.
pub mod backend;
/// Block devices.
pub mod device;
/// I/O error types.
pub mod error;
/// The completion reactor.
pub mod reactor;
/// Requests and completions.
pub mod request;
/// Block-level reads and writes.
pub mod serializer;

pub use backend::{memory::MemoryBackend, memory::MemoryDisk, AioBackend};
#[cfg(target_os = "linux")]
pub use backend::uring::{UringBackend, UringBackendBuilder};
pub use device::{Device, FileDevice, FileDeviceBuilder, MemoryDevice};
pub use error::{IoError, IoResult};
pub use reactor::{Reactor, ReactorConfig};
pub use request::{Completion, IoHandle, IoOp, IoRequest, NotifyTarget};
pub use serializer::Serializer;
