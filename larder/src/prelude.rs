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

pub use larder_common::{
    error::{Error, ErrorKind, Result},
    BlockId,
};
#[cfg(target_os = "linux")]
pub use larder_io::{UringBackend, UringBackendBuilder};
pub use larder_io::{
    AioBackend, Device, FileDevice, FileDeviceBuilder, IoError, IoResult, MemoryBackend, MemoryDevice, MemoryDisk,
    Reactor, ReactorConfig, Serializer,
};
pub use larder_runtime::{BufferHome, CoroContext, Coroutine, Scheduler, Shard, SharedBuffer, Task};

pub use crate::{
    BagKind, EvictionBag, PageCache, PageCacheBuilder, PageCacheConfig, PageHandle, PageState, Statistics,
    DEFAULT_EVICTION_SAMPLES,
};
