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

//! larder - a page cache driven by cooperative coroutines and asynchronous disk I/O.
//!
//! Each [`PageCache`] lives on one [`larder_runtime::Shard`]: a single-threaded loop running
//! coroutines, a buffer home and an AIO [`larder_io::Reactor`]. Coroutines acquire pages, which
//! are read on miss and pinned until released. Dirty pages are written back in the background,
//! and unpinned pages are evicted by random sampling once the memory limit is exceeded.
//!
//! ```no_run
//! use std::{rc::Rc, sync::Arc};
//!
//! use larder::prelude::*;
//!
//! let shard = Shard::new();
//! let reactor = Reactor::new(MemoryBackend::new(), ReactorConfig::default());
//! shard.register(Rc::new(reactor.clone()));
//! let serializer = Serializer::new(Arc::new(MemoryDevice::new(4096, 1024).unwrap()), reactor);
//! let cache = PageCacheBuilder::new().build(&shard, serializer).unwrap();
//!
//! shard.block_on(move |ctx| async move {
//!     let page = cache.acquire_page(&ctx, 7).await.unwrap();
//!     page.write(|bytes| bytes[0] = 1);
//!     drop(page);
//!     cache.close(&ctx).await.unwrap();
//! });
//! ```

mod bag;
mod cache;
mod config;
mod evicter;
mod page;
mod statistics;
mod writeback;

/// Re-exports of the commonly used types of all larder crates.
pub mod prelude;

pub use bag::{EvictionBag, DEFAULT_EVICTION_SAMPLES};
pub use cache::{PageCache, PageHandle};
pub use config::{PageCacheBuilder, PageCacheConfig};
pub use page::{BagKind, PageState};
pub use statistics::Statistics;
