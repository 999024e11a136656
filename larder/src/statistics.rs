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

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a page cache.
///
/// Updated by the cache's shard and readable from any thread.
#[derive(Debug, Default)]
pub struct Statistics {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    flushed_pages: AtomicU64,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    io_errors: AtomicU64,
}

macro_rules! counter {
    ($($field:ident, $inc:ident, $doc:literal;)*) => {
        impl Statistics {
            $(
                #[doc = $doc]
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }

                pub(crate) fn $inc(&self, v: u64) {
                    self.$field.fetch_add(v, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    hits, add_hits, "Acquisitions served by a resident page.";
    misses, add_misses, "Acquisitions that read the block from disk.";
    coalesced, add_coalesced, "Acquisitions that waited for another coroutine's read of the same block.";
    evictions, add_evictions, "Pages dropped to stay within the memory limit.";
    flushed_pages, add_flushed_pages, "Completed page writes.";
    read_bytes, add_read_bytes, "Bytes read from disk.";
    written_bytes, add_written_bytes, "Bytes written to disk.";
    io_errors, add_io_errors, "Failed reads and writes, including rejected submissions.";
}
