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

use std::fmt::Debug;

use larder_common::BlockId;
use larder_runtime::SharedBuffer;
use serde::{Deserialize, Serialize};

/// Writeback state of a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageState {
    /// Identical to the block on disk.
    Clean,
    /// Modified since the last completed write.
    Dirty,
    /// Picked by a writeback pass; the write has not completed yet.
    WritebackPending,
}

/// The eviction bag a page currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BagKind {
    /// Pinned by at least one handle.
    Unevictable,
    /// Unpinned and clean.
    EvictableClean,
    /// Unpinned, dirty or being written back.
    EvictableDirty,
}

/// A resident page.
pub(crate) struct Page {
    pub(crate) block: BlockId,
    pub(crate) buffer: SharedBuffer,
    pub(crate) state: PageState,
    pub(crate) access_time: u64,
    pub(crate) pins: usize,
    pub(crate) bag: Option<BagKind>,
    /// A write of a snapshot of this page is in flight.
    pub(crate) writing: bool,
}

impl Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("block", &self.block)
            .field("state", &self.state)
            .field("access_time", &self.access_time)
            .field("pins", &self.pins)
            .field("bag", &self.bag)
            .field("writing", &self.writing)
            .finish()
    }
}

impl Page {
    pub(crate) fn new(block: BlockId, buffer: SharedBuffer, state: PageState, access_time: u64) -> Self {
        Self {
            block,
            buffer,
            state,
            access_time,
            pins: 0,
            bag: None,
            writing: false,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state != PageState::Clean
    }

    /// The bag the page should be in given its pins and state.
    pub(crate) fn target_bag(&self) -> BagKind {
        if self.pins > 0 {
            BagKind::Unevictable
        } else if self.is_dirty() {
            BagKind::EvictableDirty
        } else {
            BagKind::EvictableClean
        }
    }
}
