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

use larder_common::BlockId;

use crate::{
    bag::EvictionBag,
    page::{BagKind, Page},
};

/// Places every resident page in exactly one of three bags and picks eviction victims.
///
/// Pinned pages sit in `unevictable`. Unpinned pages sit in `evictable_clean` or
/// `evictable_dirty` by state. Victims are drawn across both evictable bags; a dirty victim must
/// be written back before it can go.
#[derive(Debug)]
pub(crate) struct Evicter {
    unevictable: EvictionBag<BlockId>,
    evictable_clean: EvictionBag<BlockId>,
    evictable_dirty: EvictionBag<BlockId>,
    memory_limit: u64,
}

impl Evicter {
    pub(crate) fn new(samples: usize, memory_limit: u64, seed: Option<u64>) -> Self {
        let bag = |salt: u64| match seed {
            Some(seed) => EvictionBag::with_seed(samples, seed.wrapping_add(salt)),
            None => EvictionBag::new(samples),
        };
        Self {
            unevictable: bag(0),
            evictable_clean: bag(1),
            evictable_dirty: bag(2),
            memory_limit,
        }
    }

    fn bag_mut(&mut self, kind: BagKind) -> &mut EvictionBag<BlockId> {
        match kind {
            BagKind::Unevictable => &mut self.unevictable,
            BagKind::EvictableClean => &mut self.evictable_clean,
            BagKind::EvictableDirty => &mut self.evictable_dirty,
        }
    }

    pub(crate) fn bag(&self, kind: BagKind) -> &EvictionBag<BlockId> {
        match kind {
            BagKind::Unevictable => &self.unevictable,
            BagKind::EvictableClean => &self.evictable_clean,
            BagKind::EvictableDirty => &self.evictable_dirty,
        }
    }

    /// Move `page` to the bag matching its pins and state. No-op if it is already there.
    pub(crate) fn rebag(&mut self, page: &mut Page) {
        let target = page.target_bag();
        if page.bag == Some(target) {
            return;
        }
        let size = page.size();
        if let Some(current) = page.bag {
            self.bag_mut(current).remove(page.block, size);
        }
        self.bag_mut(target).add(page.block, size);
        page.bag = Some(target);
    }

    /// Take `page` out of its bag.
    pub(crate) fn remove(&mut self, page: &mut Page) {
        if let Some(current) = page.bag.take() {
            self.bag_mut(current).remove(page.block, page.size());
        }
    }

    /// Bytes held by all resident pages.
    pub(crate) fn in_memory_size(&self) -> u64 {
        self.unevictable.size() + self.evictable_clean.size() + self.evictable_dirty.size()
    }

    pub(crate) fn over_budget(&self) -> bool {
        self.in_memory_size() > self.memory_limit
    }

    /// Draw a victim among all unpinned pages, clean or dirty.
    pub(crate) fn select_victim<F>(&mut self, time: u64, access_time: F) -> Option<BlockId>
    where
        F: Fn(&BlockId) -> u64,
    {
        self.evictable_clean
            .select_oldish2(&self.evictable_dirty, time, access_time)
    }

    /// Draw a victim among unpinned clean pages only.
    pub(crate) fn select_clean_victim<F>(&mut self, time: u64, access_time: F) -> Option<BlockId>
    where
        F: Fn(&BlockId) -> u64,
    {
        self.evictable_clean.select_oldish(time, access_time)
    }
}

#[cfg(test)]
mod tests {
    use larder_runtime::BufferHome;

    use super::*;
    use crate::page::PageState;

    #[test_log::test]
    fn test_rebag_follows_pins_and_state() {
        let home = BufferHome::new();
        let mut evicter = Evicter::new(5, 1 << 20, Some(1));
        let mut page = Page::new(7, home.allocate(4096), PageState::Clean, 0);

        page.pins = 1;
        evicter.rebag(&mut page);
        assert!(evicter.bag(BagKind::Unevictable).has(&7));
        assert_eq!(evicter.in_memory_size(), 4096);

        page.pins = 0;
        page.state = PageState::Dirty;
        evicter.rebag(&mut page);
        assert!(!evicter.bag(BagKind::Unevictable).has(&7));
        assert!(evicter.bag(BagKind::EvictableDirty).has(&7));
        assert_eq!(evicter.select_clean_victim(10, |_| 0), None);
        assert_eq!(evicter.select_victim(10, |_| 0), Some(7));

        page.state = PageState::Clean;
        evicter.rebag(&mut page);
        assert_eq!(evicter.select_clean_victim(10, |_| 0), Some(7));

        evicter.remove(&mut page);
        assert_eq!(page.bag, None);
        assert_eq!(evicter.in_memory_size(), 0);
        assert!(!evicter.over_budget());
    }
}
