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
    cell::RefCell,
    fmt::Debug,
    rc::Rc,
    sync::Arc,
};

use hashbrown::HashMap;
use larder_common::{
    error::{Error, ErrorKind, Result},
    fatal, fatal_assert, BlockId,
};
use larder_io::Serializer;
use larder_runtime::{BufferHome, CoroContext, Coroutine, SharedBuffer, Shard};

use crate::{
    config::PageCacheConfig,
    evicter::Evicter,
    page::{BagKind, Page, PageState},
    statistics::Statistics,
    writeback::DirtyTracker,
};

pub(crate) struct CacheState {
    pub(crate) pages: HashMap<BlockId, Page>,
    /// Blocks being read, with the coroutines waiting for the read to finish.
    pub(crate) loading: HashMap<BlockId, Vec<Coroutine>>,
    pub(crate) evicter: Evicter,
    pub(crate) tracker: DirtyTracker,
    /// Logical access clock. Wraps.
    pub(crate) clock: u64,
    pub(crate) closed: bool,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    pub(crate) fn page(&self, block: BlockId) -> &Page {
        match self.pages.get(&block) {
            Some(page) => page,
            None => fatal!("block {block} is not resident"),
        }
    }

    /// Drop the clean unpinned page of `block`.
    fn evict(&mut self, block: BlockId, stats: &Statistics) {
        let Some(mut page) = self.pages.remove(&block) else {
            fatal!("eviction victim {block} is not resident");
        };
        fatal_assert!(
            page.pins == 0 && page.state == PageState::Clean && !page.writing,
            "evicting {page:?}"
        );
        self.evicter.remove(&mut page);
        stats.add_evictions(1);
        tracing::trace!(block, "[cache]: evicted");
    }
}

/// The resident page of `block`. Takes the map rather than the state so other fields stay
/// borrowable.
pub(crate) fn resident_mut(pages: &mut HashMap<BlockId, Page>, block: BlockId) -> &mut Page {
    match pages.get_mut(&block) {
        Some(page) => page,
        None => fatal!("block {block} is not resident"),
    }
}

pub(crate) struct CacheCore {
    pub(crate) state: RefCell<CacheState>,
    pub(crate) serializer: Serializer,
    pub(crate) home: BufferHome,
    pub(crate) config: PageCacheConfig,
    pub(crate) stats: Arc<Statistics>,
}

impl CacheCore {
    /// Evict unpinned pages until the resident size is within the memory limit.
    ///
    /// A dirty victim cannot go yet: its writeback is started and a clean page is evicted in
    /// its place if there is one. Staying over budget is not an error; the next completed write
    /// or released page tries again.
    pub(crate) fn evict_for_budget(self: &Rc<Self>) {
        loop {
            let (evicted, writeback) = {
                let mut state = self.state.borrow_mut();
                let state = &mut *state;
                if !state.evicter.over_budget() {
                    return;
                }

                let time = state.clock;
                let pages = &state.pages;
                let access_time = |block: &BlockId| match pages.get(block) {
                    Some(page) => page.access_time,
                    None => fatal!("bag member {block} is not resident"),
                };

                let Some(victim) = state.evicter.select_victim(time, access_time) else {
                    return;
                };
                let page = &pages[&victim];
                let (victim, writeback) = if page.is_dirty() {
                    let writeback = (page.state == PageState::Dirty && !page.writing).then_some(victim);
                    (state.evicter.select_clean_victim(time, access_time), writeback)
                } else {
                    (Some(victim), None)
                };

                if let Some(victim) = victim {
                    state.evict(victim, &self.stats);
                }
                (victim.is_some(), writeback)
            };

            if let Some(block) = writeback {
                self.start_writeback(block);
            }
            if !evicted {
                return;
            }
        }
    }

    fn unpin(self: &Rc<Self>, block: BlockId) {
        {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            let page = resident_mut(&mut state.pages, block);
            fatal_assert!(page.pins > 0, "block {block} released more often than acquired");
            page.pins -= 1;
            let evict_now = state.closed && page.pins == 0 && page.state == PageState::Clean && !page.writing;
            state.evicter.rebag(page);
            if evict_now {
                state.evict(block, &self.stats);
                return;
            }
        }
        self.evict_for_budget();
    }

    pub(crate) fn mark_dirty(&self, block: BlockId) -> bool {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let page = resident_mut(&mut state.pages, block);
        let dirtied = state.tracker.set_dirty(page);
        state.evicter.rebag(page);
        dirtied
    }
}

/// Page cache over a block device.
///
/// Bound to the shard it was built on. Pages are loaded on demand by [`PageCache::acquire_page`],
/// pinned while a [`PageHandle`] is alive and evicted by random sampling once the resident size
/// exceeds the memory limit. Dirty pages are written back by a background coroutine and by
/// [`PageCache::flush`].
#[derive(Clone)]
pub struct PageCache {
    core: Rc<CacheCore>,
}

impl Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("PageCache")
            .field("resident", &state.pages.len())
            .field("loading", &state.loading.len())
            .field("evicter", &state.evicter)
            .field("tracker", &state.tracker)
            .field("closed", &state.closed)
            .finish()
    }
}

impl PageCache {
    pub(crate) fn open(shard: &Shard, serializer: Serializer, config: PageCacheConfig) -> Self {
        let state = CacheState {
            pages: HashMap::new(),
            loading: HashMap::new(),
            evicter: Evicter::new(config.eviction_samples, config.memory_limit, config.seed),
            tracker: DirtyTracker::default(),
            clock: 0,
            closed: false,
        };
        let core = Rc::new(CacheCore {
            state: RefCell::new(state),
            serializer,
            home: shard.buffer_home().clone(),
            config,
            stats: Arc::default(),
        });
        tracing::info!(
            memory_limit = core.config.memory_limit,
            block_size = core.serializer.block_size(),
            "[cache]: open"
        );
        CacheCore::spawn_writer(&core, shard.scheduler());
        Self { core }
    }

    /// Counters.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.core.stats
    }

    /// Configurations.
    pub fn config(&self) -> &PageCacheConfig {
        &self.core.config
    }

    /// Size of a page in bytes.
    pub fn page_size(&self) -> usize {
        self.core.serializer.block_size()
    }

    /// Bytes held by resident pages.
    pub fn memory_usage(&self) -> u64 {
        self.core.state.borrow().evicter.in_memory_size()
    }

    /// Number of pages in the eviction bag of `kind`.
    pub fn bag_len(&self, kind: BagKind) -> usize {
        self.core.state.borrow().evicter.bag(kind).len()
    }

    /// Number of resident pages.
    pub fn resident(&self) -> usize {
        self.core.state.borrow().pages.len()
    }

    /// Returns `true` if `block` is resident.
    pub fn contains(&self, block: BlockId) -> bool {
        self.core.state.borrow().pages.contains_key(&block)
    }

    /// Number of dirty pages not yet picked for writeback.
    pub fn dirty_pages(&self) -> usize {
        self.core.state.borrow().tracker.len()
    }

    /// State of `block` if it is resident.
    pub fn page_state(&self, block: BlockId) -> Option<PageState> {
        self.core.state.borrow().pages.get(&block).map(|page| page.state)
    }

    /// Returns `true` once [`PageCache::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.core.state.borrow().closed
    }

    fn check_block(&self, block: BlockId) -> Result<()> {
        let blocks = self.core.serializer.device().blocks();
        if block >= blocks {
            return Err(Error::new(ErrorKind::OutOfRange, "block id beyond the device")
                .with_context("block", block)
                .with_context("blocks", blocks));
        }
        Ok(())
    }

    /// Suspend the calling coroutine until `block` is resident, then return it pinned.
    ///
    /// Concurrent acquisitions of the same missing block share one read. A failed read is
    /// returned to the coroutine that issued it; coroutines waiting on it retry on their own.
    pub async fn acquire_page(&self, ctx: &CoroContext, block: BlockId) -> Result<PageHandle> {
        self.check_block(block)?;
        loop {
            {
                let mut state = self.core.state.borrow_mut();
                let state = &mut *state;
                if state.closed {
                    return Err(Error::closed("page cache"));
                }
                let time = state.tick();
                if let Some(page) = state.pages.get_mut(&block) {
                    page.pins += 1;
                    page.access_time = time;
                    state.evicter.rebag(page);
                    self.core.stats.add_hits(1);
                    return Ok(PageHandle::new(self.core.clone(), block));
                }
                match state.loading.get_mut(&block) {
                    Some(waiters) => waiters.push(ctx.current().clone()),
                    None => {
                        state.loading.insert(block, vec![]);
                        break;
                    }
                }
            }
            self.core.stats.add_coalesced(1);
            ctx.wait().await;
        }

        self.core.stats.add_misses(1);
        let buffer = self.core.home.allocate(self.page_size());
        let res = self.core.serializer.read_block(ctx, block, buffer).await;

        let (res, waiters) = {
            let mut state = self.core.state.borrow_mut();
            let state = &mut *state;
            let waiters = state.loading.remove(&block).unwrap_or_default();
            let res = match res {
                Ok(_) if state.closed => Err(Error::closed("page cache")),
                Ok(buffer) => {
                    self.core.stats.add_read_bytes(buffer.len() as u64);
                    let time = state.tick();
                    let mut page = Page::new(block, buffer, PageState::Clean, time);
                    page.pins = 1;
                    state.evicter.rebag(&mut page);
                    state.pages.insert(block, page);
                    Ok(PageHandle::new(self.core.clone(), block))
                }
                Err(e) => {
                    self.core.stats.add_io_errors(1);
                    tracing::warn!(block, ?e, "[cache]: failed to load page");
                    Err(e)
                }
            };
            (res, waiters)
        };

        for waiter in waiters {
            waiter.notify();
        }
        if res.is_ok() {
            self.core.evict_for_budget();
        }
        res
    }

    /// Insert a zeroed page for `block` without reading it, pinned and dirty.
    ///
    /// For blocks newly allocated by the caller. Unlike a loaded page, a created page starts
    /// dirty: its contents exist nowhere on disk, so it must be written back before it can be
    /// evicted. Fails if the block is resident or being loaded.
    pub fn create_page(&self, block: BlockId) -> Result<PageHandle> {
        self.check_block(block)?;
        {
            let mut state = self.core.state.borrow_mut();
            let state = &mut *state;
            if state.closed {
                return Err(Error::closed("page cache"));
            }
            if state.pages.contains_key(&block) || state.loading.contains_key(&block) {
                return Err(Error::new(ErrorKind::AlreadyExists, "page is already cached").with_context("block", block));
            }
            let time = state.tick();
            let mut page = Page::new(block, self.core.home.allocate(self.page_size()), PageState::Clean, time);
            page.pins = 1;
            state.tracker.set_dirty(&mut page);
            state.evicter.rebag(&mut page);
            state.pages.insert(block, page);
        }
        self.core.evict_for_budget();
        Ok(PageHandle::new(self.core.clone(), block))
    }

    /// Mark the page dirty. No-op if it already is.
    pub fn mark_dirty(&self, page: &PageHandle) {
        page.mark_dirty();
    }

    /// Unpin the page. Same as dropping the handle.
    pub fn release_page(&self, page: PageHandle) {
        drop(page);
    }

    /// Write back every dirty page, suspending until all writes completed.
    ///
    /// Returns the first write error observed meanwhile; the failed pages stay dirty.
    pub async fn flush(&self, ctx: &CoroContext) -> Result<()> {
        self.core.flush(ctx).await
    }

    /// Stop accepting acquisitions, flush, and drop all unpinned clean pages.
    ///
    /// Pages still pinned are dropped when their handles are released. The background writer
    /// exits at its next wakeup.
    pub async fn close(&self, ctx: &CoroContext) -> Result<()> {
        self.core.state.borrow_mut().closed = true;
        tracing::info!("[cache]: closing");
        let res = self.flush(ctx).await;

        let mut state = self.core.state.borrow_mut();
        let state = &mut *state;
        let victims = state
            .pages
            .values()
            .filter(|page| page.pins == 0 && page.state == PageState::Clean && !page.writing)
            .map(|page| page.block)
            .collect::<Vec<_>>();
        for block in victims {
            state.evict(block, &self.core.stats);
        }
        tracing::info!(remaining = state.pages.len(), "[cache]: closed");
        res
    }
}

/// A pinned resident page. Unpins on drop.
pub struct PageHandle {
    core: Rc<CacheCore>,
    block: BlockId,
}

impl Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle").field("block", &self.block).finish()
    }
}

impl PageHandle {
    fn new(core: Rc<CacheCore>, block: BlockId) -> Self {
        Self { core, block }
    }

    /// Block id of the page.
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Writeback state of the page.
    pub fn state(&self) -> PageState {
        self.core.state.borrow().page(self.block).state
    }

    /// A handle to the current contents. Later writes to the page do not show through it.
    pub fn buffer(&self) -> SharedBuffer {
        self.core.state.borrow().page(self.block).buffer.clone()
    }

    /// Read the page contents.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let buffer = self.buffer();
        f(&buffer)
    }

    /// Mark the page dirty and mutate its contents.
    ///
    /// Copies the contents first if a snapshot is shared, e.g. by a write in flight. `f` must not
    /// call back into the cache.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.mark_dirty();
        let mut state = self.core.state.borrow_mut();
        let page = resident_mut(&mut state.pages, self.block);
        f(page.buffer.make_mut())
    }

    /// Mark the page dirty. No-op if it already is.
    pub fn mark_dirty(&self) {
        if self.core.mark_dirty(self.block) {
            tracing::trace!(block = self.block, "[cache]: dirtied");
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.core.unpin(self.block);
    }
}
