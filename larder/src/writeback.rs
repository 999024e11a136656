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

use std::{collections::BTreeSet, rc::Rc};

use larder_common::{error::Error, error::Result, fatal_assert, BlockId};
use larder_io::IoResult;
use larder_runtime::{CoroContext, Coroutine, Scheduler};

use crate::{
    cache::{resident_mut, CacheCore},
    page::{Page, PageState},
};

/// Registry of dirty pages and of the writes in flight.
///
/// Only touched by coroutines on the cache's shard.
#[derive(Debug, Default)]
pub(crate) struct DirtyTracker {
    /// Dirty pages not picked by a writeback pass yet, in block order.
    dirty: BTreeSet<BlockId>,
    inflight: usize,
    /// Flushers waiting for the in-flight writes to drain.
    waiters: Vec<Coroutine>,
    /// First write error since the last flush took it.
    error: Option<Error>,
}

impl DirtyTracker {
    /// Mark `page` dirty and register it. Returns `false` if it already was dirty.
    ///
    /// A page being written back returns to dirty, so the in-flight write leaves it dirty.
    pub(crate) fn set_dirty(&mut self, page: &mut Page) -> bool {
        match page.state {
            PageState::Dirty => false,
            PageState::Clean | PageState::WritebackPending => {
                page.state = PageState::Dirty;
                self.dirty.insert(page.block);
                true
            }
        }
    }

    /// Pick up to `max` dirty pages, lowest block ids first.
    pub(crate) fn take_batch(&mut self, max: usize) -> Vec<BlockId> {
        let mut batch = Vec::with_capacity(max.min(self.dirty.len()));
        while batch.len() < max {
            match self.dirty.pop_first() {
                Some(block) => batch.push(block),
                None => break,
            }
        }
        batch
    }

    /// Number of dirty pages not picked yet.
    pub(crate) fn len(&self) -> usize {
        self.dirty.len()
    }

    fn is_quiescent(&self) -> bool {
        self.dirty.is_empty() && self.inflight == 0
    }

    fn take_waiters_if_drained(&mut self) -> Vec<Coroutine> {
        if self.inflight == 0 {
            std::mem::take(&mut self.waiters)
        } else {
            vec![]
        }
    }
}

impl CacheCore {
    /// Spawn the coroutine running a writeback pass every `writeback_interval`.
    ///
    /// It exits once the cache is closed or dropped.
    pub(crate) fn spawn_writer(core: &Rc<Self>, scheduler: &Scheduler) {
        let weak = Rc::downgrade(core);
        let interval = core.config.writeback_interval;
        let batch = core.config.writeback_batch;
        scheduler.spawn(move |ctx| async move {
            loop {
                ctx.sleep(interval).await;
                let Some(core) = weak.upgrade() else { break };
                if core.state.borrow().closed {
                    break;
                }
                let started = core.writeback_pass(batch);
                if started > 0 {
                    tracing::debug!(started, "[writeback]: periodic pass");
                }
            }
            tracing::debug!("[writeback]: writer exits");
        });
    }

    /// Start writes for up to `max` dirty pages. Returns the number started.
    pub(crate) fn writeback_pass(self: &Rc<Self>, max: usize) -> usize {
        let batch = self.state.borrow_mut().tracker.take_batch(max);
        batch.into_iter().filter(|&block| self.start_writeback(block)).count()
    }

    /// Snapshot the dirty page of `block` and submit its write.
    ///
    /// A page that already has a write in flight stays registered as dirty and is picked again
    /// after that write completes. A rejected submission leaves the page dirty and records the
    /// error for the next flush.
    pub(crate) fn start_writeback(self: &Rc<Self>, block: BlockId) -> bool {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        state.tracker.dirty.remove(&block);

        let page = resident_mut(&mut state.pages, block);
        if page.state != PageState::Dirty {
            return false;
        }
        if page.writing {
            state.tracker.dirty.insert(block);
            return false;
        }

        page.state = PageState::WritebackPending;
        page.writing = true;
        state.evicter.rebag(page);
        state.tracker.inflight += 1;
        let snapshot = page.buffer.clone();

        let weak = Rc::downgrade(self);
        let submitted = self.serializer.submit_write(block, snapshot, move |buffer, res| {
            if let Some(core) = weak.upgrade() {
                core.on_write_complete(block, buffer.len(), res);
            }
        });

        match submitted {
            Ok(handle) => {
                tracing::trace!(block, %handle, "[writeback]: write submitted");
                true
            }
            Err(e) => {
                tracing::warn!(block, ?e, "[writeback]: write submission failed");
                self.stats.add_io_errors(1);
                let page = resident_mut(&mut state.pages, block);
                page.writing = false;
                state.tracker.set_dirty(page);
                state.evicter.rebag(page);
                state.tracker.inflight -= 1;
                state.tracker.error.get_or_insert(e);
                // Notifying only queues the waiters; they run after this borrow is gone.
                for waiter in state.tracker.take_waiters_if_drained() {
                    waiter.notify();
                }
                false
            }
        }
    }

    fn on_write_complete(self: &Rc<Self>, block: BlockId, len: usize, res: IoResult<()>) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            fatal_assert!(state.tracker.inflight > 0, "write of {block} completed with none in flight");
            state.tracker.inflight -= 1;

            let page = resident_mut(&mut state.pages, block);
            fatal_assert!(page.writing, "write of {block} completed, but none was in flight for it");
            page.writing = false;

            match res {
                Ok(()) => {
                    self.stats.add_flushed_pages(1);
                    self.stats.add_written_bytes(len as u64);
                    // Re-dirtied pages went back to `Dirty` and stay registered.
                    if page.state == PageState::WritebackPending {
                        page.state = PageState::Clean;
                    }
                    tracing::trace!(block, state = ?page.state, "[writeback]: write completed");
                }
                Err(e) => {
                    self.stats.add_io_errors(1);
                    tracing::warn!(block, ?e, "[writeback]: write failed");
                    state.tracker.set_dirty(page);
                    state.tracker.error.get_or_insert(Error::from(e).with_context("block", block));
                }
            }
            state.evicter.rebag(page);
            state.tracker.take_waiters_if_drained()
        };

        for waiter in waiters {
            waiter.notify();
        }
        self.evict_for_budget();
    }

    /// Write back until no page is dirty and no write is in flight.
    ///
    /// Returns the first error recorded meanwhile without starting further writes.
    pub(crate) async fn flush(self: &Rc<Self>, ctx: &CoroContext) -> Result<()> {
        self.state.borrow_mut().tracker.error = None;
        loop {
            {
                let mut state = self.state.borrow_mut();
                if let Some(e) = state.tracker.error.take() {
                    return Err(e);
                }
                if state.tracker.is_quiescent() {
                    return Ok(());
                }
            }

            self.writeback_pass(usize::MAX);

            {
                let mut state = self.state.borrow_mut();
                if let Some(e) = state.tracker.error.take() {
                    return Err(e);
                }
                if state.tracker.inflight == 0 {
                    continue;
                }
                state.tracker.waiters.push(ctx.current().clone());
            }
            ctx.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use larder_runtime::BufferHome;

    use super::*;

    #[test_log::test]
    fn test_set_dirty_is_idempotent() {
        let home = BufferHome::new();
        let mut tracker = DirtyTracker::default();
        let mut page = Page::new(3, home.allocate(16), PageState::Clean, 0);

        assert!(tracker.set_dirty(&mut page));
        assert!(!tracker.set_dirty(&mut page));
        assert_eq!(page.state, PageState::Dirty);
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.take_batch(8), vec![3]);
        page.state = PageState::WritebackPending;
        assert!(tracker.set_dirty(&mut page));
        assert_eq!(page.state, PageState::Dirty);
        assert_eq!(tracker.len(), 1);
    }

    #[test_log::test]
    fn test_take_batch_in_block_order() {
        let home = BufferHome::new();
        let mut tracker = DirtyTracker::default();
        for block in [9, 2, 7, 4] {
            let mut page = Page::new(block, home.allocate(16), PageState::Clean, 0);
            tracker.set_dirty(&mut page);
        }
        assert_eq!(tracker.take_batch(3), vec![2, 4, 7]);
        assert_eq!(tracker.take_batch(3), vec![9]);
        assert!(tracker.take_batch(3).is_empty());
        assert!(tracker.is_quiescent());
    }
}
