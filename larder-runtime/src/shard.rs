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
    future::Future,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{buffer::BufferHome, coroutine::CoroContext, scheduler::Scheduler};

/// A source of events polled by the [`Shard`] event loop, e.g. an AIO reactor.
pub trait EventSource {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Returns `true` while events are expected, e.g. I/O is in flight.
    fn has_pending(&self) -> bool;

    /// Wait up to `timeout` for events and dispatch them. Returns the number dispatched.
    fn poll_events(&self, timeout: Duration) -> usize;
}

/// Per-thread event loop: one scheduler, one buffer home and a set of event sources.
pub struct Shard {
    scheduler: Scheduler,
    home: BufferHome,
    sources: RefCell<Vec<Rc<dyn EventSource>>>,
    poll_interval: Duration,
}

impl Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("scheduler", &self.scheduler)
            .field("home", &self.home)
            .field("sources", &self.sources.borrow().iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}

impl Shard {
    const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    /// Create a shard bound to the current thread.
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            home: BufferHome::new(),
            sources: RefCell::new(vec![]),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how long the loop blocks in an event source at a time while other work may arrive.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The shard's scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The shard's buffer home.
    pub fn buffer_home(&self) -> &BufferHome {
        &self.home
    }

    /// Register an event source to be polled by the loop.
    pub fn register(&self, source: Rc<dyn EventSource>) {
        tracing::debug!(source = source.name(), "[shard]: register event source");
        self.sources.borrow_mut().push(source);
    }

    /// Run one iteration of the event loop.
    ///
    /// Switches to ready coroutines and drains the buffer mailbox. If nothing was ready, blocks
    /// in the pending event sources or, if there are none, parks until a notification or the
    /// next timer deadline.
    pub fn turn(&self) {
        let switched = self.scheduler.run_ready();
        self.home.drain();
        if switched > 0 || self.scheduler.has_ready() {
            return;
        }

        let timeout = self
            .scheduler
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        let sources = self
            .sources
            .borrow()
            .iter()
            .filter(|source| source.has_pending())
            .cloned()
            .collect::<Vec<_>>();

        if sources.is_empty() {
            self.scheduler.park(timeout);
            return;
        }

        // Cross-thread notifications cannot interrupt a source, so block in short slices.
        let mut timeout = timeout.unwrap_or(self.poll_interval).min(self.poll_interval);
        for source in sources {
            let dispatched = source.poll_events(timeout);
            if dispatched > 0 {
                tracing::trace!(source = source.name(), dispatched, "[shard]: events dispatched");
                timeout = Duration::ZERO;
            }
        }
    }

    /// Run `f` as a root coroutine and drive the loop until it returns.
    ///
    /// Other coroutines stay alive (suspended) after the root returns.
    pub fn block_on<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(CoroContext) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let output = Rc::new(RefCell::new(None));
        let o = output.clone();
        self.scheduler
            .spawn_task(f)
            .callback(move |value| *o.borrow_mut() = Some(value));

        loop {
            if let Some(value) = output.borrow_mut().take() {
                return value;
            }
            self.turn();
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.sources.borrow_mut().clear();
        self.home.drain();
    }
}
