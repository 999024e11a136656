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
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt::Debug,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::atomic::Ordering,
    task::{Context, Poll},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use larder_common::{fatal, fatal_assert, strict_assert};

use crate::coroutine::{CoroContext, Coroutine, CoroutineId, CoroutineStatus};

type CoroutineFuture = Pin<Box<dyn Future<Output = ()>>>;

struct Slot {
    coroutine: Coroutine,
    /// Taken out while the coroutine is running.
    future: Option<CoroutineFuture>,
    status: CoroutineStatus,
}

struct SchedulerInner {
    thread: ThreadId,

    tx: flume::Sender<CoroutineId>,
    rx: flume::Receiver<CoroutineId>,

    coroutines: RefCell<HashMap<CoroutineId, Slot>>,
    next_id: Cell<u64>,
    current: Cell<Option<CoroutineId>>,

    timers: RefCell<BTreeMap<(Instant, u64), Coroutine>>,
    timer_seq: Cell<u64>,

    switches: Cell<u64>,
}

/// Cooperative scheduler bound to the OS thread that created it.
///
/// There is no preemption: a coroutine runs until it suspends. Ready coroutines are switched to in
/// the order they were notified. Handles are cheap to clone; all clones refer to the same scheduler.
///
/// Live coroutines hold handles to their scheduler, so an owner must call [`Scheduler::shutdown`]
/// to release them. [`crate::Shard`] does this on drop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("thread", &self.inner.thread)
            .field("coroutines", &self.len())
            .field("current", &self.inner.current.get())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a scheduler bound to the current thread.
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        let inner = SchedulerInner {
            thread: thread::current().id(),
            tx,
            rx,
            coroutines: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            current: Cell::new(None),
            timers: RefCell::new(BTreeMap::new()),
            timer_seq: Cell::new(0),
            switches: Cell::new(0),
        };
        Self { inner: Rc::new(inner) }
    }

    /// The OS thread this scheduler runs coroutines on.
    pub fn thread(&self) -> ThreadId {
        self.inner.thread
    }

    /// Spawn a coroutine running `f`. It first runs when the scheduler switches to it.
    pub fn spawn<F, Fut>(&self, f: F) -> Coroutine
    where
        F: FnOnce(CoroContext) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.assert_home();

        let id = CoroutineId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);

        let coroutine = Coroutine::new(id, self.inner.thread, self.inner.tx.clone());
        let ctx = CoroContext::new(coroutine.clone(), self.clone());
        let future: CoroutineFuture = Box::pin(f(ctx));

        self.inner.coroutines.borrow_mut().insert(
            id,
            Slot {
                coroutine: coroutine.clone(),
                future: Some(future),
                status: CoroutineStatus::Suspended,
            },
        );
        tracing::trace!(%id, "[scheduler]: spawn");

        coroutine.waker().wake();
        coroutine
    }

    /// The coroutine currently executing on this scheduler, if any.
    pub fn current(&self) -> Option<Coroutine> {
        let id = self.inner.current.get()?;
        self.inner.coroutines.borrow().get(&id).map(|slot| slot.coroutine.clone())
    }

    pub(crate) fn current_id(&self) -> Option<CoroutineId> {
        self.inner.current.get()
    }

    /// Status of a coroutine, or `None` once it has been deleted.
    pub fn status(&self, id: CoroutineId) -> Option<CoroutineStatus> {
        self.inner.coroutines.borrow().get(&id).map(|slot| slot.status)
    }

    /// Number of coroutines not yet deleted.
    pub fn len(&self) -> usize {
        self.inner.coroutines.borrow().len()
    }

    /// Returns `true` if no coroutine is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of switches performed so far.
    pub fn switches(&self) -> u64 {
        self.inner.switches.get()
    }

    /// Returns `true` if some coroutine is waiting for its turn.
    pub fn has_ready(&self) -> bool {
        !self.inner.rx.is_empty()
    }

    /// Resume the coroutine `id`.
    ///
    /// Called by the event loop when a notified coroutine's turn arrives. A coroutine that is dead
    /// when switched to, or that finishes during this turn, is deleted.
    pub fn on_cpu_switch(&self, id: CoroutineId) {
        self.assert_home();
        fatal_assert!(
            self.inner.current.get().is_none(),
            "switch to {id} while {:?} is running",
            self.inner.current.get()
        );

        let (coroutine, mut future) = {
            let mut coroutines = self.inner.coroutines.borrow_mut();
            let Some(slot) = coroutines.get_mut(&id) else {
                tracing::trace!(%id, "[scheduler]: switch to deleted coroutine, ignore");
                return;
            };
            if slot.coroutine.is_dead() {
                let slot = coroutines.remove(&id);
                drop(coroutines);
                tracing::trace!(%id, "[scheduler]: delete dead coroutine");
                drop(slot);
                return;
            }
            let Some(future) = slot.future.take() else {
                fatal!("{id} resumed while already running");
            };
            slot.status = CoroutineStatus::Running;
            (slot.coroutine.clone(), future)
        };

        coroutine.shared().scheduled.store(false, Ordering::Release);
        self.inner.current.set(Some(id));
        self.inner.switches.set(self.inner.switches.get() + 1);

        let waker = coroutine.waker();
        let mut cx = Context::from_waker(&waker);
        let res = future.as_mut().poll(&mut cx);

        self.inner.current.set(None);

        match res {
            Poll::Ready(()) => {
                coroutine.mark_dead();
                let slot = self.inner.coroutines.borrow_mut().remove(&id);
                tracing::trace!(%id, "[scheduler]: coroutine returned, delete");
                // Drop outside of the borrow, destructors may spawn or notify.
                drop(slot);
                drop(future);
            }
            Poll::Pending => {
                let mut coroutines = self.inner.coroutines.borrow_mut();
                if let Some(slot) = coroutines.get_mut(&id) {
                    slot.status = if coroutine.is_dead() {
                        CoroutineStatus::Dead
                    } else {
                        CoroutineStatus::Suspended
                    };
                    slot.future = Some(future);
                }
            }
        }
    }

    /// Fire due timers, then switch to every coroutine that was ready when the call started.
    ///
    /// Returns the number of switches performed.
    pub fn run_ready(&self) -> usize {
        self.fire_timers(Instant::now());

        let ready = self.inner.rx.len();
        let mut switched = 0;
        for _ in 0..ready {
            match self.inner.rx.try_recv() {
                Ok(id) => {
                    self.on_cpu_switch(id);
                    switched += 1;
                }
                Err(_) => break,
            }
        }
        switched
    }

    /// Block the thread until a coroutine is notified or `timeout` elapses, then switch to it.
    ///
    /// Returns `true` if a coroutine was switched to.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        self.assert_home();
        let res = match timeout {
            Some(timeout) => self.inner.rx.recv_timeout(timeout).ok(),
            // The scheduler holds a sender itself, so `recv` only returns on a notification.
            None => self.inner.rx.recv().ok(),
        };
        match res {
            Some(id) => {
                self.on_cpu_switch(id);
                true
            }
            None => false,
        }
    }

    /// Register a timer that notifies `coroutine` once `deadline` has passed.
    pub fn add_timer(&self, deadline: Instant, coroutine: Coroutine) {
        strict_assert!(coroutine.home() == self.inner.thread);
        let seq = self.inner.timer_seq.get();
        self.inner.timer_seq.set(seq + 1);
        self.inner.timers.borrow_mut().insert((deadline, seq), coroutine);
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.timers.borrow().keys().next().map(|(deadline, _)| *deadline)
    }

    /// Notify the coroutines of all timers due at `now`. Returns the number fired.
    pub fn fire_timers(&self, now: Instant) -> usize {
        let due = {
            let mut timers = self.inner.timers.borrow_mut();
            let pending = timers.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *timers, pending)
        };
        let fired = due.len();
        for (_, coroutine) in due {
            if !coroutine.is_dead() {
                coroutine.notify();
            }
        }
        fired
    }

    /// Drop every live coroutine and pending timer.
    pub fn shutdown(&self) {
        let coroutines = std::mem::take(&mut *self.inner.coroutines.borrow_mut());
        let timers = std::mem::take(&mut *self.inner.timers.borrow_mut());
        if !coroutines.is_empty() {
            tracing::debug!(
                coroutines = coroutines.len(),
                "[scheduler]: shutdown with live coroutines"
            );
        }
        for slot in coroutines.values() {
            slot.coroutine.mark_dead();
        }
        drop(timers);
        drop(coroutines);
    }

    fn assert_home(&self) {
        fatal_assert!(
            thread::current().id() == self.inner.thread,
            "scheduler of {:?} used from {:?}",
            self.inner.thread,
            thread::current().id()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use itertools::Itertools;

    use super::*;

    fn run_until_empty(scheduler: &Scheduler) {
        while scheduler.run_ready() > 0 {}
    }

    #[test_log::test]
    fn test_spawn_runs_on_switch() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(vec![]));

        let l = log.clone();
        let coroutine = scheduler.spawn(move |_| async move {
            l.borrow_mut().push("run");
        });
        assert!(log.borrow().is_empty());
        assert_eq!(scheduler.status(coroutine.id()), Some(CoroutineStatus::Suspended));

        run_until_empty(&scheduler);
        assert_eq!(*log.borrow(), vec!["run"]);
        assert!(coroutine.is_dead());
        assert_eq!(scheduler.status(coroutine.id()), None);
        assert!(scheduler.is_empty());
    }

    #[test_log::test]
    fn test_wait_notify_resumes_once() {
        let scheduler = Scheduler::new();
        let resumed = Rc::new(Cell::new(0));

        let r = resumed.clone();
        let x = scheduler.spawn(move |ctx| async move {
            ctx.wait().await;
            r.set(r.get() + 1);
            ctx.wait().await;
            r.set(r.get() + 1);
        });

        run_until_empty(&scheduler);
        assert_eq!(resumed.get(), 0);
        assert_eq!(scheduler.status(x.id()), Some(CoroutineStatus::Suspended));

        let x2 = x.clone();
        scheduler.spawn(move |_| async move {
            x2.notify();
        });
        run_until_empty(&scheduler);
        assert_eq!(resumed.get(), 1);

        // Spurious wakes through the waker do not complete a wait.
        x.waker().wake();
        run_until_empty(&scheduler);
        assert_eq!(resumed.get(), 1);
        assert_eq!(scheduler.status(x.id()), Some(CoroutineStatus::Suspended));

        x.notify();
        run_until_empty(&scheduler);
        assert_eq!(resumed.get(), 2);
        assert!(x.is_dead());
    }

    #[test_log::test]
    #[should_panic(expected = "notified twice")]
    fn test_double_notify_is_fatal() {
        let scheduler = Scheduler::new();
        let x = scheduler.spawn(|ctx| async move {
            ctx.wait().await;
        });
        x.notify();
        x.notify();
    }

    #[test_log::test]
    fn test_notify_before_wait_is_consumed_by_wait() {
        let scheduler = Scheduler::new();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let x = scheduler.spawn(move |ctx| async move {
            ctx.wait().await;
            d.set(true);
        });
        x.notify();
        run_until_empty(&scheduler);
        assert!(done.get());
    }

    #[test_log::test]
    fn test_suicide_stops_execution_and_next_ready_runs() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(vec![]));

        let l = log.clone();
        let a = scheduler.spawn(move |ctx| async move {
            l.borrow_mut().push("a:before");
            match ctx.suicide().await {}
        });
        let l = log.clone();
        let b = scheduler.spawn(move |_| async move {
            l.borrow_mut().push("b");
        });

        scheduler.run_ready();
        assert_eq!(*log.borrow(), vec!["a:before", "b"]);
        assert!(a.is_dead());
        assert_eq!(scheduler.status(a.id()), Some(CoroutineStatus::Dead));
        assert!(b.is_dead());

        // The dead coroutine is deleted on its next switch and never runs again.
        run_until_empty(&scheduler);
        assert_eq!(scheduler.status(a.id()), None);
        assert_eq!(*log.borrow(), vec!["a:before", "b"]);
        assert!(scheduler.is_empty());
    }

    #[test_log::test]
    fn test_ready_order_follows_notification_order() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(vec![]));

        let coroutines = (0..4)
            .map(|i| {
                let l = log.clone();
                scheduler.spawn(move |ctx| async move {
                    ctx.wait().await;
                    l.borrow_mut().push(i);
                })
            })
            .collect_vec();
        run_until_empty(&scheduler);

        for i in [2, 0, 3, 1] {
            coroutines[i].notify();
        }
        run_until_empty(&scheduler);
        assert_eq!(*log.borrow(), vec![2, 0, 3, 1]);
    }

    #[test_log::test]
    fn test_cross_thread_notify() {
        let scheduler = Scheduler::new();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let x = scheduler.spawn(move |ctx| async move {
            ctx.wait().await;
            d.set(true);
        });
        run_until_empty(&scheduler);

        let remote = x.clone();
        let handle = std::thread::spawn(move || remote.notify());

        assert!(scheduler.park(Some(Duration::from_secs(10))));
        handle.join().unwrap();
        assert!(done.get());
    }

    #[test_log::test]
    fn test_timers_fire_in_deadline_order() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(vec![]));

        for (i, ms) in [(0, 30u64), (1, 10), (2, 20)] {
            let l = log.clone();
            scheduler.spawn(move |ctx| async move {
                ctx.sleep(Duration::from_millis(ms)).await;
                l.borrow_mut().push(i);
            });
        }
        run_until_empty(&scheduler);
        assert!(scheduler.next_deadline().is_some());

        while log.borrow().len() < 3 {
            let timeout = scheduler
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            scheduler.park(timeout);
            run_until_empty(&scheduler);
        }
        assert_eq!(*log.borrow(), vec![1, 2, 0]);
        assert!(scheduler.next_deadline().is_none());
    }

    #[test_log::test]
    fn test_shutdown_drops_live_coroutines() {
        struct Guard(Rc<Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let scheduler = Scheduler::new();
        let dropped = Rc::new(Cell::new(false));
        let guard = Guard(dropped.clone());
        let x = scheduler.spawn(move |ctx| async move {
            let _guard = guard;
            ctx.wait().await;
        });
        run_until_empty(&scheduler);
        assert!(!dropped.get());

        scheduler.shutdown();
        assert!(dropped.get());
        assert!(x.is_dead());
        assert!(scheduler.is_empty());
    }
}
