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
    convert::Infallible,
    fmt::{Debug, Display},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Wake, Waker},
    thread::ThreadId,
    time::{Duration, Instant},
};

use larder_common::{fatal, fatal_assert};

use crate::{scheduler::Scheduler, task::Task};

/// Identifier of a coroutine, unique within its scheduler. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroutineId(pub(crate) u64);

impl Display for CoroutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "coro#{}", self.0)
    }
}

/// Lifecycle state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Currently executing on its scheduler.
    Running,
    /// Waiting to be switched to.
    Suspended,
    /// Terminated. The scheduler deletes it the next time it is switched to.
    Dead,
}

pub(crate) struct CoroutineShared {
    id: CoroutineId,
    home: ThreadId,
    /// Single-shot flag set by `notify()` and consumed by `wait()`.
    notified: AtomicBool,
    /// Set while the id sits in the ready queue.
    pub(crate) scheduled: AtomicBool,
    dead: AtomicBool,
    queue: flume::Sender<CoroutineId>,
}

impl CoroutineShared {
    fn schedule(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.queue.send(self.id).is_err() {
            tracing::trace!(id = %self.id, "[coroutine]: scheduler is gone, drop wake-up");
        }
    }
}

impl Wake for CoroutineShared {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// Handle of a coroutine.
///
/// Cheap to clone and `Send`, so other threads can [`Coroutine::notify`] it. The coroutine itself
/// always runs on the thread of the scheduler that spawned it.
#[derive(Clone)]
pub struct Coroutine {
    shared: Arc<CoroutineShared>,
}

impl Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.shared.id)
            .field("home", &self.shared.home)
            .field("dead", &self.is_dead())
            .finish()
    }
}

impl Coroutine {
    pub(crate) fn new(id: CoroutineId, home: ThreadId, queue: flume::Sender<CoroutineId>) -> Self {
        let shared = CoroutineShared {
            id,
            home,
            notified: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            queue,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Id of the coroutine.
    pub fn id(&self) -> CoroutineId {
        self.shared.id
    }

    /// The OS thread the coroutine runs on.
    pub fn home(&self) -> ThreadId {
        self.shared.home
    }

    /// Returns `true` once the coroutine returned or called [`CoroContext::suicide`].
    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    /// Schedule the coroutine for resumption. May be called from any thread.
    ///
    /// Exactly one `notify()` must match each outstanding [`CoroContext::wait`]. A second notify
    /// before the first one is consumed is a programmer error and aborts.
    pub fn notify(&self) {
        if self.shared.notified.swap(true, Ordering::AcqRel) {
            fatal!(
                "{} notified twice before a wait consumed the first notification",
                self.shared.id
            );
        }
        tracing::trace!(id = %self.shared.id, "[coroutine]: notify");
        self.shared.schedule();
    }

    pub(crate) fn shared(&self) -> &Arc<CoroutineShared> {
        &self.shared
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::from(self.shared.clone())
    }

    pub(crate) fn mark_dead(&self) {
        self.shared.dead.store(true, Ordering::Release);
    }

    fn take_notification(&self) -> bool {
        self.shared.notified.swap(false, Ordering::AcqRel)
    }
}

/// Per-coroutine context, handed to every coroutine body.
///
/// Replaces ambient thread-local "current coroutine" and "current scheduler" state: everything a
/// coroutine needs to suspend, sleep or spawn goes through this value.
#[derive(Clone)]
pub struct CoroContext {
    coroutine: Coroutine,
    scheduler: Scheduler,
}

impl Debug for CoroContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroContext").field("coroutine", &self.coroutine).finish()
    }
}

impl CoroContext {
    pub(crate) fn new(coroutine: Coroutine, scheduler: Scheduler) -> Self {
        Self { coroutine, scheduler }
    }

    /// The coroutine this context belongs to.
    pub fn current(&self) -> &Coroutine {
        &self.coroutine
    }

    /// The scheduler running this coroutine.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Suspend until [`Coroutine::notify`] is called on this coroutine.
    ///
    /// If the notification already arrived, the wait completes on first poll.
    pub fn wait(&self) -> Wait<'_> {
        Wait { ctx: self }
    }

    /// Mark this coroutine dead and suspend for good.
    ///
    /// No code after the `.await` runs. The scheduler drops the coroutine the next time it
    /// is switched to.
    pub fn suicide(&self) -> Suicide<'_> {
        Suicide { ctx: self }
    }

    /// Suspend for at least `duration`, woken by the scheduler's timer.
    pub async fn sleep(&self, duration: Duration) {
        self.scheduler.add_timer(Instant::now() + duration, self.coroutine.clone());
        self.wait().await;
    }

    /// Give other ready coroutines a turn.
    pub async fn yield_now(&self) {
        let mut yielded = false;
        std::future::poll_fn(|cx| {
            if yielded {
                return Poll::Ready(());
            }
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        })
        .await
    }

    /// Spawn a coroutine on the same scheduler.
    pub fn spawn<F, Fut>(&self, f: F) -> Coroutine
    where
        F: FnOnce(CoroContext) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.scheduler.spawn(f)
    }

    /// Spawn a joinable [`Task`] on the same scheduler.
    pub fn spawn_task<F, Fut, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce(CoroContext) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        self.scheduler.spawn_task(f)
    }

    fn assert_running(&self) {
        fatal_assert!(
            self.scheduler.current_id() == Some(self.coroutine.id()),
            "{} suspended outside of its own turn (running: {:?})",
            self.coroutine.id(),
            self.scheduler.current_id()
        );
    }
}

/// Future returned by [`CoroContext::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct Wait<'a> {
    ctx: &'a CoroContext,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        self.ctx.assert_running();
        // The coroutine's own waker is the notification target, nothing to register.
        if self.ctx.coroutine.take_notification() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Future returned by [`CoroContext::suicide`]. Never completes.
#[must_use = "futures do nothing unless polled"]
pub struct Suicide<'a> {
    ctx: &'a CoroContext,
}

impl Future for Suicide<'_> {
    type Output = Infallible;

    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        self.ctx.assert_running();
        tracing::trace!(id = %self.ctx.coroutine.id(), "[coroutine]: suicide");
        self.ctx.coroutine.mark_dead();
        self.ctx.coroutine.shared.schedule();
        Poll::Pending
    }
}
