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
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

use hashbrown::HashMap;
use larder_common::{fatal, fatal_assert};
use larder_runtime::{CoroContext, EventSource, SharedBuffer};

use crate::{
    backend::AioBackend,
    error::{IoError, IoResult},
    request::{Completion, IoHandle, IoOp, IoRequest},
};

/// Configurations for [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Maximum completions retrieved per backend call.
    ///
    /// Bounds the work done per retrieval so one wakeup does not monopolize the loop.
    ///
    /// Default: `50`.
    pub max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { max_events: 50 }
    }
}

/// Counters of a [`Reactor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    /// Accepted submissions.
    pub submitted: u64,
    /// Rejected submissions.
    pub rejected: u64,
    /// Delivered completions.
    pub completed: u64,
    /// Completions delivered with an error.
    pub failed: u64,
    /// `on_event` calls that retrieved at least one completion.
    pub wakeups: u64,
}

type CompletionHandler = Box<dyn FnOnce(SharedBuffer, IoResult<()>)>;

struct PendingIo {
    op: IoOp,
    buffer: SharedBuffer,
    on_complete: CompletionHandler,
}

impl PendingIo {
    fn complete(self, completion: Completion) -> bool {
        let expected = self.buffer.len();
        let res = if completion.result < 0 {
            Err(IoError::from_raw_os_error(-completion.result as i32))
        } else if completion.result as usize != expected {
            Err(IoError::ShortTransfer {
                expected,
                actual: completion.result as usize,
            })
        } else {
            Ok(())
        };
        let ok = res.is_ok();
        if let Err(e) = &res {
            tracing::warn!(handle = %completion.handle, op = ?self.op, ?e, "[reactor]: I/O failed");
        }
        (self.on_complete)(self.buffer, res);
        ok
    }
}

struct ReactorInner {
    backend: Box<dyn AioBackend>,
    pending: HashMap<IoHandle, PendingIo>,
    next_handle: u64,
    max_events: usize,
    events: Vec<Completion>,
    stats: ReactorStats,
}

impl ReactorInner {
    fn prep(&self, request: &mut IoRequest) {
        request.notify = Some(self.backend.notify_target());
    }
}

impl Drop for ReactorInner {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        // The kernel may still access the buffers, never free them.
        tracing::error!(
            pending = self.pending.len(),
            "[reactor]: dropped with I/O in flight, leaking the buffers"
        );
        for (_, pending) in self.pending.drain() {
            std::mem::forget(pending.buffer);
        }
    }
}

/// Bridges completions of an [`AioBackend`] to the coroutines waiting on them.
///
/// Bound to the thread it is created on. Register it with the shard as an [`EventSource`] so the
/// loop calls [`Reactor::on_event`] whenever the backend's descriptor becomes readable.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<ReactorInner>>,
}

impl Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Reactor")
            .field("backend", &inner.backend)
            .field("inflight", &inner.pending.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl Reactor {
    /// Create a reactor over `backend`.
    pub fn new<B>(backend: B, config: ReactorConfig) -> Self
    where
        B: AioBackend + 'static,
    {
        fatal_assert!(config.max_events > 0, "reactor batch size must be positive");
        let inner = ReactorInner {
            backend: Box::new(backend),
            pending: HashMap::new(),
            next_handle: 1,
            max_events: config.max_events,
            events: Vec::with_capacity(config.max_events),
            stats: ReactorStats::default(),
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Attach this reactor's notification target to `request`, so its completion is signalled here.
    pub fn prep(&self, request: &mut IoRequest) {
        self.inner.borrow().prep(request);
    }

    /// Number of submitted requests whose completion has not been delivered yet.
    pub fn inflight(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Counters.
    pub fn stats(&self) -> ReactorStats {
        self.inner.borrow().stats
    }

    /// Submit `op` on `buffer` at `offset` of `fd`.
    ///
    /// `on_complete` receives the buffer back together with the outcome once the completion is
    /// retrieved by [`Reactor::on_event`]. If the backend rejects the request, the error is
    /// returned, `on_complete` is dropped uncalled and the buffer released.
    ///
    /// A read target buffer must not be shared with any other handle.
    pub fn submit<F>(
        &self,
        op: IoOp,
        fd: RawFd,
        offset: u64,
        buffer: SharedBuffer,
        on_complete: F,
    ) -> IoResult<IoHandle>
    where
        F: FnOnce(SharedBuffer, IoResult<()>) + 'static,
    {
        if op == IoOp::Read {
            fatal_assert!(buffer.is_unique(), "read target buffer is shared");
        }

        let mut inner = self.inner.borrow_mut();
        let handle = IoHandle::from_raw(inner.next_handle);
        inner.next_handle += 1;

        let (ptr, len) = buffer.as_raw_parts();
        let mut request = IoRequest {
            handle,
            op,
            fd,
            offset,
            ptr,
            len,
            notify: None,
        };
        inner.prep(&mut request);

        inner.pending.insert(
            handle,
            PendingIo {
                op,
                buffer,
                on_complete: Box::new(on_complete),
            },
        );

        match inner.backend.submit(request) {
            Ok(()) => {
                inner.stats.submitted += 1;
                tracing::trace!(%handle, ?op, fd, offset, len, "[reactor]: submitted");
                Ok(handle)
            }
            Err(e) => {
                inner.stats.rejected += 1;
                let pending = inner.pending.remove(&handle);
                drop(inner);
                drop(pending);
                tracing::warn!(%handle, ?op, fd, offset, len, ?e, "[reactor]: submission rejected");
                Err(e)
            }
        }
    }

    /// Submit `op` and suspend the calling coroutine until it completes.
    ///
    /// Returns the buffer on success.
    pub async fn io(
        &self,
        ctx: &CoroContext,
        op: IoOp,
        fd: RawFd,
        offset: u64,
        buffer: SharedBuffer,
    ) -> IoResult<SharedBuffer> {
        let slot = Rc::new(RefCell::new(None));
        let s = slot.clone();
        let waiter = ctx.current().clone();
        self.submit(op, fd, offset, buffer, move |buffer, res| {
            *s.borrow_mut() = Some((buffer, res));
            waiter.notify();
        })?;

        ctx.wait().await;

        let Some((buffer, res)) = slot.borrow_mut().take() else {
            fatal!("{} resumed before its I/O completed", ctx.current().id());
        };
        res.map(|()| buffer)
    }

    /// Read `buffer.len()` bytes at `offset` of `fd` into `buffer`, suspending until done.
    pub async fn read(
        &self,
        ctx: &CoroContext,
        fd: RawFd,
        offset: u64,
        buffer: SharedBuffer,
    ) -> IoResult<SharedBuffer> {
        self.io(ctx, IoOp::Read, fd, offset, buffer).await
    }

    /// Write `buffer` at `offset` of `fd`, suspending until done.
    pub async fn write(
        &self,
        ctx: &CoroContext,
        fd: RawFd,
        offset: u64,
        buffer: SharedBuffer,
    ) -> IoResult<SharedBuffer> {
        self.io(ctx, IoOp::Write, fd, offset, buffer).await
    }

    /// Retrieve every signalled completion and dispatch it to its handler.
    ///
    /// Completions are fetched in batches of at most `max_events` until the exact signalled count
    /// is reached, and dispatched in retrieval order. Returns the number dispatched.
    ///
    /// A backend failure, a batch shorter than requested or a completion without a pending
    /// request means the kernel and the reactor disagree, which is fatal.
    pub fn on_event(&self) -> usize {
        let dispatch = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;

            let signaled = match inner.backend.signaled() {
                Ok(signaled) => signaled,
                Err(e) => fatal!("[reactor]: failed to read completion count from {}: {e}", inner.backend.name()),
            };

            let mut events = std::mem::take(&mut inner.events);
            events.clear();
            let mut remaining = signaled;
            while remaining > 0 {
                let batch = remaining.min(inner.max_events as u64) as usize;
                let retrieved = match inner.backend.get_events(batch, &mut events) {
                    Ok(retrieved) => retrieved,
                    Err(e) => fatal!("[reactor]: failed to retrieve completions from {}: {e}", inner.backend.name()),
                };
                if retrieved != batch {
                    fatal!(
                        "[reactor]: {signaled} completions signalled, but only {} retrievable",
                        signaled - remaining + retrieved as u64
                    );
                }
                remaining -= batch as u64;
            }

            let mut dispatch = Vec::with_capacity(events.len());
            for completion in events.drain(..) {
                match inner.pending.remove(&completion.handle) {
                    Some(pending) => dispatch.push((completion, pending)),
                    None => fatal!("[reactor]: completion for unknown request {}", completion.handle),
                }
            }
            inner.events = events;
            if !dispatch.is_empty() {
                inner.stats.wakeups += 1;
            }
            dispatch
        };

        let n = dispatch.len();
        let mut failed = 0;
        // Handlers may submit more I/O, so they run without the borrow.
        for (completion, pending) in dispatch {
            if !pending.complete(completion) {
                failed += 1;
            }
        }

        let mut inner = self.inner.borrow_mut();
        inner.stats.completed += n as u64;
        inner.stats.failed += failed;
        if n > 0 {
            tracing::trace!(dispatched = n, failed, "[reactor]: completions dispatched");
        }
        n
    }
}

impl EventSource for Reactor {
    fn name(&self) -> &'static str {
        "aio reactor"
    }

    fn has_pending(&self) -> bool {
        !self.inner.borrow().pending.is_empty()
    }

    fn poll_events(&self, timeout: Duration) -> usize {
        let readable = self.inner.borrow_mut().backend.wait_readable(timeout);
        match readable {
            Ok(true) => self.on_event(),
            Ok(false) => 0,
            Err(e) => fatal!("[reactor]: failed to wait for completions: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use larder_runtime::Shard;

    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryDisk};

    fn setup(max_events: usize) -> (Shard, Reactor, MemoryDisk) {
        let shard = Shard::new();
        let backend = MemoryBackend::new();
        let disk = backend.disk();
        let reactor = Reactor::new(backend, ReactorConfig { max_events });
        shard.register(Rc::new(reactor.clone()));
        (shard, reactor, disk)
    }

    #[test_log::test]
    fn test_two_reads_resume_in_retrieval_order() {
        let (shard, reactor, disk) = setup(50);
        disk.write_at(0, &[1; 64]);
        disk.write_at(64, &[2; 64]);
        disk.hold();

        let order = Rc::new(RefCell::new(vec![]));
        for offset in [0, 64] {
            let buffer = shard.buffer_home().allocate(64);
            let r = reactor.clone();
            let o = order.clone();
            shard.scheduler().spawn(move |ctx| async move {
                let buffer = r.read(&ctx, -1, offset, buffer).await.unwrap();
                o.borrow_mut().push(buffer[0]);
            });
        }
        shard.scheduler().run_ready();
        assert_eq!(reactor.inflight(), 2);
        assert!(order.borrow().is_empty());

        assert_eq!(disk.release_reversed(), 2);
        assert_eq!(reactor.on_event(), 2);
        assert_eq!(reactor.inflight(), 0);
        assert!(order.borrow().is_empty());

        shard.scheduler().run_ready();
        assert_eq!(*order.borrow(), vec![2, 1]);
        assert_eq!(reactor.stats().wakeups, 1);
    }

    #[test_log::test]
    fn test_batches_cover_signalled_count() {
        let (shard, reactor, disk) = setup(2);
        disk.hold();

        let done = Rc::new(Cell::new(0));
        for i in 0..5u64 {
            let buffer = shard.buffer_home().copy_from_slice(&[i as u8; 16]);
            let d = done.clone();
            reactor
                .submit(IoOp::Write, -1, i * 16, buffer, move |_, res| {
                    res.unwrap();
                    d.set(d.get() + 1);
                })
                .unwrap();
        }
        disk.release();
        assert_eq!(reactor.on_event(), 5);
        assert_eq!(done.get(), 5);
        assert_eq!(disk.read_at(64, 16), vec![4; 16]);
        assert_eq!(reactor.on_event(), 0);
    }

    #[test_log::test]
    fn test_block_on_round_trip() {
        let (shard, reactor, _disk) = setup(50);
        let out = shard.buffer_home().copy_from_slice(b"larder page bytes");
        let into = shard.buffer_home().allocate(out.len());
        let r = reactor.clone();
        let read = shard.block_on(move |ctx| async move {
            r.write(&ctx, -1, 4096, out).await.unwrap();
            r.read(&ctx, -1, 4096, into).await.unwrap()
        });
        assert_eq!(&read[..], b"larder page bytes");
        assert_eq!(reactor.stats().completed, 2);
    }

    #[test_log::test]
    fn test_submission_failure_is_returned() {
        let (shard, reactor, disk) = setup(50);
        disk.fail_next_submit(libc::EAGAIN);
        let buffer = shard.buffer_home().allocate(8);
        let r = reactor.clone();
        let res = shard.block_on(move |ctx| async move { r.read(&ctx, -1, 0, buffer).await });
        assert!(matches!(res, Err(IoError::Io(e)) if e.raw_os_error() == Some(libc::EAGAIN)));
        assert_eq!(reactor.inflight(), 0);
        assert_eq!(reactor.stats().rejected, 1);
    }

    #[test_log::test]
    fn test_completion_errors() {
        let (shard, reactor, disk) = setup(50);
        let a = shard.buffer_home().allocate(8);
        let b = shard.buffer_home().allocate(8);
        let r = reactor.clone();
        let (ra, rb) = shard.block_on(move |ctx| async move {
            disk.fail_next_completion(libc::EIO);
            let ra = r.read(&ctx, -1, 0, a).await;
            disk.shorten_next_completion(5);
            let rb = r.read(&ctx, -1, 0, b).await;
            (ra, rb)
        });
        assert!(matches!(ra, Err(IoError::Io(e)) if e.raw_os_error() == Some(libc::EIO)));
        assert!(matches!(rb, Err(IoError::ShortTransfer { expected: 8, actual: 5 })));
        assert_eq!(reactor.stats().failed, 2);
    }

    #[test_log::test]
    #[should_panic(expected = "only 0 retrievable")]
    fn test_signal_count_mismatch_is_fatal() {
        let (_shard, reactor, disk) = setup(50);
        disk.signal_spurious(1);
        reactor.on_event();
    }
}
