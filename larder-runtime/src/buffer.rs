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
    cell::Cell,
    fmt::Debug,
    ops::Deref,
    ptr::NonNull,
    rc::Rc,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use allocator_api2::alloc::{handle_alloc_error, Allocator, Global, Layout};
use larder_common::{
    bits::{self, PAGE},
    fatal_assert,
};

/// Allocation and dispatch counters of a [`BufferHome`].
#[derive(Debug, Default)]
pub struct HomeStats {
    allocated: AtomicUsize,
    freed: AtomicUsize,
    dispatched: AtomicUsize,
}

impl HomeStats {
    /// Buffers allocated so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers deallocated so far.
    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }

    /// Buffers currently allocated.
    pub fn live(&self) -> usize {
        self.allocated() - self.freed()
    }

    /// Refcount changes that were dispatched from other threads.
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }
}

struct Inner {
    /// Only read or written on `home`.
    refs: Cell<usize>,
    home: ThreadId,
    mailbox: flume::Sender<Message>,
    /// Receiving end of the home mailbox, drained before the home side relies on `refs`.
    inbox: flume::Receiver<Message>,
    stats: Arc<HomeStats>,

    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
}

struct InnerPtr(NonNull<Inner>);

// Safety: the pointee is only mutated on its home thread, which is where messages are handled.
unsafe impl Send for InnerPtr {}

enum Message {
    Acquire(InnerPtr),
    Release(InnerPtr),
}

/// Reference-counted, page-aligned byte buffer with a fixed home thread.
///
/// The payload may be read from any thread holding a handle. The refcount is only touched on the
/// home thread: cloning or dropping a handle elsewhere sends the change to the home's
/// [`BufferHome`] mailbox instead. The buffer is freed on the home thread when the count reaches
/// zero.
pub struct SharedBuffer {
    inner: NonNull<Inner>,
}

// Safety: off-home operations never touch `refs`, they are dispatched to the home thread.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.inner().len)
            .field("home", &self.inner().home)
            .finish()
    }
}

impl SharedBuffer {
    fn alloc(
        home: ThreadId,
        mailbox: flume::Sender<Message>,
        inbox: flume::Receiver<Message>,
        stats: Arc<HomeStats>,
        len: usize,
    ) -> Self {
        let cap = bits::align_up(PAGE, len.max(1));
        let layout = Layout::from_size_align(cap, PAGE).unwrap_or_else(|_| panic!("invalid buffer size: {len}"));
        let ptr = match Global.allocate_zeroed(layout) {
            Ok(ptr) => ptr.cast::<u8>(),
            Err(_) => handle_alloc_error(layout),
        };
        stats.allocated.fetch_add(1, Ordering::Relaxed);

        let inner = Box::new(Inner {
            refs: Cell::new(1),
            home,
            mailbox,
            inbox,
            stats,
            ptr,
            len,
            cap,
        });
        Self {
            inner: NonNull::from(Box::leak(inner)),
        }
    }

    fn inner(&self) -> &Inner {
        unsafe { self.inner.as_ref() }
    }

    fn on_home(&self) -> bool {
        thread::current().id() == self.inner().home
    }

    fn assert_home(&self, op: &str) {
        fatal_assert!(
            self.on_home(),
            "shared buffer {op} on {:?}, home is {:?}",
            thread::current().id(),
            self.inner().home
        );
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> usize {
        self.inner().len
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The thread that owns the refcount.
    pub fn home(&self) -> ThreadId {
        self.inner().home
    }

    /// Apply the refcount changes other threads queued so far.
    fn settle(&self) {
        drain_mailbox(&self.inner().inbox);
    }

    /// Current refcount. Must be called on the home thread.
    ///
    /// Applies the changes dispatched from other threads first, so the count covers every handle
    /// created or dropped before the call.
    pub fn refcount(&self) -> usize {
        self.assert_home("refcount read");
        self.settle();
        self.inner().refs.get()
    }

    /// Returns `true` if this is the only handle. Must be called on the home thread.
    pub fn is_unique(&self) -> bool {
        self.refcount() == 1
    }

    /// Returns `true` if both handles point to the same allocation.
    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        self.inner == other.inner
    }

    /// Exchange what two handles point to, without refcount traffic.
    pub fn swap(&mut self, other: &mut SharedBuffer) {
        std::mem::swap(&mut self.inner, &mut other.inner);
    }

    /// Raw pointer and length of the payload, for handing to the kernel.
    pub fn as_raw_parts(&self) -> (*mut u8, usize) {
        (self.inner().ptr.as_ptr(), self.inner().len)
    }

    /// Mutable access to the payload if this is the only handle and we are on the home thread.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        if !self.on_home() {
            return None;
        }
        self.settle();
        if self.inner().refs.get() == 1 {
            Some(unsafe { from_raw_parts_mut(self.inner().ptr.as_ptr(), self.inner().len) })
        } else {
            None
        }
    }

    /// Mutable access to the payload, copying it into a fresh buffer first if it is shared.
    ///
    /// Must be called on the home thread. Every off-home clone queues its acquire before it
    /// exists, so once the mailbox is drained a refcount of one means no other handle exists.
    pub fn make_mut(&mut self) -> &mut [u8] {
        self.assert_home("make_mut");
        self.settle();
        if self.inner().refs.get() > 1 {
            let inner = self.inner();
            let copy = SharedBuffer::alloc(
                inner.home,
                inner.mailbox.clone(),
                inner.inbox.clone(),
                inner.stats.clone(),
                inner.len,
            );
            unsafe { std::ptr::copy_nonoverlapping(inner.ptr.as_ptr(), copy.inner().ptr.as_ptr(), inner.len) };
            *self = copy;
        }
        unsafe { from_raw_parts_mut(self.inner().ptr.as_ptr(), self.inner().len) }
    }

    fn dispatch(&self, message: Message) {
        let inner = self.inner();
        inner.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        if inner.mailbox.send(message).is_err() {
            tracing::warn!(home = ?inner.home, "[shared buffer]: mailbox closed, refcount change dropped");
        }
    }
}

unsafe fn acquire(inner: NonNull<Inner>) {
    let refs = &inner.as_ref().refs;
    refs.set(refs.get() + 1);
}

unsafe fn release(inner: NonNull<Inner>) {
    let mut refs = inner.as_ref().refs.get();
    if refs == 1 {
        // Clones made on other threads may still be queued. Their acquires precede any release of
        // theirs in the mailbox, so draining cannot free the buffer under this handle.
        drain_mailbox(&inner.as_ref().inbox);
        refs = inner.as_ref().refs.get();
    }
    fatal_assert!(refs > 0, "shared buffer refcount underflow");
    inner.as_ref().refs.set(refs - 1);
    if refs == 1 {
        let inner = Box::from_raw(inner.as_ptr());
        let layout = Layout::from_size_align_unchecked(inner.cap, PAGE);
        Global.deallocate(inner.ptr, layout);
        inner.stats.freed.fetch_add(1, Ordering::Relaxed);
    }
}

fn drain_mailbox(inbox: &flume::Receiver<Message>) -> usize {
    let mut applied = 0;
    while let Ok(message) = inbox.try_recv() {
        match message {
            Message::Acquire(InnerPtr(inner)) => unsafe { acquire(inner) },
            Message::Release(InnerPtr(inner)) => unsafe { release(inner) },
        }
        applied += 1;
    }
    applied
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        if self.on_home() {
            unsafe { acquire(self.inner) };
        } else {
            self.dispatch(Message::Acquire(InnerPtr(self.inner)));
        }
        Self { inner: self.inner }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if self.on_home() {
            unsafe { release(self.inner) };
        } else {
            self.dispatch(Message::Release(InnerPtr(self.inner)));
        }
    }
}

impl Deref for SharedBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { from_raw_parts(self.inner().ptr.as_ptr(), self.inner().len) }
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl Eq for SharedBuffer {}

/// Allocator and refcount mailbox for the [`SharedBuffer`]s homed on one thread.
///
/// The owning event loop calls [`BufferHome::drain`] to apply refcount changes dispatched from
/// other threads. Clones share the same mailbox and never leave the thread.
#[derive(Clone)]
pub struct BufferHome {
    inner: Rc<HomeInner>,
}

struct HomeInner {
    thread: ThreadId,
    tx: flume::Sender<Message>,
    rx: flume::Receiver<Message>,
    stats: Arc<HomeStats>,
}

impl Debug for BufferHome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHome")
            .field("thread", &self.inner.thread)
            .field("stats", &self.inner.stats)
            .finish()
    }
}

impl Default for BufferHome {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferHome {
    /// Create a buffer home bound to the current thread.
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            inner: Rc::new(HomeInner {
                thread: thread::current().id(),
                tx,
                rx,
                stats: Arc::default(),
            }),
        }
    }

    /// Allocate a zeroed buffer of `len` bytes homed on this thread.
    pub fn allocate(&self, len: usize) -> SharedBuffer {
        self.inner.assert_home();
        SharedBuffer::alloc(
            self.inner.thread,
            self.inner.tx.clone(),
            self.inner.rx.clone(),
            self.inner.stats.clone(),
            len,
        )
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn copy_from_slice(&self, data: &[u8]) -> SharedBuffer {
        let mut buffer = self.allocate(data.len());
        buffer.make_mut().copy_from_slice(data);
        buffer
    }

    /// Apply all refcount changes dispatched from other threads. Returns the number applied.
    pub fn drain(&self) -> usize {
        self.inner.drain()
    }

    /// Allocation counters.
    pub fn stats(&self) -> &Arc<HomeStats> {
        &self.inner.stats
    }
}

impl HomeInner {
    fn drain(&self) -> usize {
        self.assert_home();
        let applied = drain_mailbox(&self.rx);
        if applied > 0 {
            tracing::trace!(applied, "[buffer home]: drained dispatched refcount changes");
        }
        applied
    }

    fn assert_home(&self) {
        fatal_assert!(
            thread::current().id() == self.thread,
            "buffer home of {:?} used from {:?}",
            self.thread,
            thread::current().id()
        );
    }
}

impl Drop for HomeInner {
    fn drop(&mut self) {
        if thread::current().id() == self.thread {
            self.drain();
        }
        if self.stats.live() > 0 {
            tracing::debug!(live = self.stats.live(), "[buffer home]: dropped with live buffers");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use itertools::Itertools;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;

    fn is_send_sync<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync() {
        is_send_sync::<SharedBuffer>();
    }

    #[test_log::test]
    fn test_home_refcount() {
        let home = BufferHome::new();
        let a = home.copy_from_slice(b"hello");
        assert_eq!(a.refcount(), 1);
        assert_eq!(&a[..], b"hello");
        assert_eq!(a.as_raw_parts().0 as usize % PAGE, 0);

        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        assert!(a.ptr_eq(&b));

        drop(b);
        assert_eq!(a.refcount(), 1);
        assert_eq!(home.stats().live(), 1);

        drop(a);
        assert_eq!(home.stats().live(), 0);
        assert_eq!(home.stats().freed(), 1);
    }

    #[test_log::test]
    fn test_swap_has_no_refcount_traffic() {
        let home = BufferHome::new();
        let mut a = home.copy_from_slice(b"aaaa");
        let a2 = a.clone();
        let mut b = home.copy_from_slice(b"bb");

        a.swap(&mut b);
        assert_eq!(&a[..], b"bb");
        assert_eq!(&b[..], b"aaaa");
        assert_eq!(a.refcount(), 1);
        assert_eq!(b.refcount(), 2);
        assert!(b.ptr_eq(&a2));
    }

    #[test_log::test]
    fn test_make_mut_copies_when_shared() {
        let home = BufferHome::new();
        let mut a = home.copy_from_slice(&[1, 2, 3, 4]);
        let snapshot = a.clone();

        a.make_mut()[0] = 9;
        assert_eq!(&a[..], &[9, 2, 3, 4]);
        assert_eq!(&snapshot[..], &[1, 2, 3, 4]);
        assert!(!a.ptr_eq(&snapshot));
        assert_eq!(home.stats().live(), 2);

        drop(snapshot);
        let ptr = a.as_raw_parts().0;
        a.make_mut()[1] = 8;
        assert_eq!(a.as_raw_parts().0, ptr);
        assert_eq!(&a[..], &[9, 8, 3, 4]);
        assert!(a.get_mut().is_some());
    }

    #[test_log::test]
    fn test_off_home_changes_are_dispatched() {
        let home = BufferHome::new();
        let a = home.copy_from_slice(b"payload");
        let b = a.clone();

        let handle = std::thread::spawn(move || {
            assert_eq!(&b[..], b"payload");
            let c = b.clone();
            let d = c.clone();
            drop(c);
            (b, d)
        });
        let (b, d) = handle.join().unwrap();

        // Two clones and one drop were dispatched. Reading the count applies them.
        assert_eq!(home.stats().dispatched(), 3);
        assert_eq!(a.refcount(), 3);
        assert_eq!(home.drain(), 0);

        drop(b);
        drop(d);
        assert_eq!(a.refcount(), 1);
    }

    #[test_log::test]
    fn test_home_release_counts_queued_remote_clones() {
        let home = BufferHome::new();
        let mut a = home.copy_from_slice(&[1, 2, 3, 4]);
        let b = a.clone();
        let (b, c) = std::thread::spawn(move || {
            let c = b.clone();
            (b, c)
        })
        .join()
        .unwrap();

        // The acquire of `c` is still queued when `b` is dropped here.
        drop(b);
        assert_eq!(a.refcount(), 2);
        assert!(!a.is_unique());

        a.make_mut()[0] = 9;
        assert_eq!(&a[..], &[9, 2, 3, 4]);
        assert_eq!(&c[..], &[1, 2, 3, 4]);
        assert!(!a.ptr_eq(&c));

        drop(c);
        assert_eq!(home.stats().live(), 1);
        assert_eq!(home.drain(), 0);
    }

    #[test_log::test]
    fn test_last_home_release_waits_for_queued_remote_clones() {
        let home = BufferHome::new();
        let a = home.copy_from_slice(b"data");
        let (a, c) = std::thread::spawn(move || {
            let c = a.clone();
            (a, c)
        })
        .join()
        .unwrap();

        // `a` is the only counted handle, but `c` is live.
        drop(a);
        assert_eq!(home.stats().live(), 1);
        assert_eq!(&c[..], b"data");
        assert_eq!(c.refcount(), 1);

        drop(c);
        assert_eq!(home.stats().freed(), 1);
        assert_eq!(home.stats().live(), 0);
        assert_eq!(home.drain(), 0);
    }

    #[test_log::test]
    fn test_last_release_off_home_frees_on_home() {
        let home = BufferHome::new();
        let a = home.allocate(8192);

        std::thread::spawn(move || drop(a)).join().unwrap();
        assert_eq!(home.stats().live(), 1);

        home.drain();
        assert_eq!(home.stats().live(), 0);
        assert_eq!(home.stats().freed(), 1);
    }

    #[test_log::test]
    fn test_interleaved_cross_thread_refcount() {
        const THREADS: usize = 4;
        const OPS: usize = 1000;

        let home = BufferHome::new();
        let root = home.allocate(64);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|t| {
                let mut held = vec![root.clone()];
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(t as u64);
                    barrier.wait();
                    for _ in 0..OPS {
                        if held.len() > 1 && rng.random_bool(0.5) {
                            let i = rng.random_range(0..held.len());
                            held.swap_remove(i);
                        } else {
                            let i = rng.random_range(0..held.len());
                            let copy = held[i].clone();
                            held.push(copy);
                        }
                    }
                    held
                })
            })
            .collect_vec();

        // Interleave home-side traffic with the remote threads.
        for _ in 0..OPS {
            let copy = root.clone();
            home.drain();
            drop(copy);
        }

        let survivors = handles.into_iter().flat_map(|h| h.join().unwrap()).collect_vec();
        home.drain();
        assert_eq!(root.refcount(), survivors.len() + 1);
        assert_eq!(home.stats().live(), 1);

        drop(survivors);
        assert_eq!(root.refcount(), 1);
        drop(root);
        assert_eq!(home.stats().freed(), 1);
        assert_eq!(home.stats().live(), 0);
    }
}
