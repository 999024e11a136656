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
    collections::VecDeque,
    fmt::Debug,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    backend::AioBackend,
    error::{IoError, IoResult},
    request::{Completion, IoHandle, IoOp, IoRequest, NotifyTarget},
};

/// Memory backend targets are negative so they never collide with real descriptors.
static NEXT_TARGET: AtomicI32 = AtomicI32::new(-1);

#[derive(Default)]
struct DiskState {
    data: Vec<u8>,
    held: VecDeque<IoRequest>,
    completed: VecDeque<Completion>,
    signaled: u64,
    hold: bool,
    fail_submit: Option<i32>,
    fail_completion: Option<i32>,
    short_completion: Option<usize>,
    submitted: u64,
}

impl DiskState {
    fn execute(&mut self, request: IoRequest) {
        let result = if let Some(errno) = self.fail_completion.take() {
            -(errno as i64)
        } else {
            let len = match self.short_completion.take() {
                Some(short) => short.min(request.len),
                None => request.len,
            };
            let offset = request.offset as usize;
            if self.data.len() < offset + len {
                self.data.resize(offset + len, 0);
            }
            // Safety: the reactor keeps the request buffer alive and unaliased until completion.
            unsafe {
                match request.op {
                    IoOp::Read => {
                        std::ptr::copy_nonoverlapping(self.data[offset..].as_ptr(), request.ptr, len);
                    }
                    IoOp::Write => {
                        std::ptr::copy_nonoverlapping(request.ptr, self.data[offset..].as_mut_ptr(), len);
                    }
                }
            }
            len as i64
        };
        self.completed.push_back(Completion {
            handle: request.handle,
            result,
        });
        self.signaled += 1;
    }
}

struct DiskShared {
    target: NotifyTarget,
    state: Mutex<DiskState>,
    readable: Condvar,
}

/// Control handle of the simulated disk behind a [`MemoryBackend`].
///
/// Cloneable and usable from any thread. By default requests complete at submission. While
/// holding, requests queue up until released, in submission order or reversed.
#[derive(Clone)]
pub struct MemoryDisk {
    shared: Arc<DiskShared>,
}

impl Debug for MemoryDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryDisk")
            .field("target", &self.shared.target)
            .field("len", &state.data.len())
            .field("held", &state.held.len())
            .field("completed", &state.completed.len())
            .field("signaled", &state.signaled)
            .finish()
    }
}

impl MemoryDisk {
    /// Stop completing requests at submission.
    pub fn hold(&self) {
        self.shared.state.lock().hold = true;
    }

    /// Number of held requests.
    pub fn held(&self) -> usize {
        self.shared.state.lock().held.len()
    }

    /// Number of accepted submissions.
    pub fn submitted(&self) -> u64 {
        self.shared.state.lock().submitted
    }

    /// Complete all held requests in submission order and stop holding.
    pub fn release(&self) -> usize {
        self.release_with(false)
    }

    /// Complete all held requests in reverse submission order and stop holding.
    pub fn release_reversed(&self) -> usize {
        self.release_with(true)
    }

    fn release_with(&self, reversed: bool) -> usize {
        let mut state = self.shared.state.lock();
        state.hold = false;
        let mut held = std::mem::take(&mut state.held);
        if reversed {
            held.make_contiguous().reverse();
        }
        let released = held.len();
        for request in held {
            state.execute(request);
        }
        drop(state);
        self.shared.readable.notify_all();
        released
    }

    /// Fail the next submission with `errno`.
    pub fn fail_next_submit(&self, errno: i32) {
        self.shared.state.lock().fail_submit = Some(errno);
    }

    /// Complete the next executed request with `-errno`.
    pub fn fail_next_completion(&self, errno: i32) {
        self.shared.state.lock().fail_completion = Some(errno);
    }

    /// Transfer at most `len` bytes for the next executed request.
    pub fn shorten_next_completion(&self, len: usize) {
        self.shared.state.lock().short_completion = Some(len);
    }

    /// Signal `count` completions that do not exist.
    pub fn signal_spurious(&self, count: u64) {
        self.shared.state.lock().signaled += count;
        self.shared.readable.notify_all();
    }

    /// Copy of `len` bytes at `offset`. Unwritten bytes read as zero.
    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.shared.state.lock();
        let offset = offset as usize;
        (offset..offset + len).map(|i| state.data.get(i).copied().unwrap_or(0)).collect()
    }

    /// Overwrite bytes at `offset` directly, bypassing the I/O path.
    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let mut state = self.shared.state.lock();
        let offset = offset as usize;
        if state.data.len() < offset + data.len() {
            state.data.resize(offset + data.len(), 0);
        }
        state.data[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// [`AioBackend`] over a simulated disk, steered through its [`MemoryDisk`].
#[derive(Debug)]
pub struct MemoryBackend {
    disk: MemoryDisk,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend with an empty disk.
    pub fn new() -> Self {
        let shared = DiskShared {
            target: NotifyTarget(NEXT_TARGET.fetch_sub(1, Ordering::Relaxed)),
            state: Mutex::new(DiskState::default()),
            readable: Condvar::new(),
        };
        Self {
            disk: MemoryDisk {
                shared: Arc::new(shared),
            },
        }
    }

    /// Control handle of the disk.
    pub fn disk(&self) -> MemoryDisk {
        self.disk.clone()
    }

    /// Handle of the oldest completion not yet retrieved, if any.
    pub fn peek_completed(&self) -> Option<IoHandle> {
        self.disk.shared.state.lock().completed.front().map(|c| c.handle)
    }
}

impl AioBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn notify_target(&self) -> NotifyTarget {
        self.disk.shared.target
    }

    fn submit(&mut self, request: IoRequest) -> IoResult<()> {
        if request.notify != Some(self.notify_target()) {
            return Err(IoError::other(format!("{} was not prepared for this backend", request.handle)));
        }
        let mut state = self.disk.shared.state.lock();
        if let Some(errno) = state.fail_submit.take() {
            return Err(IoError::from_raw_os_error(errno));
        }
        state.submitted += 1;
        if state.hold {
            state.held.push_back(request);
        } else {
            state.execute(request);
        }
        Ok(())
    }

    fn signaled(&mut self) -> IoResult<u64> {
        Ok(std::mem::take(&mut self.disk.shared.state.lock().signaled))
    }

    fn get_events(&mut self, max: usize, out: &mut Vec<Completion>) -> IoResult<usize> {
        let mut state = self.disk.shared.state.lock();
        let n = max.min(state.completed.len());
        out.extend(state.completed.drain(..n));
        Ok(n)
    }

    fn wait_readable(&mut self, timeout: Duration) -> IoResult<bool> {
        let mut state = self.disk.shared.state.lock();
        if state.signaled == 0 {
            self.disk.shared.readable.wait_for(&mut state, timeout);
        }
        Ok(state.signaled > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(backend: &MemoryBackend, handle: u64, op: IoOp, offset: u64, buf: &mut [u8]) -> IoRequest {
        IoRequest {
            handle: IoHandle::from_raw(handle),
            op,
            fd: -1,
            offset,
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            notify: Some(backend.notify_target()),
        }
    }

    #[test_log::test]
    fn test_write_then_read() {
        let mut backend = MemoryBackend::new();
        let disk = backend.disk();

        let mut w = vec![3u8; 16];
        backend.submit(request(&backend, 1, IoOp::Write, 8, &mut w)).unwrap();
        let mut r = vec![0u8; 16];
        backend.submit(request(&backend, 2, IoOp::Read, 8, &mut r)).unwrap();

        assert_eq!(backend.signaled().unwrap(), 2);
        let mut out = vec![];
        assert_eq!(backend.get_events(50, &mut out).unwrap(), 2);
        assert_eq!(out[0], Completion { handle: IoHandle::from_raw(1), result: 16 });
        assert_eq!(r, w);
        assert_eq!(disk.read_at(0, 8), vec![0; 8]);
        assert_eq!(disk.submitted(), 2);
    }

    #[test_log::test]
    fn test_hold_and_reverse_release() {
        let mut backend = MemoryBackend::new();
        let disk = backend.disk();
        disk.hold();

        let mut a = vec![0u8; 4];
        let mut b = vec![0u8; 4];
        backend.submit(request(&backend, 1, IoOp::Read, 0, &mut a)).unwrap();
        backend.submit(request(&backend, 2, IoOp::Read, 4, &mut b)).unwrap();
        assert_eq!(backend.signaled().unwrap(), 0);
        assert!(!backend.wait_readable(Duration::from_millis(1)).unwrap());
        assert_eq!(disk.held(), 2);

        assert_eq!(disk.release_reversed(), 2);
        assert!(backend.wait_readable(Duration::ZERO).unwrap());
        assert_eq!(backend.peek_completed(), Some(IoHandle::from_raw(2)));
        assert_eq!(backend.signaled().unwrap(), 2);
    }

    #[test_log::test]
    fn test_injected_failures() {
        let mut backend = MemoryBackend::new();
        let disk = backend.disk();

        let mut buf = vec![0u8; 8];
        disk.fail_next_submit(libc::EAGAIN);
        assert!(backend.submit(request(&backend, 1, IoOp::Read, 0, &mut buf)).is_err());
        assert_eq!(backend.signaled().unwrap(), 0);

        disk.fail_next_completion(libc::EIO);
        backend.submit(request(&backend, 2, IoOp::Read, 0, &mut buf)).unwrap();
        disk.shorten_next_completion(3);
        backend.submit(request(&backend, 3, IoOp::Read, 0, &mut buf)).unwrap();

        let mut out = vec![];
        assert_eq!(backend.get_events(50, &mut out).unwrap(), 2);
        assert_eq!(out[0].result, -(libc::EIO as i64));
        assert_eq!(out[1].result, 3);
    }

    #[test_log::test]
    fn test_unprepared_request_is_rejected() {
        let mut backend = MemoryBackend::new();
        let other = MemoryBackend::new();
        let mut buf = vec![0u8; 8];
        let req = request(&other, 1, IoOp::Read, 0, &mut buf);
        assert!(backend.submit(req).is_err());
    }
}
