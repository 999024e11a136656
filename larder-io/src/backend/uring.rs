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
    fmt::Debug,
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use io_uring::{opcode, types::Fd, IoUring};
use larder_common::{fatal, fatal_assert};

use crate::{
    backend::AioBackend,
    error::{IoError, IoResult},
    request::{Completion, IoHandle, IoOp, IoRequest, NotifyTarget},
};

/// io_uring based backend.
///
/// The ring fd is the notification target: it polls readable while the completion queue holds
/// entries. Completions are only consumed by [`AioBackend::get_events`], so the queue length read
/// by [`AioBackend::signaled`] is exactly what the next retrievals will return.
pub struct UringBackend {
    ring: IoUring,
    /// Completions already reported by `signaled()` but not yet retrieved.
    reported: u64,
    /// Entries pushed to the submission queue that the kernel has not taken yet.
    unsubmitted: bool,
}

impl Debug for UringBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringBackend")
            .field("fd", &self.ring.as_raw_fd())
            .field("reported", &self.reported)
            .field("unsubmitted", &self.unsubmitted)
            .finish()
    }
}

impl AioBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn notify_target(&self) -> NotifyTarget {
        NotifyTarget(self.ring.as_raw_fd())
    }

    fn submit(&mut self, request: IoRequest) -> IoResult<()> {
        fatal_assert!(
            request.notify == Some(self.notify_target()),
            "{} was not prepared for this ring",
            request.handle
        );
        let len = u32::try_from(request.len).map_err(IoError::other)?;
        let fd = Fd(request.fd);
        let sqe = match request.op {
            IoOp::Read => opcode::Read::new(fd, request.ptr, len).offset(request.offset).build(),
            IoOp::Write => opcode::Write::new(fd, request.ptr, len).offset(request.offset).build(),
        }
        .user_data(request.handle.raw());

        // Safety: the reactor keeps the buffer alive until the completion is delivered.
        unsafe { self.ring.submission().push(&sqe) }.map_err(IoError::other)?;
        // Once pushed, the entry reaches the kernel with some later submit, so it is accepted.
        self.flush_submissions();
        Ok(())
    }

    fn signaled(&mut self) -> IoResult<u64> {
        let available = self.ring.completion().len() as u64;
        let fresh = available.saturating_sub(self.reported);
        self.reported = available;
        Ok(fresh)
    }

    fn get_events(&mut self, max: usize, out: &mut Vec<Completion>) -> IoResult<usize> {
        let before = out.len();
        out.extend(self.ring.completion().take(max).map(|cqe| Completion {
            handle: IoHandle::from_raw(cqe.user_data()),
            result: cqe.result() as i64,
        }));
        let retrieved = out.len() - before;
        self.reported = self.reported.saturating_sub(retrieved as u64);
        Ok(retrieved)
    }

    fn wait_readable(&mut self, timeout: Duration) -> IoResult<bool> {
        if self.unsubmitted {
            self.flush_submissions();
        }
        poll_readable(self.ring.as_raw_fd(), timeout)
    }
}

impl UringBackend {
    /// Hand queued entries to the kernel. Transient failures leave them queued for the next call.
    fn flush_submissions(&mut self) {
        let res = self.ring.submit();
        self.unsubmitted = submission_deferred(res);
    }
}

/// Returns `true` if the entries stay queued after a failed `io_uring_enter`.
///
/// Pushed entries cannot be withdrawn, so any failure other than a transient one is fatal.
fn submission_deferred(res: std::io::Result<usize>) -> bool {
    match res {
        Ok(_) => false,
        Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN | libc::EBUSY | libc::EINTR)) => {
            tracing::debug!(?e, "[uring]: submission deferred");
            true
        }
        Err(e) => fatal!("[uring]: failed to submit queued entries: {e}"),
    }
}

fn poll_readable(fd: RawFd, timeout: Duration) -> IoResult<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // Safety: `pfd` is a valid pollfd for the duration of the call.
    let res = unsafe { libc::poll(&mut pfd, 1, millis) };
    if res < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err.into());
    }
    Ok(res > 0 && pfd.revents & libc::POLLIN != 0)
}

/// Builder for [`UringBackend`].
#[derive(Debug)]
pub struct UringBackendBuilder {
    queue_depth: u32,
}

impl Default for UringBackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UringBackendBuilder {
    /// Create a builder with default configurations.
    pub fn new() -> Self {
        Self { queue_depth: 64 }
    }

    /// Set the submission queue depth.
    ///
    /// The completion queue is twice as deep, as set up by the kernel.
    ///
    /// Default: `64`.
    pub fn with_queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Create the ring.
    pub fn build(self) -> IoResult<UringBackend> {
        if self.queue_depth == 0 {
            return Err(IoError::other("io_uring queue depth must be greater than 0"));
        }
        let ring = IoUring::new(self.queue_depth)?;
        tracing::debug!(fd = ring.as_raw_fd(), depth = self.queue_depth, "[uring]: ring created");
        Ok(UringBackend {
            ring,
            reported: 0,
            unsubmitted: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, io::Write, os::fd::AsRawFd};

    use super::*;

    fn ring() -> Option<UringBackend> {
        match UringBackendBuilder::new().with_queue_depth(8).build() {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::warn!(?e, "[test]: io_uring unavailable, skip");
                None
            }
        }
    }

    #[test_log::test]
    fn test_transient_submit_failure_keeps_entries_queued() {
        assert!(!submission_deferred(Ok(2)));
        for errno in [libc::EAGAIN, libc::EBUSY, libc::EINTR] {
            assert!(submission_deferred(Err(std::io::Error::from_raw_os_error(errno))));
        }
    }

    #[test_log::test]
    #[should_panic(expected = "failed to submit queued entries")]
    fn test_hard_submit_failure_is_fatal() {
        submission_deferred(Err(std::io::Error::from_raw_os_error(libc::EBADF)));
    }

    #[test_log::test]
    fn test_uring_read_reports_count() {
        let Some(mut backend) = ring() else { return };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut file = OpenOptions::new().create(true).truncate(true).read(true).write(true).open(&path).unwrap();
        file.write_all(&[7u8; 128]).unwrap();
        file.sync_all().unwrap();

        let target = backend.notify_target();
        let mut bufs = [vec![0u8; 64], vec![0u8; 64]];
        for (i, buf) in bufs.iter_mut().enumerate() {
            backend
                .submit(IoRequest {
                    handle: IoHandle::from_raw(i as u64 + 1),
                    op: IoOp::Read,
                    fd: file.as_raw_fd(),
                    offset: i as u64 * 64,
                    ptr: buf.as_mut_ptr(),
                    len: buf.len(),
                    notify: Some(target),
                })
                .unwrap();
        }

        let mut signaled = 0;
        while signaled < 2 {
            backend.wait_readable(Duration::from_millis(100)).unwrap();
            signaled += backend.signaled().unwrap();
        }
        assert_eq!(signaled, 2);

        let mut out = vec![];
        assert_eq!(backend.get_events(1, &mut out).unwrap(), 1);
        assert_eq!(backend.get_events(8, &mut out).unwrap(), 1);
        assert_eq!(backend.signaled().unwrap(), 0);

        let mut handles = out.iter().map(|c| c.handle.raw()).collect::<Vec<_>>();
        handles.sort();
        assert_eq!(handles, vec![1, 2]);
        assert!(out.iter().all(|c| c.result == 64));
        assert!(bufs.iter().all(|b| b.iter().all(|&v| v == 7)));
    }
}
