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

use std::{fmt::Debug, time::Duration};

use crate::{
    error::IoResult,
    request::{Completion, IoRequest, NotifyTarget},
};

/// Simulated disk for tests and benchmarks.
pub mod memory;
/// io_uring based backend.
#[cfg(target_os = "linux")]
pub mod uring;

/// OS async-I/O completion primitive.
///
/// A backend exposes a pollable notification target, accepts requests that were prepared for that
/// target, reports how many completions have been signalled, and hands them out in bounded
/// batches. All calls happen on the reactor's thread.
pub trait AioBackend: Debug {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// The target completions are signalled to.
    fn notify_target(&self) -> NotifyTarget;

    /// Submit a prepared request.
    ///
    /// On error the request was not accepted and no completion will be signalled for it.
    fn submit(&mut self, request: IoRequest) -> IoResult<()>;

    /// Number of completions signalled since the last call. Never blocks.
    fn signaled(&mut self) -> IoResult<u64>;

    /// Append up to `max` completions to `out`, returning how many were appended. Never blocks.
    fn get_events(&mut self, max: usize, out: &mut Vec<Completion>) -> IoResult<usize>;

    /// Block up to `timeout` until the notification target is readable.
    fn wait_readable(&mut self, timeout: Duration) -> IoResult<bool>;
}
