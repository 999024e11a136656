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

//! Cooperative, single-threaded-per-shard runtime for larder.
//!
//! Each OS thread ("shard") runs one [`Scheduler`]. Coroutines are futures that only yield at
//! explicit suspension points ([`CoroContext::wait`], [`Task::join`], I/O wrappers) and are
//! resumed by exactly one [`Coroutine::notify`] per wait. The [`Shard`] event loop drives the
//! scheduler, its timers, the [`BufferHome`] mailbox and registered [`EventSource`]s.

mod buffer;
mod coroutine;
mod scheduler;
mod shard;
mod task;

pub use buffer::{BufferHome, HomeStats, SharedBuffer};
pub use coroutine::{CoroContext, Coroutine, CoroutineId, CoroutineStatus, Suicide, Wait};
pub use scheduler::Scheduler;
pub use shard::{EventSource, Shard};
pub use task::Task;
