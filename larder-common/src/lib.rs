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

//! Shared components for the larder workspace.

/// Fatal and strict assertion macros.
pub mod assert;
/// Bit and alignment helpers.
pub mod bits;
/// Error type shared by all larder crates.
pub mod error;

/// Block id of a disk page.
pub type BlockId = u64;

#[doc(hidden)]
pub use tracing as __tracing;
