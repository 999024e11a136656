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

use larder_common::error::{Error, ErrorKind};

/// Outcome of a failed I/O submission or completion.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Std I/O error.
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// The kernel transferred fewer bytes than requested.
    #[error("short transfer: expected {expected} bytes, transferred {actual}")]
    ShortTransfer {
        /// Requested bytes.
        expected: usize,
        /// Transferred bytes.
        actual: usize,
    },
    /// Other I/O error.
    #[error("other I/O error: {0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl IoError {
    /// Convert a raw OS error code (positive errno) to an I/O error.
    pub fn from_raw_os_error(raw: i32) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(raw))
    }

    /// Wrap a customized error.
    pub fn other<E>(e: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self::Other(e.into())
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::new(ErrorKind::Io, "disk I/O failed").with_source(e)
    }
}

/// Result type for I/O operations.
pub type IoResult<T> = std::result::Result<T, IoError>;
