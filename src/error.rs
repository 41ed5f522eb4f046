// Copyright 2022 Ryan Seipp
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

//! Crate-wide error type

use std::io;

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The failures this crate surfaces to callers.
///
/// Transient OS conditions (`EAGAIN`/`EWOULDBLOCK`, `EINTR`) and peer resets
/// never appear here; the core retries them, ignores them, or routes them to
/// the close path internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Registering or deregistering a descriptor with the OS demultiplexer
    /// failed for a reason other than an already-closed or unknown
    /// descriptor, or the poller itself failed.
    #[error("reactor I/O failure")]
    ReactorIo(#[source] io::Error),

    /// Creating, binding, or listening on the server socket failed. No
    /// server exists after this error.
    #[error("failed to bind listener")]
    Bind(#[source] io::Error),

    /// The connection factory failed while the pool was growing. The pool's
    /// state is unchanged.
    #[error("connection factory failed")]
    ConnCreate(#[source] io::Error),

    /// The system allocator refused a chunk request.
    #[error("memory pool could not allocate a chunk")]
    OutOfMemory,

    /// `run()` was called while the reactor's dispatch loop was already
    /// executing.
    #[error("reactor is already running")]
    AlreadyRunning,
}
