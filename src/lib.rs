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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! reaktor is the reactive I/O core of a small networking toolkit: a
//! single-threaded readiness-based event demultiplexer driving a non-blocking
//! TCP server, plus the resource managers the server leans on.
//!
//! The pieces compose but stand alone:
//!
//! * [`reactor::Reactor`]: maps descriptors to readiness handlers and runs
//!   the dispatch loop on one thread.
//! * [`server::TcpServer`]: non-blocking accept/read/close lifecycle on top
//!   of the reactor, surfaced through three optional callbacks.
//! * [`pool::ConnectionPool`]: bounded, blocking pool of reusable
//!   connections with lazy construction up to a fixed capacity.
//! * [`mempool::MemoryPool`]: O(1) fixed-block allocator over pre-sliced
//!   chunks.
//! * [`logging::AsyncLog`]: double-buffered log sink with a dedicated
//!   writer thread, so hot paths never block on file I/O.
//!
//! ## Examples
//!
//! A runnable echo server lives in the `demos` directory of the source tree.

pub mod error;
pub mod logging;
pub mod mempool;
pub mod pool;
pub mod reactor;
pub mod ready;
pub mod server;

pub use error::{Error, Result};
pub use mio::Interest;
