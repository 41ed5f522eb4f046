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

//! Readiness bits delivered to reactor handlers

use mio::event::Event;

/// The set of conditions a descriptor reported ready in one dispatch.
///
/// Handed to every handler so it can tell plain readability apart from a
/// peer hangup without consulting the poller itself.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    readable: bool,
    writable: bool,
    read_closed: bool,
    error: bool,
}

impl Ready {
    pub(crate) fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }

    /// The descriptor has bytes to read (or a pending accept).
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// The descriptor can accept writes without blocking.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The peer shut down its write half; no further data will arrive.
    #[inline]
    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    /// The descriptor is in an error state.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.error
    }
}
