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

//! Single-threaded readiness-based event demultiplexer
//!
//! The [`Reactor`] owns one OS poller and a registry mapping raw descriptors
//! to handler callbacks. [`Reactor::run`] blocks the calling thread in the
//! dispatch loop; every handler executes on that thread. The registry is not
//! thread-safe, so cross-thread signaling goes through a [`StopHandle`] or a
//! pipe descriptor registered like any other handler.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    io::ErrorKind,
    os::unix::io::RawFd,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use mio::{unix::SourceFd, Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::warn;

use crate::{
    error::{Error, Result},
    ready::Ready,
};

/// Upper bound on ready descriptors drained per poll.
const MAX_EVENTS: usize = 10;

const WAKE_TOKEN: Token = Token(usize::MAX);

type Handler = Box<dyn FnMut(&Reactor, Ready)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopping,
}

/// Readiness-based event demultiplexer.
///
/// Handlers receive the [`Reactor`] itself along with the ready bits, so a
/// handler may mutate the registry freely without capturing the reactor,
/// including removing its own descriptor. Registrations made from inside a
/// handler are visible to the OS on the next poll.
pub struct Reactor {
    poll: RefCell<Poll>,
    registry: Registry,
    handlers: RefCell<Slab<Rc<RefCell<Handler>>>>,
    by_fd: RefCell<HashMap<RawFd, usize>>,
    state: Cell<State>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Reactor {
    /// Creates an idle reactor with an empty registry.
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(Error::ReactorIo)?;
        let registry = poll.registry().try_clone().map_err(Error::ReactorIo)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(Error::ReactorIo)?;

        Ok(Self {
            poll: RefCell::new(poll),
            registry,
            handlers: RefCell::new(Slab::new()),
            by_fd: RefCell::new(HashMap::new()),
            state: Cell::new(State::Idle),
            stop: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
        })
    }

    /// Registers `fd` with the poller and installs `handler` for it.
    ///
    /// Registering a descriptor that is already present replaces its
    /// interests and handler. Peer-hangup reporting comes along with
    /// [`Interest::READABLE`]; delivered events expose it through
    /// [`Ready::is_read_closed`].
    pub fn add_handler<F>(&self, fd: RawFd, interest: Interest, handler: F) -> Result<()>
    where
        F: FnMut(&Reactor, Ready) + 'static,
    {
        let handler: Rc<RefCell<Handler>> = Rc::new(RefCell::new(Box::new(handler)));
        let mut by_fd = self.by_fd.borrow_mut();
        let mut handlers = self.handlers.borrow_mut();

        if let Some(&key) = by_fd.get(&fd) {
            self.registry
                .reregister(&mut SourceFd(&fd), Token(key), interest)
                .map_err(Error::ReactorIo)?;
            handlers[key] = handler;
        } else {
            let entry = handlers.vacant_entry();
            let key = entry.key();
            self.registry
                .register(&mut SourceFd(&fd), Token(key), interest)
                .map_err(Error::ReactorIo)?;
            entry.insert(handler);
            by_fd.insert(fd, key);
        }

        Ok(())
    }

    /// Deregisters `fd` and drops its handler.
    ///
    /// Idempotent: removing a descriptor that was never registered is a
    /// no-op. A descriptor the OS already considers closed is silently
    /// dropped from the registry; one the poller claims not to know logs a
    /// warning and is dropped from the registry anyway. Any other poller
    /// error leaves the registry untouched and surfaces
    /// [`Error::ReactorIo`].
    pub fn remove_handler(&self, fd: RawFd) -> Result<()> {
        let key = match self.by_fd.borrow().get(&fd) {
            Some(&key) => key,
            None => return Ok(()),
        };

        match self.registry.deregister(&mut SourceFd(&fd)) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EBADF) => {
                // descriptor already closed; only the registry entry is left
            }
            Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => {
                warn!(fd, "descriptor missing from poller during deregistration");
            }
            Err(e) => return Err(Error::ReactorIo(e)),
        }

        self.by_fd.borrow_mut().remove(&fd);
        self.handlers.borrow_mut().try_remove(key);
        Ok(())
    }

    /// Number of descriptors currently registered.
    pub fn handler_count(&self) -> usize {
        self.by_fd.borrow().len()
    }

    /// Runs the dispatch loop until [`stop`](Self::stop) is observed.
    ///
    /// Blocks the calling thread. Only one thread may run the loop at a
    /// time; a nested or concurrent call fails with
    /// [`Error::AlreadyRunning`].
    pub fn run(&self) -> Result<()> {
        if self.state.get() != State::Idle {
            return Err(Error::AlreadyRunning);
        }
        self.state.set(State::Running);
        self.stop.store(false, Ordering::Release);

        let mut events = Events::with_capacity(MAX_EVENTS);
        let result = self.dispatch(&mut events);

        self.state.set(State::Idle);
        self.stop.store(false, Ordering::Release);
        result
    }

    fn dispatch(&self, events: &mut Events) -> Result<()> {
        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.borrow_mut().poll(events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::ReactorIo(e));
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }

                // Clone the handler out so a callback that removes its own
                // registration stays alive for the rest of its invocation.
                let handler = self
                    .handlers
                    .borrow()
                    .get(event.token().0)
                    .map(Rc::clone);

                if let Some(handler) = handler {
                    let mut handler = handler.borrow_mut();
                    (*handler)(self, Ready::from_event(event));
                }
            }
        }

        Ok(())
    }

    /// Requests the dispatch loop to exit at the next iteration boundary.
    ///
    /// Safe to call from inside a handler. Calling it any number of times
    /// before `run` returns causes exactly one exit. From another thread,
    /// use a [`StopHandle`] instead.
    pub fn stop(&self) {
        if self.state.get() == State::Running {
            self.state.set(State::Stopping);
        }
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Whether the dispatch loop is currently executing.
    pub fn is_running(&self) -> bool {
        self.state.get() != State::Idle
    }

    /// A clonable, `Send` handle that can stop the loop from any thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("state", &self.state.get())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Cross-thread stop signal for a [`Reactor`].
///
/// The reactor's registry is single-threaded; this handle is the one piece
/// of it other threads may touch. Stopping wakes the poller, so the request
/// is observed even while the loop is blocked with no traffic.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Requests the dispatch loop to exit at the next iteration boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}
