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

//! Non-blocking TCP acceptor/connection server
//!
//! [`TcpServer`] drives the accept, read, and close lifecycle of client
//! connections on top of a [`Reactor`]. All callbacks execute on the reactor
//! thread; they must not block or the whole loop stalls.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
};

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use tracing::error;

use crate::{
    error::{Error, Result},
    reactor::Reactor,
    ready::Ready,
};

/// Tuning knobs fixed at construction.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Largest number of bytes handed to `on_receive` per read syscall.
    pub read_buffer_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
        }
    }
}

type ConnectCallback = Box<dyn FnMut(RawFd)>;
type ReceiveCallback = Box<dyn FnMut(RawFd, &[u8])>;
type CloseCallback = Box<dyn FnMut(RawFd)>;

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_receive: Option<ReceiveCallback>,
    on_close: Option<CloseCallback>,
}

#[derive(PartialEq)]
enum ReadOutcome {
    Open,
    Closed,
}

struct Inner {
    listener: TcpListener,
    connections: RefCell<HashMap<RawFd, TcpStream>>,
    callbacks: RefCell<Callbacks>,
    // scratch space for the read path, sized once at construction
    read_buf: RefCell<Vec<u8>>,
    running: Cell<bool>,
}

/// Non-blocking TCP server bound to one listening descriptor.
///
/// The handle is a cheap clone over shared state, so an `on_receive`
/// callback can hold its own copy and answer through [`send`](Self::send).
/// Dropping the last handle closes the listener and every client
/// descriptor; [`stop`](Self::stop) is still the way to detach from a live
/// reactor, since drop order cannot reach it.
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<Inner>,
}

impl TcpServer {
    /// Opens a listening socket on `addr`.
    ///
    /// The socket gets `SO_REUSEADDR`, the OS-default backlog, and
    /// non-blocking mode. Any failure surfaces [`Error::Bind`] and no
    /// server exists.
    pub fn bind(addr: SocketAddr, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(Error::Bind)?;

        Ok(Self {
            inner: Rc::new(Inner {
                listener,
                connections: RefCell::new(HashMap::new()),
                callbacks: RefCell::new(Callbacks::default()),
                read_buf: RefCell::new(vec![0; options.read_buffer_size]),
                running: Cell::new(false),
            }),
        })
    }

    /// Address the listener is bound to. Useful with port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Invoked with the client descriptor after every successful accept.
    pub fn set_on_connect<F>(&self, callback: F)
    where
        F: FnMut(RawFd) + 'static,
    {
        self.inner.callbacks.borrow_mut().on_connect = Some(Box::new(callback));
    }

    /// Invoked with each chunk of received bytes.
    ///
    /// The slice borrows the server's read buffer and is valid only for the
    /// duration of the call; copy out whatever must outlive it.
    pub fn set_on_receive<F>(&self, callback: F)
    where
        F: FnMut(RawFd, &[u8]) + 'static,
    {
        self.inner.callbacks.borrow_mut().on_receive = Some(Box::new(callback));
    }

    /// Invoked exactly once per connection, after its descriptor is closed.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: FnMut(RawFd) + 'static,
    {
        self.inner.callbacks.borrow_mut().on_close = Some(Box::new(callback));
    }

    /// Registers the listener with the reactor and begins accepting.
    pub fn start(&self, reactor: &Reactor) -> Result<()> {
        let server = self.clone();
        reactor.add_handler(
            self.inner.listener.as_raw_fd(),
            Interest::READABLE,
            move |reactor, _ready| server.accept_ready(reactor),
        )?;
        self.inner.running.set(true);
        Ok(())
    }

    /// Deregisters the listener. Established connections keep flowing.
    pub fn stop(&self, reactor: &Reactor) -> Result<()> {
        reactor.remove_handler(self.inner.listener.as_raw_fd())?;
        self.inner.running.set(false);
        Ok(())
    }

    /// Whether the listener is currently registered with a reactor.
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Best-effort, non-blocking write to a client.
    ///
    /// One send syscall, no retry, no partial-write accounting. Callers
    /// needing delivery guarantees must layer their own outbound queue.
    pub fn send(&self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        let mut connections = self.inner.connections.borrow_mut();
        let stream = connections
            .get_mut(&fd)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "unknown client descriptor"))?;
        stream.write(data)
    }

    /// Number of established connections currently tracked.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    fn accept_ready(&self, reactor: &Reactor) {
        // The poller is edge-triggered: drain the backlog or pending
        // connections go unseen until the next inbound SYN.
        loop {
            match self.inner.listener.accept() {
                Ok((stream, _)) => self.register_client(reactor, stream),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    return;
                }
            }
        }
    }

    fn register_client(&self, reactor: &Reactor, stream: TcpStream) {
        let fd = stream.as_raw_fd();
        self.inner.connections.borrow_mut().insert(fd, stream);

        let server = self.clone();
        let registered = reactor.add_handler(fd, Interest::READABLE, move |reactor, ready| {
            server.client_ready(reactor, fd, ready);
        });
        if registered.is_err() {
            // drop the stream; the peer sees a reset
            self.inner.connections.borrow_mut().remove(&fd);
            return;
        }

        if let Some(on_connect) = self.inner.callbacks.borrow_mut().on_connect.as_mut() {
            on_connect(fd);
        }
    }

    fn client_ready(&self, reactor: &Reactor, fd: RawFd, ready: Ready) {
        if ready.is_readable() && self.drain_read(fd) == ReadOutcome::Closed {
            self.close_connection(reactor, fd);
            return;
        }

        if ready.is_read_closed() || ready.is_error() {
            self.close_connection(reactor, fd);
        }
    }

    fn drain_read(&self, fd: RawFd) -> ReadOutcome {
        let mut buf = self.inner.read_buf.borrow_mut();

        loop {
            // Hold the connection borrow only for the syscall so the
            // callback below may call `send` on this same server.
            let read = {
                let mut connections = self.inner.connections.borrow_mut();
                let Some(stream) = connections.get_mut(&fd) else {
                    return ReadOutcome::Open;
                };
                stream.read(&mut buf[..])
            };

            match read {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    if let Some(on_receive) =
                        self.inner.callbacks.borrow_mut().on_receive.as_mut()
                    {
                        on_receive(fd, &buf[..n]);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return ReadOutcome::Open,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return ReadOutcome::Closed,
            }
        }
    }

    fn close_connection(&self, reactor: &Reactor, fd: RawFd) {
        let stream = self.inner.connections.borrow_mut().remove(&fd);
        if stream.is_none() {
            return;
        }

        let _ = reactor.remove_handler(fd);
        drop(stream);

        if let Some(on_close) = self.inner.callbacks.borrow_mut().on_close.as_mut() {
            on_close(fd);
        }
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.inner.listener.local_addr().ok())
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{ServerOptions, TcpServer};
    use crate::error::Error;
    use crate::reactor::Reactor;

    #[test]
    fn bind_failure_surfaces_bind_error_and_no_server() {
        let result = TcpServer::bind(
            "255.255.255.255:80".parse().unwrap(),
            ServerOptions::default(),
        );
        assert!(matches!(result, Err(Error::Bind(_))));
    }

    #[test]
    fn start_registers_listener_and_stop_removes_it() {
        let reactor = Reactor::new().unwrap();
        let server =
            TcpServer::bind("127.0.0.1:0".parse().unwrap(), ServerOptions::default()).unwrap();

        assert!(!server.is_running());
        server.start(&reactor).unwrap();
        assert!(server.is_running());
        assert_eq!(1, reactor.handler_count());

        server.stop(&reactor).unwrap();
        assert!(!server.is_running());
        assert_eq!(0, reactor.handler_count());
    }

    #[test]
    fn stop_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let server =
            TcpServer::bind("127.0.0.1:0".parse().unwrap(), ServerOptions::default()).unwrap();

        server.start(&reactor).unwrap();
        server.stop(&reactor).unwrap();
        server.stop(&reactor).unwrap();
        assert_eq!(0, reactor.handler_count());
    }

    #[test]
    fn send_to_unknown_descriptor_fails() {
        let server =
            TcpServer::bind("127.0.0.1:0".parse().unwrap(), ServerOptions::default()).unwrap();
        assert!(server.send(4242, b"hello").is_err());
    }
}
