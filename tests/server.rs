//! End-to-end scenarios: a reactor thread serving real TCP clients.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reaktor::reactor::{Reactor, StopHandle};
use reaktor::server::{ServerOptions, TcpServer};

struct Fixture {
    addr: SocketAddr,
    stop: StopHandle,
    reactor_thread: thread::JoinHandle<()>,
}

impl Fixture {
    fn shutdown(self) {
        self.stop.stop();
        self.reactor_thread.join().expect("reactor thread panicked");
    }
}

/// Spins up a reactor thread, binds a server on an ephemeral port, and lets
/// `configure` install callbacks before the loop starts. The reactor and
/// server never leave their thread; only the address and stop handle do.
fn run_server<F>(options: ServerOptions, configure: F) -> Fixture
where
    F: FnOnce(&TcpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let reactor_thread = thread::spawn(move || {
        let reactor = Reactor::new().expect("failed to create reactor");
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), options)
            .expect("failed to bind server");
        configure(&server);
        server.start(&reactor).expect("failed to start server");

        tx.send((
            server.local_addr().expect("no local addr"),
            reactor.stop_handle(),
        ))
        .expect("main test thread is gone");

        reactor.run().expect("dispatch loop failed");
    });

    let (addr, stop) = rx.recv().expect("server thread died during setup");
    Fixture {
        addr,
        stop,
        reactor_thread,
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_round_trip_then_close() {
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_seen = Arc::clone(&closes);

    let fixture = run_server(ServerOptions::default(), move |server| {
        let echo = server.clone();
        server.set_on_receive(move |fd, bytes| {
            let _ = echo.send(fd, bytes);
        });
        server.set_on_close(move |_fd| {
            closes_seen.fetch_add(1, Ordering::SeqCst);
        });
    });

    let mut client = TcpStream::connect(fixture.addr).unwrap();
    client.write_all(b"ping").unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(b"ping", &reply);

    drop(client);
    wait_until(Duration::from_secs(5), || closes.load(Ordering::SeqCst) == 1);

    fixture.shutdown();
    assert_eq!(1, closes.load(Ordering::SeqCst));
}

#[test]
fn one_hundred_clients_each_deliver_and_close() {
    let connects = Arc::new(AtomicUsize::new(0));
    let bytes = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let fixture = {
        let connects = Arc::clone(&connects);
        let bytes = Arc::clone(&bytes);
        let closes = Arc::clone(&closes);
        run_server(ServerOptions::default(), move |server| {
            server.set_on_connect(move |_fd| {
                connects.fetch_add(1, Ordering::SeqCst);
            });
            server.set_on_receive(move |_fd, chunk| {
                bytes.fetch_add(chunk.len(), Ordering::SeqCst);
            });
            server.set_on_close(move |_fd| {
                closes.fetch_add(1, Ordering::SeqCst);
            });
        })
    };

    let clients: Vec<_> = (0..100)
        .map(|_| {
            let addr = fixture.addr;
            thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                client.write_all(b"X").unwrap();
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    wait_until(Duration::from_secs(10), || {
        closes.load(Ordering::SeqCst) == 100
    });

    assert_eq!(100, connects.load(Ordering::SeqCst));
    assert_eq!(100, bytes.load(Ordering::SeqCst));
    assert_eq!(100, closes.load(Ordering::SeqCst));

    fixture.shutdown();
}

#[test]
fn payload_larger_than_read_buffer_arrives_chunked_and_ordered() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let chunks = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let fixture = {
        let received = Arc::clone(&received);
        let chunks = Arc::clone(&chunks);
        let closed = Arc::clone(&closed);
        let options = ServerOptions {
            read_buffer_size: 8,
        };
        run_server(options, move |server| {
            server.set_on_receive(move |_fd, chunk| {
                assert!(chunk.len() <= 8);
                received.lock().unwrap().extend_from_slice(chunk);
                chunks.fetch_add(1, Ordering::SeqCst);
            });
            server.set_on_close(move |_fd| {
                closed.fetch_add(1, Ordering::SeqCst);
            });
        })
    };

    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(fixture.addr).unwrap();
    client.write_all(&payload).unwrap();
    drop(client);

    wait_until(Duration::from_secs(5), || closed.load(Ordering::SeqCst) == 1);

    assert_eq!(payload, *received.lock().unwrap());
    assert!(chunks.load(Ordering::SeqCst) > 1);

    fixture.shutdown();
}

#[test]
fn close_fires_once_when_peer_shuts_down_its_write_half() {
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_seen = Arc::clone(&closes);

    let fixture = run_server(ServerOptions::default(), move |server| {
        server.set_on_close(move |_fd| {
            closes_seen.fetch_add(1, Ordering::SeqCst);
        });
    });

    let mut client = TcpStream::connect(fixture.addr).unwrap();
    client.write_all(b"half a messa").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    wait_until(Duration::from_secs(5), || closes.load(Ordering::SeqCst) >= 1);
    drop(client);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(1, closes.load(Ordering::SeqCst));

    fixture.shutdown();
}

#[test]
fn on_connect_may_answer_through_send() {
    let fixture = run_server(ServerOptions::default(), move |server| {
        let greeter = server.clone();
        server.set_on_connect(move |fd| {
            let _ = greeter.send(fd, b"hello");
        });
    });

    let mut client = TcpStream::connect(fixture.addr).unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(b"hello", &reply);

    fixture.shutdown();
}
