//! Echo server wired end to end: reactor, TCP server, and the async log
//! sink. Connect with `nc 127.0.0.1 7878` and type at it.

use std::net::SocketAddr;

use reaktor::logging::AsyncLog;
use reaktor::reactor::Reactor;
use reaktor::server::{ServerOptions, TcpServer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = "127.0.0.1:7878".parse()?;
    let reactor = Reactor::new()?;
    let server = TcpServer::bind(addr, ServerOptions::default())?;
    let sink = AsyncLog::global()?;

    server.set_on_connect(move |fd| {
        sink.append(&format!("connect fd={fd}\n"));
    });

    let echo = server.clone();
    server.set_on_receive(move |fd, bytes| {
        let _ = echo.send(fd, bytes);
    });

    server.set_on_close(move |fd| {
        sink.append(&format!("close fd={fd}\n"));
    });

    server.start(&reactor)?;
    println!("echo listening on {}", server.local_addr()?);

    // ctrl-c exits the process; a long-lived service would wire a signal
    // pipe into the reactor and stop cleanly instead
    reactor.run()?;
    sink.stop();
    Ok(())
}
