//! Wires `AsyncClient` to a real `mio::Poll` reactor. Demonstrates that the
//! four-hook-plus-cleanup capability interface in `async_client::EventLoopHooks`
//! is satisfiable by an ordinary reactor, not just the test harness's fake
//! hooks. Not part of the published crate API: this is a runnable example,
//! built only behind the `mio-demo` feature.

use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use mongo_async_wire::{
    AsyncClient, ConnectOptions, ConnectStatus, Disposition, DisconnectStatus, EventLoopHooks, Reply,
};

const CONN_TOKEN: Token = Token(0);

struct MioHooks {
    registry: Registry,
    fd: RawFd,
    readable: bool,
    writable: bool,
}

impl MioHooks {
    fn new(registry: Registry, fd: RawFd) -> std::io::Result<Self> {
        registry.register(&mut SourceFd(&fd), CONN_TOKEN, Interest::WRITABLE)?;
        Ok(MioHooks {
            registry,
            fd,
            readable: false,
            writable: true,
        })
    }

    fn sync_interest(&mut self) {
        let interest = match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if let Some(interest) = interest {
            let _ = self
                .registry
                .reregister(&mut SourceFd(&self.fd), CONN_TOKEN, interest);
        }
    }
}

impl EventLoopHooks for MioHooks {
    fn add_read(&mut self) {
        self.readable = true;
        self.sync_interest();
    }
    fn del_read(&mut self) {
        self.readable = false;
        self.sync_interest();
    }
    fn add_write(&mut self) {
        self.writable = true;
        self.sync_interest();
    }
    fn del_write(&mut self) {
        self.writable = false;
        self.sync_interest();
    }
    fn cleanup(&mut self) {
        let _ = self.registry.deregister(&mut SourceFd(&self.fd));
    }
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let host = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1".into());
    let port: u16 = std::env::args()
        .nth(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(27017);

    let connection = mongo_async_wire::transport::connect_tcp_nonblocking(&host, port, ConnectOptions::new())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let mut poll = Poll::new()?;
    let hooks = MioHooks::new(poll.registry().try_clone()?, connection.as_raw_fd())?;
    let mut client = AsyncClient::new(connection, Box::new(hooks));

    client.set_connect_callback(Box::new(|status| match status {
        ConnectStatus::Ok => tracing::info!("connected"),
        ConnectStatus::Err => tracing::warn!("connect failed"),
    }));
    client.set_disconnect_callback(Box::new(|status| match status {
        DisconnectStatus::Ok => tracing::info!("disconnected cleanly"),
        DisconnectStatus::Err => tracing::warn!("disconnected after error"),
    }));

    let ping = bson::to_vec(&bson::doc! { "ping": 1 }).unwrap();
    client
        .find_one(
            "admin",
            "$cmd",
            &ping,
            Some(Box::new(|reply: Option<&Reply>, _| {
                match reply {
                    Some(Reply::Document { documents, .. }) => {
                        tracing::info!(replies = documents.len(), "ping reply");
                    }
                    Some(_) => tracing::info!("ping reply (non-document)"),
                    None => tracing::warn!("ping callback invoked with no reply"),
                }
                Disposition::Disconnect
            })),
            Box::new(()),
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let mut events = Events::with_capacity(16);
    loop {
        poll.poll(&mut events, Some(Duration::from_secs(5)))?;
        if events.is_empty() {
            tracing::warn!("idle timeout waiting for server");
            break;
        }
        for event in &events {
            if event.token() != CONN_TOKEN {
                continue;
            }
            if event.is_writable() {
                let _ = client.handle_write();
            }
            if event.is_readable() {
                let _ = client.handle_read();
            }
        }
        if client.is_closed() {
            break;
        }
    }

    std::io::stdout().flush()?;
    Ok(())
}
