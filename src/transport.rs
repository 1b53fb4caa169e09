/*!
 * @file transport.rs
 * @brief Socket setup, blocking and non-blocking (component D)
 *
 * Resolves a host, opens a socket, optionally binds a source address,
 * connects (blocking or non-blocking per entry point), and applies
 * `TCP_NODELAY` / keepalive / timeouts. `std::net` can't express several of
 * these (non-blocking connect with a bindable source address,
 * `SO_KEEPALIVE` idle/interval/probes, raw `SO_RCVTIMEO`/`SO_SNDTIMEO`), so
 * this core goes through `socket2`.
 */

use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, TcpKeepalive, Type};

use crate::config::{ConnectOptions, KeepaliveOptions};
use crate::connection::{Connection, ConnectionFlags, ConnectionKind};
use crate::error::{MongoError, Result};

/// How many times a bound, `SO_REUSEADDR` connect attempt retries past
/// `EADDRNOTAVAIL` on the same address before giving up and moving to the
/// next candidate.
const CONNECT_RETRIES: u32 = 10;

fn io_err(context: &'static str, e: io::Error) -> MongoError {
    MongoError::Io(io::Error::new(e.kind(), format!("{context}: {e}")))
}

/// Converts a `Duration` into the millisecond form `poll(2)` wants,
/// rounding up and clamping to `i32::MAX` the same way the original's
/// `mongoContextTimeoutMsec` does for `struct timeval`.
fn timeout_to_poll_ms(timeout: Duration) -> i32 {
    let whole_millis = timeout.as_millis();
    let sub_milli_nanos = timeout.subsec_nanos() % 1_000_000;
    let millis = if sub_milli_nanos > 0 {
        whole_millis + 1
    } else {
        whole_millis
    };
    if millis > i32::MAX as u128 {
        i32::MAX
    } else {
        millis as i32
    }
}

fn resolve_candidates(host: &str, port: u16) -> Result<Vec<std::net::SocketAddr>> {
    (host, port)
        .to_socket_addrs()
        .map(|it| it.collect())
        .map_err(|e| io_err("getaddrinfo", e))
}

fn new_nonblocking_socket(domain: Domain) -> Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|e| io_err("socket", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| io_err("fcntl(O_NONBLOCK)", e))?;
    Ok(socket)
}

fn bind_source_addr(socket: &Socket, source_addr: &str) -> Result<()> {
    let candidates = resolve_candidates(source_addr, 0)?;
    for addr in &candidates {
        if socket.bind(&SockAddr::from(*addr)).is_ok() {
            return Ok(());
        }
    }
    Err(MongoError::Other(format!(
        "can't bind source address {source_addr}"
    )))
}

/// Waits, at most once, for the connecting socket to become writable, then
/// reads back the real connect outcome via `SO_ERROR`. Mirrors
/// `mongoContextWaitReady` + `mongoCheckSocketError`, using `poll(2)`
/// through `socket2`'s blocking `connect_timeout` where available and a
/// manual `poll` otherwise.
fn wait_connect_ready(socket: &Socket, timeout: Option<Duration>) -> Result<()> {
    let millis = timeout.map(timeout_to_poll_ms).unwrap_or(-1);
    let mut pfd = libc::pollfd {
        fd: std::os::unix::io::AsRawFd::as_raw_fd(socket),
        events: libc::POLLOUT,
        revents: 0,
    };
    let rv = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rv == -1 {
        return Err(io_err("poll(2)", io::Error::last_os_error()));
    }
    if rv == 0 {
        return Err(MongoError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        )));
    }
    match socket.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(MongoError::Io(e)),
        Err(e) => Err(MongoError::Io(e)),
    }
}

fn apply_tcp_nodelay(socket: &Socket) -> Result<()> {
    socket
        .set_nodelay(true)
        .map_err(|e| io_err("setsockopt(TCP_NODELAY)", e))
}

pub(crate) fn apply_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| io_err("setsockopt(SO_RCVTIMEO)", e))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| io_err("setsockopt(SO_SNDTIMEO)", e))?;
    Ok(())
}

pub(crate) fn apply_keepalive(socket: &Socket, keepalive: KeepaliveOptions) -> Result<()> {
    let ka = TcpKeepalive::new()
        .with_time(keepalive.idle)
        .with_interval(keepalive.interval)
        .with_retries(keepalive.probes);
    socket
        .set_tcp_keepalive(&ka)
        .map_err(|e| io_err("setsockopt(SO_KEEPALIVE)", e))
}

/// Opens and connects a non-blocking TCP socket, applying reuseaddr retry,
/// source-address binding, keepalive, timeout, and `TCP_NODELAY` exactly as
/// `connect_tcp` documents. Returns the raw socket plus the flags it ended
/// up with. `CONNECTED` is only set here for a blocking connect (which has
/// waited out the handshake via `wait_connect_ready`); a non-blocking
/// connect leaves `CONNECTED` unset even if the syscall happened to
/// complete synchronously (common on loopback), so the async controller's
/// write handler is always the one to confirm it via `check_socket_error`.
pub(crate) fn raw_connect_tcp(
    host: &str,
    port: u16,
    opts: &ConnectOptions,
    base_flags: ConnectionFlags,
) -> Result<(Socket, ConnectionFlags)> {
    let candidates = resolve_candidates(host, port)?;
    if candidates.is_empty() {
        return Err(MongoError::Other(format!("no addresses found for {host}")));
    }

    let blocking = base_flags.contains(ConnectionFlags::BLOCK);
    let mut last_err: Option<MongoError> = None;

    for addr in &candidates {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let mut reuses = 0u32;
        loop {
            let socket = match new_nonblocking_socket(domain) {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            };

            if opts.reuseaddr {
                if let Err(e) = socket.set_reuse_address(true) {
                    last_err = Some(io_err("setsockopt(SO_REUSEADDR)", e));
                    break;
                }
            }
            if let Some(source_addr) = &opts.source_addr {
                if let Err(e) = bind_source_addr(&socket, source_addr) {
                    last_err = Some(e);
                    break;
                }
            }

            match socket.connect(&SockAddr::from(*addr)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {
                    if blocking {
                        if let Err(err) = wait_connect_ready(&socket, opts.timeout) {
                            last_err = Some(err);
                            break;
                        }
                    }
                    // Non-blocking: left pending, the caller's event loop
                    // drives completion via write-readiness.
                }
                Err(e) if e.raw_os_error() == Some(libc::EHOSTUNREACH) => {
                    last_err = Some(io_err("connect", e));
                    break;
                }
                Err(e) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) && opts.reuseaddr => {
                    reuses += 1;
                    if reuses >= CONNECT_RETRIES {
                        last_err = Some(io_err("connect", e));
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    if let Err(err) = wait_connect_ready(&socket, opts.timeout) {
                        last_err = Some(err);
                    } else {
                        last_err = Some(io_err("connect", e));
                    }
                    break;
                }
            }

            apply_tcp_nodelay(&socket)?;
            if let Some(timeout) = opts.timeout {
                apply_timeout(&socket, timeout)?;
            }
            if let Some(keepalive) = opts.keepalive {
                apply_keepalive(&socket, keepalive)?;
            }

            let mut flags = base_flags;
            if blocking {
                flags |= ConnectionFlags::CONNECTED;
            }
            if opts.reuseaddr {
                flags |= ConnectionFlags::REUSEADDR;
            }
            return Ok((socket, flags));
        }
    }

    Err(last_err.unwrap_or_else(|| MongoError::Other("failed to connect".into())))
}

/// Connects a Unix-domain (`AF_LOCAL`) socket at `path`.
pub(crate) fn raw_connect_unix(
    path: &str,
    opts: &ConnectOptions,
    base_flags: ConnectionFlags,
) -> Result<(Socket, ConnectionFlags)> {
    let blocking = base_flags.contains(ConnectionFlags::BLOCK);
    let stream = if blocking {
        UnixStream::connect(path).map_err(|e| io_err("connect", e))?
    } else {
        // `socket2` has no AF_UNIX connect helper with nonblocking
        // semantics on all targets; std's UnixStream plus a fd-borrow
        // into `Socket` gets us the same underlying descriptor.
        let stream = UnixStream::connect(path).map_err(|e| io_err("connect", e))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| io_err("fcntl(O_NONBLOCK)", e))?;
        stream
    };
    let fd = std::os::unix::io::IntoRawFd::into_raw_fd(stream);
    let socket = unsafe { Socket::from_raw_fd(fd) };

    if let Some(timeout) = opts.timeout {
        apply_timeout(&socket, timeout)?;
    }

    let mut flags = base_flags;
    flags |= ConnectionFlags::CONNECTED;
    Ok((socket, flags))
}

/// Connects to `host:port` over TCP, blocking the calling thread until the
/// handshake completes (or fails, or times out per `opts.timeout`). Mirrors
/// the original's blocking `mongoConnect`/`mongoConnectWithTimeout`. The
/// resulting `Connection` has `ConnectionFlags::BLOCK` set and is not meant
/// to be driven by `AsyncClient`, which requires `BLOCK` cleared.
pub fn connect_tcp(host: &str, port: u16, opts: ConnectOptions) -> Result<Connection> {
    let kind = ConnectionKind::Tcp {
        host: host.to_string(),
        port,
        source_addr: opts.source_addr.clone(),
    };
    let (socket, flags) = raw_connect_tcp(host, port, &opts, ConnectionFlags::BLOCK)?;
    Ok(Connection::new(socket, kind, opts, flags))
}

/// Connects to `host:port` over TCP without blocking; the caller's event
/// loop drives the handshake to completion via write-readiness, confirmed
/// through `AsyncClient`'s write handler. Mirrors the original's
/// `mongoConnectNonBlock`.
pub fn connect_tcp_nonblocking(host: &str, port: u16, opts: ConnectOptions) -> Result<Connection> {
    let kind = ConnectionKind::Tcp {
        host: host.to_string(),
        port,
        source_addr: opts.source_addr.clone(),
    };
    let (socket, flags) = raw_connect_tcp(host, port, &opts, ConnectionFlags::empty())?;
    Ok(Connection::new(socket, kind, opts, flags))
}

/// Non-blocking TCP connect bound to `source_addr`, without `SO_REUSEADDR`.
/// Mirrors the original's `mongoConnectBindNonBlock`.
pub fn connect_bind(
    host: &str,
    port: u16,
    source_addr: &str,
    mut opts: ConnectOptions,
) -> Result<Connection> {
    opts.source_addr = Some(source_addr.to_string());
    opts.reuseaddr = false;
    connect_tcp_nonblocking(host, port, opts)
}

/// Non-blocking TCP connect bound to `source_addr`, with `SO_REUSEADDR` set
/// on the bound socket before `connect(2)`. Mirrors the original's
/// `mongoConnectBindNonBlockWithReuse`.
pub fn connect_bind_reuse(
    host: &str,
    port: u16,
    source_addr: &str,
    mut opts: ConnectOptions,
) -> Result<Connection> {
    opts.source_addr = Some(source_addr.to_string());
    opts.reuseaddr = true;
    connect_tcp_nonblocking(host, port, opts)
}

/// Connects to a Unix-domain socket at `path`, blocking until connected.
/// Mirrors the original's `mongoConnectUnix`/`mongoConnectUnixWithTimeout`.
pub fn connect_unix(path: &str, opts: ConnectOptions) -> Result<Connection> {
    let kind = ConnectionKind::Local {
        path: path.to_string(),
    };
    let (socket, flags) = raw_connect_unix(path, &opts, ConnectionFlags::BLOCK)?;
    Ok(Connection::new(socket, kind, opts, flags))
}

/// Connects to a Unix-domain socket at `path` without blocking. Mirrors the
/// original's `mongoConnectUnixNonBlock`.
pub fn connect_unix_nonblocking(path: &str, opts: ConnectOptions) -> Result<Connection> {
    let kind = ConnectionKind::Local {
        path: path.to_string(),
    };
    let (socket, flags) = raw_connect_unix(path, &opts, ConnectionFlags::empty())?;
    Ok(Connection::new(socket, kind, opts, flags))
}
