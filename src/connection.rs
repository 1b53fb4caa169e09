/*!
 * @file connection.rs
 * @brief Connection object: fd, buffers, flags, error slot (component E)
 */

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use bitflags::bitflags;
use socket2::Socket;

use crate::codec::{Reply, ReplyReader};
use crate::config::ConnectOptions;
use crate::error::{MongoError, Result};

bitflags! {
    /// Independent connection state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectionFlags: u32 {
        /// Blocking mode; the async controller requires this cleared.
        const BLOCK         = 1 << 0;
        /// Set after the first successful write-readiness confirms connect.
        const CONNECTED     = 1 << 1;
        /// New writes refused; drain pending replies then close.
        const DISCONNECTING = 1 << 2;
        /// Destruction requested; completes once any in-flight callback returns.
        const FREEING       = 1 << 3;
        /// A user callback is currently executing.
        const IN_CALLBACK   = 1 << 4;
        /// SO_REUSEADDR on the bound source address.
        const REUSEADDR     = 1 << 5;
    }
}

/// What kind of endpoint this connection was made to, retained so
/// `reconnect` can recreate the socket with the same parameters.
#[derive(Debug, Clone)]
pub enum ConnectionKind {
    Tcp {
        host: String,
        port: u16,
        source_addr: Option<String>,
    },
    Local {
        path: String,
    },
}

/// Size of the stack buffer used for a single `recv` call. Doesn't bound
/// how much is read overall per `buffer_read` — that loops until the
/// socket would block.
const READ_CHUNK: usize = 16 * 1024;

/// Above this many queued-but-unwritten bytes, an oversized output buffer
/// is compacted by draining the already-written prefix rather than left to
/// grow unbounded while a slow peer lags behind.
const OUTPUT_COMPACT_THRESHOLD: usize = 64 * 1024;

pub struct Connection {
    socket: Socket,
    output: Vec<u8>,
    write_offset: usize,
    reader: ReplyReader,
    kind: ConnectionKind,
    timeout: Option<Duration>,
    connect_options: ConnectOptions,
    error: Option<MongoError>,
    flags: ConnectionFlags,
    request_id: u32,
}

impl Connection {
    pub(crate) fn new(
        socket: Socket,
        kind: ConnectionKind,
        connect_options: ConnectOptions,
        flags: ConnectionFlags,
    ) -> Self {
        let timeout = connect_options.timeout;
        Connection {
            socket,
            output: Vec::new(),
            write_offset: 0,
            reader: ReplyReader::new(),
            kind,
            timeout,
            connect_options,
            error: None,
            flags,
            request_id: 0,
        }
    }

    /// Wraps an already-connected file descriptor (e.g. inherited from a
    /// parent process, or established by a caller out of band), taking
    /// ownership of it. Mirrors the original's `mongoConnectFd`: the
    /// descriptor is assumed already connected, so the resulting
    /// `Connection` is marked `CONNECTED` immediately rather than going
    /// through a connect handshake. `kind` records how `reconnect` should
    /// recreate the socket if the connection is later lost; a caller with
    /// no meaningful host/path to reconnect to should not call `reconnect`
    /// on a connection constructed this way.
    ///
    /// # Safety
    /// `fd` must be a valid, open, connected stream socket descriptor not
    /// owned elsewhere; this call takes exclusive ownership of it.
    pub unsafe fn from_raw_fd(fd: RawFd, kind: ConnectionKind, opts: ConnectOptions) -> Result<Self> {
        let socket = Socket::from_raw_fd(fd);
        if let Some(timeout) = opts.timeout {
            crate::transport::apply_timeout(&socket, timeout)?;
        }
        if let Some(keepalive) = opts.keepalive {
            crate::transport::apply_keepalive(&socket, keepalive)?;
        }
        let mut flags = ConnectionFlags::CONNECTED;
        if opts.reuseaddr {
            flags |= ConnectionFlags::REUSEADDR;
        }
        Ok(Connection::new(socket, kind, opts, flags))
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut ConnectionFlags {
        &mut self.flags
    }

    pub fn kind(&self) -> &ConnectionKind {
        &self.kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn error(&self) -> Option<&MongoError> {
        self.error.as_ref()
    }

    pub(crate) fn set_error(&mut self, err: MongoError) {
        tracing::warn!(code = err.code(), message = %err, "connection error");
        self.error = Some(err);
    }

    pub(crate) fn take_error(&mut self) -> Option<MongoError> {
        self.error.take()
    }

    /// Monotonic request id used for `requestID` in outgoing headers. Wraps
    /// on overflow, matching the original's untreated 32-bit wraparound.
    pub(crate) fn next_request_id(&mut self) -> i32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id as i32
    }

    pub fn reader(&mut self) -> &mut ReplyReader {
        &mut self.reader
    }

    /// Appends a pre-built frame to the output buffer (pipelining).
    pub fn append_formatted(&mut self, bytes: &[u8]) -> Result<()> {
        self.output
            .try_reserve(bytes.len())
            .map_err(|_| MongoError::Oom)?;
        self.output.extend_from_slice(bytes);
        Ok(())
    }

    pub fn has_pending_output(&self) -> bool {
        self.write_offset < self.output.len()
    }

    /// Drains as much of the output buffer as the socket accepts without
    /// blocking. Returns `true` if the buffer is now fully drained.
    pub fn buffer_write(&mut self) -> Result<bool> {
        while self.write_offset < self.output.len() {
            match self.socket.write(&self.output[self.write_offset..]) {
                Ok(0) => break,
                Ok(n) => self.write_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MongoError::Io(e)),
            }
        }
        self.compact_output();
        Ok(self.write_offset == self.output.len())
    }

    fn compact_output(&mut self) {
        if self.write_offset == self.output.len() {
            self.output.clear();
            self.write_offset = 0;
        } else if self.write_offset >= OUTPUT_COMPACT_THRESHOLD {
            self.output.drain(0..self.write_offset);
            self.write_offset = 0;
        }
    }

    /// Reads as much as the socket offers without blocking, feeding it to
    /// the reply reader. Returns total bytes read. `Ok(0)` reads are peer
    /// EOF and surfaced as `MongoError::Eof`.
    pub fn buffer_read(&mut self) -> Result<usize> {
        let mut buf = [0u8; READ_CHUNK];
        let mut total = 0usize;
        loop {
            match self.socket.read(&mut buf) {
                Ok(0) => {
                    if total == 0 {
                        return Err(MongoError::Eof);
                    }
                    break;
                }
                Ok(n) => {
                    self.reader.feed(&buf[..n]);
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MongoError::Io(e)),
            }
        }
        Ok(total)
    }

    /// Diagnoses the outcome of a pending non-blocking `connect(2)` after a
    /// write-readiness event. `Ok(())` means connected; an `Io` error with
    /// `EINPROGRESS` means "still connecting, try again later" and is
    /// reported distinctly via `still_connecting`.
    pub fn check_socket_error(&self) -> Result<()> {
        match self.socket.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(MongoError::Io(e)),
            Err(e) => Err(MongoError::Io(e)),
        }
    }

    /// `get_reply`: in blocking mode, flushes output and reads until a
    /// reply is available; in non-blocking mode, drains what's ready once
    /// and returns whatever the reader yields (which may be `None`).
    pub fn get_reply(&mut self) -> Result<Option<Reply>> {
        if let Some(reply) = self.reader.poll()? {
            return Ok(Some(reply));
        }
        if self.flags.contains(ConnectionFlags::BLOCK) {
            loop {
                while !self.buffer_write()? {}
                self.buffer_read()?;
                if let Some(reply) = self.reader.poll()? {
                    return Ok(Some(reply));
                }
            }
        } else {
            self.buffer_write()?;
            self.buffer_read()?;
            self.reader.poll()
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        crate::transport::apply_timeout(&self.socket, timeout)?;
        self.timeout = Some(timeout);
        self.connect_options.timeout = Some(timeout);
        Ok(())
    }

    pub fn enable_keepalive(
        &mut self,
        keepalive: crate::config::KeepaliveOptions,
    ) -> Result<()> {
        crate::transport::apply_keepalive(&self.socket, keepalive)?;
        self.connect_options.keepalive = Some(keepalive);
        Ok(())
    }

    /// Re-establishes the socket using the parameters captured at connect
    /// time ("reconnect"). Resets transient per-connection state but
    /// keeps `BLOCK`/`REUSEADDR`, matching "flags are used unmodified from
    /// the existing context" for the bits that describe connection
    /// *policy* rather than connection *state*.
    pub fn reconnect(&mut self) -> Result<()> {
        let keep = self.flags & (ConnectionFlags::BLOCK | ConnectionFlags::REUSEADDR);
        let (socket, new_flags) = match &self.kind {
            ConnectionKind::Tcp {
                host,
                port,
                source_addr,
            } => {
                let mut opts = self.connect_options.clone();
                if let Some(addr) = source_addr {
                    opts = opts.with_source_addr(addr.clone());
                }
                crate::transport::raw_connect_tcp(host, *port, &opts, keep)?
            }
            ConnectionKind::Local { path } => {
                crate::transport::raw_connect_unix(path, &self.connect_options, keep)?
            }
        };
        self.socket = socket;
        self.flags = new_flags;
        self.output.clear();
        self.write_offset = 0;
        self.reader = ReplyReader::new();
        self.error = None;
        Ok(())
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.socket.as_raw_fd())
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("output_len", &(self.output.len() - self.write_offset))
            .finish()
    }
}
