//! Purpose: Output endpoints driven by the delivery state machine.
//! Exports: `Destination`, `DestState`, `FileDestination`, `TcpDestination`,
//! `DatagramDestination`, `open_destination`.
//! Role: Each transport implements connect/disconnect/write/timeout over one descriptor.
//! Invariants: `write` advances `remaining` by exactly the bytes accepted by the transport.
//! Invariants: A destination in `Disconnected` holds no descriptor (stdout excepted).
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use crate::core::error::Error;
use crate::core::sys;
use crate::endpoint::{resolve_socket_addr, Endpoint, TransportKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DestState {
    Disconnected,
    Connecting,
    Ready,
    Sending,
    Error,
}

impl fmt::Display for DestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DestState::Disconnected => "disconnected",
            DestState::Connecting => "connecting",
            DestState::Ready => "ready",
            DestState::Sending => "sending",
            DestState::Error => "error",
        })
    }
}

pub trait Destination: Send {
    fn describe(&self) -> &str;
    fn state(&self) -> DestState;
    /// Descriptor to wait on for write readiness.
    fn fd(&self) -> Option<RawFd>;
    /// Starts or continues establishing the transport. `false` means the
    /// attempt failed and the state is now `Error`.
    fn connect(&mut self) -> bool;
    fn disconnect(&mut self) -> bool;
    /// Writes the unsent tail of `wire`, i.e. its last `*remaining` bytes.
    /// `true` once the whole record is out.
    fn write(&mut self, wire: &[u8], remaining: &mut usize) -> bool;
    /// Called when a readiness wait expired.
    fn timeout(&mut self) -> bool;

    fn cleanup(&mut self) -> bool {
        if self.state() == DestState::Disconnected {
            return true;
        }
        self.disconnect()
    }
}

// Shared by every stream-like destination: loop until the record is out or
// the transport pushes back.
fn write_stream(
    writer: &mut impl Write,
    wire: &[u8],
    remaining: &mut usize,
    state: &mut DestState,
    describe: &str,
) -> bool {
    while *remaining > 0 {
        let offset = wire.len() - *remaining;
        match writer.write(&wire[offset..]) {
            Ok(0) => {
                *state = DestState::Sending;
                return false;
            }
            Ok(written) => {
                *remaining -= written.min(*remaining);
                *state = DestState::Sending;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                *state = DestState::Sending;
                return false;
            }
            Err(err) => {
                tracing::warn!(dest = describe, error = %err, "write failed");
                *state = DestState::Error;
                return false;
            }
        }
    }
    *state = DestState::Ready;
    true
}

// One datagram per record; anything short of the full record is a failure.
fn send_datagram(
    sent: io::Result<usize>,
    remaining: &mut usize,
    state: &mut DestState,
    describe: &str,
) -> bool {
    match sent {
        Ok(len) if len == *remaining => {
            *remaining = 0;
            *state = DestState::Ready;
            true
        }
        Ok(len) => {
            tracing::warn!(dest = describe, sent = len, expected = *remaining, "short datagram send");
            *state = DestState::Error;
            false
        }
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            *state = DestState::Sending;
            false
        }
        Err(err) => {
            tracing::warn!(dest = describe, error = %err, "send failed");
            *state = DestState::Error;
            false
        }
    }
}

/// Append-only file, or stdout for `-`.
pub struct FileDestination {
    describe: String,
    path: Option<PathBuf>,
    file: Option<File>,
    state: DestState,
}

impl FileDestination {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            describe: format!("file:{}", path.display()),
            path: Some(path),
            file: None,
            state: DestState::Disconnected,
        }
    }

    pub fn stdout() -> io::Result<Self> {
        let fd = io::stdout().as_fd().try_clone_to_owned()?;
        Ok(Self {
            describe: "file:-".to_string(),
            path: None,
            file: Some(File::from(fd)),
            state: DestState::Ready,
        })
    }
}

impl Destination for FileDestination {
    fn describe(&self) -> &str {
        &self.describe
    }

    fn state(&self) -> DestState {
        self.state
    }

    fn fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn connect(&mut self) -> bool {
        let Some(path) = &self.path else {
            self.state = DestState::Ready;
            return true;
        };
        match OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o644)
            .open(path)
        {
            Ok(file) => {
                self.file = Some(file);
                self.state = DestState::Ready;
                true
            }
            Err(err) => {
                tracing::warn!(dest = %self.describe, error = %err, "open failed");
                self.state = DestState::Error;
                false
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        if self.path.is_none() {
            // stdout stays open for the life of the process.
            self.state = DestState::Ready;
            return true;
        }
        self.state = DestState::Disconnected;
        match self.file.take() {
            Some(file) => sys::close(OwnedFd::from(file)).is_ok(),
            None => true,
        }
    }

    fn write(&mut self, wire: &[u8], remaining: &mut usize) -> bool {
        let Some(file) = self.file.as_mut() else {
            self.state = DestState::Error;
            return false;
        };
        write_stream(file, wire, remaining, &mut self.state, &self.describe)
    }

    fn timeout(&mut self) -> bool {
        true
    }
}

/// Non-blocking TCP client.
pub struct TcpDestination {
    describe: String,
    resource: String,
    target: Option<SocketAddr>,
    stream: Option<TcpStream>,
    state: DestState,
}

impl TcpDestination {
    pub fn new(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self {
            describe: format!("tcp:{resource}"),
            resource,
            target: None,
            stream: None,
            state: DestState::Disconnected,
        }
    }

    fn fail(&mut self, err: impl fmt::Display) -> bool {
        tracing::warn!(dest = %self.describe, error = %err, "connect failed");
        self.state = DestState::Error;
        false
    }
}

impl Destination for TcpDestination {
    fn describe(&self) -> &str {
        &self.describe
    }

    fn state(&self) -> DestState {
        self.state
    }

    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn connect(&mut self) -> bool {
        if self.stream.is_none() {
            // Resolve per attempt so a moved peer is picked up after reconnects.
            let target = match resolve_socket_addr(&self.resource) {
                Ok(target) => target,
                Err(err) => return self.fail(err),
            };
            match tcp_socket(&target) {
                Ok(socket) => {
                    self.stream = Some(TcpStream::from(socket));
                    self.target = Some(target);
                }
                Err(err) => return self.fail(err),
            }
        }
        let (Some(stream), Some(target)) = (&self.stream, &self.target) else {
            self.state = DestState::Error;
            return false;
        };

        match SockRef::from(stream).connect(&SockAddr::from(*target)) {
            Ok(()) => {
                tracing::info!(dest = %self.describe, "connected");
                self.state = DestState::Ready;
                true
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::EISCONN) => {
                    tracing::info!(dest = %self.describe, "connected");
                    self.state = DestState::Ready;
                    true
                }
                Some(libc::EINPROGRESS | libc::EALREADY | libc::EAGAIN | libc::EINTR) => {
                    self.state = DestState::Connecting;
                    true
                }
                _ => self.fail(err),
            },
        }
    }

    fn disconnect(&mut self) -> bool {
        self.state = DestState::Disconnected;
        self.target = None;
        match self.stream.take() {
            Some(stream) => sys::close(OwnedFd::from(stream)).is_ok(),
            None => true,
        }
    }

    fn write(&mut self, wire: &[u8], remaining: &mut usize) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            self.state = DestState::Error;
            return false;
        };
        write_stream(stream, wire, remaining, &mut self.state, &self.describe)
    }

    fn timeout(&mut self) -> bool {
        tracing::debug!(dest = %self.describe, state = %self.state, "timed out, dropping connection");
        self.disconnect();
        false
    }
}

// Non-blocking stream socket with keepalive; socket2 sets close-on-exec itself.
fn tcp_socket(target: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*target), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

enum DatagramSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl DatagramSocket {
    fn send(&self, wire: &[u8]) -> io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => socket.send(wire),
            DatagramSocket::Unix(socket) => socket.send(wire),
        }
    }

    fn into_fd(self) -> OwnedFd {
        match self {
            DatagramSocket::Udp(socket) => OwnedFd::from(socket),
            DatagramSocket::Unix(socket) => OwnedFd::from(socket),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        match self {
            DatagramSocket::Udp(socket) => socket.as_raw_fd(),
            DatagramSocket::Unix(socket) => socket.as_raw_fd(),
        }
    }
}

/// Connectionless UDP or unix-datagram peer; each record is one datagram.
pub struct DatagramDestination {
    describe: String,
    kind: TransportKind,
    resource: String,
    socket: Option<DatagramSocket>,
    state: DestState,
}

impl DatagramDestination {
    pub fn udp(resource: impl Into<String>) -> Self {
        Self::new(TransportKind::Udp, resource.into())
    }

    pub fn unix(resource: impl Into<String>) -> Self {
        Self::new(TransportKind::Unix, resource.into())
    }

    fn new(kind: TransportKind, resource: String) -> Self {
        Self {
            describe: format!("{kind}:{resource}"),
            kind,
            resource,
            socket: None,
            state: DestState::Disconnected,
        }
    }

    fn open(&self) -> io::Result<DatagramSocket> {
        let socket = match self.kind {
            TransportKind::Unix => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(&self.resource)?;
                socket.set_nonblocking(true)?;
                DatagramSocket::Unix(socket)
            }
            _ => {
                let target = resolve_socket_addr(&self.resource)
                    .map_err(|err| io::Error::new(io::ErrorKind::NotFound, err.to_string()))?;
                let local: SocketAddr = match target {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(target)?;
                socket.set_nonblocking(true)?;
                DatagramSocket::Udp(socket)
            }
        };
        Ok(socket)
    }
}

impl Destination for DatagramDestination {
    fn describe(&self) -> &str {
        &self.describe
    }

    fn state(&self) -> DestState {
        self.state
    }

    fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(DatagramSocket::as_raw_fd)
    }

    fn connect(&mut self) -> bool {
        match self.open() {
            Ok(socket) => {
                self.socket = Some(socket);
                self.state = DestState::Ready;
                true
            }
            Err(err) => {
                tracing::warn!(dest = %self.describe, error = %err, "connect failed");
                self.state = DestState::Error;
                false
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        self.state = DestState::Disconnected;
        match self.socket.take() {
            Some(socket) => sys::close(socket.into_fd()).is_ok(),
            None => true,
        }
    }

    fn write(&mut self, wire: &[u8], remaining: &mut usize) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            self.state = DestState::Error;
            return false;
        };
        // A datagram is all or nothing, so a retry always resends the whole record.
        *remaining = wire.len();
        send_datagram(socket.send(wire), remaining, &mut self.state, &self.describe)
    }

    fn timeout(&mut self) -> bool {
        true
    }
}

/// Builds the destination an endpoint names. Nothing is opened yet except
/// stdout; the delivery loop connects on first use.
pub fn open_destination(endpoint: &Endpoint) -> Result<Box<dyn Destination>, Error> {
    let destination: Box<dyn Destination> = match endpoint.kind {
        TransportKind::File if endpoint.is_standard_stream() => Box::new(
            FileDestination::stdout()
                .map_err(|err| Error::from_io(err).with_message("cannot duplicate stdout"))?,
        ),
        TransportKind::File => Box::new(FileDestination::path(&endpoint.resource)),
        TransportKind::Tcp => {
            resolve_socket_addr(&endpoint.resource)?;
            Box::new(TcpDestination::new(endpoint.resource.clone()))
        }
        TransportKind::Udp => {
            resolve_socket_addr(&endpoint.resource)?;
            Box::new(DatagramDestination::udp(endpoint.resource.clone()))
        }
        TransportKind::Unix => Box::new(DatagramDestination::unix(endpoint.resource.clone())),
    };
    Ok(destination)
}
