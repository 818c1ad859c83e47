//! Purpose: Input sources the multiplexer polls: framed streams, TCP listeners, datagram sockets.
//! Exports: `Source`, `Reporter`, `ReadStatus`, `SourceKind`, `StreamSource`,
//! `ListenerSource`, `DatagramSource`, `open_source`.
//! Role: Turns readiness on one descriptor into zero or more `Record`s.
//! Invariants: A read never blocks; it consumes at most what the kernel reports as pending.
//! Invariants: Every produced record has passed the NUL sanitation policy.
//! Invariants: New sources discovered during a read are handed to the reporter, never registered directly.
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use bstr::ByteSlice;

use crate::core::error::Error;
use crate::core::frame::FrameBuffer;
use crate::core::record::{sanitize, Record};
use crate::core::sys;
use crate::endpoint::{resolve_socket_addr, Endpoint, TransportKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceKind {
    File,
    TcpListener,
    TcpConnection,
    Udp,
    Unix,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::File => "file",
            SourceKind::TcpListener => "tcp-listener",
            SourceKind::TcpConnection => "tcp-connection",
            SourceKind::Udp => "udp",
            SourceKind::Unix => "unix",
        })
    }
}

/// Outcome of servicing one ready source.
#[derive(Debug)]
pub enum ReadStatus {
    /// Still usable; poll it again.
    Open,
    /// End of input; remove it.
    Closed,
    /// Unrecoverable read failure; remove it.
    Failed(io::Error),
}

/// Receives what a source produced during one read.
pub trait Reporter {
    fn record(&mut self, record: Record);
    /// A record was dropped by sanitation, truncation, or overflow.
    fn discarded(&mut self);
    /// A source discovered mid-read (an accepted connection).
    fn add_source(&mut self, source: Box<dyn Source>);
}

pub trait Source: Send {
    fn kind(&self) -> SourceKind;
    fn resource(&self) -> &str;
    /// `None` when the descriptor cannot be resolved; such a source is rejected.
    fn fd(&self) -> Option<RawFd>;
    fn read(&mut self, reporter: &mut dyn Reporter) -> ReadStatus;
    /// Releases the descriptor; `false` if closing it failed.
    fn cleanup(self: Box<Self>) -> bool;
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A byte stream framed into newline-terminated records.
pub struct StreamSource {
    kind: SourceKind,
    resource: String,
    stream: Option<File>,
    frame: FrameBuffer,
}

impl StreamSource {
    pub fn new(kind: SourceKind, resource: impl Into<String>, fd: OwnedFd, capacity: usize) -> Self {
        Self {
            kind,
            resource: resource.into(),
            stream: Some(File::from(fd)),
            frame: FrameBuffer::new(capacity),
        }
    }
}

impl Source for StreamSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn read(&mut self, reporter: &mut dyn Reporter) -> ReadStatus {
        let Some(stream) = self.stream.as_mut() else {
            return ReadStatus::Closed;
        };
        let pending = match sys::bytes_available(stream.as_raw_fd()) {
            Ok(0) => return ReadStatus::Closed,
            Ok(pending) => pending,
            Err(err) if is_transient(&err) => return ReadStatus::Open,
            Err(err) => return ReadStatus::Failed(err),
        };

        let spare = self.frame.spare_mut();
        let want = spare.len().min(pending);
        match stream.read(&mut spare[..want]) {
            Ok(0) => return ReadStatus::Closed,
            Ok(read) => self.frame.advance(read),
            Err(err) if is_transient(&err) => return ReadStatus::Open,
            Err(err) => return ReadStatus::Failed(err),
        }

        let outcome = self.frame.extract(|line| match sanitize(line) {
            Some(record) => reporter.record(record),
            None => reporter.discarded(),
        });
        if outcome.overflowed {
            tracing::warn!(
                source = %self.resource,
                capacity = self.frame.capacity(),
                "record exceeds buffer capacity, discarding until next newline"
            );
            reporter.discarded();
        }
        if outcome.resynced {
            tracing::debug!(source = %self.resource, "resynchronized after oversized record");
        }
        ReadStatus::Open
    }

    fn cleanup(mut self: Box<Self>) -> bool {
        if !self.frame.is_empty() {
            tracing::debug!(
                source = %self.resource,
                pending = self.frame.capacity() - self.frame.available(),
                "dropping unterminated trailing bytes"
            );
        }
        match self.stream.take() {
            Some(stream) => sys::close(OwnedFd::from(stream)).is_ok(),
            None => true,
        }
    }
}

/// Accepts TCP connections and reports each one as a new framed stream.
pub struct ListenerSource {
    resource: String,
    listener: TcpListener,
    capacity: usize,
}

impl ListenerSource {
    pub fn new(resource: impl Into<String>, listener: TcpListener, capacity: usize) -> Self {
        Self {
            resource: resource.into(),
            listener,
            capacity,
        }
    }

    fn connection(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<StreamSource> {
        stream.set_nonblocking(true)?;
        Ok(StreamSource::new(
            SourceKind::TcpConnection,
            peer.to_string(),
            OwnedFd::from(stream),
            self.capacity,
        ))
    }
}

impl Source for ListenerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::TcpListener
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
    }

    fn read(&mut self, reporter: &mut dyn Reporter) -> ReadStatus {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.connection(stream, peer) {
                    Ok(source) => {
                        tracing::info!(listener = %self.resource, %peer, "accepted connection");
                        reporter.add_source(Box::new(source));
                    }
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "could not prepare accepted connection");
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return ReadStatus::Open,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(err) => return ReadStatus::Failed(err),
            }
        }
    }

    fn cleanup(self: Box<Self>) -> bool {
        sys::close(OwnedFd::from(self.listener)).is_ok()
    }
}

/// One datagram per read, at most one record per datagram. Serves both
/// `udp:` and `unix:` sockets.
pub struct DatagramSource {
    kind: SourceKind,
    resource: String,
    socket: OwnedFd,
    // One byte past `limit` so an oversized datagram shows up even without MSG_TRUNC.
    buf: Vec<u8>,
    limit: usize,
}

impl DatagramSource {
    pub fn new(
        kind: SourceKind,
        resource: impl Into<String>,
        socket: impl Into<OwnedFd>,
        capacity: usize,
    ) -> Self {
        Self {
            kind,
            resource: resource.into(),
            socket: socket.into(),
            buf: vec![0u8; capacity + 1],
            limit: capacity,
        }
    }
}

impl Source for DatagramSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn read(&mut self, reporter: &mut dyn Reporter) -> ReadStatus {
        let len = match sys::recv_datagram(self.socket.as_raw_fd(), &mut self.buf) {
            Ok(len) => len,
            Err(err) if is_transient(&err) => return ReadStatus::Open,
            Err(err) => return ReadStatus::Failed(err),
        };
        if len == 0 {
            return ReadStatus::Open;
        }
        if len > self.limit {
            tracing::warn!(
                source = %self.resource,
                size = len,
                capacity = self.limit,
                "datagram truncated, discarded"
            );
            reporter.discarded();
            return ReadStatus::Open;
        }

        let datagram = &self.buf[..len];
        let payload = datagram.strip_suffix(b"\n").unwrap_or(datagram);
        match sanitize(payload.to_vec()) {
            Some(record) => reporter.record(record),
            None => {
                tracing::debug!(source = %self.resource, datagram = %datagram.as_bstr(), "datagram dropped");
                reporter.discarded();
            }
        }
        ReadStatus::Open
    }

    fn cleanup(self: Box<Self>) -> bool {
        sys::close(self.socket).is_ok()
    }
}

fn setup_error(endpoint: &Endpoint, err: io::Error) -> Error {
    Error::from_io(err).with_message(format!("cannot open source {endpoint}"))
}

/// Sets up the source an endpoint names. `capacity` bounds one record.
pub fn open_source(endpoint: &Endpoint, capacity: usize) -> Result<Box<dyn Source>, Error> {
    match endpoint.kind {
        TransportKind::File => {
            let fd = if endpoint.is_standard_stream() {
                io::stdin()
                    .as_fd()
                    .try_clone_to_owned()
                    .map_err(|err| setup_error(endpoint, err))?
            } else {
                let path = Path::new(&endpoint.resource);
                let file = File::open(path)
                    .map_err(|err| setup_error(endpoint, err).with_path(path))?;
                OwnedFd::from(file)
            };
            Ok(Box::new(StreamSource::new(
                SourceKind::File,
                endpoint.resource.clone(),
                fd,
                capacity,
            )))
        }
        TransportKind::Tcp => {
            let addr = resolve_socket_addr(&endpoint.resource)?;
            let listener = TcpListener::bind(addr).map_err(|err| setup_error(endpoint, err))?;
            listener
                .set_nonblocking(true)
                .map_err(|err| setup_error(endpoint, err))?;
            tracing::info!(%addr, "listening for tcp connections");
            Ok(Box::new(ListenerSource::new(
                endpoint.resource.clone(),
                listener,
                capacity,
            )))
        }
        TransportKind::Udp => {
            let addr = resolve_socket_addr(&endpoint.resource)?;
            let socket = UdpSocket::bind(addr).map_err(|err| setup_error(endpoint, err))?;
            socket
                .set_nonblocking(true)
                .map_err(|err| setup_error(endpoint, err))?;
            tracing::info!(%addr, "listening for udp datagrams");
            Ok(Box::new(DatagramSource::new(
                SourceKind::Udp,
                endpoint.resource.clone(),
                socket,
                capacity,
            )))
        }
        TransportKind::Unix => {
            let socket = unix_datagram(Path::new(&endpoint.resource))
                .map_err(|err| setup_error(endpoint, err).with_path(&endpoint.resource))?;
            socket
                .set_nonblocking(true)
                .map_err(|err| setup_error(endpoint, err))?;
            Ok(Box::new(DatagramSource::new(
                SourceKind::Unix,
                endpoint.resource.clone(),
                socket,
                capacity,
            )))
        }
    }
}

// Attach to a peer already serving `path`, otherwise own the path.
fn unix_datagram(path: &Path) -> io::Result<UnixDatagram> {
    let socket = UnixDatagram::unbound()?;
    match socket.connect(path) {
        Ok(()) => Ok(socket),
        Err(_) => UnixDatagram::bind(path).map_err(|err| {
            if err.kind() == io::ErrorKind::AddrInUse {
                io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} exists but nothing is listening on it", path.display()),
                )
            } else {
                err
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Collected {
        records: Vec<Record>,
        discarded: usize,
        added: Vec<Box<dyn Source>>,
    }

    impl Reporter for Collected {
        fn record(&mut self, record: Record) {
            self.records.push(record);
        }

        fn discarded(&mut self) {
            self.discarded += 1;
        }

        fn add_source(&mut self, source: Box<dyn Source>) {
            self.added.push(source);
        }
    }

    fn payloads(records: &[Record]) -> Vec<&[u8]> {
        records.iter().map(Record::payload).collect()
    }

    fn stream_pair(capacity: usize) -> (UnixStream, StreamSource) {
        let (writer, reader) = UnixStream::pair().expect("pair");
        reader.set_nonblocking(true).expect("nonblocking");
        let source = StreamSource::new(SourceKind::File, "pair", OwnedFd::from(reader), capacity);
        (writer, source)
    }

    fn read_until<F: Fn(&Collected) -> bool>(
        source: &mut dyn Source,
        sink: &mut Collected,
        done: F,
    ) -> ReadStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        let fd = source.fd().expect("fd");
        loop {
            let mut fds = [sys::poll_entry(fd, sys::READABLE)];
            let ready = sys::poll(&mut fds, Some(Duration::from_millis(50))).expect("poll");
            let status = if ready > 0 {
                source.read(sink)
            } else {
                ReadStatus::Open
            };
            if !matches!(status, ReadStatus::Open) || done(sink) || Instant::now() > deadline {
                return status;
            }
        }
    }

    #[test]
    fn stream_frames_lines_across_reads() {
        let (mut writer, source) = stream_pair(64);
        let mut source: Box<dyn Source> = Box::new(source);
        let mut sink = Collected::default();

        writer.write_all(b"al").expect("write");
        assert!(matches!(source.read(&mut sink), ReadStatus::Open));
        assert!(sink.records.is_empty());

        writer.write_all(b"pha\nbeta\n\ngam").expect("write");
        read_until(source.as_mut(), &mut sink, |sink| sink.records.len() == 3);
        assert_eq!(payloads(&sink.records), vec![&b"alpha"[..], b"beta", b""]);

        drop(writer);
        let status = read_until(source.as_mut(), &mut sink, |_| false);
        assert!(matches!(status, ReadStatus::Closed));
        assert!(source.cleanup());
    }

    #[test]
    fn stream_discards_oversized_line_and_recovers() {
        let (mut writer, source) = stream_pair(8);
        let mut source: Box<dyn Source> = Box::new(source);
        let mut sink = Collected::default();

        writer.write_all(b"0123456789abcdef\nok\n").expect("write");
        read_until(source.as_mut(), &mut sink, |sink| !sink.records.is_empty());
        assert_eq!(payloads(&sink.records), vec![&b"ok"[..]]);
        assert!(sink.discarded >= 1);
    }

    #[test]
    fn stream_applies_nul_policy() {
        let (mut writer, source) = stream_pair(64);
        let mut source: Box<dyn Source> = Box::new(source);
        let mut sink = Collected::default();

        writer.write_all(b"trail\0\0\nem\0bed\nclean\n").expect("write");
        read_until(source.as_mut(), &mut sink, |sink| sink.records.len() == 2);
        assert_eq!(payloads(&sink.records), vec![&b"trail"[..], b"clean"]);
        assert_eq!(sink.discarded, 1);
    }

    #[test]
    fn file_source_reads_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input.log");
        std::fs::write(&path, b"one\ntwo\npartial").expect("write");

        let endpoint = Endpoint::new(TransportKind::File, path.to_string_lossy());
        let mut source = open_source(&endpoint, 1024).expect("open");
        assert_eq!(source.kind(), SourceKind::File);
        let mut sink = Collected::default();
        let status = read_until(source.as_mut(), &mut sink, |_| false);
        assert!(matches!(status, ReadStatus::Closed));
        assert_eq!(payloads(&sink.records), vec![&b"one"[..], b"two"]);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = Endpoint::new(
            TransportKind::File,
            dir.path().join("absent").to_string_lossy(),
        );
        let err = open_source(&endpoint, 16).err().expect("error");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn listener_reports_accepted_connections() {
        let endpoint = Endpoint::new(TransportKind::Tcp, "127.0.0.1:0");
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let addr = listener.local_addr().expect("addr");
        let mut source: Box<dyn Source> =
            Box::new(ListenerSource::new(endpoint.resource, listener, 64));

        let mut client = TcpStream::connect(addr).expect("connect");
        let mut sink = Collected::default();
        read_until(source.as_mut(), &mut sink, |sink| !sink.added.is_empty());
        assert_eq!(sink.added.len(), 1);

        let mut connection = sink.added.pop().expect("connection");
        assert_eq!(connection.kind(), SourceKind::TcpConnection);
        client.write_all(b"over tcp\n").expect("write");
        let mut lines = Collected::default();
        read_until(connection.as_mut(), &mut lines, |sink| !sink.records.is_empty());
        assert_eq!(payloads(&lines.records), vec![&b"over tcp"[..]]);
    }

    #[test]
    fn datagram_source_one_record_per_datagram() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        socket.set_nonblocking(true).expect("nonblocking");
        let addr = socket.local_addr().expect("addr");
        let mut source: Box<dyn Source> =
            Box::new(DatagramSource::new(SourceKind::Udp, "udp", socket, 16));

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        sender.send_to(b"first\n", addr).expect("send");
        sender.send_to(b"second", addr).expect("send");
        sender.send_to(b"bad\0byte", addr).expect("send");

        let mut sink = Collected::default();
        read_until(source.as_mut(), &mut sink, |sink| {
            sink.records.len() + sink.discarded == 3
        });
        assert_eq!(payloads(&sink.records), vec![&b"first"[..], b"second"]);
        assert_eq!(sink.discarded, 1);
    }

    #[test]
    fn truncated_datagram_is_discarded() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        socket.set_nonblocking(true).expect("nonblocking");
        let addr = socket.local_addr().expect("addr");
        let mut source: Box<dyn Source> =
            Box::new(DatagramSource::new(SourceKind::Udp, "udp", socket, 4));

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        sender.send_to(b"too long\n", addr).expect("send");
        sender.send_to(b"ok\n", addr).expect("send");

        let mut sink = Collected::default();
        read_until(source.as_mut(), &mut sink, |sink| !sink.records.is_empty());
        assert_eq!(payloads(&sink.records), vec![&b"ok"[..]]);
        assert_eq!(sink.discarded, 1);
    }

    #[test]
    fn unix_source_binds_when_nothing_listens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.sock");
        let endpoint = Endpoint::new(TransportKind::Unix, path.to_string_lossy());
        let mut source = open_source(&endpoint, 64).expect("open");
        assert!(path.exists());

        let client = UnixDatagram::unbound().expect("unbound");
        client.send_to(b"via unix\n", &path).expect("send");
        let mut sink = Collected::default();
        read_until(source.as_mut(), &mut sink, |sink| !sink.records.is_empty());
        assert_eq!(payloads(&sink.records), vec![&b"via unix"[..]]);
        assert_eq!(source.kind(), SourceKind::Unix);
    }

    fn unix_source(
        dir: &tempfile::TempDir,
        capacity: usize,
    ) -> (std::path::PathBuf, Box<dyn Source>) {
        let path = dir.path().join("relay.sock");
        let endpoint = Endpoint::new(TransportKind::Unix, path.to_string_lossy());
        let source = open_source(&endpoint, capacity).expect("open");
        (path, source)
    }

    #[test]
    fn unix_datagrams_stay_whole_past_buffer_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (path, mut source) = unix_source(&dir, 16);
        let client = UnixDatagram::unbound().expect("unbound");
        client.send_to(b"abcdefghij\n", &path).expect("send");
        client.send_to(b"0123456789\n", &path).expect("send");
        client.send_to(b"x\n", &path).expect("send");

        let mut sink = Collected::default();
        read_until(source.as_mut(), &mut sink, |sink| sink.records.len() == 3);
        assert_eq!(
            payloads(&sink.records),
            vec![&b"abcdefghij"[..], b"0123456789", b"x"]
        );
        assert_eq!(sink.discarded, 0);
    }

    #[test]
    fn empty_unix_datagram_keeps_source_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (path, mut source) = unix_source(&dir, 16);
        let client = UnixDatagram::unbound().expect("unbound");
        client.send_to(b"", &path).expect("send");
        client.send_to(b"after\n", &path).expect("send");

        let mut sink = Collected::default();
        let status = read_until(source.as_mut(), &mut sink, |sink| !sink.records.is_empty());
        assert!(matches!(status, ReadStatus::Open));
        assert_eq!(payloads(&sink.records), vec![&b"after"[..]]);
    }

    #[test]
    fn oversized_unix_datagram_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (path, mut source) = unix_source(&dir, 8);
        let client = UnixDatagram::unbound().expect("unbound");
        client.send_to(b"much too long\n", &path).expect("send");
        client.send_to(b"fits\n", &path).expect("send");

        let mut sink = Collected::default();
        read_until(source.as_mut(), &mut sink, |sink| !sink.records.is_empty());
        assert_eq!(payloads(&sink.records), vec![&b"fits"[..]]);
        assert_eq!(sink.discarded, 1);
    }
}
