//! Purpose: Parse `KIND:RESOURCE` endpoint strings and resolve network resources.
//! Exports: `Endpoint`, `TransportKind`, `resolve_socket_addr`.
//! Role: Shared vocabulary between the CLI and source/destination setup.
//! Invariants: Kind names are matched case-insensitively; the resource is kept verbatim.
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    File,
    Tcp,
    Udp,
    Unix,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::File => "file",
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Unix => "unix",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "file" => Ok(TransportKind::File),
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            "unix" => Ok(TransportKind::Unix),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown transport kind '{input}'"))
                .with_hint("Use one of: file, tcp, udp, unix.")),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub resource: String,
}

impl Endpoint {
    pub fn new(kind: TransportKind, resource: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
        }
    }

    /// `file:-` names stdin for sources and stdout for destinations.
    pub fn is_standard_stream(&self) -> bool {
        self.kind == TransportKind::File && self.resource == "-"
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.resource)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((kind, resource)) = input.split_once(':') else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("endpoint '{input}' is missing a kind"))
                .with_hint("Endpoints look like KIND:RESOURCE, e.g. file:/var/log/app.log or tcp:514."));
        };
        if resource.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("endpoint '{input}' has an empty resource")));
        }
        Ok(Self {
            kind: kind.parse()?,
            resource: resource.to_string(),
        })
    }
}

/// Resolves `[host:]port`; a missing host means every local interface.
pub fn resolve_socket_addr(resource: &str) -> Result<SocketAddr, Error> {
    let (host, port) = match resource.rsplit_once(':') {
        Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
        None => ("", resource),
    };
    let port: u16 = port.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid port in '{resource}'"))
            .with_hint("Network resources look like [host:]port.")
    })?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };

    let mut candidates = (host, port).to_socket_addrs().map_err(|err| {
        Error::new(ErrorKind::NotFound)
            .with_message(format!("cannot resolve '{host}'"))
            .with_source(err)
    })?;
    candidates.next().ok_or_else(|| {
        Error::new(ErrorKind::NotFound).with_message(format!("'{host}' resolved to no addresses"))
    })
}
