//! # Receiving the HAProxy PROXY protocol.
//!
//! This crate parses PROXY protocol headers incrementally as they arrive on
//! a connection, and wraps connections so that the protocol behind the
//! proxy sees the original client's addresses.
//!
//! The protocol has been implemented per the specification available here:
//! <https://www.haproxy.org/download/2.4/doc/proxy-protocol.txt>
//!
//! * [version1] and [version2] hold the parsers for the two header formats.
//! * [HeaderDecoder] sniffs which format a connection uses and drives the
//!   matching parser.
//! * [ProtocolWrapper] puts a decoder in front of any [Protocol].
//! * `endpoint` (feature `endpoint`) does the same for tokio streams.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod config;
mod decoder;
#[cfg(feature = "endpoint")]
pub mod endpoint;
mod info;
pub mod version1;
pub mod version2;
pub mod wrapper;

pub use config::ProxyProtocolConfig;
pub use decoder::{HeaderDecoder, Progress};
pub use info::{NetworkAddress, ProxyInfo, TransportProtocol, Version};
pub use wrapper::{Protocol, ProtocolFactory, ProtocolWrapper, Transport, WrappingFactory};

use bytes::{Buf, Bytes};
use snafu::{ensure, ResultExt as _, Snafu};

/// The broad class of a header error.
///
/// Every kind means the header is invalid; the other two narrow down why a
/// v1 line was rejected.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ErrorKind {
    /// The header is malformed.
    InvalidProxyHeader,

    /// The declared network protocol is not one we support.
    InvalidNetworkProtocol,

    /// The header promised addresses but ended before giving them.
    MissingAddressData,
}

#[derive(Debug, Snafu)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)] // A new version may be added
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum Error {
    /// This is not a PROXY header at all.
    #[snafu(display("the given data is not a PROXY header"))]
    NotProxyHeader,

    /// The header is well-formed, but this version is not accepted.
    #[snafu(display("PROXY {} headers are not accepted", version))]
    VersionDisabled { version: Version },

    /// An error occurred while parsing version 1.
    #[snafu(display("there was an error while parsing the v1 header: {}", source))]
    Version1 { source: version1::ParseError },

    /// An error occurred while parsing version 2.
    #[snafu(display("there was an error while parsing the v2 header: {}", source))]
    Version2 { source: version2::ParseError },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Version1 { source } => source.kind(),
            Error::Version2 { source } => source.kind(),
            _ => ErrorKind::InvalidProxyHeader,
        }
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The incremental interface shared by both header parsers.
///
/// A parser owns the bytes fed to it until the header is complete. It then
/// hands back the [ProxyInfo] and everything it was given past the header.
/// A parser which returned an error must be discarded.
pub trait Parser {
    type Error: std::error::Error + 'static;

    /// Append `data`, returning `Ok(None)` while the header is incomplete.
    fn feed(&mut self, data: &[u8]) -> Result<Option<(ProxyInfo, Bytes)>, Self::Error>;
}

fn parse_version(buf: &impl Buf) -> Result<Version> {
    let chunk = buf.chunk();

    // V1 is the only version that starts with "PROXY" (0x50 0x52 0x4F 0x58
    // 0x59), and we can therefore decide version based on that.
    if chunk.starts_with(version1::PREFIX) {
        return Ok(Version::V1);
    }

    ensure!(chunk.starts_with(&version2::SIGNATURE[..]), NotProxyHeader);
    Ok(Version::V2)
}

/// Parse a PROXY header of either version from the given buffer.
///
/// The header is consumed; whatever follows it stays in `buf`.
///
/// NOTE: The buffer must have a continuous representation of the inner data
/// available through [Buf::chunk], at the very least for the header. Data that
/// follows may be chunked as you wish.
pub fn parse(buf: &mut impl Buf) -> Result<ProxyInfo> {
    match parse_version(&*buf)? {
        Version::V1 => version1::parse(buf).context(Version1),
        Version::V2 => version2::parse(buf).context(Version2),
    }
}
