//! The human-readable header format (section 2.1).
//!
//! > PROXY TCP4 255.255.255.255 255.255.255.255 65535 65535\r\n

use crate::{ErrorKind, NetworkAddress, Parser, ProxyInfo, TransportProtocol, Version};
use bytes::{Buf, BufMut as _, Bytes, BytesMut};
use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};
use std::{
    io::Write as _,
    net::{AddrParseError, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::Utf8Error,
};

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

/// The literal every v1 header starts with.
pub const PREFIX: &[u8] = b"PROXY ";

/// The longest a v1 line may be, CRLF included.
pub const MAX_LINE_LENGTH: usize = 108;

#[derive(Debug, Snafu)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ParseError {
    #[snafu(display("the line does not start with \"PROXY \""))]
    NotProxyLine,

    #[snafu(display("no CRLF within the first {} bytes", MAX_LINE_LENGTH))]
    HeaderTooLong { buffered: usize },

    #[snafu(display("unsupported network protocol"))]
    InvalidNetworkProtocol,

    #[snafu(display("the line ends before all addresses and ports are given"))]
    MissingAddressData,

    #[snafu(display("the given input is not valid ascii text"))]
    NonAscii { source: Utf8Error },

    #[snafu(display("invalid ip address"))]
    InvalidAddress { source: AddrParseError },

    #[snafu(display("invalid port"))]
    InvalidPort,
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::InvalidNetworkProtocol => ErrorKind::InvalidNetworkProtocol,
            ParseError::MissingAddressData => ErrorKind::MissingAddressData,
            _ => ErrorKind::InvalidProxyHeader,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum EncodeError {
    #[snafu(display("the source and destination are not of the same family"))]
    MismatchedAddressFamilies,

    #[snafu(display("could not write to the buffer"))]
    StdIo { source: std::io::Error },
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
enum NetworkProtocol {
    Tcp4,
    Tcp6,
    Unknown,
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(2).position(|w| w == [CR, LF])
}

/// Accumulates a v1 header line across reads.
#[derive(Debug, Default)]
pub struct V1Parser {
    buffer: BytesMut,
}

impl V1Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and try to complete the header.
    ///
    /// Returns `Ok(None)` until a CRLF arrives. Once it does, the info is
    /// returned along with every byte received after the CRLF; those belong
    /// to the proxied stream.
    ///
    /// The CRLF must be found within the first [MAX_LINE_LENGTH] bytes. A
    /// single large feed is fine as long as the line itself is short.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<(ProxyInfo, Bytes)>, ParseError> {
        self.buffer.extend_from_slice(data);

        let window = &self.buffer[..self.buffer.len().min(MAX_LINE_LENGTH)];
        let end = match find_crlf(window) {
            Some(end) => end + 2,
            None => {
                ensure!(
                    self.buffer.len() < MAX_LINE_LENGTH,
                    HeaderTooLong {
                        buffered: self.buffer.len(),
                    },
                );
                return Ok(None);
            }
        };

        let header = self.buffer.split_to(end).freeze();
        let remainder = self.buffer.split().freeze();
        let info = parse_line(header)?;
        Ok(Some((info, remainder)))
    }
}

impl Parser for V1Parser {
    type Error = ParseError;

    fn feed(&mut self, data: &[u8]) -> Result<Option<(ProxyInfo, Bytes)>, ParseError> {
        V1Parser::feed(self, data)
    }
}

/// Parse a complete v1 line from the given buffer.
///
/// Everything up to and including the first CRLF is consumed. If there is no
/// CRLF, the whole buffer is taken to be the line.
pub fn parse(buf: &mut impl Buf) -> Result<ProxyInfo, ParseError> {
    let length = match find_crlf(buf.chunk()) {
        Some(end) => end + 2,
        None => buf.remaining(),
    };
    parse_line(buf.copy_to_bytes(length))
}

fn split_token(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|&b| b == b' ') {
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => (line, &[]),
    }
}

fn parse_line(header: Bytes) -> Result<ProxyInfo, ParseError> {
    let line = header.strip_suffix(&[CR, LF][..]).unwrap_or(&header[..]);
    let line = line.strip_prefix(PREFIX).context(NotProxyLine)?;

    let (protocol, rest) = split_token(line);
    let protocol = match protocol {
        b"TCP4" => NetworkProtocol::Tcp4,
        b"TCP6" => NetworkProtocol::Tcp6,
        b"UNKNOWN" => NetworkProtocol::Unknown,
        _ => return InvalidNetworkProtocol.fail(),
    };

    // Whatever follows UNKNOWN is deliberately ignored.
    if protocol == NetworkProtocol::Unknown {
        return Ok(ProxyInfo::unknown(Version::V1, header));
    }

    let mut fields = rest.split(|&b| b == b' ');
    let source = next_field(&mut fields)?;
    let destination = next_field(&mut fields)?;
    let source_port = parse_port(next_field(&mut fields)?)?;
    let destination_port = parse_port(next_field(&mut fields)?)?;

    let (source, destination) = match protocol {
        NetworkProtocol::Tcp4 => (
            NetworkAddress::Ipv4 {
                transport: TransportProtocol::Stream,
                address: SocketAddrV4::new(
                    source.parse::<Ipv4Addr>().context(InvalidAddress)?,
                    source_port,
                ),
            },
            NetworkAddress::Ipv4 {
                transport: TransportProtocol::Stream,
                address: SocketAddrV4::new(
                    destination.parse::<Ipv4Addr>().context(InvalidAddress)?,
                    destination_port,
                ),
            },
        ),
        NetworkProtocol::Tcp6 => (
            NetworkAddress::Ipv6 {
                transport: TransportProtocol::Stream,
                address: SocketAddrV6::new(
                    source.parse::<Ipv6Addr>().context(InvalidAddress)?,
                    source_port,
                    0,
                    0,
                ),
            },
            NetworkAddress::Ipv6 {
                transport: TransportProtocol::Stream,
                address: SocketAddrV6::new(
                    destination.parse::<Ipv6Addr>().context(InvalidAddress)?,
                    destination_port,
                    0,
                    0,
                ),
            },
        ),
        NetworkProtocol::Unknown => unreachable!("unknown should have its own branch"),
    };

    Ok(ProxyInfo::proxied(Version::V1, header, source, destination))
}

fn next_field<'a>(fields: &mut impl Iterator<Item = &'a [u8]>) -> Result<&'a str, ParseError> {
    let field = fields.next().context(MissingAddressData)?;
    std::str::from_utf8(field).context(NonAscii)
}

fn parse_port(port: &str) -> Result<u16, ParseError> {
    // u16::from_str would also take a leading '+'.
    ensure!(
        !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        InvalidPort,
    );
    port.parse().ok().context(InvalidPort)
}

/// Serialize a v1 line conveying the given endpoints.
pub fn encode(source: SocketAddr, destination: SocketAddr) -> Result<BytesMut, EncodeError> {
    let family = match (source, destination) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => "TCP4",
        (SocketAddr::V6(_), SocketAddr::V6(_)) => "TCP6",
        _ => return MismatchedAddressFamilies.fail(),
    };

    // Reserve as much data as we're gonna need -- at most.
    let mut buf = BytesMut::with_capacity(MAX_LINE_LENGTH).writer();
    write!(
        buf,
        "PROXY {} {} {} {} {}\r\n",
        family,
        source.ip(),
        destination.ip(),
        source.port(),
        destination.port(),
    )
    .context(StdIo)?;

    Ok(buf.into_inner())
}

/// Serialize a v1 line which conveys no addresses.
pub fn encode_unknown() -> BytesMut {
    BytesMut::from(&b"PROXY UNKNOWN\r\n"[..])
}
