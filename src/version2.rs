//! The binary header format (section 2.2).

use crate::{ErrorKind, NetworkAddress, Parser, ProxyInfo, TransportProtocol, Version};
use bytes::{Buf, BufMut as _, Bytes, BytesMut};
use snafu::{ensure, Snafu};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

/// The 12 bytes every v2 header starts with.
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Signature, version/command, family/protocol and the block length.
pub const FIXED_HEADER_LENGTH: usize = 16;

const INET_BLOCK_LENGTH: usize = 4 + 4 + 2 + 2;
const INET6_BLOCK_LENGTH: usize = 16 + 16 + 2 + 2;
const UNIX_PATH_LENGTH: usize = 108;
const UNIX_BLOCK_LENGTH: usize = UNIX_PATH_LENGTH * 2;

#[derive(Debug, Snafu)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ParseError {
    #[snafu(display(
        "segment too small: got {} bytes, the first read must hold {}",
        given,
        FIXED_HEADER_LENGTH
    ))]
    SegmentTooSmall { given: usize },

    #[snafu(display("an unexpected eof was hit: needed {} bytes, got {}", needs, given))]
    UnexpectedEof { given: usize, needs: usize },

    #[snafu(display("the v2 signature does not match"))]
    InvalidSignature,

    #[snafu(display("the version {} is invalid", version))]
    InvalidVersion { version: u8 },

    #[snafu(display("invalid command: {}", cmd))]
    UnknownCommand { cmd: u8 },

    #[snafu(display("invalid address family: {}", family))]
    UnknownAddressFamily { family: u8 },

    #[snafu(display("invalid transport protocol: {}", protocol))]
    UnknownTransportProtocol { protocol: u8 },

    #[snafu(display("insufficient length specified: {}, requires minimum {}", given, needs))]
    InsufficientLengthSpecified { given: usize, needs: usize },
}

impl ParseError {
    /// Every structural violation in a binary header is reported as a plain
    /// invalid header.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidProxyHeader
    }
}

#[derive(Debug, Snafu)]
pub enum EncodeError {
    #[snafu(display("the source and destination are not of the same family"))]
    MismatchedAddressFamilies,

    #[snafu(display("unix socket path is {} bytes, at most {} fit", length, UNIX_PATH_LENGTH))]
    UnixPathTooLong { length: usize },
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Command {
    /// Sent on connections the proxy made on its own, e.g. health checks.
    Local,

    /// Sent on relayed connections.
    Proxy,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum AddressFamily {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

/// Accumulates a v2 header across reads.
#[derive(Debug, Default)]
pub struct V2Parser {
    buffer: BytesMut,
}

impl V2Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and try to complete the header.
    ///
    /// The first call must supply at least the [FIXED_HEADER_LENGTH] fixed
    /// bytes, since the total header size is only known once the length
    /// field is read. After that the header may trickle in.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<(ProxyInfo, Bytes)>, ParseError> {
        self.buffer.extend_from_slice(data);
        ensure!(
            self.buffer.len() >= FIXED_HEADER_LENGTH,
            SegmentTooSmall {
                given: self.buffer.len(),
            },
        );

        let size = header_size(&self.buffer);
        if self.buffer.len() < size {
            return Ok(None);
        }

        let header = self.buffer.split_to(size).freeze();
        let remainder = self.buffer.split().freeze();
        let info = parse_header(header)?;
        Ok(Some((info, remainder)))
    }
}

impl Parser for V2Parser {
    type Error = ParseError;

    fn feed(&mut self, data: &[u8]) -> Result<Option<(ProxyInfo, Bytes)>, ParseError> {
        V2Parser::feed(self, data)
    }
}

fn header_size(fixed: &[u8]) -> usize {
    FIXED_HEADER_LENGTH + u16::from_be_bytes([fixed[14], fixed[15]]) as usize
}

/// Parse a complete v2 header from the given buffer.
///
/// Exactly the header is consumed; data that follows stays in `buf`.
///
/// NOTE: The fixed 16 bytes must be available through [Buf::chunk]. The
/// address block may be chunked as you wish.
pub fn parse(buf: &mut impl Buf) -> Result<ProxyInfo, ParseError> {
    let fixed = buf.chunk();
    ensure!(
        fixed.len() >= FIXED_HEADER_LENGTH,
        SegmentTooSmall { given: fixed.len() },
    );

    let size = header_size(fixed);
    ensure!(
        buf.remaining() >= size,
        UnexpectedEof {
            given: buf.remaining(),
            needs: size,
        },
    );
    parse_header(buf.copy_to_bytes(size))
}

fn parse_header(header: Bytes) -> Result<ProxyInfo, ParseError> {
    // > struct proxy_hdr_v2 {
    // >     uint8_t sig[12];  /* hex 0D 0A 0D 0A 00 0D 0A 51 55 49 54 0A */
    // >     uint8_t ver_cmd;  /* protocol version and command */
    // >     uint8_t fam;      /* protocol family and address */
    // >     uint16_t len;     /* number of following bytes part of the header */
    // > };
    let mut buf = &header[..];
    ensure!(buf[..12] == SIGNATURE, InvalidSignature);
    buf.advance(12);

    let ver_cmd = buf.get_u8();
    let version = ver_cmd >> 4;
    ensure!(version == 2, InvalidVersion { version });
    let command = match ver_cmd & 0x0F {
        0 => Command::Local,
        1 => Command::Proxy,
        cmd => return UnknownCommand { cmd }.fail(),
    };

    let fam = buf.get_u8();
    let address_family = match fam >> 4 {
        0 => AddressFamily::Unspec,
        1 => AddressFamily::Inet,
        2 => AddressFamily::Inet6,
        3 => AddressFamily::Unix,
        family => return UnknownAddressFamily { family }.fail(),
    };
    let transport_protocol = match fam & 0x0F {
        0 => None,
        1 => Some(TransportProtocol::Stream),
        2 => Some(TransportProtocol::Datagram),
        protocol => return UnknownTransportProtocol { protocol }.fail(),
    };

    let length = buf.get_u16() as usize;

    // The receiver must use the real connection endpoints for LOCAL, and
    // should ignore the address block when anything is unspecified. The block
    // is part of the header either way.
    let transport = match (command, address_family, transport_protocol) {
        (Command::Local, _, _) | (_, AddressFamily::Unspec, _) | (_, _, None) => {
            return Ok(ProxyInfo::unknown(Version::V2, header));
        }
        (Command::Proxy, _, Some(transport)) => transport,
    };

    // > union proxy_addr {
    // >     struct {        /* for TCP/UDP over IPv4, len = 12 */
    // >         uint32_t src_addr;
    // >         uint32_t dst_addr;
    // >         uint16_t src_port;
    // >         uint16_t dst_port;
    // >     } ipv4_addr;
    // >     struct {        /* for TCP/UDP over IPv6, len = 36 */
    // >          uint8_t  src_addr[16];
    // >          uint8_t  dst_addr[16];
    // >          uint16_t src_port;
    // >          uint16_t dst_port;
    // >     } ipv6_addr;
    // >     struct {        /* for AF_UNIX sockets, len = 216 */
    // >          uint8_t src_addr[108];
    // >          uint8_t dst_addr[108];
    // >     } unix_addr;
    // > };
    //
    // Anything past the family's block is TLVs, which we skip.
    let needs = match address_family {
        AddressFamily::Inet => INET_BLOCK_LENGTH,
        AddressFamily::Inet6 => INET6_BLOCK_LENGTH,
        AddressFamily::Unix => UNIX_BLOCK_LENGTH,
        AddressFamily::Unspec => unreachable!("unspec returned above"),
    };
    ensure!(
        length >= needs,
        InsufficientLengthSpecified {
            given: length,
            needs,
        },
    );

    let (source, destination) = match address_family {
        AddressFamily::Inet => {
            let mut data = [0u8; 4];
            buf.copy_to_slice(&mut data);
            let source = Ipv4Addr::from(data);
            buf.copy_to_slice(&mut data);
            let destination = Ipv4Addr::from(data);
            let source_port = buf.get_u16();
            let destination_port = buf.get_u16();

            (
                NetworkAddress::Ipv4 {
                    transport,
                    address: SocketAddrV4::new(source, source_port),
                },
                NetworkAddress::Ipv4 {
                    transport,
                    address: SocketAddrV4::new(destination, destination_port),
                },
            )
        }
        AddressFamily::Inet6 => {
            let mut data = [0u8; 16];
            buf.copy_to_slice(&mut data);
            let source = Ipv6Addr::from(data);
            buf.copy_to_slice(&mut data);
            let destination = Ipv6Addr::from(data);
            let source_port = buf.get_u16();
            let destination_port = buf.get_u16();

            (
                NetworkAddress::Ipv6 {
                    transport,
                    address: SocketAddrV6::new(source, source_port, 0, 0),
                },
                NetworkAddress::Ipv6 {
                    transport,
                    address: SocketAddrV6::new(destination, destination_port, 0, 0),
                },
            )
        }
        AddressFamily::Unix => {
            let start = FIXED_HEADER_LENGTH;
            let source = unix_path(transport, header.slice(start..start + UNIX_PATH_LENGTH));
            let start = start + UNIX_PATH_LENGTH;
            let destination =
                unix_path(transport, header.slice(start..start + UNIX_PATH_LENGTH));
            (source, destination)
        }
        AddressFamily::Unspec => unreachable!("unspec returned above"),
    };

    Ok(ProxyInfo::proxied(Version::V2, header, source, destination))
}

fn unix_path(transport: TransportProtocol, mut raw: Bytes) -> NetworkAddress {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |idx| idx + 1);
    raw.truncate(end);
    NetworkAddress::Unix {
        transport,
        path: raw,
    }
}

/// Serialize a v2 header.
///
/// `addresses` is ignored for [Command::Local]; a [Command::Proxy] header
/// without addresses is sent with the UNSPEC family.
pub fn encode(
    command: Command,
    addresses: Option<(&NetworkAddress, &NetworkAddress)>,
) -> Result<BytesMut, EncodeError> {
    let ver_cmd = (2 << 4)
        | match command {
            Command::Local => 0,
            Command::Proxy => 1,
        };
    let addresses = match command {
        Command::Local => None,
        Command::Proxy => addresses,
    };

    let transport_bits = |transport: &TransportProtocol| match transport {
        TransportProtocol::Stream => 1,
        TransportProtocol::Datagram => 2,
    };
    let (fam, len) = match addresses {
        None => (0, 0),
        Some((NetworkAddress::Ipv4 { transport, .. }, NetworkAddress::Ipv4 { .. })) => {
            ((1 << 4) | transport_bits(transport), INET_BLOCK_LENGTH)
        }
        Some((NetworkAddress::Ipv6 { transport, .. }, NetworkAddress::Ipv6 { .. })) => {
            ((2 << 4) | transport_bits(transport), INET6_BLOCK_LENGTH)
        }
        Some((NetworkAddress::Unix { transport, .. }, NetworkAddress::Unix { .. })) => {
            ((3 << 4) | transport_bits(transport), UNIX_BLOCK_LENGTH)
        }
        Some(_) => return MismatchedAddressFamilies.fail(),
    };

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LENGTH + len);
    buf.put_slice(&SIGNATURE[..]);
    buf.put_slice(&[ver_cmd, fam][..]);
    buf.put_u16(len as u16);

    match addresses {
        None => (),
        Some((
            NetworkAddress::Ipv4 {
                address: source, ..
            },
            NetworkAddress::Ipv4 {
                address: destination,
                ..
            },
        )) => {
            buf.put_slice(&source.ip().octets()[..]);
            buf.put_slice(&destination.ip().octets()[..]);
            buf.put_u16(source.port());
            buf.put_u16(destination.port());
        }
        Some((
            NetworkAddress::Ipv6 {
                address: source, ..
            },
            NetworkAddress::Ipv6 {
                address: destination,
                ..
            },
        )) => {
            buf.put_slice(&source.ip().octets()[..]);
            buf.put_slice(&destination.ip().octets()[..]);
            buf.put_u16(source.port());
            buf.put_u16(destination.port());
        }
        Some((
            NetworkAddress::Unix { path: source, .. },
            NetworkAddress::Unix {
                path: destination, ..
            },
        )) => {
            for path in &[source, destination] {
                ensure!(
                    path.len() <= UNIX_PATH_LENGTH,
                    UnixPathTooLong { length: path.len() },
                );
                buf.put_slice(&path[..]);
                buf.put_bytes(0, UNIX_PATH_LENGTH - path.len());
            }
        }
        Some(_) => unreachable!("mismatches are rejected above"),
    }

    Ok(buf)
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::prelude::*;

    fn header(ver_cmd: u8, fam: u8, block: &[u8]) -> Vec<u8> {
        let mut data = SIGNATURE.to_vec();
        data.push(ver_cmd);
        data.push(fam);
        data.extend(&(block.len() as u16).to_be_bytes()[..]);
        data.extend(block);
        data
    }

    const INET_BLOCK: [u8; 12] = [
        // Source IP
        127, 0, 0, 1, //
        // Destination IP
        192, 168, 0, 1, //
        // Source port
        // 65535 = [255, 255]
        255, 255, //
        // Destination port
        // 257 = [1, 1]
        1, 1,
    ];

    #[test]
    fn test_ipv4() {
        let data = header(0x21, 0x11, &INET_BLOCK[..]);
        let info = parse(&mut &data[..]).unwrap();
        assert_eq!(
            info.source(),
            Some(&NetworkAddress::Ipv4 {
                transport: TransportProtocol::Stream,
                address: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 65535),
            }),
        );
        assert_eq!(
            info.destination(),
            Some(&NetworkAddress::Ipv4 {
                transport: TransportProtocol::Stream,
                address: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 257),
            }),
        );
        assert_eq!(info.header(), &data[..]);
        assert_eq!(info.version(), Version::V2);
    }

    #[test]
    fn test_ipv6_datagram() {
        let mut block = vec![255u8; 16];
        block.extend(&[0u8; 16][..]);
        block.extend(&[0x7B, 0x00, 0xFF, 0xFF][..]);
        let data = header(0x21, 0x22, &block);

        let info = parse(&mut &data[..]).unwrap();
        assert_eq!(
            info.source(),
            Some(&NetworkAddress::Ipv6 {
                transport: TransportProtocol::Datagram,
                address: SocketAddrV6::new(
                    Ipv6Addr::new(65535, 65535, 65535, 65535, 65535, 65535, 65535, 65535),
                    31488,
                    0,
                    0,
                ),
            }),
        );
        assert_eq!(
            info.destination(),
            Some(&NetworkAddress::Ipv6 {
                transport: TransportProtocol::Datagram,
                address: SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 65535, 0, 0),
            }),
        );
    }

    #[test]
    fn test_unix() {
        let mut block = vec![0u8; UNIX_BLOCK_LENGTH];
        block[..13].copy_from_slice(b"/tmp/src.sock");
        block[108..121].copy_from_slice(b"/tmp/dst.sock");
        let data = header(0x21, 0x31, &block);

        let info = parse(&mut &data[..]).unwrap();
        assert_eq!(
            info.source(),
            Some(&NetworkAddress::Unix {
                transport: TransportProtocol::Stream,
                path: Bytes::from_static(b"/tmp/src.sock"),
            }),
        );
        assert_eq!(
            info.destination(),
            Some(&NetworkAddress::Unix {
                transport: TransportProtocol::Stream,
                path: Bytes::from_static(b"/tmp/dst.sock"),
            }),
        );
    }

    #[test]
    fn test_unix_datagram() {
        let mut block = vec![0u8; UNIX_BLOCK_LENGTH];
        block[..9].copy_from_slice(b"/dev/log0");
        block[108..116].copy_from_slice(b"/dev/log");
        let data = header(0x21, 0x32, &block);

        let info = parse(&mut &data[..]).unwrap();
        let source = info.source().unwrap();
        assert_eq!(source.transport(), TransportProtocol::Datagram);
        assert_eq!(
            info.destination(),
            Some(&NetworkAddress::Unix {
                transport: TransportProtocol::Datagram,
                path: Bytes::from_static(b"/dev/log"),
            }),
        );

        let encoded = encode(Command::Proxy, Some((source, info.destination().unwrap()))).unwrap();
        assert_eq!(&encoded[..], &data[..]);
    }

    #[test]
    fn test_no_addresses() {
        // LOCAL with an otherwise valid INET block.
        let info = parse(&mut &header(0x20, 0x11, &INET_BLOCK[..])[..]).unwrap();
        assert_eq!(info.source(), None);
        assert_eq!(info.destination(), None);

        // UNSPEC family.
        let info = parse(&mut &header(0x21, 0x01, &INET_BLOCK[..])[..]).unwrap();
        assert_eq!(info.source(), None);

        // UNSPEC transport.
        let info = parse(&mut &header(0x21, 0x10, &INET_BLOCK[..])[..]).unwrap();
        assert_eq!(info.source(), None);

        // The block is still consumed.
        let mut data = header(0x20, 0x00, &[1, 2, 3, 4][..]);
        data.extend(b"after");
        let mut buf = &data[..];
        let info = parse(&mut buf).unwrap();
        assert_eq!(info.header().len(), FIXED_HEADER_LENGTH + 4);
        assert_eq!(buf, &b"after"[..]);
    }

    #[test]
    fn test_random_blocks_without_addresses() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let mut block = vec![0u8; rng.gen_range(0..300)];
            rng.fill_bytes(&mut block);
            let (ver_cmd, fam) = match rng.gen_range(0..3) {
                0 => (0x20, rng.gen_range(0..4) << 4 | rng.gen_range(0..3)),
                1 => (0x21, rng.gen_range(0..3)),
                _ => (0x21, rng.gen_range(0..4) << 4),
            };
            let info = parse(&mut &header(ver_cmd, fam, &block)[..]).unwrap();
            assert_eq!(info.source(), None);
            assert_eq!(info.destination(), None);
        }
    }

    #[test]
    fn test_tlvs_are_skipped() {
        let mut block = INET_BLOCK.to_vec();
        // PP2_TYPE_NOOP with no value.
        block.extend(&[0x04, 0, 0][..]);
        let mut data = header(0x21, 0x11, &block);
        data.extend(b"payload");

        let mut buf = &data[..];
        let info = parse(&mut buf).unwrap();
        assert!(info.source().is_some());
        assert_eq!(info.header().len(), FIXED_HEADER_LENGTH + 15);
        assert_eq!(buf, &b"payload"[..]);
    }

    #[test]
    fn test_invalid_cases() {
        let mut data = header(0x21, 0x11, &INET_BLOCK[..]);
        data[0] = 0x0E;
        assert_eq!(parse(&mut &data[..]).unwrap_err(), ParseError::InvalidSignature);

        assert_eq!(
            parse(&mut &header(0x11, 0x11, &INET_BLOCK[..])[..]).unwrap_err(),
            ParseError::InvalidVersion { version: 1 },
        );
        assert_eq!(
            parse(&mut &header(0x22, 0x11, &INET_BLOCK[..])[..]).unwrap_err(),
            ParseError::UnknownCommand { cmd: 2 },
        );

        let err = parse(&mut &header(0x21, 0x40, &INET_BLOCK[..])[..]).unwrap_err();
        assert_eq!(err, ParseError::UnknownAddressFamily { family: 4 });
        assert_eq!(err.kind(), ErrorKind::InvalidProxyHeader);

        assert_eq!(
            parse(&mut &header(0x20, 0x13, &INET_BLOCK[..])[..]).unwrap_err(),
            ParseError::UnknownTransportProtocol { protocol: 3 },
        );
        assert_eq!(
            parse(&mut &header(0x21, 0x11, &[0, 0, 0][..])[..]).unwrap_err(),
            ParseError::InsufficientLengthSpecified {
                given: 3,
                needs: INET_BLOCK_LENGTH,
            },
        );
        assert_eq!(
            parse(&mut &header(0x21, 0x21, &INET_BLOCK[..])[..]).unwrap_err(),
            ParseError::InsufficientLengthSpecified {
                given: INET_BLOCK_LENGTH,
                needs: INET6_BLOCK_LENGTH,
            },
        );

        let data = header(0x21, 0x11, &INET_BLOCK[..]);
        assert_eq!(
            parse(&mut &data[..20]).unwrap_err(),
            ParseError::UnexpectedEof {
                given: 20,
                needs: 28,
            },
        );
        assert_eq!(
            parse(&mut &data[..15]).unwrap_err(),
            ParseError::SegmentTooSmall { given: 15 },
        );
    }

    #[test]
    fn test_feed_segment_too_small() {
        let data = header(0x21, 0x11, &INET_BLOCK[..]);
        let mut parser = V2Parser::new();
        assert_eq!(
            parser.feed(&data[..10]).unwrap_err(),
            ParseError::SegmentTooSmall { given: 10 },
        );
    }

    #[test]
    fn test_feed_is_associative() {
        let mut block = INET_BLOCK.to_vec();
        block.extend(&[0x04, 0, 2, 0xAA, 0xBB][..]);
        let head = header(0x21, 0x12, &block);
        let trailer = &b"\x00\x01datagram-ish payload"[..];
        let data = [&head[..], trailer].concat();

        let mut whole = V2Parser::new();
        let (expected, expected_remainder) = whole.feed(&data).unwrap().unwrap();
        assert_eq!(expected_remainder, trailer);
        assert_eq!(expected.header(), &head[..]);

        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let mut parser = V2Parser::new();
            let first = rng.gen_range(FIXED_HEADER_LENGTH..=data.len());
            let (chunk, mut rest) = data.split_at(first);
            let mut result = parser.feed(chunk).unwrap();
            while result.is_none() {
                let take = rng.gen_range(1..=rest.len());
                let (chunk, tail) = rest.split_at(take);
                rest = tail;
                result = parser.feed(chunk).unwrap();
            }
            let (info, remainder) = result.unwrap();
            assert_eq!(info, expected);
            assert_eq!([&remainder[..], rest].concat(), trailer);
        }
    }
}
