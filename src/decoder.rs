//! Deciding which header a connection starts with, then reading it.

use crate::{
    version1::{self, V1Parser},
    version2::{self, V2Parser},
    NotProxyHeader, ProxyInfo, ProxyProtocolConfig, Result, Version, Version1, Version2,
    VersionDisabled,
};
use bytes::{Bytes, BytesMut};
use snafu::{ensure, ResultExt as _};
use tracing::debug;

/// Bytes needed to recognise a v1 header.
const V1_SNIFF_LENGTH: usize = 8;

/// What the decoder has made of the bytes so far.
#[derive(Debug)]
pub enum Progress {
    /// The header is not complete yet; feed the decoder more data.
    Pending(HeaderDecoder),

    /// The header is complete.
    Complete {
        info: ProxyInfo,

        /// Bytes received after the header. They belong to the proxied stream.
        remainder: Bytes,
    },
}

#[derive(Debug)]
enum State {
    Sniffing(BytesMut),
    V1(V1Parser),
    V2(V2Parser),
}

enum Sniffed {
    Version(Version),
    NeedMore,
    Invalid,
}

/// Reads a PROXY header of either version off the start of a connection.
///
/// The first bytes are held back until they are enough to tell the versions
/// apart; from then on all data goes to the matching parser. Decoding takes
/// the decoder by value, so a decoder which failed can not be fed again.
#[derive(Debug)]
pub struct HeaderDecoder {
    state: State,
    config: ProxyProtocolConfig,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new(ProxyProtocolConfig::default())
    }
}

impl HeaderDecoder {
    pub fn new(config: ProxyProtocolConfig) -> Self {
        Self {
            state: State::Sniffing(BytesMut::new()),
            config,
        }
    }

    /// Feed the next bytes received on the connection.
    pub fn decode(mut self, data: &[u8]) -> Result<Progress> {
        let result = match &mut self.state {
            State::V1(parser) => parser.feed(data).context(Version1)?,
            State::V2(parser) => parser.feed(data).context(Version2)?,
            State::Sniffing(buffer) => {
                buffer.extend_from_slice(data);
                let version = match sniff(buffer) {
                    Sniffed::Version(version) => version,
                    Sniffed::NeedMore => return Ok(Progress::Pending(self)),
                    Sniffed::Invalid => return NotProxyHeader.fail(),
                };
                ensure!(self.config.accepts(version), VersionDisabled { version });
                debug!(%version, "detected PROXY header");

                let sniffed = buffer.split().freeze();
                match version {
                    Version::V1 => {
                        let mut parser = V1Parser::new();
                        let result = parser.feed(&sniffed).context(Version1)?;
                        self.state = State::V1(parser);
                        result
                    }
                    Version::V2 => {
                        let mut parser = V2Parser::new();
                        let result = parser.feed(&sniffed).context(Version2)?;
                        self.state = State::V2(parser);
                        result
                    }
                }
            }
        };

        Ok(match result {
            Some((info, remainder)) => Progress::Complete { info, remainder },
            None => Progress::Pending(self),
        })
    }
}

fn sniff(buf: &[u8]) -> Sniffed {
    let signature = &version2::SIGNATURE[..];
    if buf.len() >= version2::FIXED_HEADER_LENGTH
        && buf.starts_with(signature)
        && buf[12] & 0xF0 == 0x20
    {
        return Sniffed::Version(Version::V2);
    }

    let proxy = &version1::PREFIX[..5];
    if buf.len() >= V1_SNIFF_LENGTH && buf.starts_with(proxy) {
        return Sniffed::Version(Version::V1);
    }

    // Wait as long as the bytes could still turn into either header.
    let could_be_v2 = buf.len() < version2::FIXED_HEADER_LENGTH && {
        let n = buf.len().min(signature.len());
        buf[..n] == signature[..n] && (buf.len() <= 12 || buf[12] & 0xF0 == 0x20)
    };
    let could_be_v1 = buf.len() < V1_SNIFF_LENGTH && {
        let n = buf.len().min(proxy.len());
        buf[..n] == proxy[..n]
    };
    if could_be_v1 || could_be_v2 {
        Sniffed::NeedMore
    } else {
        Sniffed::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, ErrorKind, NetworkAddress};
    use pretty_assertions::assert_eq;
    use std::net::{Ipv6Addr, SocketAddr};

    fn decode_chunks(
        mut decoder: HeaderDecoder,
        chunks: &[&[u8]],
    ) -> Result<Option<(ProxyInfo, Vec<u8>)>> {
        let mut chunks = chunks.iter();
        while let Some(chunk) = chunks.next() {
            match decoder.decode(chunk)? {
                Progress::Pending(next) => decoder = next,
                Progress::Complete { info, remainder } => {
                    let mut rest = remainder.to_vec();
                    for chunk in chunks {
                        rest.extend_from_slice(chunk);
                    }
                    return Ok(Some((info, rest)));
                }
            }
        }
        Ok(None)
    }

    fn v2_header() -> Vec<u8> {
        let source: NetworkAddress = SocketAddr::from((Ipv6Addr::LOCALHOST, 1000)).into();
        let destination: NetworkAddress = SocketAddr::from((Ipv6Addr::LOCALHOST, 2000)).into();
        version2::encode(version2::Command::Proxy, Some((&source, &destination)))
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_v1_one_byte_at_a_time() {
        let data = b"PROXY TCP4 127.0.0.1 127.0.0.1 8080 8888\r\nEXTRA";
        let chunks: Vec<&[u8]> = data.chunks(1).collect();
        let (info, rest) = decode_chunks(HeaderDecoder::default(), &chunks)
            .unwrap()
            .unwrap();
        assert_eq!(info.version(), Version::V1);
        assert_eq!(
            info.source().and_then(NetworkAddress::socket_addr),
            Some("127.0.0.1:8080".parse().unwrap()),
        );
        assert_eq!(rest, b"EXTRA");
    }

    #[test]
    fn test_v2_one_byte_at_a_time() {
        let mut data = v2_header();
        data.extend(b"EXTRA");
        let chunks: Vec<&[u8]> = data.chunks(1).collect();
        let (info, rest) = decode_chunks(HeaderDecoder::default(), &chunks)
            .unwrap()
            .unwrap();
        assert_eq!(info.version(), Version::V2);
        assert_eq!(
            info.destination().and_then(NetworkAddress::socket_addr),
            Some("[::1]:2000".parse().unwrap()),
        );
        assert_eq!(rest, b"EXTRA");
    }

    #[test]
    fn test_pending_until_complete() {
        let decoder = HeaderDecoder::default();
        let decoder = match decoder.decode(b"PRO").unwrap() {
            Progress::Pending(decoder) => decoder,
            Progress::Complete { .. } => panic!("three bytes can not be a header"),
        };
        let decoder = match decoder.decode(b"XY TCP4 1.2.3.4").unwrap() {
            Progress::Pending(decoder) => decoder,
            Progress::Complete { .. } => panic!("no CRLF yet"),
        };
        assert!(matches!(
            decoder.decode(b" 5.6.7.8 1 2\r\n").unwrap(),
            Progress::Complete { .. },
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err =
            decode_chunks(HeaderDecoder::default(), &[&b"GET / HTTP/1.1\r\n"[..]]).unwrap_err();
        assert_eq!(err, Error::NotProxyHeader);

        // Diverges from both patterns on the first byte.
        let err = decode_chunks(HeaderDecoder::default(), &[&b"X"[..]]).unwrap_err();
        assert_eq!(err, Error::NotProxyHeader);

        // A v2 signature with version 1 is not worth waiting for.
        let mut data = version2::SIGNATURE.to_vec();
        data.push(0x11);
        let err = decode_chunks(HeaderDecoder::default(), &[&data[..]]).unwrap_err();
        assert_eq!(err, Error::NotProxyHeader);
    }

    #[test]
    fn test_parse_errors_are_passed_on() {
        let err =
            decode_chunks(HeaderDecoder::default(), &[&b"PROXY WUTPROTO \r\n"[..]]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidNetworkProtocol);

        let mut data = v2_header();
        data[13] = 0x40;
        let err = decode_chunks(HeaderDecoder::default(), &[&data[..]]).unwrap_err();
        assert_eq!(
            err,
            Error::Version2 {
                source: version2::ParseError::UnknownAddressFamily { family: 4 },
            },
        );
    }

    #[test]
    fn test_disabled_versions() {
        let config = ProxyProtocolConfig {
            accept_v2: false,
            ..ProxyProtocolConfig::default()
        };
        let err = decode_chunks(HeaderDecoder::new(config), &[&v2_header()[..]]).unwrap_err();
        assert_eq!(err, Error::VersionDisabled { version: Version::V2 });

        let config = ProxyProtocolConfig {
            accept_v1: false,
            ..ProxyProtocolConfig::default()
        };
        let err =
            decode_chunks(HeaderDecoder::new(config), &[&b"PROXY UNKNOWN\r\n"[..]]).unwrap_err();
        assert_eq!(err, Error::VersionDisabled { version: Version::V1 });
    }
}
