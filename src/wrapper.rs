//! Putting a PROXY header decoder in front of an existing protocol.
//!
//! The types here are transport agnostic: whatever owns the socket calls
//! into a [Protocol] whenever something happens on the connection, and hands
//! it a [Transport] to talk back through. A [ProtocolWrapper] is itself a
//! [Protocol], so it slots in wherever the wrapped one would have.

use crate::{HeaderDecoder, NetworkAddress, Progress, ProxyInfo, ProxyProtocolConfig};
use std::{mem, sync::Arc};
use tracing::{debug, warn};

/// The connection as seen by a [Protocol].
pub trait Transport {
    /// The address of the other end of the connection.
    fn peer(&self) -> NetworkAddress;

    /// The address of our end of the connection.
    fn host(&self) -> NetworkAddress;

    fn write(&mut self, data: &[u8]);

    /// Close the connection once pending writes are flushed.
    fn lose_connection(&mut self);

    /// Close the connection right away, discarding pending writes.
    fn abort_connection(&mut self) {
        self.lose_connection()
    }
}

/// Reacts to events on a single connection.
pub trait Protocol {
    /// The connection is ready for use.
    fn connection_made(&mut self, _transport: &mut dyn Transport) {}

    fn data_received(&mut self, transport: &mut dyn Transport, data: &[u8]);

    /// The connection is gone. No more events follow.
    fn connection_lost(&mut self) {}
}

/// Builds one [Protocol] per connection.
pub trait ProtocolFactory {
    type Protocol: Protocol;

    fn build_protocol(&self, peer: &NetworkAddress) -> Self::Protocol;
}

/// A [Transport] that reports the addresses from the PROXY header.
///
/// Addresses the header did not carry are taken from the real transport.
pub struct ProxiedTransport<'a> {
    inner: &'a mut dyn Transport,
    info: Option<&'a ProxyInfo>,
}

impl<'a> ProxiedTransport<'a> {
    pub fn new(inner: &'a mut dyn Transport, info: Option<&'a ProxyInfo>) -> Self {
        Self { inner, info }
    }
}

impl Transport for ProxiedTransport<'_> {
    fn peer(&self) -> NetworkAddress {
        match self.info.and_then(ProxyInfo::source) {
            Some(source) => source.clone(),
            None => self.inner.peer(),
        }
    }

    fn host(&self) -> NetworkAddress {
        match self.info.and_then(ProxyInfo::destination) {
            Some(destination) => destination.clone(),
            None => self.inner.host(),
        }
    }

    fn write(&mut self, data: &[u8]) {
        self.inner.write(data)
    }

    fn lose_connection(&mut self) {
        self.inner.lose_connection()
    }

    fn abort_connection(&mut self) {
        self.inner.abort_connection()
    }
}

enum State<P> {
    Decoding(HeaderDecoder),
    Forwarding(P),
    Closed,
}

/// Reads the PROXY header off a connection, then hands the rest of the
/// stream to a protocol built by the wrapped factory.
///
/// The wrapped protocol is only built once the header has been read. A
/// connection with a missing or malformed header is closed without the
/// wrapped protocol ever seeing it.
pub struct ProtocolWrapper<F: ProtocolFactory> {
    factory: Arc<F>,
    state: State<F::Protocol>,
    info: Option<ProxyInfo>,
}

impl<F: ProtocolFactory> ProtocolWrapper<F> {
    pub fn new(factory: Arc<F>, config: ProxyProtocolConfig) -> Self {
        Self {
            factory,
            state: State::Decoding(HeaderDecoder::new(config)),
            info: None,
        }
    }

    /// The parsed header, once it has been read.
    pub fn proxy_info(&self) -> Option<&ProxyInfo> {
        self.info.as_ref()
    }

    /// The wrapped protocol, once the header has been read.
    pub fn wrapped(&self) -> Option<&F::Protocol> {
        match &self.state {
            State::Forwarding(protocol) => Some(protocol),
            _ => None,
        }
    }

    /// The client address: from the header if it carried one, otherwise the
    /// transport's.
    pub fn peer(&self, transport: &dyn Transport) -> NetworkAddress {
        match self.info.as_ref().and_then(ProxyInfo::source) {
            Some(source) => source.clone(),
            None => transport.peer(),
        }
    }

    /// The address the client connected to: from the header if it carried
    /// one, otherwise the transport's.
    pub fn host(&self, transport: &dyn Transport) -> NetworkAddress {
        match self.info.as_ref().and_then(ProxyInfo::destination) {
            Some(destination) => destination.clone(),
            None => transport.host(),
        }
    }

    fn header_complete(
        &mut self,
        transport: &mut dyn Transport,
        info: ProxyInfo,
        remainder: &[u8],
    ) {
        let info = &*self.info.get_or_insert(info);
        let mut transport = ProxiedTransport::new(transport, Some(info));
        debug!(
            version = %info.version(),
            peer = %transport.peer(),
            host = %transport.host(),
            "read PROXY header"
        );

        let mut protocol = self.factory.build_protocol(&transport.peer());
        protocol.connection_made(&mut transport);
        if !remainder.is_empty() {
            protocol.data_received(&mut transport, remainder);
        }
        self.state = State::Forwarding(protocol);
    }
}

impl<F: ProtocolFactory> Protocol for ProtocolWrapper<F> {
    fn data_received(&mut self, transport: &mut dyn Transport, data: &[u8]) {
        match mem::replace(&mut self.state, State::Closed) {
            State::Forwarding(mut protocol) => {
                let mut proxied = ProxiedTransport::new(transport, self.info.as_ref());
                protocol.data_received(&mut proxied, data);
                self.state = State::Forwarding(protocol);
            }
            State::Decoding(decoder) => match decoder.decode(data) {
                Ok(Progress::Pending(decoder)) => self.state = State::Decoding(decoder),
                Ok(Progress::Complete { info, remainder }) => {
                    self.header_complete(transport, info, &remainder)
                }
                Err(e) => {
                    warn!(peer = %transport.peer(), error = %e, "dropping connection");
                    transport.abort_connection();
                }
            },
            State::Closed => {}
        }
    }

    fn connection_lost(&mut self) {
        if let State::Forwarding(mut protocol) = mem::replace(&mut self.state, State::Closed) {
            protocol.connection_lost();
        }
    }
}

/// Wraps every protocol built by `F` in a [ProtocolWrapper].
pub struct WrappingFactory<F> {
    wrapped: Arc<F>,
    config: ProxyProtocolConfig,
}

impl<F: ProtocolFactory> WrappingFactory<F> {
    pub fn new(wrapped: F, config: ProxyProtocolConfig) -> Self {
        Self {
            wrapped: Arc::new(wrapped),
            config,
        }
    }

    pub fn config(&self) -> &ProxyProtocolConfig {
        &self.config
    }
}

impl<F: ProtocolFactory> ProtocolFactory for WrappingFactory<F> {
    type Protocol = ProtocolWrapper<F>;

    fn build_protocol(&self, _peer: &NetworkAddress) -> ProtocolWrapper<F> {
        ProtocolWrapper::new(Arc::clone(&self.wrapped), self.config.clone())
    }
}
