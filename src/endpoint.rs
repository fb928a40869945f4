//! Reading PROXY headers off tokio streams.
//!
//! [ProxyAcceptor] performs the header exchange on a single stream, and
//! [ProxyListener] does so for every connection accepted on a TCP listener.

use crate::{Error, HeaderDecoder, NetworkAddress, Progress, ProxyInfo, ProxyProtocolConfig};
use bytes::{Buf, Bytes, BytesMut};
use snafu::{ensure, ResultExt as _, Snafu};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    time::{error::Elapsed, timeout},
};
use tracing::{debug, warn};

/// Reads are at most this large until the header is complete.
const READ_CHUNK: usize = 512;

#[derive(Debug, Snafu)]
pub enum AcceptError {
    #[snafu(display("could not read the PROXY header: {}", source))]
    Io { source: io::Error },

    #[snafu(display("timed out waiting for the PROXY header"))]
    Timeout { source: Elapsed },

    #[snafu(display("connection closed before the PROXY header was complete"))]
    ConnectionClosed,

    #[snafu(display("invalid PROXY header: {}", source))]
    Header { source: Error },
}

/// Reads the PROXY header off the start of a stream.
#[derive(Debug, Clone, Default)]
pub struct ProxyAcceptor {
    config: ProxyProtocolConfig,
}

impl ProxyAcceptor {
    pub fn new(config: ProxyProtocolConfig) -> Self {
        Self { config }
    }

    /// Read the header off `stream`.
    ///
    /// # Errors
    ///
    /// Fails if the stream errors or closes, the header is invalid, or the
    /// header takes longer than the configured timeout to arrive.
    pub async fn accept<S>(&self, mut stream: S) -> Result<ProxiedStream<S>, AcceptError>
    where
        S: AsyncRead + Unpin,
    {
        let (info, remainder) = timeout(
            self.config.timeout_duration(),
            read_header(&mut stream, self.config.clone()),
        )
        .await
        .context(Timeout)??;

        Ok(ProxiedStream {
            inner: stream,
            info,
            remainder,
        })
    }
}

async fn read_header<S>(
    stream: &mut S,
    config: ProxyProtocolConfig,
) -> Result<(ProxyInfo, Bytes), AcceptError>
where
    S: AsyncRead + Unpin,
{
    let mut decoder = HeaderDecoder::new(config);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.clear();
        let n = stream.read_buf(&mut buf).await.context(Io)?;
        ensure!(n != 0, ConnectionClosed);

        match decoder.decode(&buf).context(Header)? {
            Progress::Pending(next) => decoder = next,
            Progress::Complete { info, remainder } => return Ok((info, remainder)),
        }
    }
}

/// A stream whose PROXY header has been read.
///
/// Reads first return whatever arrived after the header in the same segment,
/// then continue from the inner stream. Writes go straight through.
#[derive(Debug)]
pub struct ProxiedStream<S> {
    inner: S,
    info: ProxyInfo,
    remainder: Bytes,
}

impl<S> ProxiedStream<S> {
    pub fn proxy_info(&self) -> &ProxyInfo {
        &self.info
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Take the inner stream back, along with any bytes read past the header
    /// that have not been consumed yet.
    pub fn into_parts(self) -> (S, ProxyInfo, Bytes) {
        (self.inner, self.info, self.remainder)
    }
}

impl ProxiedStream<TcpStream> {
    /// The client address from the header, or the socket's peer address if
    /// the header did not carry one.
    pub fn peer_addr(&self) -> io::Result<NetworkAddress> {
        match self.info.source() {
            Some(source) => Ok(source.clone()),
            None => self.inner.peer_addr().map(NetworkAddress::from),
        }
    }

    /// The address the client connected to from the header, or the socket's
    /// local address if the header did not carry one.
    pub fn local_addr(&self) -> io::Result<NetworkAddress> {
        match self.info.destination() {
            Some(destination) => Ok(destination.clone()),
            None => self.inner.local_addr().map(NetworkAddress::from),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ProxiedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.remainder.has_remaining() {
            let n = this.remainder.len().min(buf.remaining());
            buf.put_slice(&this.remainder[..n]);
            this.remainder.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProxiedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A TCP listener whose connections all start with a PROXY header.
#[derive(Debug)]
pub struct ProxyListener {
    listener: TcpListener,
    acceptor: ProxyAcceptor,
}

impl ProxyListener {
    pub async fn bind(addr: impl ToSocketAddrs, config: ProxyProtocolConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: ProxyProtocolConfig) -> Self {
        Self {
            listener,
            acceptor: ProxyAcceptor::new(config),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, calling `handler` for each one whose
    /// header was read successfully.
    ///
    /// Every connection is handled on its own task. Connections with a bad
    /// or late header are closed without reaching `handler`.
    ///
    /// # Errors
    ///
    /// Returns when accepting on the listener fails.
    pub async fn serve<H, Fut>(self, handler: H) -> io::Result<()>
    where
        H: Fn(ProxiedStream<TcpStream>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "accepted connection");

            let acceptor = self.acceptor.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(stream) => handler(stream).await,
                    Err(e) => warn!(%peer, error = %e, "dropping connection"),
                }
            });
        }
    }
}
