use std::{
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{client::options::ServerAddress, error::Result};

#[cfg(feature = "rustls-tls")]
use super::tls_rustls::TlsConfig;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What to connect to and how.
#[derive(Clone, Debug)]
pub(crate) struct StreamOptions {
    pub(crate) address: ServerAddress,
    pub(crate) connect_timeout: Option<Duration>,
    #[cfg(feature = "rustls-tls")]
    pub(crate) tls_config: Option<TlsConfig>,
}

/// An async stream to a server, possibly using TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A sink stream that discards writes and reports end-of-stream on reads; used where a
    /// connection object is needed without a live socket.
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "rustls-tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncStream {
    /// Open a connection, applying the connect timeout (0 means no timeout) and performing the
    /// TLS handshake when a configuration is supplied.
    pub(crate) async fn connect(options: StreamOptions) -> Result<Self> {
        let timeout = match options.connect_timeout {
            Some(d) if !d.is_zero() => d,
            Some(_) => Duration::MAX,
            None => DEFAULT_CONNECT_TIMEOUT,
        };
        let ServerAddress::Tcp { ref host, port } = options.address;
        let target = (host.as_str(), port.unwrap_or(27017));

        let stream = super::timeout(timeout, TcpStream::connect(target)).await??;
        stream.set_nodelay(true)?;

        #[cfg(feature = "rustls-tls")]
        if let Some(ref cfg) = options.tls_config {
            let tls_stream = cfg.connect(host, stream).await?;
            return Ok(Self::Tls(tls_stream));
        }

        Ok(Self::Tcp(stream))
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(buf.len())),
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
