//! A duplex stream that starts out as a plain TCP connection and may be
//! upgraded in place to TLS once, grounded on
//! `examples/launchbadge-sqlx/sqlx-core/src/io/tls.rs`'s `MaybeTlsStream`
//! (adapted from `async_std::io::{Read,Write}` to tokio's `AsyncRead`/
//! `AsyncWrite`, and from `async_native_tls` to `tokio_rustls`).

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use tokio_rustls::server::TlsStream;

/// Either a bare [`TcpStream`] or, once the client negotiated `CLIENT_SSL`
/// and the TLS handshake completed, the same connection wrapped by
/// `tokio_rustls`. The handshake module produces this; the mediator only
/// ever sees one `AsyncRead + AsyncWrite` value.
pub enum ServerStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl ServerStream {
    pub fn is_tls(&self) -> bool {
        match self {
            ServerStream::Plain(_) => false,
            #[cfg(feature = "tls")]
            ServerStream::Tls(_) => true,
        }
    }
}

macro_rules! forward_pin {
    ($self:ident.$method:ident($($arg:ident),*)) => {
        match $self.get_mut() {
            ServerStream::Plain(stream) => Pin::new(stream).$method($($arg),*),
            #[cfg(feature = "tls")]
            ServerStream::Tls(stream) => Pin::new(stream.as_mut()).$method($($arg),*),
        }
    };
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        forward_pin!(self.poll_read(cx, buf))
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        forward_pin!(self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        forward_pin!(self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        forward_pin!(self.poll_shutdown(cx))
    }
}
