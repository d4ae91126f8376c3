//! The accepted-connection type handed to the HTTP/2 session layer: either a
//! plain TCP stream or one wrapped in a completed TLS handshake.

use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[pin_project(project = ServerIoProj)]
pub(crate) enum ServerIo<IO> {
    Plain(#[pin] IO),
    Tls(#[pin] Box<tokio_rustls::server::TlsStream<IO>>),
}

impl<IO> ServerIo<IO> {
    pub(crate) fn new_io(io: IO) -> Self {
        Self::Plain(io)
    }

    pub(crate) fn new_tls_io(io: tokio_rustls::server::TlsStream<IO>) -> Self {
        Self::Tls(Box::new(io))
    }

    /// The negotiated ALPN protocol, if this is a TLS connection that
    /// completed one.
    pub(crate) fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for ServerIo<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.project() {
            ServerIoProj::Plain(io) => io.poll_read(cx, buf),
            ServerIoProj::Tls(io) => io.poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ServerIo<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.project() {
            ServerIoProj::Plain(io) => io.poll_write(cx, buf),
            ServerIoProj::Tls(io) => io.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            ServerIoProj::Plain(io) => io.poll_flush(cx),
            ServerIoProj::Tls(io) => io.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            ServerIoProj::Plain(io) => io.poll_shutdown(cx),
            ServerIoProj::Tls(io) => io.poll_shutdown(cx),
        }
    }
}
