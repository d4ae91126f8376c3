//! Connection-level metadata extracted from the accepted IO resource:
//! remote address and, for TLS connections, the peer's certificate chain.
//! Feeds [`crate::context::ConnectionContext`].

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::tls::Certificate;
use crate::wrangler::io::ServerIo;

/// Implemented by anything that can report the connection metadata a
/// [`crate::context::ConnectionContext`] is built from. Lets tests substitute
/// an in-memory duplex stream without faking a full TCP/TLS stack.
pub trait Connected {
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_certs(&self) -> Option<Vec<Certificate>> {
        None
    }
}

impl Connected for TcpStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl<IO: Connected> Connected for ServerIo<IO> {
    fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerIo::Plain(io) => io.remote_addr(),
            ServerIo::Tls(stream) => stream.get_ref().0.remote_addr(),
        }
    }

    fn peer_certs(&self) -> Option<Vec<Certificate>> {
        match self {
            ServerIo::Plain(_) => None,
            ServerIo::Tls(stream) => {
                let (_, conn) = stream.get_ref();
                conn.peer_certificates().map(|certs| {
                    certs
                        .iter()
                        .map(|c| Certificate::from_pem(c.as_ref().to_vec()))
                        .collect()
                })
            }
        }
    }
}
