//! Wraps a `rustls` [`ServerConfig`] with SNI-based certificate selection
//! and ALPN negotiation for HTTP/2.

use std::io::Cursor;
use std::{fmt, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{
    rustls::{server::WebPkiClientVerifier, RootCertStore, ServerConfig},
    server::TlsStream,
    TlsAcceptor as RustlsAcceptor,
};

use crate::error::Error;
use crate::tls::cert_store::CertificateStore;
use crate::tls::identity::Certificate;

pub(crate) const ALPN_H2: &[u8] = b"h2";

fn root_store_from_pem(cert: &Certificate) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_pemfile::certs(&mut Cursor::new(&cert.pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::from_source(std::io::Error::other(e)))?;
    for der in certs {
        roots
            .add(der)
            .map_err(|e| Error::from_source(std::io::Error::other(e.to_string())))?;
    }
    Ok(roots)
}

#[derive(Clone)]
pub(crate) struct TlsAcceptor {
    inner: Arc<ServerConfig>,
}

impl TlsAcceptor {
    pub(crate) fn new(
        certs: CertificateStore,
        client_ca_root: Option<Certificate>,
        client_auth_optional: bool,
    ) -> Result<Self, Error> {
        let builder = ServerConfig::builder();

        let builder = match client_ca_root {
            None => builder.with_no_client_auth(),
            Some(cert) => {
                let roots = root_store_from_pem(&cert)?;
                let verifier_builder = WebPkiClientVerifier::builder(roots.into());
                let verifier = if client_auth_optional {
                    verifier_builder.allow_unauthenticated()
                } else {
                    verifier_builder
                }
                .build()
                .map_err(|e| Error::from_source(std::io::Error::other(e.to_string())))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = builder.with_cert_resolver(Arc::new(certs));
        config.alpn_protocols.push(ALPN_H2.into());
        Ok(Self {
            inner: Arc::new(config),
        })
    }

    pub(crate) async fn accept<IO>(&self, io: IO) -> Result<TlsStream<IO>, Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = RustlsAcceptor::from(self.inner.clone());
        acceptor
            .accept(io)
            .await
            .map_err(|e| Error::from_source(e))
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}
