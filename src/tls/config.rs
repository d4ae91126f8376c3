use std::fmt;

use crate::error::Error;
use crate::tls::acceptor::TlsAcceptor;
use crate::tls::cert_store::CertificateStore;
use crate::tls::identity::{Certificate, Identity};

/// Builds the TLS configuration for one listener: a set of per-hostname
/// certificates selected via SNI, plus optional client certificate
/// verification.
#[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
pub struct ServerTlsConfig {
    identities: Vec<(String, Identity)>,
    client_ca_root: Option<Certificate>,
    client_auth_optional: bool,
}

impl fmt::Debug for ServerTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTlsConfig")
            .field("hostnames", &self.identities.iter().map(|(h, _)| h).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ServerTlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTlsConfig {
    pub fn new() -> Self {
        ServerTlsConfig {
            identities: Vec::new(),
            client_ca_root: None,
            client_auth_optional: false,
        }
    }

    /// Registers the certificate to serve when the ClientHello's SNI
    /// extension matches `hostname` (or, for a `*.domain` entry, any
    /// immediate subdomain of `domain`). The first registered entry also
    /// becomes the fallback for SNI-less connections.
    pub fn identity(mut self, hostname: impl Into<String>, identity: Identity) -> Self {
        self.identities.push((hostname.into(), identity));
        self
    }

    /// Sets a certificate against which to validate client TLS certificates.
    pub fn client_ca_root(mut self, cert: Certificate) -> Self {
        self.client_ca_root = Some(cert);
        self
    }

    /// Accepts connections without a client certificate even when
    /// `client_ca_root` is set, rather than rejecting the handshake.
    pub fn client_auth_optional(mut self, optional: bool) -> Self {
        self.client_auth_optional = optional;
        self
    }

    pub(crate) fn tls_acceptor(&self) -> Result<TlsAcceptor, Error> {
        let mut builder = CertificateStore::builder();
        for (hostname, identity) in &self.identities {
            builder = builder
                .add(hostname, identity)
                .map_err(Error::from)?;
        }
        let store = builder.build();
        TlsAcceptor::new(store, self.client_ca_root.clone(), self.client_auth_optional)
    }
}
