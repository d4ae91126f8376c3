//! PEM-encoded certificate/key material, kept as raw bytes until a
//! [`crate::tls::cert_store::CertificateStore`] turns it into a loaded
//! rustls [`CertifiedKey`](tokio_rustls::rustls::sign::CertifiedKey).

use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::tls::cert_store::private_key_from_pem;

#[derive(Debug, Clone)]
pub struct Certificate {
    pub(crate) pem: Vec<u8>,
}

impl Certificate {
    pub fn from_pem(pem: Vec<u8>) -> Self {
        Self { pem }
    }

    pub(crate) fn to_der_chain(&self) -> Result<Vec<CertificateDer<'static>>, &'static str> {
        rustls_pemfile::certs(&mut std::io::Cursor::new(&self.pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| "malformed PEM certificate chain")
    }
}

/// A certificate chain plus its matching private key.
#[derive(Debug, Clone)]
pub struct Identity {
    pub(crate) cert: Certificate,
    pub(crate) key: Vec<u8>,
}

impl Identity {
    pub fn from_pem(cert: Vec<u8>, key: Vec<u8>) -> Self {
        Self {
            cert: Certificate::from_pem(cert),
            key,
        }
    }

    pub(crate) fn to_certified_key(&self) -> Result<CertifiedKey, &'static str> {
        let chain = self.cert.to_der_chain()?;
        let key = private_key_from_pem(&self.key)?;
        let signing_key = tokio_rustls::rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|_| "unsupported private key type")?;
        Ok(CertifiedKey::new(chain, signing_key))
    }
}
