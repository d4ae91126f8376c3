//! TLS configuration and SNI-based certificate selection (spec §4.5, §4.9).

pub(crate) mod acceptor;
pub mod cert_store;
mod config;
mod identity;

pub use cert_store::CertificateStore;
pub use config::ServerTlsConfig;
pub use identity::{Certificate, Identity};
