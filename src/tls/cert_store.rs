//! Per-hostname certificate selection (spec §4.5/§4.9): a listener may be
//! configured with several `(hostname, identity)` pairs, and the right one is
//! chosen per-connection from the TLS ClientHello's SNI extension.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::error::ValidationError;
use crate::tls::identity::Identity;

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// Yields every wildcard key that could match `hostname`, from the
/// narrowest (`*.a.b.example.com`) to the widest (`*.com`), by stripping one
/// leading label at a time. A name with no dot yields nothing.
fn wildcard_candidates(hostname: &str) -> impl Iterator<Item = String> + '_ {
    let mut rest = hostname;
    std::iter::from_fn(move || {
        let (_, tail) = rest.split_once('.')?;
        rest = tail;
        Some(format!("*.{tail}"))
    })
}

/// Maps hostnames to certified keys and resolves SNI lookups against it.
/// One store is shared by all connections accepted on a given listener.
pub struct CertificateStore {
    entries: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

/// Picks the matching entry for `name` out of `entries`, trying (in order)
/// an exact match, each progressively-shortened wildcard, then the literal
/// `"*"` global wildcard. Kept generic over the value type so the tier
/// logic can be unit tested without constructing real certified keys.
fn select_tier<'a, V>(entries: &'a HashMap<String, V>, name: &str) -> Option<&'a V> {
    let name = normalize(name);
    if let Some(value) = entries.get(&name) {
        return Some(value);
    }
    for wildcard in wildcard_candidates(&name) {
        if let Some(value) = entries.get(&wildcard) {
            return Some(value);
        }
    }
    entries.get("*")
}

impl CertificateStore {
    pub fn builder() -> CertificateStoreBuilder {
        CertificateStoreBuilder::default()
    }

    fn lookup(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        select_tier(&self.entries, name)
            .cloned()
            .or_else(|| self.default.clone())
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("hostnames", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.lookup(name),
            None => self.default.clone(),
        }
    }
}

#[derive(Default)]
pub struct CertificateStoreBuilder {
    entries: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

impl CertificateStoreBuilder {
    /// Registers `identity` for `hostname` — a concrete name, a `*.` wildcard,
    /// or the literal `"*"` global wildcard (matched only after every
    /// concrete name and every wildcard prefix has missed). The first entry
    /// added also becomes the fallback used when a ClientHello carries no
    /// SNI extension or an unmatched name and no other default has been set.
    pub fn add(mut self, hostname: &str, identity: &Identity) -> Result<Self, ValidationError> {
        let key = identity
            .to_certified_key()
            .map_err(|reason| ValidationError::InvalidHost {
                input: hostname.to_string(),
                reason,
            })?;
        let key = Arc::new(key);
        let normalized = normalize(hostname);
        if self.entries.contains_key(&normalized) {
            return Err(ValidationError::DuplicateCertificate(normalized));
        }
        if self.default.is_none() {
            self.default = Some(key.clone());
        }
        self.entries.insert(normalized, key);
        Ok(self)
    }

    /// Explicitly sets the fallback used for SNI-less or unmatched
    /// connections, overriding the implicit "first entry added" default.
    pub fn default_identity(mut self, identity: &Identity) -> Result<Self, ValidationError> {
        let key = identity
            .to_certified_key()
            .map_err(|reason| ValidationError::InvalidHost {
                input: "<default>".to_string(),
                reason,
            })?;
        self.default = Some(Arc::new(key));
        Ok(self)
    }

    pub fn build(self) -> CertificateStore {
        CertificateStore {
            entries: self.entries,
            default: self.default,
        }
    }
}

pub(crate) fn private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, &'static str> {
    rustls_pemfile::private_key(&mut std::io::Cursor::new(pem))
        .map_err(|_| "malformed PEM private key")?
        .ok_or("no private key found in PEM input")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_candidates_progressively_shorten() {
        assert_eq!(
            wildcard_candidates("a.b.example.com").collect::<Vec<_>>(),
            vec!["*.b.example.com", "*.example.com", "*.com"],
        );
        assert_eq!(wildcard_candidates("com").collect::<Vec<_>>(), Vec::<String>::new());
    }

    #[test]
    fn select_tier_matches_progressively_shortened_wildcard() {
        let mut entries = HashMap::new();
        entries.insert("*.example.com".to_string(), "wide");
        assert_eq!(select_tier(&entries, "a.b.example.com"), Some(&"wide"));
        assert_eq!(select_tier(&entries, "example.net"), None);
    }

    #[test]
    fn select_tier_prefers_exact_and_narrower_wildcards_first() {
        let mut entries = HashMap::new();
        entries.insert("*.example.com".to_string(), "wide");
        entries.insert("*.b.example.com".to_string(), "narrow");
        entries.insert("a.b.example.com".to_string(), "exact");
        assert_eq!(select_tier(&entries, "a.b.example.com"), Some(&"exact"));
        entries.remove("a.b.example.com");
        assert_eq!(select_tier(&entries, "a.b.example.com"), Some(&"narrow"));
    }

    #[test]
    fn select_tier_falls_back_to_global_wildcard() {
        let mut entries = HashMap::new();
        entries.insert("*".to_string(), "catch-all");
        assert_eq!(select_tier(&entries, "anything.invalid"), Some(&"catch-all"));
    }

    #[test]
    fn normalize_strips_trailing_dot_and_case() {
        assert_eq!(normalize("Example.COM."), "example.com");
    }
}
