//! Connection/session/request context propagation (spec §4.1, §4.10).
//!
//! Each request carries an ambient chain of context: a [`RequestContext`]
//! points at the [`SessionContext`] it arrived on, which points at the
//! [`ConnectionContext`] the session is running over. The chain is made
//! available to handler code two ways: ambiently, via [`current()`] inside
//! the scope a request is dispatched in, and by explicit association, via
//! [`ContextTracker`], for code that only holds a non-owning handle (e.g. an
//! `h2::SendStream`) and needs to look its context back up later.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use crate::ids::Identifier;
use crate::tls::Certificate;

/// Metadata about the accepted TCP/TLS connection a session runs over.
pub struct ConnectionContext {
    pub id: Identifier,
    pub remote_addr: Option<SocketAddr>,
    pub peer_certs: Option<Vec<Certificate>>,
    pub tls_alpn: Option<Vec<u8>>,
}

/// Metadata about one HTTP/2 session multiplexed over a connection.
pub struct SessionContext {
    pub id: Identifier,
    pub connection: Arc<ConnectionContext>,
}

/// Metadata about one request within a session.
pub struct RequestContext {
    pub id: Identifier,
    pub session: Arc<SessionContext>,
    pub host: Option<String>,
    /// Monotonic seconds (from the wrangler's [`crate::time::TimeSource`]) at
    /// which this request was received (spec §3).
    pub request_start: f64,
    /// The request's headers with the fallback-transport `Host` header
    /// stripped (spec §4.7); see [`crate::request::sanitize_headers`].
    pub sanitized_headers: http::HeaderMap,
}

impl RequestContext {
    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.session.connection
    }
}

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

/// Runs `fut` with `context` as the ambient [`current()`] context.
pub async fn scope<F, T>(context: Arc<RequestContext>, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT.scope(context, fut).await
}

/// The request context of the scope this call is made from, if any. Returns
/// `None` outside of a [`scope`] call (e.g. in a background task that wasn't
/// explicitly handed a context).
pub fn try_current() -> Option<Arc<RequestContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Like [`try_current`], but panics outside of a [`scope`] call. Use only
/// where the caller is certain it always runs within request dispatch.
pub fn current() -> Arc<RequestContext> {
    try_current().expect("called context::current() outside of a request scope")
}

/// Associates non-owning handles (keyed by an arbitrary `K`, typically
/// something cheap like a stream id) with a context, for code that can't
/// thread an `Arc<RequestContext>` through directly. Entries are `Weak`, so
/// they disappear on their own once the context itself is dropped; expired
/// entries are swept out lazily on lookup.
pub struct ContextTracker<K> {
    bindings: Mutex<HashMap<K, Weak<RequestContext>>>,
}

impl<K: std::hash::Hash + Eq + Clone> Default for ContextTracker<K> {
    fn default() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone> ContextTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, key: K, context: &Arc<RequestContext>) {
        self.bindings.lock().unwrap().insert(key, Arc::downgrade(context));
    }

    pub fn lookup(&self, key: &K) -> Option<Arc<RequestContext>> {
        let mut bindings = self.bindings.lock().unwrap();
        match bindings.get(key).and_then(Weak::upgrade) {
            Some(ctx) => Some(ctx),
            None => {
                bindings.remove(key);
                None
            }
        }
    }

    pub fn unbind(&self, key: &K) {
        self.bindings.lock().unwrap().remove(key);
    }

    /// Drops every binding whose context has already been dropped. Call
    /// periodically from long-lived trackers instead of relying solely on
    /// lazy sweep-on-lookup.
    pub fn sweep(&self) {
        self.bindings.lock().unwrap().retain(|_, w| w.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> Arc<RequestContext> {
        let connection = Arc::new(ConnectionContext {
            id: Identifier::generate(),
            remote_addr: None,
            peer_certs: None,
            tls_alpn: None,
        });
        let session = Arc::new(SessionContext {
            id: Identifier::generate(),
            connection,
        });
        Arc::new(RequestContext {
            id: Identifier::generate(),
            session,
            host: Some("example.com".into()),
            request_start: 0.0,
            sanitized_headers: http::HeaderMap::new(),
        })
    }

    #[tokio::test]
    async fn current_is_available_only_inside_scope() {
        assert!(try_current().is_none());
        let ctx = test_context();
        let id = ctx.id.clone();
        scope(ctx, async {
            assert_eq!(current().id, id);
        })
        .await;
        assert!(try_current().is_none());
    }

    #[test]
    fn tracker_upgrades_while_context_alive_and_sweeps_after_drop() {
        let tracker: ContextTracker<u32> = ContextTracker::new();
        let ctx = test_context();
        tracker.bind(1, &ctx);
        assert!(tracker.lookup(&1).is_some());
        drop(ctx);
        assert!(tracker.lookup(&1).is_none());
    }
}
