//! Owns the full set of configured endpoints (spec §4.12): starts and stops
//! every [`Wrangler`] together, and routes name-based lookups (e.g. for
//! `onReload` of one endpoint) through [`Error::UnknownEndpoint`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::component::Component;
use crate::error::{BoxError, Error};
use crate::wrangler::Wrangler;

pub struct EndpointManager {
    endpoints: HashMap<String, Arc<Wrangler>>,
}

impl EndpointManager {
    pub fn new(endpoints: Vec<Arc<Wrangler>>) -> Result<Self, Error> {
        let mut map = HashMap::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let name = endpoint.component_name().to_string();
            if map.insert(name.clone(), endpoint).is_some() {
                return Err(crate::error::ValidationError::DuplicateEndpoint(name).into());
            }
        }
        Ok(Self { endpoints: map })
    }

    pub fn endpoint(&self, name: &str) -> Result<&Arc<Wrangler>, Error> {
        self.endpoints
            .get(name)
            .ok_or_else(|| Error::UnknownEndpoint(name.to_string()))
    }

    pub fn endpoint_names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    /// Starts every endpoint in parallel. If any fails, the others that
    /// already started are stopped before the error is returned, so a
    /// partial `start()` never leaves a half-up manager running silently.
    pub async fn start_all(&self, is_reload: bool) -> Result<(), BoxError> {
        let results = join_all(
            self.endpoints
                .values()
                .map(|endpoint| endpoint.start(is_reload)),
        )
        .await;

        if let Some(first_err_idx) = results.iter().position(Result::is_err) {
            let started: Vec<_> = self.endpoints.values().collect();
            join_all(
                started[..first_err_idx]
                    .iter()
                    .map(|endpoint| endpoint.stop(false)),
            )
            .await;
            return results.into_iter().nth(first_err_idx).unwrap();
        }
        Ok(())
    }

    /// Stops every endpoint in parallel, collecting the first failure (if
    /// any) rather than short-circuiting, so one stuck endpoint doesn't
    /// prevent its siblings from being asked to stop too.
    pub async fn stop_all(&self, will_reload: bool) -> Result<(), BoxError> {
        let results = join_all(
            self.endpoints
                .values()
                .map(|endpoint| endpoint.stop(will_reload)),
        )
        .await;

        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    pub async fn reload(&self, name: &str) -> Result<(), BoxError> {
        let endpoint = self.endpoint(name)?;
        endpoint.stop(true).await?;
        endpoint.start(true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::handler::{Handler, HandlerOutcome};
    use crate::net::address::InterfaceAddress;
    use async_trait::async_trait;

    struct NullHandler;

    #[async_trait]
    impl Handler for NullHandler {
        async fn handle(
            &self,
            _request: http::Request<h2::RecvStream>,
            _context: Arc<crate::context::RequestContext>,
        ) -> Result<HandlerOutcome, crate::error::HandlerError> {
            Ok(HandlerOutcome::Handled(http::Response::new(bytes::Bytes::new())))
        }
    }

    fn endpoint(name: &str, port: u16) -> Arc<Wrangler> {
        let config = ListenerConfig::new(
            name,
            InterfaceAddress::Tcp(format!("127.0.0.1:{port}").parse().unwrap()),
        );
        Arc::new(Wrangler::new(config, Arc::new(NullHandler)).unwrap())
    }

    #[test]
    fn rejects_duplicate_endpoint_names() {
        let err = EndpointManager::new(vec![endpoint("a", 0), endpoint("a", 0)]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_endpoint_reload_fails() {
        let manager = EndpointManager::new(vec![endpoint("a", 0)]).unwrap();
        let err = manager.reload("missing").await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
