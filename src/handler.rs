//! The application-facing extension points (spec §4.7, §4.10): a request
//! [`Handler`], plus optional observers a [`crate::wrangler::Wrangler`]
//! notifies at connection/session boundaries.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

use crate::context::{ConnectionContext, RequestContext, SessionContext};
use crate::error::HandlerError;

/// Request bodies are driven directly off the `h2::RecvStream` rather than
/// through a `hyper::Body`/`tower::Service` pipeline: this crate talks to
/// `h2` below hyper's auto-negotiation layer so it can hook session open,
/// idle-timeout, and forced-destroy events the wrangler needs (spec §4.10).
pub type RequestBody = h2::RecvStream;

/// A fully-buffered response body. Handlers that need to stream should write
/// directly to the `h2::SendStream` obtained from the session loop instead
/// of returning through this trait (see [`crate::wrangler::Wrangler`]).
pub type ResponseBody = Bytes;

/// The three-valued outcome spec §4.8 step 7 requires of a handler: it
/// either produces a response, declines to handle the request at all (the
/// wrangler then answers with `404`), or — by returning `Err` from
/// [`Handler::handle`] — fails, and the wrangler answers with `500`.
pub enum HandlerOutcome {
    Handled(Response<ResponseBody>),
    Declined,
}

/// Handles one HTTP/2 request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        request: Request<RequestBody>,
        context: std::sync::Arc<RequestContext>,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Observes connection lifecycle events. All methods default to no-ops so
/// implementors only override what they need.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn on_connection_open(&self, _connection: &ConnectionContext) {}
    async fn on_connection_close(&self, _connection: &ConnectionContext) {}
}

/// Observes session (HTTP/2 connection preface to GOAWAY) lifecycle events.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_session_open(&self, _session: &SessionContext) {}
    async fn on_session_close(&self, _session: &SessionContext) {}
}

/// Observes completed requests, for access logging.
#[async_trait]
pub trait RequestLogger: Send + Sync {
    async fn on_request_complete(
        &self,
        context: &RequestContext,
        status: http::StatusCode,
        duration: std::time::Duration,
    );
}

/// Per-connection admission check run before a connection is accepted onto
/// an endpoint's live set, independent of the [`crate::token_bucket::TokenBucket`]
/// used for request-level admission.
#[async_trait]
pub trait ConnectionLimiter: Send + Sync {
    async fn admit(&self, connection: &ConnectionContext) -> bool;
}
