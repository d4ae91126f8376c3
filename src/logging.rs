//! Per-component [`tracing`] spans, so every log line emitted while serving
//! a connection/session/request carries its identifiers without every call
//! site threading them through by hand.

use tracing::Span;

use crate::context::{ConnectionContext, RequestContext, SessionContext};

pub fn connection_span(connection: &ConnectionContext) -> Span {
    tracing::info_span!(
        "connection",
        conn.id = %connection.id,
        conn.remote_addr = connection.remote_addr.map(|a| a.to_string()),
    )
}

pub fn session_span(session: &SessionContext) -> Span {
    tracing::info_span!(
        "session",
        session.id = %session.id,
        conn.id = %session.connection.id,
    )
}

pub fn request_span(request: &RequestContext) -> Span {
    tracing::info_span!(
        "request",
        request.id = %request.id,
        session.id = %request.session.id,
        request.host = request.host.as_deref(),
    )
}
