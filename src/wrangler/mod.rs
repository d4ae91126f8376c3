//! `ProtocolWrangler`: one TLS/HTTP2 listener (spec §4.10). Accepts TCP
//! connections, completes the TLS handshake (if configured) and the HTTP/2
//! preface, then drives one session per connection to completion, enforcing
//! an idle-session timeout and a bounded graceful shutdown.

mod conn;
mod io;
mod io_stream;
mod incoming;

pub use incoming::TcpIncoming;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::Notify;
use tokio_stream::StreamExt as _;
use tracing::Instrument;

use crate::component::{self, Component};
use crate::config::ListenerConfig;
use crate::context::{ConnectionContext, ContextTracker, RequestContext, SessionContext};
use crate::error::{BoxError, Error, ProtocolError, ShutdownIncomplete, ValidationError};
use crate::event::{EventSink, EventSource, LinkedEvent};
use crate::file_preserver::FilePreserver;
use crate::handler::{ConnectionObserver, Handler, HandlerOutcome, RequestLogger, SessionObserver};
use crate::ids::Identifier;
use crate::logging;
use crate::net::address::InterfaceAddress;
use crate::net::host::HostInfo;
use crate::request::{self, classify_target, resolve_authority, sanitize_headers, TargetForm};
use crate::threadlet::{StopSignal, Threadlet, ThreadletError};
use crate::time::{SystemTimeSource, TimeSource};
use crate::token_bucket::TokenBucket;
use crate::wrangler::conn::Connected as _;
use crate::wrangler::io::ServerIo;
use crate::wrangler::io_stream::ServerIoStream;

/// How long a session is given to drain in-flight streams after
/// `graceful_shutdown()` before the wrangler stops waiting on it and treats
/// it as closed for bookkeeping purposes, win or lose (spec §9 Open
/// Question: resolved in `DESIGN.md`).
pub const DEFAULT_SESSION_STOP_GRACE: Duration = Duration::from_millis(250);

/// Retained window for [`Wrangler::events`] (spec §4.3): bounds how many
/// past lifecycle events stay reachable from `earliest_event` before being
/// dropped.
const EVENT_RETAIN: usize = 64;

/// `wrangler-rt`'s `Server` response header value (spec §4.8 step 4).
const SERVER_HEADER_VALUE: &str = concat!("wrangler-rt/", env!("CARGO_PKG_VERSION"));

/// Lifecycle events a [`Wrangler`] emits over its [`EventSource`] (spec
/// §4.3, §4.8, §4.10): connection/session open and close, each request
/// received and completed, and idle-timeout-triggered closes.
#[derive(Debug, Clone)]
pub enum WranglerEvent {
    /// The chain's seed; never observed by a real subscriber.
    Kickoff,
    ConnectionOpened { connection: Identifier },
    ConnectionClosed { connection: Identifier },
    SessionOpened { session: Identifier },
    SessionClosed { session: Identifier, reason: SessionCloseReason },
    IncomingRequest { request: Identifier },
    RequestCompleted { request: Identifier, status: http::StatusCode },
    IdleTimeout { session: Identifier },
}

/// Why a session's [`WranglerEvent::SessionClosed`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCloseReason {
    ClientGoAway,
    FrameError,
    IdleTimeout,
    ServerShutdown,
    AdmissionDenied,
}

struct SessionHandle {
    threadlet: Arc<Threadlet>,
}

/// Optional plugins a [`Wrangler`] notifies or consults; every field is
/// independently optional.
#[derive(Default)]
pub struct WranglerPlugins {
    pub connection_observer: Option<Arc<dyn ConnectionObserver>>,
    pub session_observer: Option<Arc<dyn SessionObserver>>,
    pub request_logger: Option<Arc<dyn RequestLogger>>,
    pub request_bucket: Option<TokenBucket>,
}

/// Lets a per-request task ask its owning session to begin a connection-wide
/// graceful close, rather than only failing its own stream (spec §4.8 step
/// 6: admission denial closes the whole connection, not just the one
/// stream that triggered it).
#[derive(Clone)]
struct SessionCloser {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl SessionCloser {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn request_close(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn should_close(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        if self.should_close() {
            return;
        }
        self.notify.notified().await;
    }
}

/// The state shared between the accept loop and every spawned session task.
/// Kept separate from [`Wrangler`] itself so those tasks only need this
/// piece `Arc`'d, not the whole wrangler (which also owns the accept loop's
/// own [`Threadlet`], with its own borrow of `self`).
struct Inner {
    name: String,
    config: ListenerConfig,
    handler: Arc<dyn Handler>,
    plugins: WranglerPlugins,
    time: Arc<dyn TimeSource>,
    sessions: Mutex<HashMap<Identifier, SessionHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tracker: Arc<ContextTracker<h2::StreamId>>,
    events: Arc<EventSource<WranglerEvent>>,
    event_sink: EventSink,
    kickoff_node: Arc<LinkedEvent<WranglerEvent>>,
    file_preservers: Vec<FilePreserver>,
}

pub struct Wrangler {
    inner: Arc<Inner>,
    accept_loop: Threadlet,
}

impl Wrangler {
    pub fn new(config: ListenerConfig, handler: Arc<dyn Handler>) -> Result<Self, ValidationError> {
        Self::with_plugins(config, handler, WranglerPlugins::default(), Vec::new())
    }

    /// `file_preservers` are started after this wrangler's own accept loop
    /// and stopped before it, per spec §4.12's parent/child ordering, via
    /// [`component::start_children`]/[`component::stop_children`].
    pub fn with_plugins(
        config: ListenerConfig,
        handler: Arc<dyn Handler>,
        plugins: WranglerPlugins,
        file_preservers: Vec<FilePreserver>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;

        let events = Arc::new(EventSource::new(WranglerEvent::Kickoff, EVENT_RETAIN));
        let kickoff_node = events.kickoff_node();

        Ok(Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                config,
                handler,
                plugins,
                time: Arc::new(SystemTimeSource::new()),
                sessions: Mutex::new(HashMap::new()),
                local_addr: Mutex::new(None),
                tracker: Arc::new(ContextTracker::new()),
                events,
                event_sink: EventSink::new("wrangler-events"),
                kickoff_node,
                file_preservers,
            }),
            accept_loop: Threadlet::new("wrangler-accept"),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// The chain of connection/session/request lifecycle events this
    /// wrangler has emitted (spec §4.3).
    pub fn events(&self) -> &Arc<EventSource<WranglerEvent>> {
        &self.inner.events
    }

    fn bind(&self) -> Result<TcpIncoming, Error> {
        let incoming = match &self.inner.config.interface {
            InterfaceAddress::Tcp(addr) => TcpIncoming::bind(*addr),
            InterfaceAddress::Fd { .. } => {
                return Err(Error::from_source(std::io::Error::other(
                    "adopting a pre-opened fd is not supported on this platform's binding path",
                )))
            }
        }
        .map_err(Error::from_source)?;

        Ok(incoming
            .with_nodelay(self.inner.config.nodelay)
            .with_keepalive(self.inner.config.keepalive))
    }
}

impl Inner {
    async fn run_accept_loop(
        self: Arc<Self>,
        incoming: TcpIncoming,
        stop: StopSignal,
    ) -> Result<(), ThreadletError> {
        #[cfg(feature = "tls")]
        let tls_acceptor = match &self.config.tls {
            Some(tls) => Some(
                tls.tls_acceptor()
                    .map_err(|e| Arc::new(e) as ThreadletError)?,
            ),
            None => None,
        };

        #[cfg(feature = "tls")]
        let mut accepted = ServerIoStream::new(incoming, tls_acceptor);
        #[cfg(not(feature = "tls"))]
        let mut accepted = ServerIoStream::new(incoming);

        loop {
            let next = tokio::select! {
                item = accepted.next() => item,
                _ = stop.wait() => return Ok(()),
            };

            match next {
                Some(Ok(io)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.accept_one(io).await });
                }
                Some(Err(e)) => {
                    tracing::warn!(wrangler = %self.name, error = %e, "accept error");
                }
                None => return Ok(()),
            }
        }
    }

    async fn accept_one(self: Arc<Self>, io: ServerIo<tokio::net::TcpStream>) {
        let connection = Arc::new(ConnectionContext {
            id: Identifier::generate(),
            remote_addr: io.remote_addr(),
            peer_certs: io.peer_certs(),
            tls_alpn: io.negotiated_alpn(),
        });

        self.events
            .emit(WranglerEvent::ConnectionOpened { connection: connection.id.clone() })
            .ok();
        if let Some(observer) = &self.plugins.connection_observer {
            observer.on_connection_open(&connection).await;
        }

        let span = logging::connection_span(&connection);
        let inner = self.clone();
        let connection_for_session = connection.clone();

        async move {
            let session_threadlet = Arc::new(Threadlet::new("wrangler-session"));
            let session_id = Identifier::generate();
            inner.sessions.lock().unwrap().insert(
                session_id.clone(),
                SessionHandle {
                    threadlet: session_threadlet.clone(),
                },
            );

            let serve_inner = inner.clone();
            let result = session_threadlet
                .run(async { Ok(()) }, move |stop| {
                    Box::pin(async move {
                        serve_inner
                            .serve_session(io, connection_for_session, stop)
                            .await
                            .map_err(|e| Arc::new(e) as ThreadletError)
                    })
                })
                .await;

            inner.sessions.lock().unwrap().remove(&session_id);

            if let Err(e) = result {
                tracing::debug!(wrangler = %inner.name, error = %e, "session ended with error");
            }
        }
        .instrument(span)
        .await;

        if let Some(observer) = &self.plugins.connection_observer {
            observer.on_connection_close(&connection).await;
        }
        self.events
            .emit(WranglerEvent::ConnectionClosed { connection: connection.id.clone() })
            .ok();
    }

    async fn serve_session(
        self: Arc<Self>,
        io: ServerIo<tokio::net::TcpStream>,
        connection: Arc<ConnectionContext>,
        stop: StopSignal,
    ) -> Result<(), BoxError> {
        let mut h2_conn = h2::server::handshake(io)
            .await
            .map_err(|e| ProtocolError::Session(Box::new(e)))?;

        let session = Arc::new(SessionContext {
            id: Identifier::generate(),
            connection: connection.clone(),
        });
        self.events
            .emit(WranglerEvent::SessionOpened { session: session.id.clone() })
            .ok();
        if let Some(observer) = &self.plugins.session_observer {
            observer.on_session_open(&session).await;
        }

        let span = logging::session_span(&session);
        let idle_timeout = self.config.idle_session_timeout;
        let closer = SessionCloser::new();
        let inner = self.clone();

        async move {
            let mut close_reason = SessionCloseReason::ClientGoAway;
            let mut shutting_down = false;

            let loop_result: Result<(), BoxError> = loop {
                let next = tokio::select! {
                    item = h2_conn.accept() => item,
                    _ = stop.wait(), if !shutting_down => {
                        h2_conn.graceful_shutdown();
                        close_reason = SessionCloseReason::ServerShutdown;
                        shutting_down = true;
                        continue;
                    }
                    _ = inner.time.sleep(idle_timeout), if !shutting_down => {
                        tracing::debug!(session = %session.id, "idle session timeout");
                        inner
                            .events
                            .emit(WranglerEvent::IdleTimeout { session: session.id.clone() })
                            .ok();
                        h2_conn.graceful_shutdown();
                        close_reason = SessionCloseReason::IdleTimeout;
                        shutting_down = true;
                        continue;
                    }
                    _ = closer.wait(), if !shutting_down => {
                        h2_conn.graceful_shutdown();
                        close_reason = SessionCloseReason::AdmissionDenied;
                        shutting_down = true;
                        continue;
                    }
                };

                match next {
                    Some(Ok((request, respond))) => {
                        let inner = inner.clone();
                        let session = session.clone();
                        let closer = closer.clone();
                        tokio::spawn(async move {
                            inner.dispatch(closer, session, request, respond).await;
                        });
                    }
                    Some(Err(e)) => break Err(Box::new(ProtocolError::FrameError(Box::new(e)))),
                    None => break Ok(()),
                }
            };

            if loop_result.is_err() {
                close_reason = SessionCloseReason::FrameError;
            }

            inner
                .events
                .emit(WranglerEvent::SessionClosed {
                    session: session.id.clone(),
                    reason: close_reason,
                })
                .ok();
            if let Some(observer) = &inner.plugins.session_observer {
                observer.on_session_close(&session).await;
            }

            loop_result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        self: Arc<Self>,
        closer: SessionCloser,
        session: Arc<SessionContext>,
        request: http::Request<h2::RecvStream>,
        respond: h2::server::SendResponse<Bytes>,
    ) {
        let stream_id = respond.stream_id();
        let request_id = Identifier::generate();
        let started = self.time.now();

        self.events
            .emit(WranglerEvent::IncomingRequest { request: request_id.clone() })
            .ok();

        let local_port = self
            .local_addr
            .lock()
            .unwrap()
            .map(|addr| addr.port())
            .unwrap_or(0);
        let raw_authority = request
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                request
                    .headers()
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let host = resolve_authority(&request)
            .map(|resolved| resolved.host)
            .unwrap_or_else(|_| HostInfo::parse_safe(&raw_authority, local_port));

        let context = Arc::new(RequestContext {
            id: request_id,
            session,
            host: Some(host.host.clone()),
            request_start: started,
            sanitized_headers: sanitize_headers(request.headers()),
        });
        self.tracker.bind(stream_id, &context);

        let span = logging::request_span(&context);
        let inner = self.clone();
        let context_for_scope = context.clone();
        let context_for_handler = context.clone();
        let status = crate::context::scope(
            context_for_scope,
            async move {
                let mut respond = respond;

                if classify_target(&request) == TargetForm::Other {
                    return respond_with_status(&mut respond, http::StatusCode::BAD_REQUEST);
                }

                if let Some(bucket) = &inner.plugins.request_bucket {
                    if let Err((status, _)) = request::admit(bucket, 1.0).await {
                        closer.request_close();
                        return respond_with_status(&mut respond, status);
                    }
                }

                match inner.handler.handle(request, context_for_handler).await {
                    Ok(HandlerOutcome::Handled(response)) => send_response(&mut respond, response),
                    Ok(HandlerOutcome::Declined) => {
                        respond_with_status(&mut respond, http::StatusCode::NOT_FOUND)
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "handler error");
                        respond_with_status(&mut respond, http::StatusCode::INTERNAL_SERVER_ERROR)
                    }
                }
            }
            .instrument(span),
        )
        .await;

        self.tracker.unbind(&stream_id);
        self.events
            .emit(WranglerEvent::RequestCompleted {
                request: context.id.clone(),
                status,
            })
            .ok();

        if let Some(logger) = &self.plugins.request_logger {
            let elapsed = Duration::from_secs_f64((self.time.now() - started).max(0.0));
            logger.on_request_complete(&context, status, elapsed).await;
        }
    }
}

fn with_server_header(mut response: http::Response<Bytes>) -> http::Response<Bytes> {
    if !response.headers().contains_key(http::header::SERVER) {
        response.headers_mut().insert(
            http::header::SERVER,
            http::HeaderValue::from_static(SERVER_HEADER_VALUE),
        );
    }
    response
}

fn send_response(
    respond: &mut h2::server::SendResponse<Bytes>,
    response: http::Response<Bytes>,
) -> http::StatusCode {
    let response = with_server_header(response);
    let status = response.status();
    let (parts, body) = response.into_parts();
    let head = http::Response::from_parts(parts, ());
    match respond.send_response(head, body.is_empty()) {
        Ok(mut send_stream) => {
            if !body.is_empty() {
                let _ = send_stream.send_data(body, true);
            }
        }
        Err(e) => tracing::debug!(error = %e, "failed to send response head"),
    }
    status
}

fn respond_with_status(
    respond: &mut h2::server::SendResponse<Bytes>,
    status: http::StatusCode,
) -> http::StatusCode {
    let response = http::Response::builder()
        .status(status)
        .body(Bytes::new())
        .unwrap();
    send_response(respond, response)
}

#[async_trait]
impl Component for Wrangler {
    fn component_name(&self) -> &str {
        &self.inner.name
    }

    async fn start(&self, is_reload: bool) -> Result<(), BoxError> {
        let incoming = self.bind()?;
        *self.inner.local_addr.lock().unwrap() = incoming.local_addr().ok();

        self.inner
            .event_sink
            .start(self.inner.kickoff_node.clone(), |event: &WranglerEvent| {
                tracing::debug!(?event, "wrangler lifecycle event");
                Ok(())
            })
            .await
            .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as BoxError)?;

        let inner = self.inner.clone();
        self.accept_loop
            .start(async { Ok(()) }, move |stop| {
                Box::pin(async move { inner.run_accept_loop(incoming, stop).await })
            })
            .await
            .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as BoxError)?;

        let children: Vec<&(dyn Component + Sync)> = self
            .inner
            .file_preservers
            .iter()
            .map(|p| p as &(dyn Component + Sync))
            .collect();
        component::start_children(&children, is_reload).await
    }

    async fn stop(&self, will_reload: bool) -> Result<(), BoxError> {
        let children: Vec<&(dyn Component + Sync)> = self
            .inner
            .file_preservers
            .iter()
            .map(|p| p as &(dyn Component + Sync))
            .collect();
        component::stop_children(&children, will_reload).await?;

        self.accept_loop
            .stop()
            .await
            .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as BoxError)?;

        let sessions: Vec<Arc<Threadlet>> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|s| s.threadlet.clone())
            .collect();

        let grace = self.inner.config.shutdown_grace;
        let results = join_all(
            sessions
                .iter()
                .map(|session| tokio::time::timeout(grace, session.stop())),
        )
        .await;
        let forced = results.iter().filter(|r| r.is_err()).count();

        self.inner
            .event_sink
            .stop()
            .await
            .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as BoxError)?;

        if forced > 0 {
            // "undead sessions": still draining past their shared grace
            // period. Treated as closed for bookkeeping; each finishes in
            // the background on its own.
            return Err(Box::new(ShutdownIncomplete { count: forced }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod static_checks {
    use super::Wrangler;

    static_assertions::assert_impl_all!(Wrangler: Send, Sync);
}
