//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns one of the variants below
//! rather than a bare [`BoxError`]; `BoxError` remains available for wrapping
//! opaque causes from `h2`, `std::io`, or TLS libraries.

use std::fmt;

/// Type-erased error, used only as the `source` of the variants below.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Validation failures surfaced at component construction/init time.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("invalid interface string {input:?}: {reason}")]
    InvalidInterface { input: String, reason: &'static str },

    #[error("invalid host header {input:?}: {reason}")]
    InvalidHost { input: String, reason: &'static str },

    #[error("port {0} out of range (1..=65535)")]
    PortOutOfRange(u32),

    #[error("file descriptor {0} out of range (0..=65535)")]
    FdOutOfRange(u32),

    #[error("duplicate certificate entry for hostname {0:?}")]
    DuplicateCertificate(String),

    #[error("duplicate endpoint name {0:?}")]
    DuplicateEndpoint(String),

    #[error("both `rotate` and `save` triggers configured without resolution")]
    ConflictingRotationTriggers,

    #[error("unrecognised configuration field {0:?}")]
    UnknownField(String),
}

/// Admission-control denial. Locally handled by the caller (503 + close);
/// exposed publicly so callers can distinguish it from other I/O failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AdmissionError {
    #[error("requested minimum {min} exceeds bucket capacity {capacity}")]
    Impossible { min: f64, capacity: f64 },

    #[error("waiter queue is full")]
    QueueFull,
}

/// Session/connection-level protocol errors. Handled locally by removing the
/// session from the live set; never propagated past the endpoint.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("http/2 session error: {0}")]
    Session(#[source] BoxError),

    #[error("http/2 frame error: {0}")]
    FrameError(#[source] BoxError),

    #[error("peer sent goaway")]
    GoAway,
}

/// Errors surfaced from a request handler invocation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandlerError {
    #[error("handler returned true without completing the response")]
    ResponseNotActuallyHandled,

    #[error("handler raised an uncaught error: {0}")]
    TopLevelError(#[source] BoxError),
}

/// Raised from a [`crate::wrangler::Wrangler::stop`] call (or
/// [`crate::endpoint_manager::EndpointManager::stop`]) when sessions survive
/// both the graceful and forced shutdown passes.
#[derive(Debug, thiserror::Error)]
#[error("{count} session(s) did not shut down within the grace period")]
pub struct ShutdownIncomplete {
    pub count: usize,
}

/// Filesystem errors during rotation that are not silently tolerated
/// (`ENOENT` is tolerated at the call site and never reaches this type).
#[derive(Debug, thiserror::Error)]
#[error("rotation I/O error on {path}: {source}")]
pub struct TransientFilesystemError {
    pub path: std::path::PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// The crate's unified error type, returned from any public fallible API
/// that does not already have a narrower error type of its own.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    ShutdownIncomplete(#[from] ShutdownIncomplete),

    #[error(transparent)]
    TransientFilesystem(#[from] TransientFilesystemError),

    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(String),

    #[error("{0}")]
    Other(#[source] BoxError),
}

impl Error {
    pub(crate) fn from_source(source: impl Into<BoxError>) -> Self {
        Self::Other(source.into())
    }
}

/// Displays an error together with its full `source()` chain, one cause per
/// line. Used at trace/debug log sites instead of `{}` so nested causes
/// (TLS -> io -> os) are not swallowed.
pub(crate) struct DisplayErrorStack<'a>(pub(crate) &'a (dyn std::error::Error + 'static));

impl fmt::Display for DisplayErrorStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = self.0.source();
        while let Some(err) = cause {
            write!(f, ": {err}")?;
            cause = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DisplayErrorStack;
    use std::error::Error;
    use std::fmt::{self, Display, Formatter};
    use std::sync::Arc;

    #[test]
    fn error_stack_chains_sources() {
        #[derive(Debug)]
        struct TestError(&'static str, Option<Arc<TestError>>);

        impl Display for TestError {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Error for TestError {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                self.1.as_ref().map(|e| e as &(dyn Error + 'static))
            }
        }

        let a = Arc::new(TestError("a", None));
        let b = Arc::new(TestError("b", Some(a.clone())));
        let c = Arc::new(TestError("c", Some(b.clone())));

        assert_eq!("a", DisplayErrorStack(&*a).to_string());
        assert_eq!("b: a", DisplayErrorStack(&*b).to_string());
        assert_eq!("c: b: a", DisplayErrorStack(&*c).to_string());
    }
}
