//! Shared lifecycle shape for the crate's stateful pieces (spec §4.1): an
//! `init` done once, then any number of `start`/`stop` cycles, with children
//! started after their parent and stopped before it.
//!
//! [`crate::wrangler::Wrangler`], [`crate::endpoint_manager::EndpointManager`],
//! and [`crate::file_preserver::FilePreserver`] all implement [`Component`].
//! `EndpointManager` fans out to its wranglers with
//! `futures_util::future::join_all` instead of [`start_children`]/
//! [`stop_children`]: spec §4.10 requires the wranglers it owns to start and
//! stop *concurrently*, while these two helpers are strictly ordered
//! (parent-then-children / children-then-parent), which is what
//! `Wrangler` uses them for with the [`crate::file_preserver::FilePreserver`]s
//! attached to it.

use async_trait::async_trait;

use crate::error::BoxError;

/// A unit with an init/start/stop lifecycle. `start`/`stop` may be called
/// more than once (a reload is a `stop(will_reload: true)` immediately
/// followed by a fresh `start(is_reload: true)`); `init` runs at most once.
#[async_trait]
pub trait Component: Send + Sync {
    /// Human-readable name for logs; not necessarily unique.
    fn component_name(&self) -> &str;

    /// One-time setup run before the first `start`. Default: no-op.
    async fn init(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Brings the component up. `is_reload` is true when this start follows
    /// a `stop(will_reload: true)` rather than a fresh cold start.
    async fn start(&self, is_reload: bool) -> Result<(), BoxError>;

    /// Brings the component down. `will_reload` is true when a `start(is_reload:
    /// true)` is expected to follow shortly; implementations may use it to
    /// skip releasing resources that will just be re-acquired.
    async fn stop(&self, will_reload: bool) -> Result<(), BoxError>;
}

/// Starts every child in order, stopping whichever already started if a
/// later one fails, so a failed `start` never leaves a partial child set
/// running silently.
pub async fn start_children(
    children: &[&(dyn Component + Sync)],
    is_reload: bool,
) -> Result<(), BoxError> {
    for (i, child) in children.iter().enumerate() {
        if let Err(e) = child.start(is_reload).await {
            tracing::warn!(component = child.component_name(), error = %crate::error::DisplayErrorStack(&*e), "child start failed, rolling back");
            for started in children[..i].iter().rev() {
                let _ = started.stop(false).await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Stops every child in reverse start order, collecting (rather than
/// short-circuiting on) individual failures so one stuck child doesn't
/// prevent its siblings from being asked to stop too.
pub async fn stop_children(
    children: &[&(dyn Component + Sync)],
    will_reload: bool,
) -> Result<(), BoxError> {
    let mut first_err = None;
    for child in children.iter().rev() {
        if let Err(e) = child.stop(will_reload).await {
            tracing::warn!(component = child.component_name(), error = %crate::error::DisplayErrorStack(&*e), "child stop failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        order: &'static Mutex<Vec<&'static str>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Component for Recorder {
        fn component_name(&self) -> &str {
            self.name
        }

        async fn start(&self, _is_reload: bool) -> Result<(), BoxError> {
            if self.fail_start {
                return Err(Box::new(std::io::Error::other("boom")));
            }
            self.order.lock().unwrap().push(self.name);
            Ok(())
        }

        async fn stop(&self, _will_reload: bool) -> Result<(), BoxError> {
            self.order.lock().unwrap().retain(|n| *n != self.name);
            Ok(())
        }
    }

    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    #[tokio::test]
    async fn failed_start_rolls_back_started_siblings() {
        ORDER.lock().unwrap().clear();
        CALLS.store(0, Ordering::SeqCst);

        let a = Recorder { name: "a", order: &ORDER, fail_start: false };
        let b = Recorder { name: "b", order: &ORDER, fail_start: true };
        let children: Vec<&(dyn Component + Sync)> = vec![&a, &b];

        let err = start_children(&children, false).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(ORDER.lock().unwrap().is_empty());
    }
}
