//! Cooperative long-running task with an explicit start/stop lifecycle and a
//! cancellation signal, in place of an OS thread per component (design note
//! §9). [`crate::token_bucket::TokenBucket`]'s servicing loop,
//! [`crate::event::EventSink`]'s drain loop, and
//! [`crate::file_preserver::FilePreserver`]'s rotation scheduler are all
//! built on one of these.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Shared, cloneable error type for a threadlet's failure: main bodies run
/// on a detached task, so their error can't be moved out by value more than
/// once; an `Arc` lets every later idempotent `stop()` call observe it.
pub type ThreadletError = Arc<dyn std::error::Error + Send + Sync + 'static>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Cancellation signal readable from inside a threadlet's main body.
#[derive(Clone)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn should_stop(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once `stop()` has been requested. Safe to call repeatedly;
    /// resolves immediately if the signal has already fired.
    pub async fn wait(&self) {
        if self.should_stop() {
            return;
        }
        self.notify.notified().await;
    }

    fn fire(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// A cooperative task with optional `startBody`/`mainBody` phases. See
/// module docs and spec §4.4 for the full state machine.
pub struct Threadlet {
    name: &'static str,
    state: Mutex<State>,
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<Result<(), ThreadletError>>>>,
    last_result: Mutex<Option<Result<(), ThreadletError>>>,
}

impl Threadlet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::Idle),
            stop: StopSignal {
                flag: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            },
            handle: Mutex::new(None),
            last_result: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn should_stop(&self) -> bool {
        self.stop.should_stop()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs `start_body` once, then launches `main_body` as a detached task.
    /// Idempotent: if the threadlet is already starting/running/stopping,
    /// this is a no-op that returns `Ok(())` immediately without re-running
    /// either body — the caller is attaching to the in-progress lifecycle,
    /// not replacing it.
    pub async fn start<Fs, Fm>(&self, start_body: Fs, main_body: Fm) -> Result<(), ThreadletError>
    where
        Fs: Future<Output = Result<(), ThreadletError>> + Send + 'static,
        Fm: FnOnce(StopSignal) -> BoxFuture<Result<(), ThreadletError>> + Send + 'static,
    {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Idle {
                return Ok(());
            }
            *state = State::Starting;
        }

        if let Err(e) = start_body.await {
            *self.state.lock().unwrap() = State::Idle;
            tracing::debug!(threadlet = self.name, error = %e, "startBody failed");
            return Err(e);
        }

        self.stop.flag.store(false, Ordering::Release);
        *self.last_result.lock().unwrap() = None;

        let stop_signal = self.stop.clone();
        let handle = tokio::spawn(main_body(stop_signal));
        *self.handle.lock().unwrap() = Some(handle);
        *self.state.lock().unwrap() = State::Running;
        Ok(())
    }

    /// Requests cancellation and blocks until `mainBody` returns. Idempotent:
    /// repeated calls return the same cached result rather than re-awaiting
    /// an already-consumed task handle.
    pub async fn stop(&self) -> Result<(), ThreadletError> {
        if let Some(result) = self.last_result.lock().unwrap().clone() {
            return result;
        }

        let handle = {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Idle => return Ok(()),
                State::Running | State::Starting => *state = State::Stopping,
                State::Stopping => {}
            }
            self.handle.lock().unwrap().take()
        };

        self.stop.fire();

        let result = match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(Arc::new(JoinFailure(join_err.to_string())) as ThreadletError),
            },
            None => Ok(()),
        };

        *self.last_result.lock().unwrap() = Some(result.clone());
        *self.state.lock().unwrap() = State::Idle;
        result
    }

    /// Convenience: `start()` followed by `stop()`, propagating whichever
    /// side failed.
    pub async fn run<Fs, Fm>(&self, start_body: Fs, main_body: Fm) -> Result<(), ThreadletError>
    where
        Fs: Future<Output = Result<(), ThreadletError>> + Send + 'static,
        Fm: FnOnce(StopSignal) -> BoxFuture<Result<(), ThreadletError>> + Send + 'static,
    {
        self.start(start_body, main_body).await?;
        self.stop().await
    }
}

#[derive(Debug)]
struct JoinFailure(String);

impl std::fmt::Display for JoinFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "threadlet task panicked: {}", self.0)
    }
}

impl std::error::Error for JoinFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn idle_to_running_to_idle() {
        let t = Arc::new(Threadlet::new("test"));
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        t.start(async { Ok(()) }, move |stop| {
            Box::pin(async move {
                ran2.store(true, Ordering::SeqCst);
                stop.wait().await;
                Ok(())
            })
        })
        .await
        .unwrap();

        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));

        t.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let t = Arc::new(Threadlet::new("test"));
        let starts = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let starts = starts.clone();
            t.start(
                {
                    let starts = starts.clone();
                    async move {
                        starts.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                move |stop| Box::pin(async move { stop.wait().await; Ok(()) }),
            )
            .await
            .unwrap();
        }

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        t.stop().await.unwrap();
    }

    #[tokio::test]
    async fn main_body_error_surfaces_from_stop() {
        let t = Arc::new(Threadlet::new("test"));
        t.start(async { Ok(()) }, |_stop| {
            Box::pin(async move {
                Err(Arc::new(std::io::Error::other("boom")) as ThreadletError)
            })
        })
        .await
        .unwrap();

        // give the spawned task a moment to run and fail before we stop()
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = t.stop().await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        // idempotent: second stop() returns the same cached error
        let err2 = t.stop().await.unwrap_err();
        assert_eq!(err.to_string(), err2.to_string());
    }

    #[tokio::test]
    async fn start_body_failure_returns_to_idle() {
        let t = Threadlet::new("test");
        let err = t
            .start(
                async { Err(Arc::new(std::io::Error::other("nope")) as ThreadletError) },
                |_stop| Box::pin(async { Ok(()) }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));

        // threadlet went back to idle, so a fresh start is possible
        t.start(async { Ok(()) }, |stop| {
            Box::pin(async move {
                stop.wait().await;
                Ok(())
            })
        })
        .await
        .unwrap();
        t.stop().await.unwrap();
    }
}
