//! Injectable monotonic time, so rate limiting, idle timers, and rotation
//! checks can be driven deterministically from tests instead of the real
//! clock.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time and timed waits. Every time computation in the
/// crate goes through this trait; nothing calls `Instant::now()` or
/// `tokio::time::sleep` directly outside of [`SystemTimeSource`].
pub trait TimeSource: Send + Sync + 'static {
    /// Seconds elapsed since some fixed but unspecified epoch for this
    /// source. Only differences between two calls are meaningful.
    fn now(&self) -> f64;

    /// Completes after `duration` has elapsed according to this source's
    /// notion of time.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// The default [`TimeSource`]: wall-clock seconds measured off a process
/// start [`Instant`], with waits driven by `tokio::time::sleep`.
#[derive(Clone, Default)]
pub struct SystemTimeSource {
    start: Arc<Instant>,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            start: Arc::new(Instant::now()),
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A manually-advanced [`TimeSource`] for tests. `sleep` resolves as soon as
/// the clock is advanced past the target instant by [`TestTimeSource::advance`];
/// it never waits on the real clock.
#[derive(Clone, Default)]
pub struct TestTimeSource {
    micros: Arc<AtomicU64>,
    notify: Arc<tokio::sync::Notify>,
}

impl TestTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `duration`, waking any pending `sleep` calls
    /// whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        self.micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl TimeSource for TestTimeSource {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let deadline = self.micros.load(Ordering::SeqCst) + duration.as_micros() as u64;
        let micros = self.micros.clone();
        let notify = self.notify.clone();
        Box::pin(async move {
            loop {
                if micros.load(Ordering::SeqCst) >= deadline {
                    return;
                }
                notify.notified().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_time_source_advances_monotonically() {
        let ts = SystemTimeSource::new();
        let a = ts.now();
        ts.sleep(Duration::from_millis(5)).await;
        let b = ts.now();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_time_source_sleep_resolves_on_advance() {
        let ts = TestTimeSource::new();
        let waiter = {
            let ts = ts.clone();
            tokio::spawn(async move {
                ts.sleep(Duration::from_secs(5)).await;
            })
        };
        tokio::task::yield_now().await;
        ts.advance(Duration::from_secs(5));
        waiter.await.unwrap();
        assert_eq!(ts.now(), 5.0);
    }
}
