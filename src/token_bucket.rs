//! Token-bucket admission control with a bounded, strictly-FIFO waiter
//! queue (spec §4.2). The only object in this crate that may legitimately be
//! shared across more than one scheduling domain (spec §5) — its internal
//! [`Mutex`] plus single servicing [`Threadlet`] provide the serialization
//! that makes that safe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::error::{AdmissionError, ValidationError};
use crate::threadlet::Threadlet;
use crate::time::{SystemTimeSource, TimeSource};

/// Validated configuration for a [`TokenBucket`].
pub struct TokenBucketConfig {
    pub burst_size: f64,
    pub flow_rate: f64,
    pub initial_volume: Option<f64>,
    pub max_waiters: usize,
    pub allow_partial: bool,
    pub time_source: Arc<dyn TimeSource>,
}

impl TokenBucketConfig {
    pub fn new(burst_size: f64, flow_rate: f64) -> Self {
        Self {
            burst_size,
            flow_rate,
            initial_volume: None,
            max_waiters: 0,
            allow_partial: false,
            time_source: Arc::new(SystemTimeSource::new()),
        }
    }

    pub fn max_waiters(mut self, max_waiters: usize) -> Self {
        self.max_waiters = max_waiters;
        self
    }

    pub fn allow_partial(mut self, allow_partial: bool) -> Self {
        self.allow_partial = allow_partial;
        self
    }

    pub fn initial_volume(mut self, volume: f64) -> Self {
        self.initial_volume = Some(volume);
        self
    }

    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !(self.burst_size > 0.0) {
            return Err(ValidationError::UnknownField("burstSize must be > 0".into()));
        }
        if !(self.flow_rate > 0.0) {
            return Err(ValidationError::UnknownField("flowRate must be > 0".into()));
        }
        if let Some(v) = self.initial_volume {
            if !(0.0..=self.burst_size).contains(&v) {
                return Err(ValidationError::UnknownField(
                    "initialVolume must be within [0, burstSize]".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of a synchronous [`TokenBucket::take_now`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grant {
    pub granted: bool,
    pub amount: f64,
    pub estimated_wait: f64,
}

/// Read-only view of bucket state, taken with a top-up side effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub available_burst: f64,
    pub burst_size: f64,
    pub max_waiters: usize,
    pub now: f64,
    pub waiters_count: usize,
}

struct Waiter {
    min: f64,
    max: f64,
    resolver: oneshot::Sender<f64>,
}

struct State {
    capacity: f64,
    flow_rate: f64,
    volume: f64,
    last_now: f64,
    max_waiters: usize,
    allow_partial: bool,
    waiters: VecDeque<Waiter>,
}

fn top_up(state: &mut State, now: f64) {
    let elapsed = (now - state.last_now).max(0.0);
    state.volume = (state.volume + elapsed * state.flow_rate).min(state.capacity);
    state.last_now = now;
}

struct Inner {
    state: Mutex<State>,
    time: Arc<dyn TimeSource>,
    servicer: Threadlet,
    wake: Notify,
}

/// A rate-and-burst limiter. Cheaply [`Clone`]-able; clones share the same
/// underlying state and servicing loop.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Inner>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        let initial_volume = config.initial_volume.unwrap_or(config.burst_size);
        let time = config.time_source.clone();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                capacity: config.burst_size,
                flow_rate: config.flow_rate,
                volume: initial_volume,
                last_now: time.now(),
                max_waiters: config.max_waiters,
                allow_partial: config.allow_partial,
                waiters: VecDeque::new(),
            }),
            time,
            servicer: Threadlet::new("token-bucket-servicer"),
            wake: Notify::new(),
        });
        Ok(Self { inner })
    }

    /// Attempts an immediate grant for `[min, max]`. Synchronous: never
    /// suspends or queues.
    pub fn take_now(&self, min: f64, max: f64) -> Result<Grant, AdmissionError> {
        let now = self.inner.time.now();
        let mut state = self.inner.state.lock().unwrap();
        Self::take_now_locked(&mut state, min, max, now)
    }

    fn take_now_locked(
        state: &mut State,
        min: f64,
        max: f64,
        now: f64,
    ) -> Result<Grant, AdmissionError> {
        if min > state.capacity {
            return Err(AdmissionError::Impossible {
                min,
                capacity: state.capacity,
            });
        }

        top_up(state, now);

        let (min, max) = if state.allow_partial {
            (min, max)
        } else {
            (min.ceil(), max.floor())
        };

        let available = state.volume;
        let amount = if available >= max {
            max
        } else if available >= min {
            available
        } else {
            0.0
        };

        state.volume = available - amount;
        let estimated_wait = ((max - amount - state.volume) / state.flow_rate).max(0.0);

        Ok(Grant {
            granted: amount >= min,
            amount,
            estimated_wait,
        })
    }

    /// Requests a grant, queueing behind the FIFO waiter list if the bucket
    /// cannot currently serve `min`. Returns the granted amount, or `0.0` if
    /// the queue is already full (caller distinguishes "denied" from
    /// "queue full" by context, per spec §4.2).
    pub async fn request_grant(&self, min: f64, max: f64) -> f64 {
        {
            let mut state = self.inner.state.lock().unwrap();
            if min > state.capacity {
                // Can never be served no matter how long we wait; short-circuit
                // instead of enqueueing a waiter the servicer would only later
                // discover is unservable and drop unresolved.
                return 0.0;
            }
            if state.waiters.is_empty() {
                let now = self.inner.time.now();
                if let Ok(grant) = Self::take_now_locked(&mut state, min, max, now) {
                    if grant.granted {
                        return grant.amount;
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.waiters.len() >= state.max_waiters {
                return 0.0;
            }
            state.waiters.push_back(Waiter { min, max, resolver: tx });
        }

        self.ensure_servicer_running();
        self.inner.wake.notify_one();

        rx.await.unwrap_or(0.0)
    }

    /// Tops up the bucket and reports its current state.
    pub fn snapshot(&self) -> Snapshot {
        let now = self.inner.time.now();
        let mut state = self.inner.state.lock().unwrap();
        top_up(&mut state, now);
        Snapshot {
            available_burst: state.volume,
            burst_size: state.capacity,
            max_waiters: state.max_waiters,
            now,
            waiters_count: state.waiters.len(),
        }
    }

    /// Current number of queued waiters. A request's waiter is removed from
    /// here when its owning scope is cancelled, per spec §5's cancellation
    /// rule; see [`TokenBucket::cancel_waiter`].
    pub fn waiters_count(&self) -> usize {
        self.inner.state.lock().unwrap().waiters.len()
    }

    fn ensure_servicer_running(&self) {
        // `Threadlet::start` is idempotent, so it's safe to fire this on
        // every enqueue; only the first concurrent caller actually spawns
        // the loop.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let servicer_loop_inner = inner.clone();
            let _ = inner
                .servicer
                .start(async { Ok(()) }, move |stop| {
                    Box::pin(Self::service_loop(servicer_loop_inner, stop))
                })
                .await;
        });
    }

    async fn service_loop(
        inner: Arc<Inner>,
        stop: crate::threadlet::StopSignal,
    ) -> Result<(), crate::threadlet::ThreadletError> {
        loop {
            if stop.should_stop() {
                return Ok(());
            }

            let head_request = {
                let state = inner.state.lock().unwrap();
                state.waiters.front().map(|w| (w.min, w.max))
            };

            let Some((min, max)) = head_request else {
                tokio::select! {
                    _ = inner.wake.notified() => continue,
                    _ = stop.wait() => return Ok(()),
                }
            };

            let now = inner.time.now();
            let outcome = {
                let mut state = inner.state.lock().unwrap();
                Self::take_now_locked(&mut state, min, max, now)
            };

            match outcome {
                Ok(grant) if grant.granted => {
                    let mut state = inner.state.lock().unwrap();
                    if let Some(head) = state.waiters.pop_front() {
                        let _ = head.resolver.send(grant.amount);
                    }
                }
                Ok(grant) => {
                    let wait = Duration::from_secs_f64(grant.estimated_wait.max(0.0));
                    tokio::select! {
                        _ = inner.time.sleep(wait) => {},
                        _ = stop.wait() => return Ok(()),
                    }
                }
                Err(_impossible) => {
                    // ErrImpossible: the head waiter can never be served.
                    // Drop it so it doesn't block the FIFO forever.
                    let mut state = inner.state.lock().unwrap();
                    state.waiters.pop_front();
                }
            }
        }
    }

    /// Stops the servicing loop. Outstanding waiters are never resolved;
    /// dropping their `oneshot::Receiver` surfaces as `request_grant`
    /// returning `0.0` once the receiver is dropped by the caller's own
    /// cancellation.
    pub async fn stop(&self) -> Result<(), crate::threadlet::ThreadletError> {
        self.inner.servicer.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestTimeSource;

    fn bucket_with(
        burst: f64,
        rate: f64,
        allow_partial: bool,
        initial: f64,
        time: Arc<TestTimeSource>,
    ) -> TokenBucket {
        TokenBucket::new(
            TokenBucketConfig::new(burst, rate)
                .allow_partial(allow_partial)
                .initial_volume(initial)
                .time_source(time),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn steady_state_scenario() {
        let time = Arc::new(TestTimeSource::new());
        let bucket = bucket_with(10.0, 5.0, true, 10.0, time.clone());

        let g = bucket.take_now(10.0, 10.0).unwrap();
        assert!(g.granted);
        assert_eq!(g.amount, 10.0);
        assert_eq!(g.estimated_wait, 0.0);

        time.advance(Duration::from_secs(1));
        let g = bucket.take_now(0.0, 10.0).unwrap();
        assert!(g.granted);
        assert_eq!(g.amount, 5.0);

        time.advance(Duration::from_millis(500));
        let g = bucket.take_now(0.0, 10.0).unwrap();
        assert!(g.granted);
        assert_eq!(g.amount, 2.5);
    }

    #[tokio::test]
    async fn queue_overflow_scenario() {
        let time = Arc::new(TestTimeSource::new());
        let bucket = TokenBucket::new(
            TokenBucketConfig::new(1.0, 1.0)
                .max_waiters(1)
                .time_source(time.clone()),
        )
        .unwrap();

        let g = bucket.take_now(1.0, 1.0).unwrap();
        assert!(g.granted);
        assert_eq!(bucket.snapshot().available_burst, 0.0);

        // first concurrent requester enqueues
        let bucket2 = bucket.clone();
        let first = tokio::spawn(async move { bucket2.request_grant(1.0, 1.0).await });
        tokio::task::yield_now().await;
        assert_eq!(bucket.waiters_count(), 1);

        // second is rejected outright: queue already full
        let second = bucket.request_grant(1.0, 1.0).await;
        assert_eq!(second, 0.0);

        time.advance(Duration::from_secs(1));
        // nudge the servicing loop so it notices the bucket refilled
        bucket.inner.wake.notify_one();
        let granted = first.await.unwrap();
        assert_eq!(granted, 1.0);
    }

    #[test]
    fn impossible_when_min_exceeds_capacity() {
        let time = Arc::new(TestTimeSource::new());
        let bucket = bucket_with(5.0, 1.0, true, 5.0, time);
        let err = bucket.take_now(10.0, 10.0).unwrap_err();
        assert!(matches!(err, AdmissionError::Impossible { .. }));
    }

    #[tokio::test]
    async fn request_grant_short_circuits_instead_of_enqueueing_impossible_waiter() {
        let time = Arc::new(TestTimeSource::new());
        let bucket = bucket_with(5.0, 1.0, true, 5.0, time);
        let granted = bucket.request_grant(10.0, 10.0).await;
        assert_eq!(granted, 0.0);
        assert_eq!(bucket.waiters_count(), 0);
    }

    #[quickcheck_macros::quickcheck]
    fn volume_never_exceeds_capacity(draws: Vec<(u8, u8)>) -> bool {
        let time = Arc::new(TestTimeSource::new());
        let bucket = bucket_with(20.0, 3.0, true, 20.0, time.clone());
        for (min, max) in draws {
            let (min, max) = (min as f64 % 25.0, max as f64 % 25.0);
            let (min, max) = if min <= max { (min, max) } else { (max, min) };
            let _ = bucket.take_now(min, max);
            time.advance(Duration::from_millis(100));
            let snap = bucket.snapshot();
            if !(0.0..=snap.burst_size + 1e-9).contains(&snap.available_burst) {
                return false;
            }
        }
        true
    }
}
