//! Causal linked-event chain (spec §4.3): an append-only sequence of nodes
//! where each node's successor is itself awaitable before it exists.
//!
//! [`LinkedEvent`] uses a [`tokio::sync::watch`] channel rather than a
//! `oneshot` for its "next" slot specifically because more than one task may
//! be awaiting the same node's successor concurrently (an `EventSink` drain
//! loop and an ad-hoc caller both holding the same `current` snapshot), and
//! `oneshot::Receiver` cannot be cloned or shared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};

use crate::threadlet::Threadlet;

/// A single node in the chain. `T` is the event payload.
pub struct LinkedEvent<T> {
    pub value: T,
    next_tx: Mutex<Option<watch::Sender<Option<Arc<LinkedEvent<T>>>>>>,
    next_rx: watch::Receiver<Option<Arc<LinkedEvent<T>>>>,
}

/// Emitting a second time on the same node.
#[derive(Debug, thiserror::Error)]
#[error("event already emitted on this node")]
pub struct AlreadyEmitted;

impl<T: Clone + Send + Sync + 'static> LinkedEvent<T> {
    /// Creates a fresh node with no successor yet.
    pub fn new(value: T) -> Arc<Self> {
        let (tx, rx) = watch::channel(None);
        Arc::new(Self {
            value,
            next_tx: Mutex::new(Some(tx)),
            next_rx: rx,
        })
    }

    /// Appends `value` as this node's successor. May be called at most once
    /// per node; a second call returns [`AlreadyEmitted`] and has no effect.
    /// This is the "emitter capability", consumed on first use.
    pub fn emit(&self, value: T) -> Result<Arc<LinkedEvent<T>>, AlreadyEmitted> {
        let mut guard = self.next_tx.lock().unwrap();
        let tx = guard.take().ok_or(AlreadyEmitted)?;
        let node = LinkedEvent::new(value);
        let _ = tx.send(Some(node.clone()));
        Ok(node)
    }

    /// The successor node if one has already been emitted, without waiting.
    pub fn next_now(&self) -> Option<Arc<LinkedEvent<T>>> {
        self.next_rx.borrow().clone()
    }

    /// Resolves once a successor has been emitted.
    pub async fn next_promise(&self) -> Arc<LinkedEvent<T>> {
        let mut rx = self.next_rx.clone();
        loop {
            if let Some(node) = rx.borrow().clone() {
                return node;
            }
            if rx.changed().await.is_err() {
                // sender dropped without ever emitting: wait forever, matching
                // "the promise for a node that will never have a successor
                // never resolves" rather than panicking the awaiter.
                std::future::pending::<()>().await;
            }
        }
    }

    /// True once this node's emitter capability has been used (or dropped).
    pub fn is_terminal(&self) -> bool {
        self.next_tx.lock().unwrap().is_none() && self.next_now().is_none()
    }
}

/// Holds the current and earliest-retained nodes of a chain, plus a count of
/// everything ever emitted. The first node ("kickoff") carries no real
/// payload significance; `current`/`earliest` only ever report real events.
pub struct EventSource<T> {
    kickoff: Arc<LinkedEvent<T>>,
    current: Mutex<Arc<LinkedEvent<T>>>,
    earliest: Mutex<Arc<LinkedEvent<T>>>,
    emitted_count: AtomicU64,
    retain: usize,
    first_real_event: Notify,
    has_real_event: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> EventSource<T> {
    /// `kickoff` seeds the chain; it is never itself returned by
    /// `current_event`/`earliest_event`. `retain` bounds how many emitted
    /// events stay reachable from `earliest_event` before being dropped.
    pub fn new(kickoff: T, retain: usize) -> Self {
        let node = LinkedEvent::new(kickoff);
        Self {
            kickoff: node.clone(),
            current: Mutex::new(node.clone()),
            earliest: Mutex::new(node),
            emitted_count: AtomicU64::new(0),
            retain: retain.max(1),
            first_real_event: Notify::new(),
            has_real_event: AtomicU64::new(0),
        }
    }

    /// The chain's seed node, from before any real event. Lets an
    /// [`EventSink`] start draining from the very first emitted event,
    /// rather than waiting on `current_event_now()` to become `Some`.
    pub fn kickoff_node(&self) -> Arc<LinkedEvent<T>> {
        self.kickoff.clone()
    }

    /// Appends a new event after the current node, advancing `current` and,
    /// once more than `retain` events have been emitted, advancing `earliest`
    /// to drop the oldest retained node.
    pub fn emit(&self, value: T) -> Result<(), AlreadyEmitted> {
        let next = {
            let current = self.current.lock().unwrap();
            current.emit(value)?
        };
        *self.current.lock().unwrap() = next;

        let count = self.emitted_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.retain as u64 {
            let mut earliest = self.earliest.lock().unwrap();
            if let Some(successor) = earliest.next_now() {
                *earliest = successor;
            }
        }

        if self.has_real_event.swap(1, Ordering::AcqRel) == 0 {
            self.first_real_event.notify_waiters();
        }
        Ok(())
    }

    /// The most recently emitted real event, if any.
    pub fn current_event_now(&self) -> Option<Arc<LinkedEvent<T>>> {
        if self.emitted_count.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.current.lock().unwrap().clone())
    }

    /// The oldest real event still retained, if any.
    pub fn earliest_event_now(&self) -> Option<Arc<LinkedEvent<T>>> {
        if self.emitted_count.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.earliest.lock().unwrap().clone())
    }

    /// Resolves once at least one real event has been emitted, then returns
    /// whatever `current_event_now` holds at that point.
    pub async fn current_event(&self) -> Arc<LinkedEvent<T>> {
        self.wait_for_first_real_event().await;
        self.current.lock().unwrap().clone()
    }

    /// Resolves once at least one real event has been emitted, then returns
    /// whatever `earliest_event_now` holds at that point.
    pub async fn earliest_event(&self) -> Arc<LinkedEvent<T>> {
        self.wait_for_first_real_event().await;
        self.earliest.lock().unwrap().clone()
    }

    async fn wait_for_first_real_event(&self) {
        if self.has_real_event.load(Ordering::Acquire) == 1 {
            return;
        }
        self.first_real_event.notified().await;
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted_count.load(Ordering::Acquire)
    }
}

/// Drains a chain from a starting node onward, handing each event to a
/// processor in order, on a dedicated [`Threadlet`]. Built on `Threadlet`
/// rather than a bare `tokio::spawn` so it shares the same start/stop
/// idempotency and error-surfacing contract as the rest of the crate's
/// background loops.
pub struct EventSink {
    worker: Threadlet,
}

impl EventSink {
    pub fn new(name: &'static str) -> Self {
        Self {
            worker: Threadlet::new(name),
        }
    }

    /// Starts draining `start` onward. `processor` is invoked once per event
    /// (in chain order) and may itself be fallible; a processor error stops
    /// the sink and is surfaced from a subsequent `stop()`.
    pub async fn start<T, F>(
        &self,
        start: Arc<LinkedEvent<T>>,
        mut processor: F,
    ) -> Result<(), crate::threadlet::ThreadletError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(&T) -> Result<(), crate::threadlet::ThreadletError> + Send + 'static,
    {
        self.worker
            .start(async { Ok(()) }, move |stop| {
                Box::pin(async move {
                    let mut node = start;
                    loop {
                        if stop.should_stop() {
                            return Ok(());
                        }
                        processor(&node.value)?;
                        node = tokio::select! {
                            next = node.next_promise() => next,
                            _ = stop.wait() => return Ok(()),
                        };
                    }
                })
            })
            .await
    }

    pub async fn stop(&self) -> Result<(), crate::threadlet::ThreadletError> {
        self.worker.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn emit_is_single_use_per_node() {
        let head = LinkedEvent::new(0u32);
        assert!(head.emit(1).is_ok());
        assert!(matches!(head.emit(2), Err(AlreadyEmitted)));
    }

    #[tokio::test]
    async fn next_promise_resolves_after_emit() {
        let head = LinkedEvent::new(0u32);
        let head2 = head.clone();
        let waiter = tokio::spawn(async move { head2.next_promise().await.value });
        tokio::task::yield_now().await;
        head.emit(42).unwrap();
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[test]
    fn event_source_retains_recent_window() {
        let source = EventSource::new("kickoff", 2);
        for i in 0..5 {
            source.emit(i).unwrap();
        }
        assert_eq!(source.current_event_now().unwrap().value, 4);
        // only the last 2 are guaranteed retained: earliest is 2, not 0.
        assert_eq!(source.earliest_event_now().unwrap().value, 2);
        assert_eq!(source.emitted_count(), 5);
    }

    #[tokio::test]
    async fn current_event_waits_for_first_real_emission() {
        let source = Arc::new(EventSource::new("kickoff", 4));
        let source2 = source.clone();
        let waiter = tokio::spawn(async move { source2.current_event().await.value });
        tokio::task::yield_now().await;
        source.emit("first").unwrap();
        assert_eq!(waiter.await.unwrap(), "first");
    }

    #[tokio::test]
    async fn event_sink_drains_in_order() {
        let source = EventSource::new(0u32, 8);
        let start = source.current_event_now();
        // seed with one real event so the sink has a concrete start node.
        source.emit(1).unwrap();
        let start = start.unwrap_or_else(|| source.current_event_now().unwrap());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sink = EventSink::new("test-sink");
        sink.start(start, move |v: &u32| {
            seen2.lock().unwrap().push(*v);
            Ok(())
        })
        .await
        .unwrap();

        source.emit(2).unwrap();
        source.emit(3).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.stop().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn event_sink_stops_on_processor_error() {
        let source = EventSource::new(0u32, 8);
        source.emit(1).unwrap();
        let start = source.current_event_now().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let sink = EventSink::new("test-sink-err");
        sink.start(start, move |_v: &u32| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(Arc::new(std::io::Error::other("processor failed")) as crate::threadlet::ThreadletError)
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = sink.stop().await.unwrap_err();
        assert!(err.to_string().contains("processor failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
