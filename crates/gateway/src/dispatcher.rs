//! Inbound dispatch: network receipt on one side, ordered handler execution
//! on the other.
//!
//! The reader task calls [`InboundDispatcher::ingest`] for every text frame.
//! Subscription notifications for channels with a registered handler go onto
//! a bounded FIFO queue, drained by one dedicated OS thread that runs handlers
//! one at a time in arrival order. Handlers for different channels never run
//! concurrently, so anything they mutate has a single writer.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use relay_latency::{LatencyRegistry, LatencyTracker};

use crate::channel::Channel;
use crate::event::StreamEvent;
use crate::pending::PendingRequests;
use crate::protocol::{classify, HeartbeatKind, Inbound};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Callback invoked on the dispatch thread.
pub type Handler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Upstream channel → handler registry.
///
/// Looked up twice per event: once at ingest to decide whether to queue, and
/// again on the worker so a handler removed while its events were queued is
/// not invoked.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Channel, Handler>>,
}

impl HandlerRegistry {
    pub fn insert(&self, channel: Channel, handler: Handler) -> Option<Handler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, handler)
    }

    pub fn remove(&self, channel: &Channel) -> Option<Handler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
    }

    pub fn get(&self, channel: &Channel) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of [`InboundDispatcher::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Subscription event queued for its handler.
    Queued,
    /// Subscription event for a channel nobody listens to.
    Dropped,
    /// JSON-RPC response; `matched` is false when no request was waiting.
    Response { id: u64, matched: bool },
    Heartbeat(HeartbeatKind),
    /// Unparseable or unexpected frame; logged and discarded.
    Malformed,
    /// Dispatcher is shutting down.
    Rejected,
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub queued: AtomicU64,
    pub dropped: AtomicU64,
    pub malformed: AtomicU64,
    pub responses: AtomicU64,
    pub heartbeats: AtomicU64,
    pub rejected: AtomicU64,
    pub dispatched: AtomicU64,
    pub decode_failures: AtomicU64,
    pub handler_panics: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub queued: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub responses: u64,
    pub heartbeats: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub decode_failures: u64,
    pub handler_panics: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

struct Envelope {
    channel: Channel,
    data: Value,
    wait_id: u64,
}

enum Work {
    Event(Envelope),
    Stop,
}

struct Worker {
    handlers: Arc<HandlerRegistry>,
    stats: Arc<DispatcherStats>,
    queue_wait: Arc<LatencyTracker>,
    callback: Arc<LatencyTracker>,
}

impl Worker {
    fn run(self, mut rx: mpsc::Receiver<Work>) {
        debug!("dispatch worker started");
        while let Some(work) = rx.blocking_recv() {
            match work {
                Work::Event(envelope) => self.dispatch(envelope),
                Work::Stop => {
                    // refuse new sends, then run whatever made it in
                    rx.close();
                    while let Ok(work) = rx.try_recv() {
                        if let Work::Event(envelope) = work {
                            self.dispatch(envelope);
                        }
                    }
                    break;
                }
            }
        }
        debug!("dispatch worker exiting");
    }

    fn dispatch(&self, envelope: Envelope) {
        self.queue_wait.end(envelope.wait_id);

        let Some(handler) = self.handlers.get(&envelope.channel) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %envelope.channel, "handler removed while event was queued");
            return;
        };

        let event = match StreamEvent::decode(&envelope.channel, envelope.data) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %envelope.channel, error = %e, "dropping undecodable event");
                return;
            }
        };

        let id = self.callback.start();
        let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
        self.callback.end(id);
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        if result.is_err() {
            self.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
            error!(channel = %envelope.channel, "subscription handler panicked");
        }
    }
}

/// Bounded single-consumer dispatch queue.
pub struct InboundDispatcher {
    tx: mpsc::Sender<Work>,
    capacity: usize,
    handlers: Arc<HandlerRegistry>,
    pending: Arc<PendingRequests>,
    stats: Arc<DispatcherStats>,
    queue_wait: Arc<LatencyTracker>,
    stopping: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InboundDispatcher {
    /// Spawn the worker thread.
    pub fn start(capacity: usize, latency: &LatencyRegistry) -> std::io::Result<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let handlers = Arc::new(HandlerRegistry::default());
        let stats = Arc::new(DispatcherStats::default());
        let queue_wait = latency.tracker("dispatch.queue_wait");

        let worker = Worker {
            handlers: Arc::clone(&handlers),
            stats: Arc::clone(&stats),
            queue_wait: Arc::clone(&queue_wait),
            callback: latency.tracker("dispatch.callback"),
        };
        let handle = std::thread::Builder::new()
            .name("inbound-dispatch".into())
            .spawn(move || worker.run(rx))?;

        info!(capacity, "inbound dispatcher started");

        Ok(Self {
            tx,
            capacity,
            handlers,
            pending: Arc::new(PendingRequests::new()),
            stats,
            queue_wait,
            stopping: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.handlers)
    }

    pub fn pending(&self) -> Arc<PendingRequests> {
        Arc::clone(&self.pending)
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Events currently waiting for the worker.
    pub fn queue_depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Classify a raw frame and route it. Waits for queue space when full.
    pub async fn ingest(&self, raw: &str) -> Ingest {
        let inbound = match classify(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping malformed upstream message");
                return Ingest::Malformed;
            }
        };

        match inbound {
            Inbound::Subscription { channel, data } => self.enqueue(&channel, data).await,
            Inbound::Response { id, outcome } => {
                self.stats.responses.fetch_add(1, Ordering::Relaxed);
                if let Err(ref e) = outcome {
                    warn!(id, code = e.code, message = %e.message, "upstream returned error");
                }
                let matched = self.pending.resolve(id, outcome);
                if !matched {
                    debug!(id, "response with no pending request");
                }
                Ingest::Response { id, matched }
            }
            Inbound::Heartbeat(kind) => {
                self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                Ingest::Heartbeat(kind)
            }
        }
    }

    async fn enqueue(&self, name: &str, data: Value) -> Ingest {
        if self.is_stopping() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Ingest::Rejected;
        }

        let channel: Channel = match name.parse() {
            Ok(channel) => channel,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %name, error = %e, "dropping event for unparseable channel");
                return Ingest::Malformed;
            }
        };

        if !self.handlers.contains(&channel) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %name, "no handler registered, dropping event");
            return Ingest::Dropped;
        }

        let wait_id = self.queue_wait.start();
        let work = Work::Event(Envelope {
            channel,
            data,
            wait_id,
        });
        if self.tx.send(work).await.is_err() {
            self.queue_wait.cancel(wait_id);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Ingest::Rejected;
        }

        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        Ingest::Queued
    }

    /// Stop accepting events, drain what is queued, and join the worker.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(queued = self.queue_depth(), "draining inbound dispatcher");

        // the marker lands behind everything already queued
        let _ = self.tx.send(Work::Stop).await;

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => info!("inbound dispatcher stopped"),
                Ok(Err(_)) => error!("dispatch worker panicked"),
                Err(e) => error!(error = %e, "failed to join dispatch worker"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Interval;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn book_frame(instrument: &str, ts: i64) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": format!("book.{}.none.10.100ms", instrument),
                "data": {
                    "timestamp": ts,
                    "instrument_name": instrument,
                    "change_id": ts,
                    "bids": [[100.0, 1.0]],
                    "asks": [[101.0, 2.0]]
                }
            }
        })
        .to_string()
    }

    fn dispatcher() -> (InboundDispatcher, Arc<LatencyRegistry>) {
        let latency = Arc::new(LatencyRegistry::new());
        (InboundDispatcher::start(256, &latency).unwrap(), latency)
    }

    #[tokio::test]
    async fn test_fifo_delivery_without_overlap() {
        let (dispatcher, _) = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        {
            let seen = Arc::clone(&seen);
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            dispatcher.handlers().insert(
                Channel::book("BTC-PERPETUAL", 10, Interval::Ms100),
                Arc::new(move |event: StreamEvent| {
                    if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_micros(50));
                    if let StreamEvent::OrderBook(book) = event {
                        seen.lock().unwrap().push(book.timestamp);
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }

        for ts in 0..100 {
            assert_eq!(dispatcher.ingest(&book_frame("BTC-PERPETUAL", ts)).await, Ingest::Queued);
        }
        dispatcher.shutdown().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<i64>>());
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().dispatched, 100);
    }

    #[tokio::test]
    async fn test_handlers_across_channels_are_serialized() {
        let (dispatcher, _) = dispatcher();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let count = Arc::new(AtomicUsize::new(0));

        for instrument in ["BTC-PERPETUAL", "ETH-PERPETUAL"] {
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            let count = Arc::clone(&count);
            dispatcher.handlers().insert(
                Channel::book(instrument, 10, Interval::Ms100),
                Arc::new(move |_: StreamEvent| {
                    if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_micros(20));
                    count.fetch_add(1, Ordering::SeqCst);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }

        for ts in 0..50 {
            dispatcher.ingest(&book_frame("BTC-PERPETUAL", ts)).await;
            dispatcher.ingest(&book_frame("ETH-PERPETUAL", ts)).await;
        }
        dispatcher.shutdown().await;

        assert_eq!(count.load(Ordering::SeqCst), 100);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregistered_channel_is_dropped() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(dispatcher.ingest(&book_frame("BTC-PERPETUAL", 1)).await, Ingest::Dropped);
        assert_eq!(dispatcher.stats().dropped, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_does_not_stop_dispatch() {
        let (dispatcher, _) = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        dispatcher.handlers().insert(
            Channel::book("BTC-PERPETUAL", 10, Interval::Ms100),
            Arc::new(move |_: StreamEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(dispatcher.ingest("{not json").await, Ingest::Malformed);
        let bad_channel = r#"{"method":"subscription","params":{"channel":"nope","data":{}}}"#;
        assert_eq!(dispatcher.ingest(bad_channel).await, Ingest::Malformed);
        assert_eq!(dispatcher.ingest(&book_frame("BTC-PERPETUAL", 1)).await, Ingest::Queued);
        dispatcher.shutdown().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().malformed, 2);
    }

    #[tokio::test]
    async fn test_undecodable_payload_and_panicking_handler() {
        let (dispatcher, _) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        dispatcher.handlers().insert(
            Channel::book("BTC-PERPETUAL", 10, Interval::Ms100),
            Arc::new(move |event: StreamEvent| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("boom on {}", event.kind());
                }
            }),
        );

        let undecodable = r#"{"method":"subscription","params":{"channel":"book.BTC-PERPETUAL.none.10.100ms","data":{"x":1}}}"#;
        assert_eq!(dispatcher.ingest(undecodable).await, Ingest::Queued);
        dispatcher.ingest(&book_frame("BTC-PERPETUAL", 1)).await;
        dispatcher.ingest(&book_frame("BTC-PERPETUAL", 2)).await;
        dispatcher.shutdown().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.handler_panics, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_response_resolves_pending() {
        let (dispatcher, _) = dispatcher();
        let reply = dispatcher.pending().register(42, "public/subscribe");
        let outcome = dispatcher
            .ingest(r#"{"jsonrpc":"2.0","id":42,"result":["trades.BTC-PERPETUAL.raw"]}"#)
            .await;
        assert_eq!(outcome, Ingest::Response { id: 42, matched: true });
        let result = reply.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result[0], "trades.BTC-PERPETUAL.raw");

        let stray = dispatcher.ingest(r#"{"jsonrpc":"2.0","id":43,"result":null}"#).await;
        assert_eq!(stray, Ingest::Response { id: 43, matched: false });
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_classified() {
        let (dispatcher, _) = dispatcher();
        let outcome = dispatcher
            .ingest(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#)
            .await;
        assert_eq!(outcome, Ingest::Heartbeat(HeartbeatKind::TestRequest));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let (dispatcher, _) = dispatcher();
        dispatcher.handlers().insert(
            Channel::book("BTC-PERPETUAL", 10, Interval::Ms100),
            Arc::new(|_: StreamEvent| {}),
        );
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.ingest(&book_frame("BTC-PERPETUAL", 1)).await, Ingest::Rejected);
        // second shutdown is a no-op
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (dispatcher, latency) = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        dispatcher.handlers().insert(
            Channel::book("BTC-PERPETUAL", 10, Interval::Ms100),
            Arc::new(move |_: StreamEvent| {
                std::thread::sleep(Duration::from_millis(1));
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        for ts in 0..20 {
            dispatcher.ingest(&book_frame("BTC-PERPETUAL", ts)).await;
        }
        dispatcher.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 20);
        assert_eq!(latency.get("dispatch.callback").map(|s| s.count), Some(20));
        assert_eq!(latency.get("dispatch.queue_wait").map(|s| s.count), Some(20));
    }
}
