//! Priority, in-process publish/subscribe hub.
//!
//! Grounded in `original_source/src/core/event_bus.py` and
//! `original_source/src/core/event_types.py`: a bounded priority queue keyed
//! by `(priority, counter)` so lower priority numbers dispatch first and ties
//! resolve in publish order, plus per-kind latency and count statistics that
//! the Guardian's runaway-event-loop detector reads directly.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};

pub const WARN_LATENCY_MS: f64 = 10.0;
pub const CRITICAL_LATENCY_MS: f64 = 50.0;
const MAX_LATENCY_SAMPLES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum EventKind {
    Tick,
    BookUpdate,
    Candle,
    PositionUpdate,
    BalanceUpdate,
    OrderUpdate,
    OrderFilled,
    OrderCancelled,
    OrderSubmitted,
    SignalBuy,
    SignalSell,
    SignalExit,
    Error,
    Warning,
    Info,
    Shutdown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Tick => "tick",
            EventKind::BookUpdate => "book_event",
            EventKind::Candle => "candle_event",
            EventKind::PositionUpdate => "position_update",
            EventKind::BalanceUpdate => "balance_update",
            EventKind::OrderUpdate => "order_update",
            EventKind::OrderFilled => "order_filled",
            EventKind::OrderCancelled => "order_cancelled",
            EventKind::OrderSubmitted => "order_submitted",
            EventKind::SignalBuy => "signal_buy",
            EventKind::SignalSell => "signal_sell",
            EventKind::SignalExit => "signal_exit",
            EventKind::Error => "error",
            EventKind::Warning => "warning",
            EventKind::Info => "info",
            EventKind::Shutdown => "shutdown",
        }
    }

    /// Priority numbers from the original `EventPriority` enum. Kinds not
    /// named there (signals, info/warning, candles, balances) are assigned a
    /// reasonable default between the named tiers; this is an implementation
    /// choice, not specified.
    pub fn default_priority(&self) -> u8 {
        match self {
            EventKind::Shutdown => 0,
            EventKind::OrderFilled => 1,
            EventKind::Error => 2,
            EventKind::PositionUpdate => 3,
            EventKind::OrderUpdate | EventKind::OrderSubmitted | EventKind::OrderCancelled => 5,
            EventKind::SignalBuy | EventKind::SignalSell | EventKind::SignalExit => 7,
            EventKind::Warning | EventKind::Info | EventKind::BalanceUpdate => 8,
            EventKind::Tick | EventKind::BookUpdate | EventKind::Candle => 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl Event {
    pub fn new(kind: EventKind, data: serde_json::Value, source: impl Into<String>) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

struct QueueEntry {
    priority: u8,
    counter: u64,
    event: Event,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.counter == other.counter
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the *smallest* (priority, counter)
        // out first, so invert the comparison.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.counter.cmp(&self.counter))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = CoreResult<()>> + Send>>;
pub type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct LatencyStats {
    pub count: u64,
    pub sum_ms: f64,
    pub max_ms: f64,
    pub min_ms: f64,
}

impl LatencyStats {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }

    pub fn p99_ms(&self, samples: &VecDeque<f64>) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }
}

#[derive(Default)]
struct BusStats {
    published: HashMap<EventKind, u64>,
    errors: u64,
    latency: HashMap<EventKind, LatencyStats>,
    latency_samples: HashMap<EventKind, VecDeque<f64>>,
}

struct Inner {
    handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    capacity: usize,
    counter: AtomicU64,
    notify: Notify,
    running: AtomicBool,
    stats: Mutex<BusStats>,
}

/// The priority, in-process publish/subscribe hub. Cheap to clone: all state
/// lives behind a shared `Arc`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                capacity,
                counter: AtomicU64::new(0),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                stats: Mutex::new(BusStats::default()),
            }),
        }
    }

    pub async fn register(&self, kind: EventKind, handler: Handler) {
        self.inner
            .handlers
            .lock()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub async fn unregister_all(&self, kind: EventKind) {
        self.inner.handlers.lock().await.remove(&kind);
    }

    /// Non-blocking publish: fails immediately with `QueueFull` if the queue
    /// is at capacity.
    pub async fn publish_nowait(&self, event: Event, priority: u8) -> CoreResult<()> {
        let mut queue = self.inner.queue.lock().await;
        if queue.len() >= self.inner.capacity {
            self.bump_error().await;
            log::error!("event bus queue full, dropping {:?}", event.kind);
            return Err(CoreError::QueueFull);
        }
        let counter = self.inner.counter.fetch_add(1, AtomicOrdering::SeqCst);
        self.bump_published(event.kind).await;
        queue.push(QueueEntry {
            priority,
            counter,
            event,
        });
        drop(queue);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Blocking-with-bound publish: waits briefly for room before giving up.
    pub async fn publish(&self, event: Event, priority: u8) -> CoreResult<()> {
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            {
                let queue = self.inner.queue.lock().await;
                if queue.len() < self.inner.capacity {
                    drop(queue);
                    return self.publish_nowait(event, priority).await;
                }
            }
            if Instant::now() >= deadline {
                self.bump_error().await;
                return Err(CoreError::QueueFull);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn bump_published(&self, kind: EventKind) {
        let mut stats = self.inner.stats.lock().await;
        *stats.published.entry(kind).or_insert(0) += 1;
    }

    async fn bump_error(&self) {
        self.inner.stats.lock().await.errors += 1;
    }

    /// Starts the dispatch loop on the current runtime and returns its
    /// `JoinHandle`. `stop()` drains the queue with a bounded wait before
    /// cancelling it.
    pub fn start(&self) -> JoinHandle<()> {
        self.inner.running.store(true, AtomicOrdering::SeqCst);
        let bus = self.clone();
        tokio::spawn(async move { bus.dispatch_loop().await })
    }

    pub async fn stop(&self, handle: JoinHandle<()>) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.inner.queue.lock().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.inner.running.store(false, AtomicOrdering::SeqCst);
        self.inner.notify.notify_one();
        handle.abort();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(AtomicOrdering::SeqCst)
    }

    async fn dispatch_loop(&self) {
        while self.inner.running.load(AtomicOrdering::SeqCst) {
            let next = {
                let mut queue = self.inner.queue.lock().await;
                queue.pop()
            };
            let entry = match next {
                Some(e) => e,
                None => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {},
                        _ = tokio::time::sleep(Duration::from_millis(1000)) => {},
                    }
                    continue;
                }
            };
            self.dispatch_one(entry.event).await;
        }
    }

    async fn dispatch_one(&self, event: Event) {
        let started = Instant::now();
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .await
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            if let Err(e) = handler(event.clone()).await {
                self.bump_error().await;
                log::error!(
                    "event bus handler failed for {:?} from {}: {}",
                    event.kind,
                    event.source,
                    e
                );
                if event.kind != EventKind::Error {
                    let err_event = Event::new(
                        EventKind::Error,
                        serde_json::json!({"message": e.to_string(), "source_kind": event.kind.as_str()}),
                        "event_bus",
                    );
                    let _ = self.publish_nowait(err_event, EventKind::Error.default_priority()).await;
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.record_latency(event.kind, elapsed_ms).await;
        if elapsed_ms > CRITICAL_LATENCY_MS {
            log::error!("event {:?} took {:.2}ms (critical)", event.kind, elapsed_ms);
        } else if elapsed_ms > WARN_LATENCY_MS {
            log::warn!("event {:?} took {:.2}ms (slow)", event.kind, elapsed_ms);
        }
    }

    async fn record_latency(&self, kind: EventKind, elapsed_ms: f64) {
        let mut stats = self.inner.stats.lock().await;
        let entry = stats.latency.entry(kind).or_default();
        entry.count += 1;
        entry.sum_ms += elapsed_ms;
        entry.max_ms = entry.max_ms.max(elapsed_ms);
        entry.min_ms = if entry.count == 1 {
            elapsed_ms
        } else {
            entry.min_ms.min(elapsed_ms)
        };
        let samples = stats.latency_samples.entry(kind).or_default();
        samples.push_back(elapsed_ms);
        if samples.len() > MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
    }

    /// Per-kind publish counters, read directly by Guardian's runaway-event
    /// detector.
    pub async fn get_event_stats(&self) -> HashMap<EventKind, u64> {
        self.inner.stats.lock().await.published.clone()
    }

    pub async fn get_stats(&self) -> (u64, u64) {
        let stats = self.inner.stats.lock().await;
        let published: u64 = stats.published.values().sum();
        (published, stats.errors)
    }

    pub async fn get_latency_stats(&self, kind: EventKind) -> Option<(LatencyStats, f64)> {
        let stats = self.inner.stats.lock().await;
        let latency = stats.latency.get(&kind)?.clone();
        let p99 = stats
            .latency_samples
            .get(&kind)
            .map(|s| latency.p99_ms(s))
            .unwrap_or(0.0);
        Some((latency, p99))
    }

    pub async fn reset_latency_stats(&self) {
        let mut stats = self.inner.stats.lock().await;
        stats.latency.clear();
        stats.latency_samples.clear();
    }

    pub async fn reset_stats(&self) {
        let mut stats = self.inner.stats.lock().await;
        stats.published.clear();
        stats.errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_handler(counter: Arc<AtomicU32>) -> Handler {
        Arc::new(move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let bus = EventBus::new(100);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        bus.register(
            EventKind::Tick,
            Arc::new(move |_e| {
                let order_a = order_a.clone();
                Box::pin(async move {
                    order_a.lock().await.push("tick");
                    Ok(())
                })
            }),
        )
        .await;

        let order_b = order.clone();
        bus.register(
            EventKind::OrderFilled,
            Arc::new(move |_e| {
                let order_b = order_b.clone();
                Box::pin(async move {
                    order_b.lock().await.push("order_filled");
                    Ok(())
                })
            }),
        )
        .await;

        bus.publish_nowait(
            Event::new(EventKind::Tick, serde_json::json!({}), "test"),
            EventKind::Tick.default_priority(),
        )
        .await
        .unwrap();
        bus.publish_nowait(
            Event::new(EventKind::OrderFilled, serde_json::json!({}), "test"),
            EventKind::OrderFilled.default_priority(),
        )
        .await
        .unwrap();

        let handle = bus.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop(handle).await;

        let observed = order.lock().await.clone();
        assert_eq!(observed, vec!["order_filled", "tick"]);
    }

    #[tokio::test]
    async fn queue_full_is_non_fatal() {
        let bus = EventBus::new(1);
        bus.publish_nowait(Event::new(EventKind::Tick, serde_json::json!({}), "a"), 10)
            .await
            .unwrap();
        let result = bus
            .publish_nowait(Event::new(EventKind::Tick, serde_json::json!({}), "b"), 10)
            .await;
        assert!(matches!(result, Err(CoreError::QueueFull)));
    }

    #[tokio::test]
    async fn handler_error_does_not_abort_remaining_handlers_and_emits_error_event() {
        let bus = EventBus::new(100);
        let ran = Arc::new(AtomicU32::new(0));

        bus.register(
            EventKind::Tick,
            Arc::new(|_e| Box::pin(async move { Err(CoreError::Protocol("boom".into())) })),
        )
        .await;
        bus.register(EventKind::Tick, counting_handler(ran.clone()))
            .await;

        let error_count = Arc::new(AtomicU32::new(0));
        bus.register(EventKind::Error, counting_handler(error_count.clone()))
            .await;

        bus.publish_nowait(Event::new(EventKind::Tick, serde_json::json!({}), "x"), 10)
            .await
            .unwrap();

        let handle = bus.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop(handle).await;

        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(error_count.load(AtomicOrdering::SeqCst), 1);
    }
}
