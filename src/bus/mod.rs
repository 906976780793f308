//! In-process typed pub/sub with bounded priority queues
//!
//! Four lock-free queues (one per priority) feed a single dispatcher task.
//! The dispatcher strictly prefers higher priorities and runs every matched
//! handler of a batch concurrently; one failing handler never cancels its
//! peers. Publishing is a non-blocking enqueue and never suspends.

pub mod event;
pub mod handler;
pub mod persistence;

pub use event::{Event, EventPriority, EventType};
pub use handler::{handler_fn, EventHandler, HandlerFn, HandlerSnapshot};
pub use persistence::{EventSink, MemorySink};

use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use self::handler::filter_by_target;

/// Publish failure modes surfaced to producers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The event's `expires_at` is already in the past; dropped, not queued
    #[error("event expired before publish")]
    Expired,
    /// The priority queue is at capacity; earlier items are untouched
    #[error("{priority} queue full")]
    QueueFull { priority: EventPriority },
}

/// Dispatcher tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Events pulled per dispatch round in batch mode
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batched dispatch vs one-event-at-a-time compatibility mode
    #[serde(default = "default_true")]
    pub enable_batching: bool,
    /// Process short batches immediately instead of waiting ~1ms to fill
    #[serde(default)]
    pub low_latency_mode: bool,
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            enable_batching: true,
            low_latency_mode: false,
        }
    }
}

/// How long a short batch waits for stragglers in high-throughput mode
const BATCH_FILL_WAIT: Duration = Duration::from_millis(1);
/// Idle poll sleep when every queue is empty
const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// Back-off after an internal dispatch failure
const INTERNAL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

fn queue_capacity(priority: EventPriority) -> usize {
    match priority {
        EventPriority::Critical => 1_000,
        EventPriority::High => 5_000,
        EventPriority::Normal => 10_000,
        EventPriority::Low => 5_000,
    }
}

fn queue_index(priority: EventPriority) -> usize {
    // Descending order: CRITICAL first
    4 - priority as usize
}

#[derive(Default)]
struct BatchStats {
    batch_processed: u64,
    avg_batch_size: f64,
    avg_processing_time_us: f64,
}

struct BusInner {
    config: BusConfig,
    /// Indexed by [`queue_index`], CRITICAL..LOW
    queues: [ArrayQueue<Event>; 4],
    handlers: RwLock<HashMap<EventType, Vec<Arc<EventHandler>>>>,
    sink: Option<Arc<dyn EventSink>>,
    running: AtomicBool,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,

    events_published: AtomicU64,
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    queue_full_rejections: AtomicU64,
    kv_persistence_errors: AtomicU64,
    batch_stats: Mutex<BatchStats>,
    started_at: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

/// Cheap-to-clone handle to the bus
///
/// Construct once per process (or per test), pass clones to every component.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_sink(config, None)
    }

    /// Bus with an external KV sink for event persistence
    pub fn with_sink(config: BusConfig, sink: Option<Arc<dyn EventSink>>) -> Self {
        let queues = [
            ArrayQueue::new(queue_capacity(EventPriority::Critical)),
            ArrayQueue::new(queue_capacity(EventPriority::High)),
            ArrayQueue::new(queue_capacity(EventPriority::Normal)),
            ArrayQueue::new(queue_capacity(EventPriority::Low)),
        ];
        info!(
            batch_size = config.batch_size,
            batching = config.enable_batching,
            low_latency = config.low_latency_mode,
            "event bus created"
        );
        Self {
            inner: Arc::new(BusInner {
                config,
                queues,
                handlers: RwLock::new(HashMap::new()),
                sink,
                running: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
                events_published: AtomicU64::new(0),
                events_processed: AtomicU64::new(0),
                events_failed: AtomicU64::new(0),
                queue_full_rejections: AtomicU64::new(0),
                kv_persistence_errors: AtomicU64::new(0),
                batch_stats: Mutex::new(BatchStats::default()),
                started_at: Mutex::new(None),
            }),
        }
    }

    /// Start the dispatcher task
    pub fn initialize(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.started_at.lock() = Some((Instant::now(), Utc::now()));

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            dispatcher_loop(inner).await;
        });
        *self.inner.dispatcher.lock() = Some(task);
        info!("event bus started");
    }

    /// Stop the dispatcher; pending queued events are dropped
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        let task = self.inner.dispatcher.lock().take();
        if let Some(task) = task {
            task.abort();
            // A cancelled task reports a JoinError; that is the expected path.
            let _ = task.await;
        }
        info!("event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Enqueue one event on its priority queue
    pub fn publish(&self, event: Event) -> Result<(), PublishError> {
        if event.is_expired(Utc::now()) {
            warn!(event_id = %event.event_id, "expired event dropped at publish");
            return Err(PublishError::Expired);
        }

        let priority = event.priority;
        let event_type = event.event_type;
        let for_sink = self.inner.sink.is_some().then(|| event.clone());

        if let Err(rejected) = self.inner.queues[queue_index(priority)].push(event) {
            self.inner.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %rejected.event_id,
                %priority,
                "priority queue full, publish rejected"
            );
            if rejected.event_type != EventType::SystemAlert {
                self.inner.raise_alert(
                    "queue_full",
                    &format!("{priority} queue at capacity"),
                    EventPriority::Normal,
                    Map::new(),
                );
            }
            return Err(PublishError::QueueFull { priority });
        }

        self.inner.events_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("bus_events_published", 1);
        debug!(%event_type, %priority, "event published");

        // Persistence is best effort and off the publish path.
        if let (Some(sink), Some(event)) = (self.inner.sink.clone(), for_sink) {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if !persistence::persist_event(&sink, &event).await {
                    inner.kv_persistence_errors.fetch_add(1, Ordering::Relaxed);
                    inner.raise_alert(
                        "kv_persistence_error",
                        "event persistence write failed",
                        EventPriority::Normal,
                        Map::new(),
                    );
                }
            });
        }
        Ok(())
    }

    /// Convenience publish from parts
    pub fn publish_simple(
        &self,
        event_type: EventType,
        source_module: impl Into<String>,
        data: Map<String, Value>,
        target_module: Option<String>,
        priority: Option<EventPriority>,
    ) -> Result<(), PublishError> {
        let mut event = Event::new(event_type, source_module).with_data(data);
        event.target_module = target_module;
        event.priority = priority.unwrap_or(EventPriority::Normal);
        self.publish(event)
    }

    /// Register a handler; returns its id (auto-generated when omitted)
    pub fn subscribe(
        &self,
        event_type: EventType,
        func: HandlerFn,
        handler_id: Option<String>,
    ) -> String {
        self.register(event_type, func, handler_id, None)
    }

    /// Register a handler with an explicit subscriber module
    ///
    /// The module is matched by target filtering before the handler-id
    /// heuristic; new code should prefer this over encoding the module into
    /// the id.
    pub fn subscribe_from(
        &self,
        event_type: EventType,
        module: impl Into<String>,
        func: HandlerFn,
        handler_id: Option<String>,
    ) -> String {
        self.register(event_type, func, handler_id, Some(module.into()))
    }

    fn register(
        &self,
        event_type: EventType,
        func: HandlerFn,
        handler_id: Option<String>,
        module: Option<String>,
    ) -> String {
        let mut handlers = self.inner.handlers.write();
        let list = handlers.entry(event_type).or_default();

        let handler_id = handler_id.unwrap_or_else(|| {
            format!("{}_{}_{}", event_type, Utc::now().timestamp(), list.len())
        });

        let mut handler = EventHandler::new(handler_id.clone(), func);
        if let Some(module) = module {
            handler = handler.with_module(module);
        }
        list.push(Arc::new(handler));

        info!(%event_type, handler_id = %handler_id, "handler subscribed");
        handler_id
    }

    /// Remove a handler by id; returns whether anything was removed
    pub fn unsubscribe(&self, event_type: EventType, handler_id: &str) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| h.handler_id != handler_id);
        let removed = list.len() < before;
        if removed {
            info!(%event_type, handler_id, "handler unsubscribed");
        }
        removed
    }

    /// Detailed view of the handlers for one type
    pub fn handlers_for(&self, event_type: EventType) -> Vec<HandlerSnapshot> {
        self.inner
            .handlers
            .read()
            .get(&event_type)
            .map(|list| list.iter().map(|h| h.snapshot()).collect())
            .unwrap_or_default()
    }

    /// Aggregate handler counts and totals per type
    pub fn handler_summary(&self) -> HashMap<String, HandlerTypeSummary> {
        self.inner
            .handlers
            .read()
            .iter()
            .map(|(event_type, list)| {
                (
                    event_type.to_string(),
                    HandlerTypeSummary {
                        handler_count: list.len(),
                        total_calls: list.iter().map(|h| h.call_count()).sum(),
                        total_errors: list.iter().map(|h| h.error_count()).sum(),
                    },
                )
            })
            .collect()
    }

    pub fn get_stats(&self) -> BusStatsSnapshot {
        let uptime_seconds = self
            .inner
            .started_at
            .lock()
            .map(|(instant, _)| instant.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let processed = self.inner.events_processed.load(Ordering::Relaxed);
        let batch = self.inner.batch_stats.lock();

        BusStatsSnapshot {
            uptime_seconds,
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            events_processed: processed,
            events_failed: self.inner.events_failed.load(Ordering::Relaxed),
            events_per_second: processed as f64 / uptime_seconds.max(1.0),
            queue_full_rejections: self.inner.queue_full_rejections.load(Ordering::Relaxed),
            kv_persistence_errors: self.inner.kv_persistence_errors.load(Ordering::Relaxed),
            queue_sizes: EventPriority::DESCENDING
                .iter()
                .map(|p| (p.to_string(), self.inner.queues[queue_index(*p)].len()))
                .collect(),
            handler_count_by_type: self
                .inner
                .handlers
                .read()
                .iter()
                .map(|(t, list)| (t.to_string(), list.len()))
                .collect(),
            batching_enabled: self.inner.config.enable_batching,
            batch_size: self.inner.config.batch_size,
            batch_processed: batch.batch_processed,
            avg_batch_size: batch.avg_batch_size,
            avg_processing_time_us: batch.avg_processing_time_us,
        }
    }

    /// Current depth of one priority queue
    pub fn queue_len(&self, priority: EventPriority) -> usize {
        self.inner.queues[queue_index(priority)].len()
    }
}

/// Aggregate handler view per event type
#[derive(Debug, Clone, Serialize)]
pub struct HandlerTypeSummary {
    pub handler_count: usize,
    pub total_calls: u64,
    pub total_errors: u64,
}

/// Point-in-time bus statistics
#[derive(Debug, Clone, Serialize)]
pub struct BusStatsSnapshot {
    pub uptime_seconds: f64,
    pub events_published: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_per_second: f64,
    pub queue_full_rejections: u64,
    pub kv_persistence_errors: u64,
    pub queue_sizes: HashMap<String, usize>,
    pub handler_count_by_type: HashMap<String, usize>,
    pub batching_enabled: bool,
    pub batch_size: usize,
    pub batch_processed: u64,
    pub avg_batch_size: f64,
    pub avg_processing_time_us: f64,
}

impl BusInner {
    /// Enqueue an operational SYSTEM_ALERT, bypassing persistence
    ///
    /// Best effort: a full queue silently drops the alert rather than
    /// recursing into the publish path.
    fn raise_alert(
        &self,
        alert_type: &str,
        reason: &str,
        priority: EventPriority,
        mut extra: Map<String, Value>,
    ) {
        extra.insert("alert_type".into(), Value::String(alert_type.into()));
        extra.insert("reason".into(), Value::String(reason.into()));
        extra.insert(
            "timestamp".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
        let event = Event::new(EventType::SystemAlert, "event_bus")
            .with_priority(priority)
            .with_data(extra);
        if self.queues[queue_index(priority)].push(event).is_ok() {
            self.events_published.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pop the next event, highest priority first
    fn next_event(&self) -> Option<Event> {
        self.queues.iter().find_map(|queue| queue.pop())
    }

    /// Move queued events into `events` up to the batch size, priority order
    fn fill_from_queues(&self, events: &mut Vec<Event>) {
        for queue in &self.queues {
            while events.len() < self.config.batch_size {
                match queue.pop() {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
            if events.len() >= self.config.batch_size {
                break;
            }
        }
    }

    async fn collect_batch(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.config.batch_size);
        self.fill_from_queues(&mut events);

        // High-throughput mode trades up to 1ms of latency for fuller
        // batches; low-latency mode processes whatever is there right away.
        if !self.config.low_latency_mode
            && !events.is_empty()
            && events.len() < self.config.batch_size
        {
            tokio::time::sleep(BATCH_FILL_WAIT).await;
            self.fill_from_queues(&mut events);
        }
        events
    }

    /// Run every matched (event, handler) pair of the batch concurrently
    ///
    /// Returns whether an internal failure (panicked handler task) occurred,
    /// which triggers the caller's back-off.
    async fn dispatch_batch(&self, events: Vec<Event>) -> bool {
        let mut by_type: HashMap<EventType, Vec<Event>> = HashMap::new();
        for event in events {
            by_type.entry(event.event_type).or_default().push(event);
        }

        let mut internal_failure = false;
        for (event_type, type_events) in by_type {
            let handlers = self
                .handlers
                .read()
                .get(&event_type)
                .cloned()
                .unwrap_or_default();
            if handlers.is_empty() {
                debug!(%event_type, count = type_events.len(), "no handlers, events skipped");
                continue;
            }

            let mut tasks = Vec::new();
            for event in &type_events {
                for handler in filter_by_target(&handlers, event.target_module.as_deref()) {
                    let handler = Arc::clone(handler);
                    let event = event.clone();
                    tasks.push(tokio::spawn(async move { handler.handle(event).await }));
                }
            }

            for joined in join_all(tasks).await {
                match joined {
                    Ok(true) => {
                        self.events_processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        self.events_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.events_failed.fetch_add(1, Ordering::Relaxed);
                        internal_failure = true;
                        error!(error = %err, "handler task aborted");
                    }
                }
            }
        }
        internal_failure
    }

    /// Compatibility path: one event, all its handlers concurrently
    async fn dispatch_single(&self, event: Event) -> bool {
        let handlers = self
            .handlers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event_type = %event.event_type, "no handlers, event skipped");
            return false;
        }

        let matched = filter_by_target(&handlers, event.target_module.as_deref());
        let tasks: Vec<_> = matched
            .into_iter()
            .map(|handler| {
                let handler = Arc::clone(handler);
                let event = event.clone();
                tokio::spawn(async move { handler.handle(event).await })
            })
            .collect();

        let mut failures = 0usize;
        let mut internal_failure = false;
        for joined in join_all(tasks).await {
            match joined {
                Ok(true) => {}
                Ok(false) => failures += 1,
                Err(err) => {
                    failures += 1;
                    internal_failure = true;
                    error!(error = %err, "handler task aborted");
                }
            }
        }

        if failures > 0 {
            self.events_failed.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = %event.event_id, failures, "event handled with failures");
        } else {
            self.events_processed.fetch_add(1, Ordering::Relaxed);
        }
        internal_failure
    }

    fn record_batch(&self, batch_len: usize, elapsed_us: f64) {
        let mut stats = self.batch_stats.lock();
        stats.batch_processed += 1;
        let n = stats.batch_processed as f64;
        stats.avg_batch_size = (stats.avg_batch_size * (n - 1.0) + batch_len as f64) / n;
        stats.avg_processing_time_us =
            (stats.avg_processing_time_us * (n - 1.0) + elapsed_us) / n;
        metrics::histogram!("bus_batch_processing_us", elapsed_us);
    }
}

async fn dispatcher_loop(inner: Arc<BusInner>) {
    info!("event dispatcher started");

    while inner.running.load(Ordering::Acquire) {
        let internal_failure = if inner.config.enable_batching {
            let events = inner.collect_batch().await;
            if events.is_empty() {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }
            let batch_len = events.len();
            let started = Instant::now();
            let failed = inner.dispatch_batch(events).await;
            inner.record_batch(batch_len, started.elapsed().as_secs_f64() * 1e6);
            failed
        } else {
            match inner.next_event() {
                Some(event) => inner.dispatch_single(event).await,
                None => {
                    tokio::time::sleep(IDLE_SLEEP).await;
                    continue;
                }
            }
        };

        if internal_failure {
            tokio::time::sleep(INTERNAL_ERROR_BACKOFF).await;
        }
    }

    info!("event dispatcher stopped");
}
