//! Handler registration and target matching

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::event::Event;

/// Boxed future returned by a handler invocation
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Type-erased async event callback
pub type HandlerFn = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`HandlerFn`]
///
/// ```ignore
/// let handler = handler_fn(|event| async move {
///     println!("{}", event.event_id);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(func: F) -> HandlerFn
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(func(event)))
}

/// A registered subscription
///
/// `handler_id` is opaque, but by convention embeds the owning module name so
/// target filtering can match it. `subscriber_module`, when set, is an
/// explicit ownership declaration that takes precedence over the id
/// heuristic.
pub struct EventHandler {
    pub handler_id: String,
    pub subscriber_module: Option<String>,
    func: HandlerFn,
    pub created_at: DateTime<Utc>,
    call_count: AtomicU64,
    error_count: AtomicU64,
    last_called: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl EventHandler {
    pub fn new(handler_id: impl Into<String>, func: HandlerFn) -> Self {
        Self {
            handler_id: handler_id.into(),
            subscriber_module: None,
            func,
            created_at: Utc::now(),
            call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_called: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.subscriber_module = Some(module.into());
        self
    }

    /// Invoke the callback, recording the outcome
    ///
    /// Returns whether the handler succeeded. Errors are counted here and
    /// logged by the dispatcher; they never propagate.
    pub async fn handle(&self, event: Event) -> bool {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        *self.last_called.lock() = Some(Utc::now());

        let event_id = event.event_id.clone();
        match (self.func)(event).await {
            Ok(()) => true,
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    handler_id = %self.handler_id,
                    event_id = %event_id,
                    error = %err,
                    "event handler failed"
                );
                false
            }
        }
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn last_called(&self) -> Option<DateTime<Utc>> {
        *self.last_called.lock()
    }

    /// Legacy target predicate over the handler id
    ///
    /// Matches when the id contains the target, starts with it, or contains
    /// it after stripping underscores from both sides. Kept loose for
    /// compatibility; explicit `subscriber_module` is checked before this.
    pub fn id_matches_target(&self, target: &str) -> bool {
        self.handler_id.contains(target)
            || self.handler_id.starts_with(target)
            || self
                .handler_id
                .replace('_', "")
                .contains(&target.replace('_', ""))
    }

    pub fn snapshot(&self) -> HandlerSnapshot {
        HandlerSnapshot {
            handler_id: self.handler_id.clone(),
            subscriber_module: self.subscriber_module.clone(),
            call_count: self.call_count(),
            error_count: self.error_count(),
            last_called: self.last_called().map(|t| t.to_rfc3339()),
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("handler_id", &self.handler_id)
            .field("subscriber_module", &self.subscriber_module)
            .field("call_count", &self.call_count())
            .field("error_count", &self.error_count())
            .finish()
    }
}

/// Introspection view of one handler
#[derive(Debug, Clone, Serialize)]
pub struct HandlerSnapshot {
    pub handler_id: String,
    pub subscriber_module: Option<String>,
    pub call_count: u64,
    pub error_count: u64,
    pub last_called: Option<String>,
}

/// Select the handlers an event should reach
///
/// No target: everybody. With a target: explicit subscriber modules first,
/// then the handler-id heuristic, then fall back to all handlers of the type
/// so legacy targets keep working.
pub fn filter_by_target<'a>(
    handlers: &'a [Arc<EventHandler>],
    target_module: Option<&str>,
) -> Vec<&'a Arc<EventHandler>> {
    let Some(target) = target_module else {
        return handlers.iter().collect();
    };

    let explicit: Vec<&Arc<EventHandler>> = handlers
        .iter()
        .filter(|h| h.subscriber_module.as_deref() == Some(target))
        .collect();
    if !explicit.is_empty() {
        return explicit;
    }

    let heuristic: Vec<&Arc<EventHandler>> = handlers
        .iter()
        .filter(|h| h.id_matches_target(target))
        .collect();
    if !heuristic.is_empty() {
        return heuristic;
    }

    handlers.iter().collect()
}
