//! Decision coordinator
//!
//! Turns a caller's synchronous "make a decision" into a correlation-tracked
//! asynchronous interaction with one of the three engines. Enforces a
//! concurrent-decision limit, micro-batches commander analysis requests, and
//! arbitrates when several decisions must collapse into one. Callers always
//! get a decision back: best available, degraded, or a conservative
//! fallback.

pub mod engines;

pub use engines::{
    CommanderEngine, CommanderReply, EngineRegistry, ScholarEngine, ScholarReply, SoldierEngine,
    SoldierReply,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::bus::{handler_fn, Event, EventBus, EventPriority, EventType};
use crate::models::{BrainDecision, BrainKind, TradeAction};

/// Errors surfaced to the caller; everything else becomes a fallback decision
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("unknown brain: {0}")]
    InvalidArgument(String),
}

/// Coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Concurrent in-flight decision slots
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_decisions: usize,
    /// Commander requests per micro-batch
    #[serde(default = "default_coord_batch_size")]
    pub batch_size: usize,
    /// Flush a partial commander batch after this long
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Micro-batch commander requests at all
    #[serde(default = "default_true")]
    pub enable_batching: bool,
    /// Route requests over the bus instead of calling engines directly
    #[serde(default)]
    pub event_dispatch: bool,
    /// Per-request budget for the soldier
    #[serde(default = "default_soldier_timeout_ms")]
    pub soldier_timeout_ms: u64,
    /// Per-request budget for commander and scholar
    #[serde(default = "default_analysis_timeout_ms")]
    pub analysis_timeout_ms: u64,
    /// Extra soldier budget operators grant when the remote path is known
    /// slower than the local one
    #[serde(default)]
    pub degraded_timeout_extra_ms: u64,
}

fn default_max_concurrent() -> usize {
    32
}

fn default_coord_batch_size() -> usize {
    10
}

fn default_batch_timeout_ms() -> u64 {
    50
}

fn default_soldier_timeout_ms() -> u64 {
    2_000
}

fn default_analysis_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_decisions: default_max_concurrent(),
            batch_size: default_coord_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            enable_batching: true,
            event_dispatch: false,
            soldier_timeout_ms: default_soldier_timeout_ms(),
            analysis_timeout_ms: default_analysis_timeout_ms(),
            degraded_timeout_extra_ms: 0,
        }
    }
}

/// Decisions kept in the in-memory history ring
const DECISION_HISTORY_CAP: usize = 100;

/// Confidence gap above which the stronger decision wins a conflict outright
const CONFLICT_CONFIDENCE_GAP: f64 = 0.10;

struct PendingBatchItem {
    context: Map<String, Value>,
    correlation_id: String,
}

struct CoordInner {
    config: CoordinatorConfig,
    bus: EventBus,
    registry: Arc<EngineRegistry>,
    semaphore: Arc<Semaphore>,
    pending: Mutex<HashMap<String, oneshot::Sender<BrainDecision>>>,
    commander_batch: Mutex<Vec<PendingBatchItem>>,
    history: Mutex<VecDeque<BrainDecision>>,
    active: AtomicBool,
    started_at: Mutex<Option<Instant>>,

    requests_by_brain: Mutex<HashMap<BrainKind, u64>>,
    completed: AtomicU64,
    confidence_sum: Mutex<f64>,
    coordination_conflicts: AtomicU64,
    timeouts: AtomicU64,
    engine_errors: AtomicU64,
    limit_hits: AtomicU64,
    batches_flushed: AtomicU64,
    late_responses: AtomicU64,
}

/// Cheap-to-clone coordinator handle
#[derive(Clone)]
pub struct BrainCoordinator {
    inner: Arc<CoordInner>,
}

impl BrainCoordinator {
    pub fn new(bus: EventBus, registry: Arc<EngineRegistry>, config: CoordinatorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_decisions));
        Self {
            inner: Arc::new(CoordInner {
                config,
                bus,
                registry,
                semaphore,
                pending: Mutex::new(HashMap::new()),
                commander_batch: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(DECISION_HISTORY_CAP)),
                active: AtomicBool::new(false),
                started_at: Mutex::new(None),
                requests_by_brain: Mutex::new(HashMap::new()),
                completed: AtomicU64::new(0),
                confidence_sum: Mutex::new(0.0),
                coordination_conflicts: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                engine_errors: AtomicU64::new(0),
                limit_hits: AtomicU64::new(0),
                batches_flushed: AtomicU64::new(0),
                late_responses: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve engines and subscribe the response/relay handlers
    pub fn initialize(&self) {
        let registered = self.inner.registry.registered();
        info!(engines = ?registered, "coordinator resolving engines");

        let inner = self.inner.clone();
        self.inner.bus.subscribe_from(
            EventType::DecisionMade,
            "coordinator",
            handler_fn(move |event| {
                let inner = inner.clone();
                async move {
                    inner.handle_decision_made(event);
                    Ok(())
                }
            }),
            Some("coordinator_decision_made_handler".into()),
        );

        let inner = self.inner.clone();
        self.inner.bus.subscribe_from(
            EventType::AnalysisCompleted,
            "coordinator",
            handler_fn(move |event| {
                let inner = inner.clone();
                async move {
                    inner.relay_follow_up(
                        &event,
                        EventType::StrategyRequest,
                        "strategy_adjustment",
                    );
                    Ok(())
                }
            }),
            Some("coordinator_analysis_handler".into()),
        );

        let inner = self.inner.clone();
        self.inner.bus.subscribe_from(
            EventType::FactorDiscovered,
            "coordinator",
            handler_fn(move |event| {
                let inner = inner.clone();
                async move {
                    inner.relay_follow_up(&event, EventType::AuditRequest, "factor_validation");
                    Ok(())
                }
            }),
            Some("coordinator_factor_handler".into()),
        );

        *self.inner.started_at.lock() = Some(Instant::now());
        self.inner.active.store(true, Ordering::Release);
        info!("coordinator active");
    }

    /// Route one decision request to the named engine
    ///
    /// Returns `InvalidArgument` for an unknown brain; every other failure
    /// mode (engine error, timeout, missing engine) yields a fallback
    /// decision.
    pub async fn request_decision(
        &self,
        context: Map<String, Value>,
        brain: &str,
    ) -> Result<BrainDecision, CoordinatorError> {
        let kind: BrainKind = brain
            .parse()
            .map_err(|_| CoordinatorError::InvalidArgument(brain.to_string()))?;

        let inner = &self.inner;
        *inner.requests_by_brain.lock().entry(kind).or_insert(0) += 1;

        let permit = match inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                inner.limit_hits.fetch_add(1, Ordering::Relaxed);
                debug!(%kind, "concurrency limit hit, waiting for a slot");
                inner
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("decision semaphore never closes")
            }
        };

        let correlation_id = format!(
            "decision_{}_{:08x}",
            Utc::now().timestamp_millis(),
            rand::random::<u32>()
        );
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(correlation_id.clone(), tx);

        if kind == BrainKind::Commander && inner.config.enable_batching {
            self.enqueue_commander(context.clone(), correlation_id.clone());
        } else if inner.config.event_dispatch {
            self.dispatch_over_bus(kind, &context, &correlation_id);
        } else {
            let inner = self.inner.clone();
            let direct_context = context.clone();
            let direct_correlation = correlation_id.clone();
            tokio::spawn(async move {
                inner.invoke_direct(kind, direct_context, direct_correlation).await;
            });
        }

        let budget = inner.request_budget(kind);
        let decision = match tokio::time::timeout(budget, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                // Sender dropped without completing; same treatment as an
                // engine error.
                inner.engine_errors.fetch_add(1, Ordering::Relaxed);
                inner.fallback_decision(&context, &correlation_id, "engine reply channel closed")
            }
            Err(_) => {
                inner.timeouts.fetch_add(1, Ordering::Relaxed);
                inner.pending.lock().remove(&correlation_id);
                warn!(%kind, %correlation_id, "decision timed out, returning fallback");
                inner.fallback_decision(&context, &correlation_id, "decision timed out")
            }
        };

        inner.record_decision(&decision);
        drop(permit);
        Ok(decision)
    }

    /// Run several requests concurrently; output order matches input order
    pub async fn request_decisions_batch(
        &self,
        requests: Vec<(Map<String, Value>, String)>,
    ) -> Vec<Result<BrainDecision, CoordinatorError>> {
        let futures = requests
            .into_iter()
            .map(|(context, brain)| {
                let coordinator = self.clone();
                async move { coordinator.request_decision(context, &brain).await }
            })
            .collect::<Vec<_>>();
        futures_util::future::join_all(futures).await
    }

    /// Collapse several engine decisions into one
    ///
    /// Two clear leaders more than 0.10 confidence apart: the higher wins.
    /// Closer than that: brain priority (soldier > commander > scholar)
    /// breaks the tie, and equal priority synthesizes a conservative
    /// de-risking decision.
    pub fn resolve_conflicts(&self, mut decisions: Vec<BrainDecision>) -> BrainDecision {
        match decisions.len() {
            0 => {
                return BrainDecision::new("coordinator", TradeAction::Hold, 0.1)
                    .with_reasoning("no decisions to resolve, defaulting to hold");
            }
            1 => return decisions.pop().expect("len checked"),
            _ => {}
        }

        self.inner.coordination_conflicts.fetch_add(1, Ordering::Relaxed);

        decisions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let min_confidence = decisions
            .iter()
            .map(|d| d.confidence)
            .fold(f64::INFINITY, f64::min);

        let first = &decisions[0];
        let second = &decisions[1];

        if (first.confidence - second.confidence).abs() > CONFLICT_CONFIDENCE_GAP {
            return first.clone();
        }

        let rank_first = brain_priority(&first.primary_brain);
        let rank_second = brain_priority(&second.primary_brain);
        if rank_first != rank_second {
            let winner = if rank_first > rank_second { first } else { second };
            return winner.clone();
        }

        // Same priority, near-equal confidence: de-risk.
        let action = if decisions.iter().any(|d| d.action == TradeAction::Sell) {
            TradeAction::Sell
        } else if decisions.iter().any(|d| d.action == TradeAction::Reduce) {
            TradeAction::Reduce
        } else {
            TradeAction::Hold
        };
        BrainDecision::new(
            "coordinator_conflict_resolution",
            action,
            min_confidence * 0.9,
        )
        .with_reasoning(format!(
            "unresolvable conflict between {} and {}, choosing conservative {}",
            first.primary_brain, second.primary_brain, action
        ))
    }

    /// Most-recent-first history snapshot, optionally filtered by brain
    pub fn get_decision_history(
        &self,
        brain_filter: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<BrainDecision> {
        let history = self.inner.history.lock();
        let iter = history
            .iter()
            .rev()
            .filter(|d| brain_filter.map(|b| d.primary_brain == b).unwrap_or(true))
            .cloned();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn get_statistics(&self) -> CoordinatorStats {
        let inner = &self.inner;
        let by_brain: HashMap<String, u64> = inner
            .requests_by_brain
            .lock()
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();
        let total_requests: u64 = by_brain.values().sum();
        let completed = inner.completed.load(Ordering::Relaxed);
        let avg_confidence = if completed > 0 {
            *inner.confidence_sum.lock() / completed as f64
        } else {
            0.0
        };
        let brain_share = by_brain
            .iter()
            .map(|(brain, count)| {
                (
                    brain.clone(),
                    *count as f64 / total_requests.max(1) as f64,
                )
            })
            .collect();

        CoordinatorStats {
            active: inner.active.load(Ordering::Acquire),
            uptime_seconds: inner
                .started_at
                .lock()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            total_requests,
            requests_by_brain: by_brain,
            brain_share,
            completed_decisions: completed,
            avg_confidence,
            coordination_conflicts: inner.coordination_conflicts.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            engine_errors: inner.engine_errors.load(Ordering::Relaxed),
            limit_hits: inner.limit_hits.load(Ordering::Relaxed),
            batches_flushed: inner.batches_flushed.load(Ordering::Relaxed),
            late_responses: inner.late_responses.load(Ordering::Relaxed),
            concurrent_in_flight: inner.config.max_concurrent_decisions
                - inner.semaphore.available_permits(),
            pending_batch_size: inner.commander_batch.lock().len(),
            decision_history_size: inner.history.lock().len(),
        }
    }

    /// Complete every pending waiter with a fallback and deactivate
    pub fn shutdown(&self) {
        self.inner.active.store(false, Ordering::Release);

        let drained: Vec<(String, oneshot::Sender<BrainDecision>)> =
            self.inner.pending.lock().drain().collect();
        for (correlation_id, tx) in drained {
            let fallback = self.inner.fallback_decision(
                &Map::new(),
                &correlation_id,
                "coordinator shutting down",
            );
            let _ = tx.send(fallback);
        }
        self.inner.commander_batch.lock().clear();
        info!("coordinator shut down");
    }

    fn enqueue_commander(&self, context: Map<String, Value>, correlation_id: String) {
        let (flush_now, start_timer) = {
            let mut batch = self.inner.commander_batch.lock();
            batch.push(PendingBatchItem {
                context,
                correlation_id,
            });
            (
                batch.len() >= self.inner.config.batch_size,
                batch.len() == 1,
            )
        };

        if flush_now {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.flush_commander_batch().await;
            });
        } else if start_timer {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(inner.config.batch_timeout_ms)).await;
                inner.flush_commander_batch().await;
            });
        }
    }

    fn dispatch_over_bus(&self, kind: BrainKind, context: &Map<String, Value>, correlation_id: &str) {
        let mut data = Map::new();
        data.insert("correlation_id".into(), Value::String(correlation_id.into()));
        data.insert("brain".into(), Value::String(kind.to_string()));
        data.insert("context".into(), Value::Object(context.clone()));

        let event = Event::new(EventType::DecisionRequest, "coordinator")
            .with_target(kind.as_str())
            .with_priority(EventPriority::High)
            .with_data(data);

        if let Err(err) = self.inner.bus.publish(event) {
            warn!(%kind, error = %err, "decision request publish failed");
            self.inner.engine_errors.fetch_add(1, Ordering::Relaxed);
            let fallback = self.inner.fallback_decision(
                context,
                correlation_id,
                "decision request could not be published",
            );
            self.inner.complete_correlation(correlation_id, fallback);
        }
    }
}

impl CoordInner {
    fn request_budget(&self, kind: BrainKind) -> Duration {
        match kind {
            BrainKind::Soldier => Duration::from_millis(
                self.config.soldier_timeout_ms + self.config.degraded_timeout_extra_ms,
            ),
            BrainKind::Commander | BrainKind::Scholar => {
                Duration::from_millis(self.config.analysis_timeout_ms)
            }
        }
    }

    /// Call the engine in-process and complete the correlation
    async fn invoke_direct(
        self: Arc<Self>,
        kind: BrainKind,
        context: Map<String, Value>,
        correlation_id: String,
    ) {
        let decision = match kind {
            BrainKind::Soldier => match self.registry.soldier() {
                Some(engine) => engine.decide(&context).await.map(|reply| {
                    let mut decision =
                        BrainDecision::new(kind.as_str(), reply.action, reply.confidence)
                            .with_reasoning(reply.reasoning)
                            .with_correlation_id(correlation_id.clone());
                    decision.supporting_data = reply.metadata;
                    decision.supporting_data.insert(
                        "signal_strength".into(),
                        serde_json::json!(reply.signal_strength),
                    );
                    decision.supporting_data.insert(
                        "risk_level".into(),
                        Value::String(reply.risk_level.to_string()),
                    );
                    decision
                }),
                None => Err(anyhow::anyhow!("soldier engine not registered")),
            },
            BrainKind::Commander => match self.registry.commander() {
                Some(engine) => engine.analyze(&context).await.map(|reply| {
                    let mut decision =
                        BrainDecision::new(kind.as_str(), reply.recommendation, reply.confidence)
                            .with_correlation_id(correlation_id.clone());
                    decision.reasoning = reply.analysis;
                    decision
                }),
                None => Err(anyhow::anyhow!("commander engine not registered")),
            },
            BrainKind::Scholar => match self.registry.scholar() {
                Some(engine) => engine.research(&context).await.map(|reply| {
                    let mut decision =
                        BrainDecision::new(kind.as_str(), reply.recommendation, reply.confidence)
                            .with_correlation_id(correlation_id.clone());
                    decision.reasoning = reply.research_summary;
                    decision
                }),
                None => Err(anyhow::anyhow!("scholar engine not registered")),
            },
        };

        let decision = match decision {
            Ok(decision) => decision,
            Err(err) => {
                self.engine_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%kind, error = %err, "engine call failed, substituting fallback");
                self.fallback_decision(&context, &correlation_id, "engine call failed")
            }
        };
        self.complete_correlation(&correlation_id, decision);
    }

    /// Process every queued commander request concurrently
    async fn flush_commander_batch(self: Arc<Self>) {
        let items: Vec<PendingBatchItem> = std::mem::take(&mut *self.commander_batch.lock());
        if items.is_empty() {
            return;
        }
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        debug!(size = items.len(), "flushing commander batch");

        let futures = items
            .into_iter()
            .map(|item| {
                let inner = self.clone();
                async move {
                    inner
                        .invoke_direct(BrainKind::Commander, item.context, item.correlation_id)
                        .await;
                }
            })
            .collect::<Vec<_>>();
        futures_util::future::join_all(futures).await;
    }

    fn handle_decision_made(&self, event: Event) {
        let Some(correlation_id) = event.data.get("correlation_id").and_then(Value::as_str) else {
            debug!(event_id = %event.event_id, "decision_made without correlation_id ignored");
            return;
        };

        let action = event
            .data
            .get("action")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(TradeAction::Hold);
        let confidence = event
            .data
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        let brain = event
            .data
            .get("brain")
            .and_then(Value::as_str)
            .unwrap_or(event.source_module.as_str())
            .to_string();
        let reasoning = event
            .data
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut decision = BrainDecision::new(brain, action, confidence)
            .with_reasoning(reasoning)
            .with_correlation_id(correlation_id.to_string());
        if let Some(Value::Object(supporting)) = event.data.get("supporting_data") {
            decision.supporting_data = supporting.clone();
        }
        self.complete_correlation(correlation_id, decision);
    }

    /// Deliver a decision to its waiter; count it as late when nobody waits
    fn complete_correlation(&self, correlation_id: &str, decision: BrainDecision) {
        let waiter = self.pending.lock().remove(correlation_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(decision);
            }
            None => {
                self.late_responses.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id, "decision arrived after its waiter left");
            }
        }
    }

    /// Re-emit cross-engine follow-up work as a typed request event
    fn relay_follow_up(&self, event: &Event, request_type: EventType, request: &str) {
        let mut data = Map::new();
        data.insert("request".into(), Value::String(request.into()));
        data.insert(
            "origin_event_id".into(),
            Value::String(event.event_id.clone()),
        );
        data.insert("origin_data".into(), Value::Object(event.data.clone()));
        let _ = self.bus.publish_simple(
            request_type,
            "coordinator",
            data,
            None,
            Some(EventPriority::Normal),
        );
    }

    /// Conservative decision used for timeouts, engine failures and shutdown
    fn fallback_decision(
        &self,
        context: &Map<String, Value>,
        correlation_id: &str,
        reason: &str,
    ) -> BrainDecision {
        let current_position = context
            .get("current_position")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let high_risk = context
            .get("risk_level")
            .and_then(Value::as_str)
            .map(|level| level == "high")
            .unwrap_or(false);

        let action = if current_position > 0.8 {
            TradeAction::Reduce
        } else if high_risk {
            TradeAction::Sell
        } else {
            TradeAction::Hold
        };

        let mut decision = BrainDecision::new("coordinator_fallback", action, 0.2)
            .with_reasoning(format!("fallback: {reason}"))
            .with_correlation_id(correlation_id.to_string());
        decision
            .supporting_data
            .insert("fallback".into(), Value::Bool(true));
        decision
    }

    fn record_decision(&self, decision: &BrainDecision) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        *self.confidence_sum.lock() += decision.confidence;
        metrics::counter!("coordinator_decisions_completed", 1);

        let mut history = self.history.lock();
        if history.len() >= DECISION_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(decision.clone());
    }
}

fn brain_priority(primary_brain: &str) -> u8 {
    match primary_brain {
        "soldier" => 3,
        "commander" => 2,
        "scholar" => 1,
        _ => 0,
    }
}

/// Point-in-time coordinator statistics
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub active: bool,
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub requests_by_brain: HashMap<String, u64>,
    pub brain_share: HashMap<String, f64>,
    pub completed_decisions: u64,
    pub avg_confidence: f64,
    pub coordination_conflicts: u64,
    pub timeouts: u64,
    pub engine_errors: u64,
    pub limit_hits: u64,
    pub batches_flushed: u64,
    pub late_responses: u64,
    pub concurrent_in_flight: usize,
    pub pending_batch_size: usize,
    pub decision_history_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::models::RiskLevel;
    use async_trait::async_trait;

    struct StubSoldier {
        action: TradeAction,
        confidence: f64,
        delay: Duration,
    }

    #[async_trait]
    impl SoldierEngine for StubSoldier {
        async fn decide(&self, _context: &Map<String, Value>) -> anyhow::Result<SoldierReply> {
            tokio::time::sleep(self.delay).await;
            Ok(SoldierReply {
                action: self.action,
                confidence: self.confidence,
                reasoning: "stub".into(),
                signal_strength: 0.7,
                risk_level: RiskLevel::Medium,
                metadata: Map::new(),
            })
        }
    }

    struct StubCommander;

    #[async_trait]
    impl CommanderEngine for StubCommander {
        async fn analyze(&self, _context: &Map<String, Value>) -> anyhow::Result<CommanderReply> {
            Ok(CommanderReply {
                recommendation: TradeAction::Buy,
                confidence: 0.8,
                analysis: "strategic stub".into(),
            })
        }
    }

    struct FailingScholar;

    #[async_trait]
    impl ScholarEngine for FailingScholar {
        async fn research(&self, _context: &Map<String, Value>) -> anyhow::Result<ScholarReply> {
            anyhow::bail!("research backend unavailable")
        }
    }

    fn test_setup(config: CoordinatorConfig) -> (EventBus, Arc<EngineRegistry>, BrainCoordinator) {
        let bus = EventBus::new(BusConfig {
            low_latency_mode: true,
            ..BusConfig::default()
        });
        bus.initialize();
        let registry = Arc::new(EngineRegistry::new());
        let coordinator = BrainCoordinator::new(bus.clone(), registry.clone(), config);
        coordinator.initialize();
        (bus, registry, coordinator)
    }

    fn decision(brain: &str, action: TradeAction, confidence: f64) -> BrainDecision {
        BrainDecision::new(brain, action, confidence)
    }

    #[tokio::test]
    async fn test_invalid_brain_rejected() {
        let (_bus, _registry, coordinator) = test_setup(CoordinatorConfig::default());
        let result = coordinator.request_decision(Map::new(), "oracle").await;
        assert_eq!(
            result.unwrap_err(),
            CoordinatorError::InvalidArgument("oracle".into())
        );
    }

    #[tokio::test]
    async fn test_direct_soldier_decision() {
        let (_bus, registry, coordinator) = test_setup(CoordinatorConfig::default());
        registry.register_soldier(Arc::new(StubSoldier {
            action: TradeAction::Buy,
            confidence: 0.9,
            delay: Duration::from_millis(1),
        }));

        let decision = coordinator
            .request_decision(Map::new(), "soldier")
            .await
            .unwrap();
        assert_eq!(decision.primary_brain, "soldier");
        assert_eq!(decision.action, TradeAction::Buy);
        assert!(decision.correlation_id.is_some());

        let stats = coordinator.get_statistics();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.requests_by_brain["soldier"], 1);
        assert_eq!(stats.timeouts, 0);
    }

    #[tokio::test]
    async fn test_timeout_returns_fallback_and_counts_late_response() {
        let config = CoordinatorConfig {
            soldier_timeout_ms: 30,
            ..CoordinatorConfig::default()
        };
        let (_bus, registry, coordinator) = test_setup(config);
        registry.register_soldier(Arc::new(StubSoldier {
            action: TradeAction::Buy,
            confidence: 0.9,
            delay: Duration::from_millis(150),
        }));

        let decision = coordinator
            .request_decision(Map::new(), "soldier")
            .await
            .unwrap();
        assert_eq!(decision.primary_brain, "coordinator_fallback");
        assert_eq!(decision.action, TradeAction::Hold);
        assert!(decision.confidence <= 0.3);
        assert_eq!(coordinator.get_statistics().timeouts, 1);

        // The stub finishes later; its reply finds no waiter.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(coordinator.get_statistics().late_responses, 1);
    }

    #[tokio::test]
    async fn test_engine_error_becomes_fallback() {
        let (_bus, registry, coordinator) = test_setup(CoordinatorConfig::default());
        registry.register_scholar(Arc::new(FailingScholar));

        let mut context = Map::new();
        context.insert("risk_level".into(), Value::String("high".into()));
        let decision = coordinator
            .request_decision(context, "scholar")
            .await
            .unwrap();
        assert_eq!(decision.primary_brain, "coordinator_fallback");
        assert_eq!(decision.action, TradeAction::Sell);
        assert_eq!(coordinator.get_statistics().engine_errors, 1);
    }

    #[tokio::test]
    async fn test_fallback_reduce_on_large_position() {
        let (_bus, _registry, coordinator) = test_setup(CoordinatorConfig::default());
        // No soldier registered: request falls back using the context.
        let mut context = Map::new();
        context.insert("current_position".into(), serde_json::json!(0.95));
        let decision = coordinator
            .request_decision(context, "soldier")
            .await
            .unwrap();
        assert_eq!(decision.action, TradeAction::Reduce);
    }

    #[tokio::test]
    async fn test_commander_batch_flushes_on_timeout() {
        let config = CoordinatorConfig {
            batch_size: 10,
            batch_timeout_ms: 20,
            ..CoordinatorConfig::default()
        };
        let (_bus, registry, coordinator) = test_setup(config);
        registry.register_commander(Arc::new(StubCommander));

        let decision = coordinator
            .request_decision(Map::new(), "commander")
            .await
            .unwrap();
        assert_eq!(decision.action, TradeAction::Buy);
        assert_eq!(decision.primary_brain, "commander");

        let stats = coordinator.get_statistics();
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.pending_batch_size, 0);
    }

    #[tokio::test]
    async fn test_commander_batch_flushes_on_size() {
        let config = CoordinatorConfig {
            batch_size: 3,
            batch_timeout_ms: 5_000,
            analysis_timeout_ms: 1_000,
            ..CoordinatorConfig::default()
        };
        let (_bus, registry, coordinator) = test_setup(config);
        registry.register_commander(Arc::new(StubCommander));

        let requests = (0..3)
            .map(|_| (Map::new(), "commander".to_string()))
            .collect();
        let results = coordinator.request_decisions_batch(requests).await;
        assert_eq!(results.len(), 3);
        for result in results {
            assert_eq!(result.unwrap().action, TradeAction::Buy);
        }
        assert_eq!(coordinator.get_statistics().batches_flushed, 1);
    }

    #[tokio::test]
    async fn test_event_dispatch_round_trip() {
        let config = CoordinatorConfig {
            event_dispatch: true,
            enable_batching: false,
            ..CoordinatorConfig::default()
        };
        let (bus, _registry, coordinator) = test_setup(config);

        // Engine-side adapter: answer decision requests over the bus.
        let responder_bus = bus.clone();
        bus.subscribe(
            EventType::DecisionRequest,
            handler_fn(move |event| {
                let bus = responder_bus.clone();
                async move {
                    let correlation_id = event.data["correlation_id"].as_str().unwrap().to_string();
                    let mut data = Map::new();
                    data.insert("correlation_id".into(), Value::String(correlation_id));
                    data.insert("action".into(), Value::String("strong_buy".into()));
                    data.insert("confidence".into(), serde_json::json!(0.92));
                    data.insert("brain".into(), Value::String("soldier".into()));
                    bus.publish_simple(EventType::DecisionMade, "soldier", data, None, None)
                        .map_err(|e| anyhow::anyhow!("{e}"))
                }
            }),
            Some("soldier_request_handler".into()),
        );

        let decision = coordinator
            .request_decision(Map::new(), "soldier")
            .await
            .unwrap();
        assert_eq!(decision.action, TradeAction::StrongBuy);
        assert_eq!(decision.primary_brain, "soldier");
        assert!((decision.confidence - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_conflict_brain_priority_tiebreak() {
        let (_bus, _registry, coordinator) = test_setup(CoordinatorConfig::default());
        let resolved = coordinator.resolve_conflicts(vec![
            decision("soldier", TradeAction::Buy, 0.75),
            decision("commander", TradeAction::Sell, 0.73),
        ]);
        assert_eq!(resolved.primary_brain, "soldier");
        assert_eq!(resolved.action, TradeAction::Buy);
        assert_eq!(coordinator.get_statistics().coordination_conflicts, 1);
    }

    #[tokio::test]
    async fn test_conflict_large_gap_takes_higher_confidence() {
        let (_bus, _registry, coordinator) = test_setup(CoordinatorConfig::default());
        let resolved = coordinator.resolve_conflicts(vec![
            decision("soldier", TradeAction::Buy, 0.30),
            decision("commander", TradeAction::Sell, 0.90),
        ]);
        assert_eq!(resolved.primary_brain, "commander");
        assert_eq!(resolved.action, TradeAction::Sell);
    }

    #[tokio::test]
    async fn test_conflict_same_brain_synthesizes_conservative() {
        let (_bus, _registry, coordinator) = test_setup(CoordinatorConfig::default());
        let resolved = coordinator.resolve_conflicts(vec![
            decision("soldier", TradeAction::Buy, 0.70),
            decision("soldier", TradeAction::Sell, 0.68),
        ]);
        assert_eq!(resolved.primary_brain, "coordinator_conflict_resolution");
        assert_eq!(resolved.action, TradeAction::Sell);
        assert!((resolved.confidence - 0.68 * 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_conflict_empty_and_single() {
        let (_bus, _registry, coordinator) = test_setup(CoordinatorConfig::default());

        let empty = coordinator.resolve_conflicts(vec![]);
        assert_eq!(empty.primary_brain, "coordinator");
        assert_eq!(empty.action, TradeAction::Hold);
        assert!((empty.confidence - 0.1).abs() < 1e-9);

        let only = decision("scholar", TradeAction::Buy, 0.4);
        let resolved = coordinator.resolve_conflicts(vec![only.clone()]);
        assert_eq!(resolved, only);
    }

    #[tokio::test]
    async fn test_history_filter_and_limit() {
        let (_bus, registry, coordinator) = test_setup(CoordinatorConfig::default());
        registry.register_soldier(Arc::new(StubSoldier {
            action: TradeAction::Buy,
            confidence: 0.9,
            delay: Duration::from_millis(1),
        }));
        registry.register_commander(Arc::new(StubCommander));

        for _ in 0..3 {
            coordinator
                .request_decision(Map::new(), "soldier")
                .await
                .unwrap();
        }
        coordinator
            .request_decision(Map::new(), "commander")
            .await
            .unwrap();

        let all = coordinator.get_decision_history(None, None);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].primary_brain, "commander", "most recent first");

        let soldiers = coordinator.get_decision_history(Some("soldier"), Some(2));
        assert_eq!(soldiers.len(), 2);
        assert!(soldiers.iter().all(|d| d.primary_brain == "soldier"));
    }

    #[tokio::test]
    async fn test_shutdown_completes_pending_with_fallback() {
        let config = CoordinatorConfig {
            soldier_timeout_ms: 2_000,
            ..CoordinatorConfig::default()
        };
        let (_bus, registry, coordinator) = test_setup(config);
        registry.register_soldier(Arc::new(StubSoldier {
            action: TradeAction::Buy,
            confidence: 0.9,
            delay: Duration::from_secs(10),
        }));

        let request = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.request_decision(Map::new(), "soldier").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.shutdown();

        let decision = request.await.unwrap().unwrap();
        assert_eq!(decision.primary_brain, "coordinator_fallback");
        assert!(!coordinator.get_statistics().active);
    }
}
