//! Soldier failover core
//!
//! Serves tactical decisions inside a tight latency budget and degrades
//! gracefully when the local inference path goes unhealthy:
//!
//! - NORMAL: local inference under `local_inference_timeout`
//! - DEGRADED: remote inference under `cloud_timeout`
//! - OFFLINE: deterministic rules over the market data
//!
//! A background health loop probes the local path every
//! `recovery_check_interval`; consecutive failures trip NORMAL to DEGRADED,
//! one healthy probe restores NORMAL. Transitions publish SYSTEM_ALERT events
//! and never wait on the network.

pub mod cache;
pub mod parse;

pub use cache::DecisionCache;
pub use parse::{parse_inference_output, ParsedDecision};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bus::{handler_fn, EventBus, EventPriority, EventType};
use crate::models::{RiskLevel, SoldierDecision, TradeAction};

/// Serving mode of the failover core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoldierMode {
    Normal,
    Degraded,
    Offline,
}

impl SoldierMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoldierMode::Normal => "normal",
            SoldierMode::Degraded => "degraded",
            SoldierMode::Offline => "offline",
        }
    }
}

impl fmt::Display for SoldierMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failover tuning; timeouts are seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoldierConfig {
    /// Local inference budget
    #[serde(default = "default_local_timeout")]
    pub local_inference_timeout: f64,
    /// Remote inference budget
    #[serde(default = "default_cloud_timeout")]
    pub cloud_timeout: f64,
    /// A healthy probe must also answer within this many milliseconds
    #[serde(default = "default_degradation_threshold_ms")]
    pub degradation_threshold_ms: f64,
    /// Consecutive health failures before NORMAL trips to DEGRADED
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Decision cache TTL
    #[serde(default = "default_cache_ttl")]
    pub decision_cache_ttl: f64,
    /// Health probe period
    #[serde(default = "default_recovery_interval")]
    pub recovery_check_interval: f64,
    /// Decision cache capacity
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Optional external backing store for cache warm/share
    #[serde(default)]
    pub backing_store_host: Option<String>,
    #[serde(default)]
    pub backing_store_port: Option<u16>,
}

fn default_local_timeout() -> f64 {
    0.02
}

fn default_cloud_timeout() -> f64 {
    5.0
}

fn default_degradation_threshold_ms() -> f64 {
    20.0
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cache_ttl() -> f64 {
    5.0
}

fn default_recovery_interval() -> f64 {
    10.0
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for SoldierConfig {
    fn default() -> Self {
        Self {
            local_inference_timeout: default_local_timeout(),
            cloud_timeout: default_cloud_timeout(),
            degradation_threshold_ms: default_degradation_threshold_ms(),
            failure_threshold: default_failure_threshold(),
            decision_cache_ttl: default_cache_ttl(),
            recovery_check_interval: default_recovery_interval(),
            cache_capacity: default_cache_capacity(),
            backing_store_host: None,
            backing_store_port: None,
        }
    }
}

impl SoldierConfig {
    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.local_inference_timeout)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.cloud_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.decision_cache_ttl)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_check_interval)
    }
}

/// Raw result of one inference call
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub text: String,
    pub latency_ms: f64,
}

/// Local (on-box) model backend
#[async_trait]
pub trait LocalInference: Send + Sync {
    async fn infer(&self, prompt: &str) -> anyhow::Result<InferenceOutput>;
}

/// Remote (cloud) model backend
#[async_trait]
pub trait RemoteInference: Send + Sync {
    async fn infer(&self, prompt: &str) -> anyhow::Result<InferenceOutput>;
}

/// Sliding latency window size for the p99 estimate
const LATENCY_WINDOW: usize = 1_000;

#[derive(Default)]
struct LatencyStats {
    count: u64,
    mean_ms: f64,
    window: VecDeque<f64>,
}

impl LatencyStats {
    fn record(&mut self, latency_ms: f64) {
        self.count += 1;
        self.mean_ms += (latency_ms - self.mean_ms) / self.count as f64;
        if self.window.len() >= LATENCY_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(latency_ms);
    }

    fn p99(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * 0.99).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }
}

struct SoldierShared {
    config: SoldierConfig,
    bus: EventBus,
    local: Arc<dyn LocalInference>,
    remote: Arc<dyn RemoteInference>,
    mode: Mutex<SoldierMode>,
    consecutive_failures: AtomicU32,
    cache: DecisionCache,

    local_decisions: AtomicU64,
    cloud_decisions: AtomicU64,
    offline_decisions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    degradations: AtomicU64,
    recoveries: AtomicU64,
    latency: Mutex<LatencyStats>,

    short_term_memory: Mutex<HashMap<String, Value>>,
    external_analysis: Mutex<HashMap<String, Value>>,

    running: AtomicBool,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

/// Cheap-to-clone handle to the failover core
#[derive(Clone)]
pub struct SoldierCore {
    shared: Arc<SoldierShared>,
}

impl SoldierCore {
    pub fn new(
        config: SoldierConfig,
        bus: EventBus,
        local: Arc<dyn LocalInference>,
        remote: Arc<dyn RemoteInference>,
    ) -> Self {
        let cache = DecisionCache::new(config.cache_ttl(), config.cache_capacity);
        Self {
            shared: Arc::new(SoldierShared {
                config,
                bus,
                local,
                remote,
                mode: Mutex::new(SoldierMode::Normal),
                consecutive_failures: AtomicU32::new(0),
                cache,
                local_decisions: AtomicU64::new(0),
                cloud_decisions: AtomicU64::new(0),
                offline_decisions: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                degradations: AtomicU64::new(0),
                recoveries: AtomicU64::new(0),
                latency: Mutex::new(LatencyStats::default()),
                short_term_memory: Mutex::new(HashMap::new()),
                external_analysis: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                health_task: Mutex::new(None),
                started_at: Mutex::new(None),
            }),
        }
    }

    /// Subscribe the external-analysis handlers and start the health loop
    pub fn initialize(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shared.started_at.lock() = Some(Instant::now());

        let shared = self.shared.clone();
        self.shared.bus.subscribe_from(
            EventType::MarketDataReceived,
            "soldier",
            handler_fn(move |event| {
                let shared = shared.clone();
                async move {
                    let key = event
                        .data
                        .get("symbol")
                        .and_then(Value::as_str)
                        .unwrap_or(&event.event_id)
                        .to_string();
                    shared
                        .short_term_memory
                        .lock()
                        .insert(key, Value::Object(event.data));
                    Ok(())
                }
            }),
            Some("soldier_market_data_handler".into()),
        );

        let shared = self.shared.clone();
        self.shared.bus.subscribe_from(
            EventType::AnalysisCompleted,
            "soldier",
            handler_fn(move |event| {
                let shared = shared.clone();
                async move {
                    let key = event
                        .data
                        .get("analysis_id")
                        .and_then(Value::as_str)
                        .unwrap_or(event.source_module.as_str())
                        .to_string();
                    shared
                        .external_analysis
                        .lock()
                        .insert(key, Value::Object(event.data));
                    Ok(())
                }
            }),
            Some("soldier_analysis_handler".into()),
        );

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            health_loop(shared).await;
        });
        *self.shared.health_task.lock() = Some(task);
        info!(
            failure_threshold = self.shared.config.failure_threshold,
            interval_secs = self.shared.config.recovery_check_interval,
            "soldier core started"
        );
    }

    /// Stop the health loop
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        let task = self.shared.health_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!("soldier core stopped");
    }

    pub fn mode(&self) -> SoldierMode {
        *self.shared.mode.lock()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Produce a decision for `symbol`, cached per (symbol, market data)
    pub async fn make_decision(
        &self,
        symbol: &str,
        market_data: &Map<String, Value>,
    ) -> SoldierDecision {
        let key = DecisionCache::fingerprint(symbol, market_data);
        if let Some(cached) = self.shared.cache.get(key) {
            self.shared.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("soldier_cache_hits", 1);
            debug!(symbol, "decision served from cache");
            return cached;
        }
        self.shared.cache_misses.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let (parsed, served_by) = self.decide_uncached(symbol, market_data).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let decision = SoldierDecision {
            action: parsed.action,
            confidence: parsed.confidence,
            reasoning: parsed.reasoning,
            signal_strength: parsed.signal_strength,
            risk_level: parsed.risk_level,
            execution_priority: execution_priority(parsed.action, parsed.confidence),
            source_mode: served_by,
            latency_ms,
            timestamp: Utc::now(),
        };

        self.shared.cache.insert(key, decision.clone());
        self.shared.record_serve(served_by, latency_ms);
        decision
    }

    async fn decide_uncached(
        &self,
        symbol: &str,
        market_data: &Map<String, Value>,
    ) -> (ParsedDecision, SoldierMode) {
        let shared = &self.shared;
        let prompt = build_prompt(symbol, market_data);

        let mode = self.mode();
        if mode == SoldierMode::Offline {
            return (offline_policy(market_data), SoldierMode::Offline);
        }

        if mode == SoldierMode::Normal {
            match tokio::time::timeout(shared.config.local_timeout(), shared.local.infer(&prompt))
                .await
            {
                Ok(Ok(output)) => {
                    return (parse_inference_output(&output.text), SoldierMode::Normal);
                }
                Ok(Err(err)) => {
                    warn!(symbol, error = %err, "local inference failed");
                }
                Err(_) => {
                    warn!(symbol, "local inference timed out");
                }
            }
            let failures = shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= shared.config.failure_threshold {
                shared.trigger_degradation();
            }
        }

        // Remote path serves DEGRADED mode and local-failure fall-through.
        match tokio::time::timeout(shared.config.cloud_timeout(), shared.remote.infer(&prompt))
            .await
        {
            Ok(Ok(output)) => (parse_inference_output(&output.text), SoldierMode::Degraded),
            Ok(Err(err)) => {
                error!(symbol, error = %err, "remote inference failed, applying offline rules");
                (offline_policy(market_data), SoldierMode::Offline)
            }
            Err(_) => {
                error!(symbol, "remote inference timed out, applying offline rules");
                (offline_policy(market_data), SoldierMode::Offline)
            }
        }
    }

    /// One health probe tick; also driven by the background loop
    pub async fn run_health_check(&self) {
        let shared = &self.shared;
        let probe = tokio::time::timeout(
            shared.config.local_timeout(),
            shared.local.infer("health probe"),
        )
        .await;

        let healthy = match probe {
            Ok(Ok(output)) => output.latency_ms <= shared.config.degradation_threshold_ms,
            Ok(Err(_)) | Err(_) => false,
        };

        if healthy {
            shared.health_ok();
        } else {
            shared.health_failure();
        }
    }

    /// Operator override: drop every path except the rule-based one
    pub fn force_offline(&self) {
        let mut mode = self.shared.mode.lock();
        if *mode != SoldierMode::Offline {
            warn!(previous = %*mode, "soldier forced offline");
            *mode = SoldierMode::Offline;
        }
    }

    /// Fire-and-forget request for fresh market data
    pub fn request_market_data(&self, symbol: &str) {
        let mut data = Map::new();
        data.insert("symbol".into(), Value::String(symbol.into()));
        data.insert(
            "requested_at".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
        if let Err(err) =
            self.shared
                .bus
                .publish_simple(EventType::MarketDataRequest, "soldier", data, None, None)
        {
            debug!(symbol, error = %err, "market data request not published");
        }
    }

    /// Fire-and-forget request for deeper research
    pub fn request_research(&self, topic: &str) {
        let mut data = Map::new();
        data.insert("topic".into(), Value::String(topic.into()));
        data.insert(
            "requested_at".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
        if let Err(err) =
            self.shared
                .bus
                .publish_simple(EventType::ResearchRequest, "soldier", data, None, None)
        {
            debug!(topic, error = %err, "research request not published");
        }
    }

    pub fn short_term_memory(&self, key: &str) -> Option<Value> {
        self.shared.short_term_memory.lock().get(key).cloned()
    }

    pub fn external_analysis(&self, key: &str) -> Option<Value> {
        self.shared.external_analysis.lock().get(key).cloned()
    }

    pub fn get_statistics(&self) -> SoldierStats {
        let shared = &self.shared;
        let latency = shared.latency.lock();
        SoldierStats {
            mode: self.mode(),
            consecutive_failures: shared.consecutive_failures.load(Ordering::Relaxed),
            local_decisions: shared.local_decisions.load(Ordering::Relaxed),
            cloud_decisions: shared.cloud_decisions.load(Ordering::Relaxed),
            offline_decisions: shared.offline_decisions.load(Ordering::Relaxed),
            cache_hits: shared.cache_hits.load(Ordering::Relaxed),
            cache_misses: shared.cache_misses.load(Ordering::Relaxed),
            cache_size: shared.cache.len(),
            degradations: shared.degradations.load(Ordering::Relaxed),
            recoveries: shared.recoveries.load(Ordering::Relaxed),
            avg_latency_ms: latency.mean_ms,
            p99_latency_ms: latency.p99(),
            uptime_seconds: shared
                .started_at
                .lock()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            short_term_memory_size: shared.short_term_memory.lock().len(),
            external_analysis_size: shared.external_analysis.lock().len(),
        }
    }
}

impl SoldierShared {
    fn health_ok(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.trigger_recovery();
    }

    fn health_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(failures, "health probe failed");
        if failures >= self.config.failure_threshold {
            self.trigger_degradation();
        }
    }

    /// NORMAL -> DEGRADED; no-op from any other state
    fn trigger_degradation(&self) {
        let transitioned = {
            let mut mode = self.mode.lock();
            if *mode == SoldierMode::Normal {
                *mode = SoldierMode::Degraded;
                true
            } else {
                false
            }
        };
        if !transitioned {
            return;
        }

        self.degradations.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.load(Ordering::Acquire);
        warn!(consecutive_failures = failures, "soldier degraded to cloud path");

        let mut data = Map::new();
        data.insert("alert_type".into(), Value::String("soldier_degradation".into()));
        data.insert(
            "reason".into(),
            Value::String("local_model_health_check_failed".into()),
        );
        data.insert("consecutive_failures".into(), serde_json::json!(failures));
        data.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        if let Err(err) = self.bus.publish_simple(
            EventType::SystemAlert,
            "soldier",
            data,
            None,
            Some(EventPriority::Critical),
        ) {
            error!(error = %err, "degradation alert not published");
        }
    }

    /// DEGRADED -> NORMAL; no-op from any other state
    fn trigger_recovery(&self) {
        let transitioned = {
            let mut mode = self.mode.lock();
            if *mode == SoldierMode::Degraded {
                *mode = SoldierMode::Normal;
                true
            } else {
                false
            }
        };
        if !transitioned {
            return;
        }

        self.recoveries.fetch_add(1, Ordering::Relaxed);
        info!("soldier recovered to local path");

        let mut data = Map::new();
        data.insert("alert_type".into(), Value::String("soldier_recovery".into()));
        data.insert(
            "reason".into(),
            Value::String("local_model_health_restored".into()),
        );
        data.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        if let Err(err) = self.bus.publish_simple(
            EventType::SystemAlert,
            "soldier",
            data,
            None,
            Some(EventPriority::High),
        ) {
            error!(error = %err, "recovery alert not published");
        }
    }

    fn record_serve(&self, served_by: SoldierMode, latency_ms: f64) {
        match served_by {
            SoldierMode::Normal => self.local_decisions.fetch_add(1, Ordering::Relaxed),
            SoldierMode::Degraded => self.cloud_decisions.fetch_add(1, Ordering::Relaxed),
            SoldierMode::Offline => self.offline_decisions.fetch_add(1, Ordering::Relaxed),
        };
        self.latency.lock().record(latency_ms);
        metrics::histogram!("soldier_decision_latency_ms", latency_ms);
    }
}

async fn health_loop(shared: Arc<SoldierShared>) {
    let period = shared.config.recovery_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let core = SoldierCore {
            shared: shared.clone(),
        };
        core.run_health_check().await;
    }
}

/// Baseline rules used when both model paths are unavailable
fn offline_policy(market_data: &Map<String, Value>) -> ParsedDecision {
    let close = field(market_data, "close");
    let ma20 = field(market_data, "ma20");
    let volume = field(market_data, "volume");
    let avg_volume = field(market_data, "avg_volume");

    let (action, confidence) = if close > ma20 && volume > avg_volume {
        (TradeAction::Buy, 0.55)
    } else if close < ma20 && volume > avg_volume {
        (TradeAction::Sell, 0.55)
    } else {
        (TradeAction::Hold, 0.35)
    };

    ParsedDecision {
        action,
        confidence,
        reasoning: format!(
            "offline rules: close={close} ma20={ma20} volume={volume} avg_volume={avg_volume}"
        ),
        signal_strength: confidence,
        risk_level: if action == TradeAction::Hold {
            RiskLevel::Low
        } else {
            RiskLevel::Medium
        },
    }
}

fn field(data: &Map<String, Value>, key: &str) -> f64 {
    data.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn build_prompt(symbol: &str, market_data: &Map<String, Value>) -> String {
    format!(
        "symbol={symbol} market={}",
        Value::Object(market_data.clone())
    )
}

fn execution_priority(action: TradeAction, confidence: f64) -> u8 {
    let base: i32 = match action {
        TradeAction::StrongBuy => 9,
        TradeAction::Buy | TradeAction::Sell => 7,
        TradeAction::Reduce => 5,
        TradeAction::Hold => 3,
    };
    let boost = if confidence > 0.8 { 1 } else { 0 };
    (base + boost).clamp(1, 10) as u8
}

/// Point-in-time soldier statistics
#[derive(Debug, Clone, Serialize)]
pub struct SoldierStats {
    pub mode: SoldierMode,
    pub consecutive_failures: u32,
    pub local_decisions: u64,
    pub cloud_decisions: u64,
    pub offline_decisions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
    pub degradations: u64,
    pub recoveries: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub uptime_seconds: f64,
    pub short_term_memory_size: usize,
    pub external_analysis_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, Event};

    /// Local backend whose failure mode and latency are toggled by tests
    struct FlakyLocal {
        failing: AtomicBool,
        reported_latency_ms: f64,
        sleep: Duration,
        reply: String,
    }

    impl FlakyLocal {
        fn healthy(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(false),
                reported_latency_ms: 5.0,
                sleep: Duration::from_millis(1),
                reply: reply.to_string(),
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(true),
                reported_latency_ms: 5.0,
                sleep: Duration::from_millis(1),
                reply: String::new(),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LocalInference for FlakyLocal {
        async fn infer(&self, _prompt: &str) -> anyhow::Result<InferenceOutput> {
            tokio::time::sleep(self.sleep).await;
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("model crashed");
            }
            Ok(InferenceOutput {
                text: self.reply.clone(),
                latency_ms: self.reported_latency_ms,
            })
        }
    }

    struct StaticRemote {
        reply: String,
    }

    #[async_trait]
    impl RemoteInference for StaticRemote {
        async fn infer(&self, _prompt: &str) -> anyhow::Result<InferenceOutput> {
            Ok(InferenceOutput {
                text: self.reply.clone(),
                latency_ms: 120.0,
            })
        }
    }

    struct DeadRemote;

    #[async_trait]
    impl RemoteInference for DeadRemote {
        async fn infer(&self, _prompt: &str) -> anyhow::Result<InferenceOutput> {
            anyhow::bail!("cloud unreachable")
        }
    }

    fn alert_collector(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = alerts.clone();
        bus.subscribe(
            EventType::SystemAlert,
            handler_fn(move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(event);
                    Ok(())
                }
            }),
            Some("alert_collector_handler".into()),
        );
        alerts
    }

    fn test_bus() -> EventBus {
        let bus = EventBus::new(BusConfig {
            low_latency_mode: true,
            ..BusConfig::default()
        });
        bus.initialize();
        bus
    }

    fn fast_config() -> SoldierConfig {
        SoldierConfig {
            local_inference_timeout: 0.02,
            failure_threshold: 3,
            recovery_check_interval: 0.1,
            ..SoldierConfig::default()
        }
    }

    fn market(close: f64, ma20: f64, volume: f64, avg_volume: f64) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("close".into(), serde_json::json!(close));
        data.insert("ma20".into(), serde_json::json!(ma20));
        data.insert("volume".into(), serde_json::json!(volume));
        data.insert("avg_volume".into(), serde_json::json!(avg_volume));
        data
    }

    fn count_alerts(alerts: &Arc<Mutex<Vec<Event>>>, alert_type: &str) -> usize {
        alerts
            .lock()
            .iter()
            .filter(|e| e.data.get("alert_type").and_then(Value::as_str) == Some(alert_type))
            .count()
    }

    #[tokio::test]
    async fn test_degradation_after_three_failed_probes() {
        let bus = test_bus();
        let alerts = alert_collector(&bus);
        let local = FlakyLocal::broken();
        let core = SoldierCore::new(
            fast_config(),
            bus.clone(),
            local,
            Arc::new(StaticRemote {
                reply: "{\"action\":\"hold\",\"confidence\":0.5}".into(),
            }),
        );

        assert_eq!(core.mode(), SoldierMode::Normal);
        for _ in 0..3 {
            core.run_health_check().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(core.mode(), SoldierMode::Degraded);
        assert!(core.consecutive_failures() >= 3);
        assert_eq!(count_alerts(&alerts, "soldier_degradation"), 1);

        let alert = alerts
            .lock()
            .iter()
            .find(|e| e.data["alert_type"] == "soldier_degradation")
            .cloned()
            .unwrap();
        assert_eq!(alert.priority, EventPriority::Critical);
        assert_eq!(
            alert.data["reason"],
            Value::String("local_model_health_check_failed".into())
        );
        assert!(alert.data["consecutive_failures"].as_u64().unwrap() >= 3);
        assert!(alert.data.contains_key("timestamp"));
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_after_single_healthy_probe() {
        let bus = test_bus();
        let alerts = alert_collector(&bus);
        let local = FlakyLocal::broken();
        let core = SoldierCore::new(
            fast_config(),
            bus.clone(),
            local.clone(),
            Arc::new(StaticRemote {
                reply: "{\"action\":\"hold\",\"confidence\":0.5}".into(),
            }),
        );

        // Degrade first, then push the failure count past the threshold.
        for _ in 0..5 {
            core.run_health_check().await;
        }
        assert_eq!(core.mode(), SoldierMode::Degraded);
        assert_eq!(core.consecutive_failures(), 5);

        local.set_failing(false);
        core.run_health_check().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(core.mode(), SoldierMode::Normal);
        assert_eq!(core.consecutive_failures(), 0);
        assert_eq!(count_alerts(&alerts, "soldier_recovery"), 1);

        let alert = alerts
            .lock()
            .iter()
            .find(|e| e.data["alert_type"] == "soldier_recovery")
            .cloned()
            .unwrap();
        assert_eq!(alert.priority, EventPriority::High);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_failures_do_not_duplicate_degradation_alert() {
        let bus = test_bus();
        let alerts = alert_collector(&bus);
        let core = SoldierCore::new(
            fast_config(),
            bus.clone(),
            FlakyLocal::broken(),
            Arc::new(DeadRemote),
        );

        for _ in 0..8 {
            core.run_health_check().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(core.mode(), SoldierMode::Degraded);
        assert_eq!(count_alerts(&alerts, "soldier_degradation"), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_hit_is_faster_and_counted() {
        let bus = test_bus();
        let local = FlakyLocal::healthy("{\"action\":\"buy\",\"confidence\":0.8}");
        let core = SoldierCore::new(
            SoldierConfig::default(),
            bus.clone(),
            local,
            Arc::new(DeadRemote),
        );
        let data = market(150.0, 145.0, 1_000_000.0, 800_000.0);

        let first_started = Instant::now();
        let first = core.make_decision("AAPL", &data).await;
        let first_elapsed = first_started.elapsed();

        let second_started = Instant::now();
        let second = core.make_decision("AAPL", &data).await;
        let second_elapsed = second_started.elapsed();

        assert_eq!(first.action, TradeAction::Buy);
        assert_eq!(second, first, "cached decision is returned verbatim");
        assert!(second_elapsed < first_elapsed);

        let stats = core.get_statistics();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.local_decisions, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_failure_falls_through_to_cloud() {
        let bus = test_bus();
        let core = SoldierCore::new(
            SoldierConfig {
                failure_threshold: 10,
                ..SoldierConfig::default()
            },
            bus.clone(),
            FlakyLocal::broken(),
            Arc::new(StaticRemote {
                reply: "{\"action\":\"sell\",\"confidence\":0.65}".into(),
            }),
        );

        let decision = core
            .make_decision("TSLA", &market(200.0, 205.0, 2e6, 1e6))
            .await;
        assert_eq!(decision.action, TradeAction::Sell);
        assert_eq!(decision.source_mode, SoldierMode::Degraded);
        assert_eq!(core.mode(), SoldierMode::Normal, "one failure is below threshold");
        assert_eq!(core.get_statistics().cloud_decisions, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_policy_rules() {
        let bus = test_bus();
        let core = SoldierCore::new(
            SoldierConfig::default(),
            bus.clone(),
            FlakyLocal::broken(),
            Arc::new(DeadRemote),
        );
        core.force_offline();
        assert_eq!(core.mode(), SoldierMode::Offline);

        let buy = core
            .make_decision("UP", &market(150.0, 145.0, 2e6, 1e6))
            .await;
        assert_eq!(buy.action, TradeAction::Buy);
        assert!((buy.confidence - 0.55).abs() < 1e-9);
        assert_eq!(buy.source_mode, SoldierMode::Offline);

        let sell = core
            .make_decision("DOWN", &market(140.0, 145.0, 2e6, 1e6))
            .await;
        assert_eq!(sell.action, TradeAction::Sell);

        let hold = core
            .make_decision("FLAT", &market(150.0, 145.0, 5e5, 1e6))
            .await;
        assert_eq!(hold.action, TradeAction::Hold);
        assert!((hold.confidence - 0.35).abs() < 1e-9);

        assert_eq!(core.get_statistics().offline_decisions, 3);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_both_paths_down_still_produces_decision() {
        let bus = test_bus();
        let core = SoldierCore::new(
            SoldierConfig {
                failure_threshold: 100,
                ..SoldierConfig::default()
            },
            bus.clone(),
            FlakyLocal::broken(),
            Arc::new(DeadRemote),
        );

        let decision = core
            .make_decision("ANY", &market(150.0, 145.0, 2e6, 1e6))
            .await;
        assert_eq!(decision.source_mode, SoldierMode::Offline);
        assert_eq!(decision.action, TradeAction::Buy);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_probe_counts_as_unhealthy() {
        let bus = test_bus();
        let local = Arc::new(FlakyLocal {
            failing: AtomicBool::new(false),
            reported_latency_ms: 50.0,
            sleep: Duration::from_millis(1),
            reply: "{\"action\":\"hold\",\"confidence\":0.5}".into(),
        });
        let core = SoldierCore::new(
            fast_config(),
            bus.clone(),
            local,
            Arc::new(DeadRemote),
        );

        for _ in 0..3 {
            core.run_health_check().await;
        }
        assert_eq!(core.mode(), SoldierMode::Degraded);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_loop_recovers_automatically() {
        let bus = test_bus();
        let local = FlakyLocal::broken();
        let core = SoldierCore::new(
            fast_config(),
            bus.clone(),
            local.clone(),
            Arc::new(StaticRemote {
                reply: "{\"action\":\"hold\",\"confidence\":0.5}".into(),
            }),
        );
        core.initialize();

        // Three 100ms ticks push the core into DEGRADED.
        tokio::time::sleep(Duration::from_millis(380)).await;
        assert_eq!(core.mode(), SoldierMode::Degraded);

        local.set_failing(false);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(core.mode(), SoldierMode::Normal);

        core.shutdown().await;
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_external_memory_updates_from_events() {
        let bus = test_bus();
        let core = SoldierCore::new(
            SoldierConfig::default(),
            bus.clone(),
            FlakyLocal::healthy("{\"action\":\"hold\",\"confidence\":0.5}"),
            Arc::new(DeadRemote),
        );
        core.initialize();

        core.request_market_data("AAPL");
        core.request_research("sector rotation");

        let mut data = Map::new();
        data.insert("symbol".into(), Value::String("AAPL".into()));
        data.insert("close".into(), serde_json::json!(151.2));
        bus.publish_simple(EventType::MarketDataReceived, "market_feed", data, None, None)
            .unwrap();

        let mut analysis = Map::new();
        analysis.insert("analysis_id".into(), Value::String("an-7".into()));
        analysis.insert("summary".into(), Value::String("bullish".into()));
        bus.publish_simple(EventType::AnalysisCompleted, "commander", analysis, None, None)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let remembered = core.short_term_memory("AAPL").unwrap();
        assert_eq!(remembered["close"], serde_json::json!(151.2));
        let analysis = core.external_analysis("an-7").unwrap();
        assert_eq!(analysis["summary"], Value::String("bullish".into()));

        core.shutdown().await;
        bus.shutdown().await;
    }

    #[test]
    fn test_latency_stats_p99() {
        let mut stats = LatencyStats::default();
        for i in 1..=100 {
            stats.record(i as f64);
        }
        assert!((stats.mean_ms - 50.5).abs() < 1e-9);
        assert!((stats.p99() - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_execution_priority_bounds() {
        assert_eq!(execution_priority(TradeAction::StrongBuy, 0.9), 10);
        assert_eq!(execution_priority(TradeAction::Buy, 0.5), 7);
        assert_eq!(execution_priority(TradeAction::Hold, 0.1), 3);
        for action in [
            TradeAction::StrongBuy,
            TradeAction::Buy,
            TradeAction::Hold,
            TradeAction::Reduce,
            TradeAction::Sell,
        ] {
            for confidence in [0.0, 0.5, 1.0] {
                let priority = execution_priority(action, confidence);
                assert!((1..=10).contains(&priority));
            }
        }
    }
}
