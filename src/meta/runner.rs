//! Dual-architecture runner
//!
//! Runs both risk-control architectures on every tick, selects the decision
//! that actually executes, and feeds realized performance back to the
//! meta-learner (and the learning store) once returns are known.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::learner::MetaLearner;
use super::ArchitectureDecision;
use crate::models::{
    LearningDataPoint, MarketContext, MarketRegime, PerformanceMetrics, Position,
    RiskControlStrategy, RiskLevel,
};
use crate::store::LearningDataStore;

/// Which architecture's decision goes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Always execute architecture A
    Conservative,
    /// Always execute architecture B
    Aggressive,
    /// Higher confidence wins; architecture A on ties
    Balanced,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conservative" => Ok(ExecutionMode::Conservative),
            "aggressive" => Ok(ExecutionMode::Aggressive),
            "balanced" => Ok(ExecutionMode::Balanced),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// What an architecture proposes for one tick
#[derive(Debug, Clone)]
pub struct ArchitectureProposal {
    pub positions: Vec<Position>,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub metadata: Map<String, Value>,
}

/// One of the two competing risk-control implementations
#[async_trait]
pub trait RiskArchitecture: Send + Sync {
    async fn decide(
        &self,
        market_data: &Map<String, Value>,
        portfolio: &Map<String, Value>,
    ) -> anyhow::Result<ArchitectureProposal>;
}

/// Maps a decision plus realized returns to performance metrics
pub trait PerformanceModel: Send + Sync {
    fn evaluate(
        &self,
        decision: &ArchitectureDecision,
        context: &MarketContext,
        actual_returns: &HashMap<String, f64>,
    ) -> PerformanceMetrics;
}

/// Default metrics from realized per-symbol returns
pub struct ReturnsPerformanceModel;

impl PerformanceModel for ReturnsPerformanceModel {
    fn evaluate(
        &self,
        decision: &ArchitectureDecision,
        context: &MarketContext,
        actual_returns: &HashMap<String, f64>,
    ) -> PerformanceMetrics {
        let mut weighted_return = 0.0;
        let mut gross_size = 0.0;
        let mut gains = 0.0;
        let mut losses = 0.0;
        let mut wins = 0usize;
        let mut worst = 0.0f64;

        for position in &decision.positions {
            let ret = actual_returns.get(&position.symbol).copied().unwrap_or(0.0);
            let contribution = position.size * ret;
            weighted_return += contribution;
            gross_size += position.size.abs();
            if contribution > 0.0 {
                gains += contribution;
                wins += 1;
            } else {
                losses += contribution.abs();
            }
            worst = worst.min(ret);
        }

        let normalized_return = if gross_size > 0.0 {
            weighted_return / gross_size
        } else {
            0.0
        };
        let sharpe_ratio = normalized_return / context.volatility.max(0.01);
        let max_drawdown = worst.min(0.0);
        let win_rate = if decision.positions.is_empty() {
            0.5
        } else {
            wins as f64 / decision.positions.len() as f64
        };
        let profit_factor = if losses > 0.0 { gains / losses } else { gains.max(1.0) };

        PerformanceMetrics {
            sharpe_ratio,
            max_drawdown,
            win_rate,
            profit_factor,
            calmar_ratio: sharpe_ratio / max_drawdown.abs().max(0.01),
            sortino_ratio: sharpe_ratio * 1.2,
            decision_latency_ms: decision.latency_ms,
        }
    }
}

/// Outcome of one parallel tick
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub selected_decision: ArchitectureDecision,
    pub architecture_a_decision: ArchitectureDecision,
    pub architecture_b_decision: ArchitectureDecision,
    pub market_context: MarketContext,
    pub execution_mode: ExecutionMode,
    pub execution_result: ExecutionResult,
}

/// Simulated execution echo of the live decision
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub executed_positions: Vec<Position>,
    pub strategy: RiskControlStrategy,
    pub timestamp: String,
}

/// History entry for one executed tick
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub timestamp: String,
    pub market_context: MarketContext,
    pub selected: RiskControlStrategy,
}

#[derive(Default)]
struct RunnerCounters {
    total_runs: u64,
    architecture_a_selected: u64,
    architecture_b_selected: u64,
}

/// Decision records kept in history
const HISTORY_CAP: usize = 10_000;

/// Parallel A/B harness over the two risk-control architectures
pub struct DualArchitectureRunner {
    meta_learner: Arc<MetaLearner>,
    architecture_a: Arc<dyn RiskArchitecture>,
    architecture_b: Arc<dyn RiskArchitecture>,
    execution_mode: ExecutionMode,
    performance_model: Box<dyn PerformanceModel>,
    store: Option<Arc<LearningDataStore>>,
    history: Mutex<VecDeque<RunRecord>>,
    counters: Mutex<RunnerCounters>,
}

impl DualArchitectureRunner {
    pub fn new(
        meta_learner: Arc<MetaLearner>,
        architecture_a: Arc<dyn RiskArchitecture>,
        architecture_b: Arc<dyn RiskArchitecture>,
        execution_mode: ExecutionMode,
    ) -> Self {
        info!(mode = ?execution_mode, "dual-architecture runner ready");
        Self {
            meta_learner,
            architecture_a,
            architecture_b,
            execution_mode,
            performance_model: Box::new(ReturnsPerformanceModel),
            store: None,
            history: Mutex::new(VecDeque::new()),
            counters: Mutex::new(RunnerCounters::default()),
        }
    }

    /// Persist every evaluated comparison to the learning store
    pub fn with_store(mut self, store: Arc<LearningDataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Swap the performance model (tests inject fixed metrics here)
    pub fn with_performance_model(mut self, model: Box<dyn PerformanceModel>) -> Self {
        self.performance_model = model;
        self
    }

    /// Run both architectures on one tick and pick the live decision
    pub async fn run_parallel(
        &self,
        market_data: &Map<String, Value>,
        portfolio: &Map<String, Value>,
    ) -> RunOutcome {
        self.counters.lock().total_runs += 1;

        let market_context = extract_market_context(market_data, portfolio);

        let (decision_a, decision_b) = tokio::join!(
            run_architecture(
                &*self.architecture_a,
                RiskControlStrategy::Hardcoded,
                market_data,
                portfolio,
            ),
            run_architecture(
                &*self.architecture_b,
                RiskControlStrategy::StrategyLayer,
                market_data,
                portfolio,
            ),
        );

        let selected = self.select_decision(&decision_a, &decision_b);
        let execution_result = ExecutionResult {
            success: true,
            executed_positions: selected.positions.clone(),
            strategy: selected.strategy,
            timestamp: Utc::now().to_rfc3339(),
        };

        {
            let mut history = self.history.lock();
            if history.len() >= HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(RunRecord {
                timestamp: execution_result.timestamp.clone(),
                market_context: market_context.clone(),
                selected: selected.strategy,
            });
        }

        debug!(
            selected = %selected.strategy,
            confidence = selected.confidence,
            "parallel tick complete"
        );

        RunOutcome {
            selected_decision: selected,
            architecture_a_decision: decision_a,
            architecture_b_decision: decision_b,
            market_context,
            execution_mode: self.execution_mode,
            execution_result,
        }
    }

    /// Score both decisions against realized returns and feed the learner
    pub fn evaluate_performance(
        &self,
        decision_a: &ArchitectureDecision,
        decision_b: &ArchitectureDecision,
        market_context: &MarketContext,
        actual_returns: &HashMap<String, f64>,
    ) -> (PerformanceMetrics, PerformanceMetrics) {
        let perf_a = self
            .performance_model
            .evaluate(decision_a, market_context, actual_returns);
        let perf_b = self
            .performance_model
            .evaluate(decision_b, market_context, actual_returns);

        let winner = self
            .meta_learner
            .observe_and_learn(market_context, &perf_a, &perf_b);

        if let Some(store) = &self.store {
            let point = LearningDataPoint {
                timestamp: Utc::now().to_rfc3339(),
                market_context: market_context.clone(),
                architecture_a_performance: perf_a.clone(),
                architecture_b_performance: perf_b.clone(),
                winner,
                metadata: None,
            };
            if !store.save_data_point(&point) {
                warn!("learning sample not persisted");
            }
        }

        (perf_a, perf_b)
    }

    fn select_decision(
        &self,
        decision_a: &ArchitectureDecision,
        decision_b: &ArchitectureDecision,
    ) -> ArchitectureDecision {
        let mut counters = self.counters.lock();
        let selected = match self.execution_mode {
            ExecutionMode::Conservative => {
                counters.architecture_a_selected += 1;
                decision_a
            }
            ExecutionMode::Aggressive => {
                counters.architecture_b_selected += 1;
                decision_b
            }
            ExecutionMode::Balanced => {
                if decision_b.confidence > decision_a.confidence {
                    counters.architecture_b_selected += 1;
                    decision_b
                } else {
                    counters.architecture_a_selected += 1;
                    decision_a
                }
            }
        };
        selected.clone()
    }

    pub fn get_statistics(&self) -> RunnerStats {
        let counters = self.counters.lock();
        let total = counters.total_runs;
        let rate = |count: u64| {
            if total > 0 {
                count as f64 / total as f64
            } else {
                0.0
            }
        };
        RunnerStats {
            total_runs: total,
            architecture_a_selected: counters.architecture_a_selected,
            architecture_b_selected: counters.architecture_b_selected,
            architecture_a_selection_rate: rate(counters.architecture_a_selected),
            architecture_b_selection_rate: rate(counters.architecture_b_selected),
            execution_mode: self.execution_mode,
            decision_history_size: self.history.lock().len(),
        }
    }

    pub fn recent_runs(&self, n: usize) -> Vec<RunRecord> {
        let history = self.history.lock();
        history.iter().rev().take(n).cloned().collect()
    }

    pub fn meta_learner(&self) -> &Arc<MetaLearner> {
        &self.meta_learner
    }
}

/// Point-in-time runner statistics
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStats {
    pub total_runs: u64,
    pub architecture_a_selected: u64,
    pub architecture_b_selected: u64,
    pub architecture_a_selection_rate: f64,
    pub architecture_b_selection_rate: f64,
    pub execution_mode: ExecutionMode,
    pub decision_history_size: usize,
}

/// Run one architecture, timing it and absorbing failure into a safe default
async fn run_architecture(
    architecture: &dyn RiskArchitecture,
    strategy: RiskControlStrategy,
    market_data: &Map<String, Value>,
    portfolio: &Map<String, Value>,
) -> ArchitectureDecision {
    let started = Instant::now();
    match architecture.decide(market_data, portfolio).await {
        Ok(proposal) => ArchitectureDecision {
            strategy,
            positions: proposal.positions,
            risk_level: proposal.risk_level,
            confidence: proposal.confidence.clamp(0.0, 1.0),
            latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
            metadata: Some(proposal.metadata),
        },
        Err(err) => {
            warn!(%strategy, error = %err, "architecture failed, substituting safe default");
            let mut metadata = Map::new();
            metadata.insert("error".into(), Value::String(err.to_string()));
            ArchitectureDecision {
                strategy,
                positions: Vec::new(),
                risk_level: RiskLevel::Low,
                confidence: 0.0,
                latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
                metadata: Some(metadata),
            }
        }
    }
}

/// Pull a [`MarketContext`] out of raw market data and portfolio maps
pub fn extract_market_context(
    market_data: &Map<String, Value>,
    portfolio: &Map<String, Value>,
) -> MarketContext {
    let number = |map: &Map<String, Value>, key: &str, default: f64| {
        map.get(key).and_then(Value::as_f64).unwrap_or(default)
    };

    let regime = market_data
        .get("regime")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MarketRegime::Sideways);

    MarketContext {
        volatility: number(market_data, "volatility", 0.2),
        liquidity: number(market_data, "avg_volume", 1_000_000.0),
        trend_strength: number(market_data, "trend_strength", 0.0),
        regime,
        aum: number(portfolio, "total_value", 100_000.0),
        portfolio_concentration: herfindahl(portfolio),
        recent_drawdown: number(portfolio, "recent_drawdown", 0.0),
    }
}

/// Herfindahl index over the portfolio's position values
fn herfindahl(portfolio: &Map<String, Value>) -> f64 {
    let Some(positions) = portfolio.get("positions").and_then(Value::as_object) else {
        return 0.0;
    };
    let values: Vec<f64> = positions
        .values()
        .filter_map(|position| position.get("value").and_then(Value::as_f64))
        .collect();
    let total: f64 = values.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    values.iter().map(|value| (value / total).powi(2)).sum()
}
