//! Intelligent risk-control router
//!
//! Turns a meta-learner prediction into a concrete strategy selection with
//! confidence guardrails: high confidence routes directly, medium confidence
//! blends, low confidence falls back to the conservative hardcoded path.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use super::learner::MetaLearner;
use crate::models::{MarketContext, RiskControlStrategy};

/// Routing decisions kept in history
const HISTORY_CAP: usize = 10_000;

/// Confidence thresholds; must satisfy 0 <= low <= high <= 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_high_threshold")]
    pub high_confidence_threshold: f64,
    #[serde(default = "default_low_threshold")]
    pub low_confidence_threshold: f64,
}

fn default_high_threshold() -> f64 {
    0.80
}

fn default_low_threshold() -> f64 {
    0.60
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: default_high_threshold(),
            low_confidence_threshold: default_low_threshold(),
        }
    }
}

/// One routed selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub selected_strategy: RiskControlStrategy,
    pub confidence: f64,
    pub routing_reason: String,
    pub fallback_used: bool,
    pub timestamp: String,
}

#[derive(Debug, Default)]
struct RouterCounters {
    total_routes: u64,
    hardcoded_selected: u64,
    strategy_layer_selected: u64,
    hybrid_selected: u64,
    fallback_used: u64,
    high_confidence_routes: u64,
    medium_confidence_routes: u64,
    low_confidence_routes: u64,
}

/// Confidence-banded strategy router
pub struct IntelligentRouter {
    meta_learner: Arc<MetaLearner>,
    config: RouterConfig,
    history: Mutex<VecDeque<RoutingDecision>>,
    counters: Mutex<RouterCounters>,
}

impl IntelligentRouter {
    /// Build a router; rejects inverted or out-of-range thresholds
    pub fn new(meta_learner: Arc<MetaLearner>, config: RouterConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&config.low_confidence_threshold)
                && (0.0..=1.0).contains(&config.high_confidence_threshold)
                && config.low_confidence_threshold <= config.high_confidence_threshold,
            "thresholds must satisfy 0 <= low ({}) <= high ({}) <= 1",
            config.low_confidence_threshold,
            config.high_confidence_threshold
        );
        info!(
            high = config.high_confidence_threshold,
            low = config.low_confidence_threshold,
            "intelligent router ready"
        );
        Ok(Self {
            meta_learner,
            config,
            history: Mutex::new(VecDeque::new()),
            counters: Mutex::new(RouterCounters::default()),
        })
    }

    /// Select a strategy for the given context
    pub fn route_decision(&self, context: &MarketContext) -> RoutingDecision {
        let (predicted, confidence) = self.meta_learner.predict_best_strategy(context);

        let mut counters = self.counters.lock();
        counters.total_routes += 1;

        let (selected_strategy, routing_reason, fallback_used) =
            if confidence >= self.config.high_confidence_threshold {
                counters.high_confidence_routes += 1;
                (
                    predicted,
                    format!("high-confidence direct ({confidence:.2}) to {predicted}"),
                    false,
                )
            } else if confidence >= self.config.low_confidence_threshold {
                counters.medium_confidence_routes += 1;
                (
                    RiskControlStrategy::Hybrid,
                    format!("medium-confidence hybrid ({confidence:.2})"),
                    false,
                )
            } else {
                counters.low_confidence_routes += 1;
                counters.fallback_used += 1;
                (
                    RiskControlStrategy::Hardcoded,
                    format!("low-confidence conservative fallback ({confidence:.2})"),
                    true,
                )
            };

        match selected_strategy {
            RiskControlStrategy::Hardcoded => counters.hardcoded_selected += 1,
            RiskControlStrategy::StrategyLayer => counters.strategy_layer_selected += 1,
            RiskControlStrategy::Hybrid => counters.hybrid_selected += 1,
            RiskControlStrategy::Evolved => {}
        }
        drop(counters);

        let decision = RoutingDecision {
            selected_strategy,
            confidence,
            routing_reason,
            fallback_used,
            timestamp: Utc::now().to_rfc3339(),
        };

        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(decision.clone());
        drop(history);

        debug!(
            strategy = %decision.selected_strategy,
            confidence,
            fallback = fallback_used,
            "routing decision made"
        );
        decision
    }

    pub fn recent_decisions(&self, n: usize) -> Vec<RoutingDecision> {
        let history = self.history.lock();
        history.iter().rev().take(n).cloned().collect()
    }

    pub fn get_statistics(&self) -> RouterStats {
        let counters = self.counters.lock();
        let total = counters.total_routes;
        let rate = |count: u64| {
            if total > 0 {
                count as f64 / total as f64
            } else {
                0.0
            }
        };

        RouterStats {
            total_routes: total,
            hardcoded_selected: counters.hardcoded_selected,
            strategy_layer_selected: counters.strategy_layer_selected,
            hybrid_selected: counters.hybrid_selected,
            hardcoded_rate: rate(counters.hardcoded_selected),
            strategy_layer_rate: rate(counters.strategy_layer_selected),
            hybrid_rate: rate(counters.hybrid_selected),
            high_confidence_routes: counters.high_confidence_routes,
            medium_confidence_routes: counters.medium_confidence_routes,
            low_confidence_routes: counters.low_confidence_routes,
            high_confidence_rate: rate(counters.high_confidence_routes),
            medium_confidence_rate: rate(counters.medium_confidence_routes),
            low_confidence_rate: rate(counters.low_confidence_routes),
            fallback_used: counters.fallback_used,
            fallback_rate: rate(counters.fallback_used),
            high_confidence_threshold: self.config.high_confidence_threshold,
            low_confidence_threshold: self.config.low_confidence_threshold,
            routing_history_size: self.history.lock().len(),
        }
    }
}

/// Point-in-time router statistics
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub total_routes: u64,
    pub hardcoded_selected: u64,
    pub strategy_layer_selected: u64,
    pub hybrid_selected: u64,
    pub hardcoded_rate: f64,
    pub strategy_layer_rate: f64,
    pub hybrid_rate: f64,
    pub high_confidence_routes: u64,
    pub medium_confidence_routes: u64,
    pub low_confidence_routes: u64,
    pub high_confidence_rate: f64,
    pub medium_confidence_rate: f64,
    pub low_confidence_rate: f64,
    pub fallback_used: u64,
    pub fallback_rate: f64,
    pub high_confidence_threshold: f64,
    pub low_confidence_threshold: f64,
    pub routing_history_size: usize,
}
