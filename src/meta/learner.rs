//! Risk-control meta-learner
//!
//! Watches both risk-control architectures run on the same ticks, scores the
//! winner of every comparison, learns a market-context -> winner classifier,
//! and periodically evolves a hybrid rule set from the accumulated wins.

use chrono::Utc;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::Map;
use statrs::statistics::Statistics;
use tracing::{debug, error, info};

use super::hybrid::{HybridRule, RuleAction};
use super::model::LogisticModel;
use crate::bus::{EventBus, EventPriority, EventType};
use crate::models::{
    LearningDataPoint, MarketContext, PerformanceMetrics, RiskControlStrategy, Winner,
};

/// Samples required before the first training pass
const MIN_TRAINING_SAMPLES: usize = 50;
/// Most recent samples used per training pass
const TRAINING_WINDOW: usize = 1_000;
/// Evolve a new hybrid rule set every this many samples
const EVOLUTION_INTERVAL: u64 = 100;
/// A win must beat the other score by this factor, else it is a tie
const WINNER_MARGIN: f64 = 1.05;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LearnerCounters {
    pub total_samples: u64,
    pub hardcoded_wins: u64,
    pub strategy_layer_wins: u64,
    pub hybrid_wins: u64,
    pub evolved_wins: u64,
    pub ties: u64,
    pub model_trained: bool,
    pub model_accuracy: f64,
    pub last_evolution_sample: u64,
}

struct LearnerState {
    experience: Vec<LearningDataPoint>,
    model: Option<LogisticModel>,
    current_best_strategy: RiskControlStrategy,
    current_best_params: Vec<HybridRule>,
    counters: LearnerCounters,
    rng: ChaCha8Rng,
}

/// Meta-learner over dual-architecture comparisons
pub struct MetaLearner {
    state: Mutex<LearnerState>,
    bus: Option<EventBus>,
}

impl Default for MetaLearner {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaLearner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LearnerState {
                experience: Vec::new(),
                model: None,
                current_best_strategy: RiskControlStrategy::Hardcoded,
                current_best_params: Vec::new(),
                counters: LearnerCounters::default(),
                // Fixed seed keeps tie labeling reproducible across runs.
                rng: ChaCha8Rng::seed_from_u64(42),
            }),
            bus: None,
        }
    }

    /// Learner that raises SYSTEM_ALERT events on training failures
    pub fn with_bus(bus: EventBus) -> Self {
        let mut learner = Self::new();
        learner.bus = Some(bus);
        learner
    }

    /// Ingest one comparison, update counters, retrain and maybe evolve
    ///
    /// Training failures leave the previous model in place and never
    /// propagate to the caller. Retraining is serialized by the state lock.
    pub fn observe_and_learn(
        &self,
        market_context: &MarketContext,
        perf_a: &PerformanceMetrics,
        perf_b: &PerformanceMetrics,
    ) -> Winner {
        let winner = determine_winner(perf_a, perf_b);
        let mut state = self.state.lock();

        state.experience.push(LearningDataPoint {
            timestamp: Utc::now().to_rfc3339(),
            market_context: market_context.clone(),
            architecture_a_performance: perf_a.clone(),
            architecture_b_performance: perf_b.clone(),
            winner,
            metadata: None,
        });
        state.counters.total_samples += 1;
        match winner {
            Winner::StrategyA => state.counters.hardcoded_wins += 1,
            Winner::StrategyB => state.counters.strategy_layer_wins += 1,
            Winner::Tie => state.counters.ties += 1,
        }

        self.train(&mut state);

        if state.counters.total_samples % EVOLUTION_INTERVAL == 0 {
            self.evolve(&mut state);
            state.counters.last_evolution_sample = state.counters.total_samples;
        }

        debug!(
            samples = state.counters.total_samples,
            %winner,
            "meta-learner observed comparison"
        );
        winner
    }

    /// Recommend a strategy for a fresh context
    ///
    /// Untrained (or on any prediction problem): (HARDCODED, 0.5). Trained:
    /// the classifier's pick with its max class probability, so confidence
    /// lands in [0.5, 1.0].
    pub fn predict_best_strategy(&self, context: &MarketContext) -> (RiskControlStrategy, f64) {
        let state = self.state.lock();
        let Some(model) = state.model.as_ref() else {
            debug!("model untrained, defaulting to hardcoded");
            return (RiskControlStrategy::Hardcoded, 0.5);
        };

        let features = extract_features(context);
        let proba = model.predict_proba(&features);
        if !proba.iter().all(|p| p.is_finite()) {
            return (RiskControlStrategy::Hardcoded, 0.5);
        }

        let strategy = if proba[1] >= proba[0] {
            RiskControlStrategy::Hardcoded
        } else {
            RiskControlStrategy::StrategyLayer
        };
        (strategy, proba[0].max(proba[1]))
    }

    pub fn current_best_strategy(&self) -> RiskControlStrategy {
        self.state.lock().current_best_strategy
    }

    /// Rule set produced by the most recent evolution pass
    pub fn evolved_rules(&self) -> Vec<HybridRule> {
        self.state.lock().current_best_params.clone()
    }

    pub fn experience_len(&self) -> usize {
        self.state.lock().experience.len()
    }

    pub fn get_statistics(&self) -> LearnerStats {
        let state = self.state.lock();
        LearnerStats {
            counters: state.counters.clone(),
            experience_size: state.experience.len(),
            current_best_strategy: state.current_best_strategy,
            has_best_params: !state.current_best_params.is_empty(),
        }
    }

    /// Full learning report with win rates and next-step recommendations
    pub fn get_learning_report(&self) -> LearningReport {
        let state = self.state.lock();
        let counters = &state.counters;
        let total = counters.total_samples;

        let rate = |count: u64| {
            if total > 0 {
                count as f64 / total as f64
            } else {
                0.0
            }
        };
        let hardcoded_rate = rate(counters.hardcoded_wins);
        let strategy_layer_rate = rate(counters.strategy_layer_wins);

        let mut recommendations = Vec::new();
        recommendations.push(if total < MIN_TRAINING_SAMPLES as u64 {
            Recommendation::new(
                "data_collection",
                "high",
                format!("only {total}/{MIN_TRAINING_SAMPLES} samples, keep collecting"),
            )
        } else if total < TRAINING_WINDOW as u64 {
            Recommendation::new(
                "data_collection",
                "medium",
                format!("{total}/{TRAINING_WINDOW} samples, intelligent switching is viable"),
            )
        } else {
            Recommendation::new(
                "data_collection",
                "low",
                format!("{total} samples, enough for hybrid evolution"),
            )
        });

        recommendations.push(if hardcoded_rate > 0.6 {
            Recommendation::new(
                "strategy_selection",
                "high",
                format!("hardcoded risk control leads with {hardcoded_rate:.1}% wins", hardcoded_rate = hardcoded_rate * 100.0),
            )
        } else if strategy_layer_rate > 0.6 {
            Recommendation::new(
                "strategy_selection",
                "high",
                format!("strategy-layer risk control leads with {rate:.1}% wins", rate = strategy_layer_rate * 100.0),
            )
        } else {
            Recommendation::new(
                "strategy_selection",
                "medium",
                "both architectures perform similarly, favor the hybrid".to_string(),
            )
        });

        recommendations.push(if !counters.model_trained {
            Recommendation::new(
                "model_training",
                "high",
                "model untrained, collect more samples".to_string(),
            )
        } else if counters.model_accuracy < 0.7 {
            Recommendation::new(
                "model_training",
                "medium",
                format!(
                    "model accuracy {:.1}% is low, revisit features",
                    counters.model_accuracy * 100.0
                ),
            )
        } else {
            Recommendation::new(
                "model_training",
                "low",
                format!("model accuracy {:.1}%", counters.model_accuracy * 100.0),
            )
        });

        LearningReport {
            summary: ReportSummary {
                total_samples: total,
                model_trained: counters.model_trained,
                model_accuracy: counters.model_accuracy,
                current_best_strategy: state.current_best_strategy,
                last_evolution_sample: counters.last_evolution_sample,
            },
            win_rates: WinRates {
                hardcoded: hardcoded_rate,
                strategy_layer: strategy_layer_rate,
                hybrid: counters.hybrid_wins as f64 / total.max(1) as f64,
                evolved: counters.evolved_wins as f64 / total.max(1) as f64,
                tie: rate(counters.ties),
            },
            evolution: EvolutionStats {
                hybrid_strategies_created: counters.hybrid_wins,
                evolved_strategies_created: counters.evolved_wins,
                evolution_frequency: EVOLUTION_INTERVAL,
            },
            recommendations,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Train on the most recent window; exception-safe
    fn train(&self, state: &mut LearnerState) {
        if state.experience.len() < MIN_TRAINING_SAMPLES {
            debug!(
                samples = state.experience.len(),
                "not enough samples for training"
            );
            return;
        }

        let window_start = state.experience.len().saturating_sub(TRAINING_WINDOW);
        let mut features = Vec::new();
        let mut labels = Vec::new();
        // Collect tie indices first so the RNG borrow does not overlap the
        // experience borrow.
        let mut rows: Vec<(Vec<f64>, Option<u8>)> = Vec::new();
        for point in &state.experience[window_start..] {
            let label = match point.winner {
                Winner::StrategyA => Some(1),
                Winner::StrategyB => Some(0),
                Winner::Tie => None,
            };
            rows.push((extract_features(&point.market_context), label));
        }
        for (row, label) in rows {
            features.push(row);
            labels.push(label.unwrap_or_else(|| state.rng.gen_range(0..2u8)));
        }

        match LogisticModel::fit(&features, &labels) {
            Ok((model, accuracy)) => {
                state.model = Some(model);
                state.counters.model_trained = true;
                state.counters.model_accuracy = accuracy;
                info!(
                    samples = features.len(),
                    accuracy, "strategy selector retrained"
                );
            }
            Err(err) => {
                error!(error = %err, "model training failed, keeping previous model");
                self.raise_train_alert(&err.to_string());
            }
        }
    }

    /// Derive a hybrid rule set from the winning patterns seen so far
    fn evolve(&self, state: &mut LearnerState) {
        let hardcoded_contexts: Vec<&MarketContext> = state
            .experience
            .iter()
            .filter(|point| point.winner == Winner::StrategyA)
            .map(|point| &point.market_context)
            .collect();

        let mut rules = Vec::new();
        if !hardcoded_contexts.is_empty() {
            let volatilities: Vec<f64> =
                hardcoded_contexts.iter().map(|c| c.volatility).collect();
            let aums: Vec<f64> = hardcoded_contexts.iter().map(|c| c.aum).collect();
            let volatility_threshold = Statistics::mean(volatilities.iter());
            let aum_threshold = Statistics::mean(aums.iter());

            rules.push(HybridRule::new(
                "evolved_high_volatility",
                &format!("volatility > {volatility_threshold:.4}"),
                RuleAction::UseHardcodedOnly,
                1.0,
                "volatile regimes favored the hardcoded path",
            ));
            rules.push(HybridRule::new(
                "evolved_large_aum",
                &format!("aum > {aum_threshold:.2}"),
                RuleAction::UseStrategyLayerOnly,
                1.0,
                "larger books favored the strategy layer",
            ));
        } else {
            rules.push(HybridRule::new(
                "evolved_large_aum",
                "aum > 100000",
                RuleAction::UseStrategyLayerOnly,
                1.0,
                "default book-size split",
            ));
        }
        rules.push(HybridRule::new(
            "evolved_drawdown_guard",
            "recent_drawdown < -0.10",
            RuleAction::UseHardcodedOnly,
            1.0,
            "deep drawdowns always fall back to the hardcoded path",
        ));

        state.current_best_strategy = RiskControlStrategy::Hybrid;
        state.current_best_params = rules;
        state.counters.hybrid_wins += 1;
        info!(
            sample = state.counters.total_samples,
            rules = state.current_best_params.len(),
            "evolved a new hybrid rule set"
        );
    }

    fn raise_train_alert(&self, reason: &str) {
        let Some(bus) = &self.bus else { return };
        let mut data = Map::new();
        data.insert(
            "alert_type".into(),
            serde_json::Value::String("meta_learner_train_error".into()),
        );
        data.insert(
            "reason".into(),
            serde_json::Value::String(reason.to_string()),
        );
        let _ = bus.publish_simple(
            EventType::SystemAlert,
            "meta_learner",
            data,
            None,
            Some(EventPriority::Normal),
        );
    }
}

/// Composite architecture score used by the winner rule
pub fn composite_score(perf: &PerformanceMetrics) -> f64 {
    perf.sharpe_ratio * 0.4
        + (1.0 - perf.max_drawdown.abs()) * 0.3
        + perf.win_rate * 0.2
        + (perf.profit_factor / 3.0).min(1.0) * 0.1
}

/// Winner rule with a 5% margin; anything closer is a tie
pub fn determine_winner(perf_a: &PerformanceMetrics, perf_b: &PerformanceMetrics) -> Winner {
    let score_a = composite_score(perf_a);
    let score_b = composite_score(perf_b);
    if score_a > score_b * WINNER_MARGIN {
        Winner::StrategyA
    } else if score_b > score_a * WINNER_MARGIN {
        Winner::StrategyB
    } else {
        Winner::Tie
    }
}

/// Fixed-order 8-dim feature vector over the market context
pub fn extract_features(context: &MarketContext) -> Vec<f64> {
    vec![
        context.volatility,
        context.liquidity,
        context.trend_strength,
        f64::from(context.regime == crate::models::MarketRegime::Bull),
        f64::from(context.regime == crate::models::MarketRegime::Bear),
        context.aum.max(1.0).ln(),
        context.portfolio_concentration,
        context.recent_drawdown.abs(),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub rec_type: String,
    pub priority: String,
    pub message: String,
}

impl Recommendation {
    fn new(rec_type: &str, priority: &str, message: String) -> Self {
        Self {
            rec_type: rec_type.into(),
            priority: priority.into(),
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total_samples: u64,
    pub model_trained: bool,
    pub model_accuracy: f64,
    pub current_best_strategy: RiskControlStrategy,
    pub last_evolution_sample: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WinRates {
    pub hardcoded: f64,
    pub strategy_layer: f64,
    pub hybrid: f64,
    pub evolved: f64,
    pub tie: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvolutionStats {
    pub hybrid_strategies_created: u64,
    pub evolved_strategies_created: u64,
    pub evolution_frequency: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningReport {
    pub summary: ReportSummary,
    pub win_rates: WinRates,
    pub evolution: EvolutionStats,
    pub recommendations: Vec<Recommendation>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnerStats {
    #[serde(flatten)]
    pub counters: LearnerCounters,
    pub experience_size: usize,
    pub current_best_strategy: RiskControlStrategy,
    pub has_best_params: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::hybrid::HybridBlender;
    use crate::models::MarketRegime;

    fn perf(
        sharpe: f64,
        max_drawdown: f64,
        win_rate: f64,
        profit_factor: f64,
        latency: f64,
    ) -> PerformanceMetrics {
        PerformanceMetrics {
            sharpe_ratio: sharpe,
            max_drawdown,
            win_rate,
            profit_factor,
            calmar_ratio: sharpe / max_drawdown.abs().max(0.01),
            sortino_ratio: sharpe * 1.2,
            decision_latency_ms: latency,
        }
    }

    fn context_with(volatility: f64, regime: MarketRegime) -> MarketContext {
        MarketContext {
            volatility,
            regime,
            ..MarketContext::default()
        }
    }

    /// High-vol contexts let A win, low-vol contexts let B win
    fn feed_separable(learner: &MetaLearner, count: usize) {
        for i in 0..count {
            if i % 2 == 0 {
                learner.observe_and_learn(
                    &context_with(0.6, MarketRegime::Bear),
                    &perf(1.8, -0.10, 0.65, 2.5, 40.0),
                    &perf(0.6, -0.25, 0.45, 1.1, 150.0),
                );
            } else {
                learner.observe_and_learn(
                    &context_with(0.08, MarketRegime::Bull),
                    &perf(0.6, -0.25, 0.45, 1.1, 40.0),
                    &perf(1.8, -0.10, 0.65, 2.5, 150.0),
                );
            }
        }
    }

    #[test]
    fn test_winner_scoring_favors_dominant_a() {
        let learner = MetaLearner::new();
        let winner = learner.observe_and_learn(
            &MarketContext::default(),
            &perf(1.8, -0.10, 0.65, 2.5, 40.0),
            &perf(1.3, -0.15, 0.55, 1.8, 150.0),
        );
        assert_eq!(winner, Winner::StrategyA);

        let stats = learner.get_statistics();
        assert_eq!(stats.counters.hardcoded_wins, 1);
        assert_eq!(stats.experience_size, 1);
    }

    #[test]
    fn test_winner_margin_produces_tie() {
        let a = perf(1.0, -0.10, 0.55, 1.5, 50.0);
        // Slightly better but within the 5% margin.
        let b = perf(1.02, -0.10, 0.55, 1.5, 50.0);
        assert_eq!(determine_winner(&a, &b), Winner::Tie);
        assert_eq!(determine_winner(&b, &a), Winner::Tie);
    }

    #[test]
    fn test_composite_score_formula() {
        let metrics = perf(1.0, -0.2, 0.5, 6.0, 10.0);
        // 1.0*0.4 + 0.8*0.3 + 0.5*0.2 + 1.0*0.1 (profit factor capped)
        assert!((composite_score(&metrics) - 0.84).abs() < 1e-9);
    }

    #[test]
    fn test_feature_vector_order() {
        let context = MarketContext {
            volatility: 0.3,
            liquidity: 2e6,
            trend_strength: -0.4,
            regime: MarketRegime::Bear,
            aum: 1_000.0,
            portfolio_concentration: 0.25,
            recent_drawdown: -0.07,
        };
        let features = extract_features(&context);
        assert_eq!(features.len(), 8);
        assert_eq!(features[0], 0.3);
        assert_eq!(features[3], 0.0, "not bull");
        assert_eq!(features[4], 1.0, "bear");
        assert!((features[5] - 1_000.0f64.ln()).abs() < 1e-9);
        assert!((features[7] - 0.07).abs() < 1e-9);
    }

    #[test]
    fn test_untrained_prediction_is_conservative_default() {
        let learner = MetaLearner::new();
        let (strategy, confidence) = learner.predict_best_strategy(&MarketContext::default());
        assert_eq!(strategy, RiskControlStrategy::Hardcoded);
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn test_training_kicks_in_at_minimum_samples() {
        let learner = MetaLearner::new();
        feed_separable(&learner, 49);
        assert!(!learner.get_statistics().counters.model_trained);

        feed_separable(&learner, 1);
        let stats = learner.get_statistics();
        assert!(stats.counters.model_trained);
        assert!(stats.counters.model_accuracy > 0.7);
    }

    #[test]
    fn test_trained_prediction_confidence_range() {
        let learner = MetaLearner::new();
        feed_separable(&learner, 60);

        let (strategy, confidence) =
            learner.predict_best_strategy(&context_with(0.7, MarketRegime::Bear));
        assert_eq!(strategy, RiskControlStrategy::Hardcoded);
        assert!((0.5..=1.0).contains(&confidence));

        let (strategy, confidence) =
            learner.predict_best_strategy(&context_with(0.05, MarketRegime::Bull));
        assert_eq!(strategy, RiskControlStrategy::StrategyLayer);
        assert!((0.5..=1.0).contains(&confidence));
    }

    #[test]
    fn test_evolution_every_hundred_samples() {
        let learner = MetaLearner::new();
        feed_separable(&learner, 99);
        assert_eq!(learner.current_best_strategy(), RiskControlStrategy::Hardcoded);
        assert_eq!(learner.get_statistics().counters.last_evolution_sample, 0);

        feed_separable(&learner, 1);
        let stats = learner.get_statistics();
        assert_eq!(learner.current_best_strategy(), RiskControlStrategy::Hybrid);
        assert_eq!(stats.counters.last_evolution_sample, 100);
        assert_eq!(stats.counters.hybrid_wins, 1);

        let rules = learner.evolved_rules();
        assert!(rules.iter().any(|r| r.name == "evolved_drawdown_guard"));
        assert!(rules.iter().any(|r| r.name == "evolved_high_volatility"));
        // Evolved conditions must be valid rule DSL.
        assert!(HybridBlender::with_rules(rules).is_ok());
    }

    #[test]
    fn test_evolution_without_hardcoded_wins_uses_default_rule() {
        let learner = MetaLearner::new();
        // B dominates every sample.
        for _ in 0..100 {
            learner.observe_and_learn(
                &MarketContext::default(),
                &perf(0.4, -0.3, 0.4, 1.0, 60.0),
                &perf(2.0, -0.05, 0.7, 2.8, 80.0),
            );
        }
        let rules = learner.evolved_rules();
        assert!(rules
            .iter()
            .any(|r| r.name == "evolved_large_aum" && r.condition == "aum > 100000"));
    }

    #[test]
    fn test_learning_report_recommendations() {
        let learner = MetaLearner::new();
        let report = learner.get_learning_report();
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.rec_type == "data_collection" && r.priority == "high"));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.rec_type == "model_training" && r.priority == "high"));

        feed_separable(&learner, 60);
        let report = learner.get_learning_report();
        assert_eq!(report.summary.total_samples, 60);
        assert!(report.summary.model_trained);
        let data_rec = report
            .recommendations
            .iter()
            .find(|r| r.rec_type == "data_collection")
            .unwrap();
        assert_eq!(data_rec.priority, "medium");
        let win_sum = report.win_rates.hardcoded + report.win_rates.strategy_layer
            + report.win_rates.tie;
        assert!((win_sum - 1.0).abs() < 1e-9);
    }
}
