//! Hybrid blender
//!
//! Combines the decisions of both risk-control architectures into one, with
//! weights derived from declarative rules over the market context. Weights
//! always normalize to w_a + w_b = 1.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::dsl::{self, Expr, RuleError};
use super::ArchitectureDecision;
use crate::models::{MarketContext, Position, RiskLevel};

/// Weight effect a fired rule applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    IncreaseHardcodedWeight,
    IncreaseStrategyLayerWeight,
    UseHardcodedOnly,
    UseStrategyLayerOnly,
}

/// One declarative blending rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridRule {
    pub name: String,
    /// Condition in the rule DSL, e.g. `"volatility > 0.30"`
    pub condition: String,
    pub action: RuleAction,
    /// Weight shift in [0, 1]; ignored by the absolute actions
    pub weight_adjustment: f64,
    pub reason: String,
}

impl HybridRule {
    pub fn new(
        name: &str,
        condition: &str,
        action: RuleAction,
        weight_adjustment: f64,
        reason: &str,
    ) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
            action,
            weight_adjustment,
            reason: reason.into(),
        }
    }
}

/// Blended output decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridDecision {
    pub positions: Vec<Position>,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub architecture_a_weight: f64,
    pub architecture_b_weight: f64,
    pub blending_reason: String,
    pub rules_applied: Vec<String>,
    pub timestamp: String,
}

struct CompiledRule {
    rule: HybridRule,
    expr: Expr,
}

#[derive(Default)]
struct BlenderStatsInner {
    total_decisions: u64,
    rules_triggered: HashMap<String, u64>,
    avg_weight_a: f64,
    avg_weight_b: f64,
}

/// Blended decisions kept in history
const HISTORY_CAP: usize = 10_000;

/// Rule-weighted decision blender
pub struct HybridBlender {
    rules: Vec<CompiledRule>,
    history: Mutex<VecDeque<HybridDecision>>,
    stats: Mutex<BlenderStatsInner>,
}

impl Default for HybridBlender {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridBlender {
    /// Blender with the default rule set
    pub fn new() -> Self {
        Self::with_rules(default_rules()).expect("default rules always parse")
    }

    /// Blender with a caller-supplied rule set
    ///
    /// Every condition is compiled up front; a rule outside the DSL grammar
    /// rejects the whole set.
    pub fn with_rules(rules: Vec<HybridRule>) -> Result<Self, RuleError> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let expr = dsl::parse_condition(&rule.condition)?;
                Ok(CompiledRule { rule, expr })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;

        info!(rules = compiled.len(), "hybrid blender ready");
        Ok(Self {
            rules: compiled,
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(BlenderStatsInner::default()),
        })
    }

    /// Blend two architecture decisions under the current market context
    pub fn decide(
        &self,
        market_context: &MarketContext,
        decision_a: &ArchitectureDecision,
        decision_b: &ArchitectureDecision,
    ) -> HybridDecision {
        let (rules_applied, weight_a, weight_b) = self.evaluate_rules(market_context);

        let positions = blend_positions(
            &decision_a.positions,
            &decision_b.positions,
            weight_a,
            weight_b,
        );
        let risk_level = blend_risk(decision_a.risk_level, decision_b.risk_level, weight_a, weight_b);
        let confidence =
            (decision_a.confidence * weight_a + decision_b.confidence * weight_b).clamp(0.0, 1.0);

        let blending_reason = if rules_applied.is_empty() {
            "default 50/50 weights".to_string()
        } else {
            format!("applied {} rule(s): {}", rules_applied.len(), rules_applied.join(", "))
        };

        let decision = HybridDecision {
            positions,
            risk_level,
            confidence,
            architecture_a_weight: weight_a,
            architecture_b_weight: weight_b,
            blending_reason,
            rules_applied,
            timestamp: Utc::now().to_rfc3339(),
        };

        self.record(&decision);
        debug!(
            weight_a,
            weight_b,
            rules = decision.rules_applied.len(),
            "hybrid decision blended"
        );
        decision
    }

    /// Evaluate the rule set, returning (fired rule names, w_a, w_b)
    fn evaluate_rules(&self, context: &MarketContext) -> (Vec<String>, f64, f64) {
        let mut weight_a = 0.5;
        let mut weight_b = 0.5;
        let mut applied = Vec::new();

        for compiled in &self.rules {
            let fired = match dsl::eval_condition(&compiled.expr, context) {
                Ok(fired) => fired,
                Err(err) => {
                    warn!(
                        rule = %compiled.rule.name,
                        condition = %compiled.rule.condition,
                        error = %err,
                        "rule condition failed to evaluate, treating as not fired"
                    );
                    false
                }
            };
            if !fired {
                continue;
            }

            applied.push(compiled.rule.name.clone());
            let adjustment = compiled.rule.weight_adjustment;
            match compiled.rule.action {
                RuleAction::IncreaseHardcodedWeight => {
                    weight_a += adjustment;
                    weight_b -= adjustment;
                }
                RuleAction::IncreaseStrategyLayerWeight => {
                    weight_b += adjustment;
                    weight_a -= adjustment;
                }
                RuleAction::UseHardcodedOnly => {
                    weight_a = 1.0;
                    weight_b = 0.0;
                }
                RuleAction::UseStrategyLayerOnly => {
                    weight_a = 0.0;
                    weight_b = 1.0;
                }
            }
        }

        let total = weight_a + weight_b;
        if total > 0.0 {
            weight_a /= total;
            weight_b /= total;
        } else {
            weight_a = 0.5;
            weight_b = 0.5;
        }
        weight_a = weight_a.clamp(0.0, 1.0);
        weight_b = weight_b.clamp(0.0, 1.0);
        // Clamping can only have trimmed symmetric overshoot, so the pair
        // still sums to 1 within float error.

        (applied, weight_a, weight_b)
    }

    pub fn recent_decisions(&self, n: usize) -> Vec<HybridDecision> {
        let history = self.history.lock();
        history.iter().rev().take(n).cloned().collect()
    }

    pub fn get_statistics(&self) -> BlenderStats {
        let stats = self.stats.lock();
        BlenderStats {
            total_decisions: stats.total_decisions,
            rules_triggered: stats.rules_triggered.clone(),
            avg_architecture_a_weight: stats.avg_weight_a,
            avg_architecture_b_weight: stats.avg_weight_b,
            total_rules: self.rules.len(),
            decision_history_size: self.history.lock().len(),
        }
    }

    fn record(&self, decision: &HybridDecision) {
        {
            let mut history = self.history.lock();
            if history.len() >= HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(decision.clone());
        }

        let mut stats = self.stats.lock();
        stats.total_decisions += 1;
        for name in &decision.rules_applied {
            *stats.rules_triggered.entry(name.clone()).or_insert(0) += 1;
        }
        let n = stats.total_decisions as f64;
        stats.avg_weight_a =
            (stats.avg_weight_a * (n - 1.0) + decision.architecture_a_weight) / n;
        stats.avg_weight_b =
            (stats.avg_weight_b * (n - 1.0) + decision.architecture_b_weight) / n;
    }
}

/// Point-in-time blender statistics
#[derive(Debug, Clone, Serialize)]
pub struct BlenderStats {
    pub total_decisions: u64,
    pub rules_triggered: HashMap<String, u64>,
    pub avg_architecture_a_weight: f64,
    pub avg_architecture_b_weight: f64,
    pub total_rules: usize,
    pub decision_history_size: usize,
}

/// The stock rule set
pub fn default_rules() -> Vec<HybridRule> {
    vec![
        HybridRule::new(
            "high_volatility_conservative",
            "volatility > 0.30",
            RuleAction::IncreaseHardcodedWeight,
            0.3,
            "increase conservative weight in high vol",
        ),
        HybridRule::new(
            "large_aum_flexible",
            "aum > 1000000",
            RuleAction::IncreaseStrategyLayerWeight,
            0.2,
            "larger books get the flexible layer",
        ),
        HybridRule::new(
            "large_drawdown_conservative",
            "recent_drawdown < -0.10",
            RuleAction::UseHardcodedOnly,
            1.0,
            "deep drawdown locks in the conservative path",
        ),
        HybridRule::new(
            "strong_trend_aggressive",
            "abs(trend_strength) > 0.7",
            RuleAction::IncreaseStrategyLayerWeight,
            0.25,
            "clear trend favors the aggressive layer",
        ),
        HybridRule::new(
            "low_liquidity_conservative",
            "liquidity < 500000",
            RuleAction::IncreaseHardcodedWeight,
            0.2,
            "thin books get the conservative path",
        ),
    ]
}

fn blend_positions(
    positions_a: &[Position],
    positions_b: &[Position],
    weight_a: f64,
    weight_b: f64,
) -> Vec<Position> {
    let mut merged: Vec<Position> = Vec::with_capacity(positions_a.len() + positions_b.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for position in positions_a {
        index.insert(position.symbol.clone(), merged.len());
        merged.push(Position {
            symbol: position.symbol.clone(),
            size: position.size * weight_a,
            source: Some("architecture_a".into()),
        });
    }
    for position in positions_b {
        match index.get(&position.symbol) {
            Some(&slot) => {
                merged[slot].size += position.size * weight_b;
                merged[slot].source = Some("both".into());
            }
            None => {
                index.insert(position.symbol.clone(), merged.len());
                merged.push(Position {
                    symbol: position.symbol.clone(),
                    size: position.size * weight_b,
                    source: Some("architecture_b".into()),
                });
            }
        }
    }
    merged
}

fn blend_risk(risk_a: RiskLevel, risk_b: RiskLevel, weight_a: f64, weight_b: f64) -> RiskLevel {
    RiskLevel::from_score(risk_a.score() * weight_a + risk_b.score() * weight_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketRegime, RiskControlStrategy};

    fn context() -> MarketContext {
        MarketContext {
            volatility: 0.2,
            liquidity: 1_000_000.0,
            trend_strength: 0.3,
            regime: MarketRegime::Sideways,
            aum: 100_000.0,
            portfolio_concentration: 0.3,
            recent_drawdown: -0.05,
        }
    }

    fn arch_decision(
        strategy: RiskControlStrategy,
        positions: Vec<Position>,
        risk_level: RiskLevel,
        confidence: f64,
    ) -> ArchitectureDecision {
        ArchitectureDecision {
            strategy,
            positions,
            risk_level,
            confidence,
            latency_ms: 1.0,
            metadata: None,
        }
    }

    fn plain_decisions() -> (ArchitectureDecision, ArchitectureDecision) {
        (
            arch_decision(
                RiskControlStrategy::Hardcoded,
                vec![Position::new("AAPL", 100.0)],
                RiskLevel::Low,
                0.7,
            ),
            arch_decision(
                RiskControlStrategy::StrategyLayer,
                vec![Position::new("AAPL", 50.0), Position::new("TSLA", 80.0)],
                RiskLevel::High,
                0.9,
            ),
        )
    }

    #[test]
    fn test_no_rules_fire_keeps_even_weights() {
        let blender = HybridBlender::new();
        let (a, b) = plain_decisions();
        let decision = blender.decide(&context(), &a, &b);

        assert!(decision.rules_applied.is_empty());
        assert!((decision.architecture_a_weight - 0.5).abs() < 1e-9);
        assert!((decision.architecture_b_weight - 0.5).abs() < 1e-9);
        assert_eq!(decision.blending_reason, "default 50/50 weights");
    }

    #[test]
    fn test_high_volatility_shifts_to_conservative() {
        let blender = HybridBlender::new();
        let mut ctx = context();
        ctx.volatility = 0.35;
        let (a, b) = plain_decisions();
        let decision = blender.decide(&ctx, &a, &b);

        assert!(decision
            .rules_applied
            .contains(&"high_volatility_conservative".to_string()));
        assert!(decision.architecture_a_weight >= 0.70);
        assert!(decision.architecture_b_weight <= 0.30);
        let sum = decision.architecture_a_weight + decision.architecture_b_weight;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_deep_drawdown_forces_hardcoded_only() {
        let blender = HybridBlender::new();
        let mut ctx = context();
        ctx.recent_drawdown = -0.15;
        let (a, b) = plain_decisions();
        let decision = blender.decide(&ctx, &a, &b);

        assert!(decision
            .rules_applied
            .contains(&"large_drawdown_conservative".to_string()));
        assert!((decision.architecture_a_weight - 1.0).abs() < 1e-9);
        assert!((decision.architecture_b_weight - 0.0).abs() < 1e-9);
        // Positions from B carry zero weight.
        let tsla = decision
            .positions
            .iter()
            .find(|p| p.symbol == "TSLA")
            .unwrap();
        assert!((tsla.size - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_strong_trend_shifts_to_strategy_layer() {
        let blender = HybridBlender::new();
        let mut ctx = context();
        ctx.trend_strength = -0.8;
        let (a, b) = plain_decisions();
        let decision = blender.decide(&ctx, &a, &b);

        assert!(decision
            .rules_applied
            .contains(&"strong_trend_aggressive".to_string()));
        assert!(decision.architecture_b_weight > 0.5);
    }

    #[test]
    fn test_weights_always_normalized() {
        let blender = HybridBlender::new();
        let (a, b) = plain_decisions();
        // Sweep contexts firing every combination of the default rules.
        for volatility in [0.1, 0.35] {
            for aum in [50_000.0, 2_000_000.0] {
                for drawdown in [-0.02, -0.2] {
                    for trend in [0.1, 0.9] {
                        for liquidity in [100_000.0, 1_000_000.0] {
                            let ctx = MarketContext {
                                volatility,
                                liquidity,
                                trend_strength: trend,
                                regime: MarketRegime::Choppy,
                                aum,
                                portfolio_concentration: 0.3,
                                recent_drawdown: drawdown,
                            };
                            let decision = blender.decide(&ctx, &a, &b);
                            let w_a = decision.architecture_a_weight;
                            let w_b = decision.architecture_b_weight;
                            assert!((0.0..=1.0).contains(&w_a), "w_a out of range: {w_a}");
                            assert!((0.0..=1.0).contains(&w_b), "w_b out of range: {w_b}");
                            assert!((w_a + w_b - 1.0).abs() < 1e-9, "weights not normalized");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_position_merging_sources() {
        let blender = HybridBlender::new();
        let (a, b) = plain_decisions();
        let decision = blender.decide(&context(), &a, &b);

        let aapl = decision.positions.iter().find(|p| p.symbol == "AAPL").unwrap();
        assert_eq!(aapl.source.as_deref(), Some("both"));
        assert!((aapl.size - (100.0 * 0.5 + 50.0 * 0.5)).abs() < 1e-9);

        let tsla = decision.positions.iter().find(|p| p.symbol == "TSLA").unwrap();
        assert_eq!(tsla.source.as_deref(), Some("architecture_b"));
        assert!((tsla.size - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_risk_and_confidence_blending() {
        let blender = HybridBlender::new();
        let (a, b) = plain_decisions();
        // Even weights: risk = 1*0.5 + 3*0.5 = 2.0 -> medium
        let decision = blender.decide(&context(), &a, &b);
        assert_eq!(decision.risk_level, RiskLevel::Medium);
        assert!((decision.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_rule_rejected_at_construction() {
        let result = HybridBlender::with_rules(vec![HybridRule::new(
            "bad",
            "volatility ** 2 > 1",
            RuleAction::UseHardcodedOnly,
            1.0,
            "not parseable",
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn test_eval_failure_treated_as_not_fired() {
        // Parses (bare field) but cannot reduce to a boolean.
        let blender = HybridBlender::with_rules(vec![HybridRule::new(
            "degenerate",
            "volatility",
            RuleAction::UseStrategyLayerOnly,
            1.0,
            "never fires",
        )])
        .unwrap();

        let (a, b) = plain_decisions();
        let decision = blender.decide(&context(), &a, &b);
        assert!(decision.rules_applied.is_empty());
        assert!((decision.architecture_a_weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_statistics_accumulate() {
        let blender = HybridBlender::new();
        let (a, b) = plain_decisions();
        let mut ctx = context();
        ctx.volatility = 0.4;

        blender.decide(&ctx, &a, &b);
        blender.decide(&ctx, &a, &b);
        blender.decide(&context(), &a, &b);

        let stats = blender.get_statistics();
        assert_eq!(stats.total_decisions, 3);
        assert_eq!(stats.rules_triggered["high_volatility_conservative"], 2);
        assert_eq!(stats.total_rules, 5);
        assert_eq!(stats.decision_history_size, 3);
        assert_eq!(blender.recent_decisions(2).len(), 2);
        assert!(stats.avg_architecture_a_weight > 0.5);
    }
}
