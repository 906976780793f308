//! Shared domain model for the decision fabric
//!
//! Every subsystem speaks these types: trade actions, risk levels, market
//! context, performance metrics, decisions and learning samples. Keeping them
//! in one place avoids per-module redefinitions drifting apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Trade action recommended by a decision engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    StrongBuy,
    Buy,
    Hold,
    Reduce,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::StrongBuy => "strong_buy",
            TradeAction::Buy => "buy",
            TradeAction::Hold => "hold",
            TradeAction::Reduce => "reduce",
            TradeAction::Sell => "sell",
        }
    }

    /// True for actions that shrink or close exposure
    pub fn is_derisking(&self) -> bool {
        matches!(self, TradeAction::Hold | TradeAction::Reduce | TradeAction::Sell)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strong_buy" => Ok(TradeAction::StrongBuy),
            "buy" => Ok(TradeAction::Buy),
            "hold" => Ok(TradeAction::Hold),
            "reduce" => Ok(TradeAction::Reduce),
            "sell" => Ok(TradeAction::Sell),
            other => Err(format!("unknown trade action: {other}")),
        }
    }
}

/// Coarse risk bucket attached to decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Numeric mapping used when blending risk levels (low=1, medium=2, high=3)
    pub fn score(&self) -> f64 {
        match self {
            RiskLevel::Low => 1.0,
            RiskLevel::Medium => 2.0,
            RiskLevel::High => 3.0,
        }
    }

    /// Inverse of [`score`](Self::score), bucketed at 1.5 and 2.5
    pub fn from_score(score: f64) -> Self {
        if score < 1.5 {
            RiskLevel::Low
        } else if score < 2.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three decision engines the coordinator can route to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrainKind {
    Soldier,
    Commander,
    Scholar,
}

impl BrainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrainKind::Soldier => "soldier",
            BrainKind::Commander => "commander",
            BrainKind::Scholar => "scholar",
        }
    }

    pub const ALL: [BrainKind; 3] = [BrainKind::Soldier, BrainKind::Commander, BrainKind::Scholar];
}

impl fmt::Display for BrainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrainKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soldier" => Ok(BrainKind::Soldier),
            "commander" => Ok(BrainKind::Commander),
            "scholar" => Ok(BrainKind::Scholar),
            other => Err(format!("unknown brain: {other}")),
        }
    }
}

/// Market regime label carried in the market context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Bull,
    Bear,
    Choppy,
    Sideways,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Bull => "bull",
            MarketRegime::Bear => "bear",
            MarketRegime::Choppy => "choppy",
            MarketRegime::Sideways => "sideways",
        }
    }
}

impl FromStr for MarketRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bull" => Ok(MarketRegime::Bull),
            "bear" => Ok(MarketRegime::Bear),
            "choppy" => Ok(MarketRegime::Choppy),
            "sideways" => Ok(MarketRegime::Sideways),
            other => Err(format!("unknown regime: {other}")),
        }
    }
}

/// Fixed-shape description of the market environment
///
/// Consumed by the meta-learner, the router and the hybrid blender.
/// `portfolio_concentration` is a Herfindahl index over position values;
/// `recent_drawdown` is zero or negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    /// Annualized volatility
    pub volatility: f64,
    /// Average traded volume
    pub liquidity: f64,
    /// Trend strength in [-1, 1]; negative is a downtrend
    pub trend_strength: f64,
    pub regime: MarketRegime,
    /// Assets under management
    pub aum: f64,
    /// Herfindahl index in [0, 1]
    pub portfolio_concentration: f64,
    /// Recent drawdown, <= 0
    pub recent_drawdown: f64,
}

impl Default for MarketContext {
    fn default() -> Self {
        Self {
            volatility: 0.2,
            liquidity: 1_000_000.0,
            trend_strength: 0.0,
            regime: MarketRegime::Sideways,
            aum: 100_000.0,
            portfolio_concentration: 0.0,
            recent_drawdown: 0.0,
        }
    }
}

/// Realized performance of one risk-control architecture over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub sharpe_ratio: f64,
    /// Maximum drawdown, <= 0
    pub max_drawdown: f64,
    /// Win rate in [0, 1]
    pub win_rate: f64,
    /// Gross profit over gross loss
    pub profit_factor: f64,
    pub calmar_ratio: f64,
    pub sortino_ratio: f64,
    pub decision_latency_ms: f64,
}

/// Winner label attached to a learning sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Winner {
    #[serde(rename = "strategy_a")]
    StrategyA,
    #[serde(rename = "strategy_b")]
    StrategyB,
    #[serde(rename = "tie")]
    Tie,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::StrategyA => "strategy_a",
            Winner::StrategyB => "strategy_b",
            Winner::Tie => "tie",
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dual-architecture comparison, as persisted to the learning store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningDataPoint {
    /// ISO-8601 timestamp
    pub timestamp: String,
    pub market_context: MarketContext,
    pub architecture_a_performance: PerformanceMetrics,
    pub architecture_b_performance: PerformanceMetrics,
    pub winner: Winner,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Risk-control strategy family selectable by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskControlStrategy {
    /// Architecture A: fixed rules inside the soldier engine
    Hardcoded,
    /// Architecture B: strategy-layer risk management
    StrategyLayer,
    /// Rule-weighted blend of both
    Hybrid,
    /// Reserved for future fully-evolved strategies
    Evolved,
}

impl RiskControlStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskControlStrategy::Hardcoded => "hardcoded",
            RiskControlStrategy::StrategyLayer => "strategy_layer",
            RiskControlStrategy::Hybrid => "hybrid",
            RiskControlStrategy::Evolved => "evolved",
        }
    }
}

impl fmt::Display for RiskControlStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single position proposed or held by an architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    /// Which architecture contributed this position after blending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Position {
    pub fn new(symbol: impl Into<String>, size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            size,
            source: None,
        }
    }
}

/// Decision produced by the coordinator on behalf of one of the engines
///
/// `primary_brain` is usually one of the three engine names, but the
/// coordinator also emits synthetic origins: `coordinator` (empty-input
/// default), `coordinator_fallback` (timeout or engine error) and
/// `coordinator_conflict_resolution` (unresolvable conflict).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainDecision {
    pub decision_id: String,
    pub primary_brain: String,
    pub action: TradeAction,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub supporting_data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl BrainDecision {
    pub fn new(primary_brain: impl Into<String>, action: TradeAction, confidence: f64) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            primary_brain: primary_brain.into(),
            action,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: String::new(),
            supporting_data: Map::new(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Decision emitted by the soldier failover core
///
/// Carries the serving mode and the measured latency alongside the tactical
/// fields the offline policy and the parsers fill in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoldierDecision {
    pub action: TradeAction,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    /// Signal strength in [0, 1]
    pub signal_strength: f64,
    pub risk_level: RiskLevel,
    /// Execution priority in [1, 10]
    pub execution_priority: u8,
    /// Which serving mode produced this decision
    pub source_mode: crate::soldier::SoldierMode,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_action_round_trip() {
        for action in [
            TradeAction::StrongBuy,
            TradeAction::Buy,
            TradeAction::Hold,
            TradeAction::Reduce,
            TradeAction::Sell,
        ] {
            let parsed: TradeAction = action.as_str().parse().unwrap();
            assert_eq!(parsed, action);
        }
        assert!("yolo".parse::<TradeAction>().is_err());
    }

    #[test]
    fn test_risk_level_score_buckets() {
        assert_eq!(RiskLevel::from_score(1.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(1.49), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(1.5), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(2.49), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(2.5), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(3.0), RiskLevel::High);
    }

    #[test]
    fn test_brain_kind_parsing() {
        assert_eq!("soldier".parse::<BrainKind>().unwrap(), BrainKind::Soldier);
        assert_eq!("commander".parse::<BrainKind>().unwrap(), BrainKind::Commander);
        assert_eq!("scholar".parse::<BrainKind>().unwrap(), BrainKind::Scholar);
        assert!("general".parse::<BrainKind>().is_err());
    }

    #[test]
    fn test_winner_wire_values() {
        assert_eq!(serde_json::to_string(&Winner::StrategyA).unwrap(), "\"strategy_a\"");
        assert_eq!(serde_json::to_string(&Winner::Tie).unwrap(), "\"tie\"");
        let back: Winner = serde_json::from_str("\"strategy_b\"").unwrap();
        assert_eq!(back, Winner::StrategyB);
    }

    #[test]
    fn test_learning_data_point_serde() {
        let point = LearningDataPoint {
            timestamp: "2026-07-01T00:00:00+00:00".to_string(),
            market_context: MarketContext::default(),
            architecture_a_performance: PerformanceMetrics {
                sharpe_ratio: 1.5,
                max_drawdown: -0.08,
                win_rate: 0.6,
                profit_factor: 2.0,
                calmar_ratio: 1.8,
                sortino_ratio: 1.9,
                decision_latency_ms: 12.0,
            },
            architecture_b_performance: PerformanceMetrics {
                sharpe_ratio: 1.1,
                max_drawdown: -0.12,
                win_rate: 0.55,
                profit_factor: 1.6,
                calmar_ratio: 1.2,
                sortino_ratio: 1.3,
                decision_latency_ms: 90.0,
            },
            winner: Winner::StrategyA,
            metadata: None,
        };

        let line = serde_json::to_string(&point).unwrap();
        assert!(line.contains("\"architecture_a_performance\""));
        assert!(line.contains("\"winner\":\"strategy_a\""));
        let back: LearningDataPoint = serde_json::from_str(&line).unwrap();
        assert_eq!(back, point);
    }

    #[test]
    fn test_brain_decision_confidence_clamped() {
        let decision = BrainDecision::new("soldier", TradeAction::Buy, 1.7);
        assert_eq!(decision.confidence, 1.0);
        let decision = BrainDecision::new("soldier", TradeAction::Buy, -0.2);
        assert_eq!(decision.confidence, 0.0);
    }
}
