//! Risk-control meta-learning stack
//!
//! The pieces that learn which risk-control architecture wins where and
//! route live traffic accordingly: the dual-architecture runner collects
//! comparisons, the meta-learner scores and models them, the router turns
//! predictions into selections, and the hybrid blender merges both
//! architectures when neither should own the book outright.

pub mod dsl;
pub mod hybrid;
pub mod learner;
pub mod model;
pub mod router;
pub mod runner;

pub use dsl::RuleError;
pub use hybrid::{HybridBlender, HybridDecision, HybridRule, RuleAction};
pub use learner::{LearningReport, MetaLearner};
pub use router::{IntelligentRouter, RouterConfig, RoutingDecision};
pub use runner::{
    DualArchitectureRunner, ExecutionMode, PerformanceModel, RiskArchitecture,
    RunOutcome,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{Position, RiskControlStrategy, RiskLevel};

/// Full decision of one risk-control architecture on one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDecision {
    pub strategy: RiskControlStrategy,
    pub positions: Vec<Position>,
    pub risk_level: RiskLevel,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}
