//! Tricortex: a low-latency decision-coordination fabric
//!
//! Three decision engines (soldier, commander, scholar) cooperate through a
//! typed event bus. A meta-learner watches two risk-control architectures
//! run side by side, learns which wins under which market conditions, and
//! routes live traffic between them, blending both when confidence is
//! middling. The soldier engine fails over between local, cloud and
//! rule-based serving paths with a TTL decision cache.

pub mod bus;
pub mod coordinator;
pub mod meta;
pub mod models;
pub mod soldier;
pub mod store;

pub use bus::{Event, EventBus, EventPriority, EventType};
pub use coordinator::{BrainCoordinator, CoordinatorConfig, EngineRegistry};
pub use meta::{
    DualArchitectureRunner, HybridBlender, IntelligentRouter, MetaLearner, RouterConfig,
};
pub use models::{BrainDecision, MarketContext, PerformanceMetrics, SoldierDecision};
pub use soldier::{SoldierConfig, SoldierCore, SoldierMode};
pub use store::LearningDataStore;
