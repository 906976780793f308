//! Engine adapter traits and the service registry
//!
//! The three decision engines live behind typed async interfaces. Concrete
//! implementations (local inference, remote analysis services) are wired in
//! at assembly time; the coordinator only ever sees these traits. Engines
//! surface structural problems as `Err`, which the coordinator converts into
//! fallback decisions.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::models::{RiskLevel, TradeAction};

/// Tactical reply from the soldier engine
#[derive(Debug, Clone)]
pub struct SoldierReply {
    pub action: TradeAction,
    pub confidence: f64,
    pub reasoning: String,
    pub signal_strength: f64,
    pub risk_level: RiskLevel,
    pub metadata: Map<String, Value>,
}

/// Strategic reply from the commander engine
#[derive(Debug, Clone)]
pub struct CommanderReply {
    pub recommendation: TradeAction,
    pub confidence: f64,
    pub analysis: String,
}

/// Research reply from the scholar engine
#[derive(Debug, Clone)]
pub struct ScholarReply {
    pub recommendation: TradeAction,
    pub confidence: f64,
    pub research_summary: String,
}

#[async_trait]
pub trait SoldierEngine: Send + Sync {
    async fn decide(&self, context: &Map<String, Value>) -> anyhow::Result<SoldierReply>;
}

#[async_trait]
pub trait CommanderEngine: Send + Sync {
    async fn analyze(&self, context: &Map<String, Value>) -> anyhow::Result<CommanderReply>;
}

#[async_trait]
pub trait ScholarEngine: Send + Sync {
    async fn research(&self, context: &Map<String, Value>) -> anyhow::Result<ScholarReply>;
}

/// Process-wide registry the coordinator resolves engines from
///
/// Registration happens during assembly; resolution happens at coordinator
/// initialization. Missing engines are tolerated (requests to them fall back)
/// so partial deployments keep serving.
#[derive(Default)]
pub struct EngineRegistry {
    soldier: RwLock<Option<Arc<dyn SoldierEngine>>>,
    commander: RwLock<Option<Arc<dyn CommanderEngine>>>,
    scholar: RwLock<Option<Arc<dyn ScholarEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_soldier(&self, engine: Arc<dyn SoldierEngine>) {
        *self.soldier.write() = Some(engine);
    }

    pub fn register_commander(&self, engine: Arc<dyn CommanderEngine>) {
        *self.commander.write() = Some(engine);
    }

    pub fn register_scholar(&self, engine: Arc<dyn ScholarEngine>) {
        *self.scholar.write() = Some(engine);
    }

    pub fn soldier(&self) -> Option<Arc<dyn SoldierEngine>> {
        self.soldier.read().clone()
    }

    pub fn commander(&self) -> Option<Arc<dyn CommanderEngine>> {
        self.commander.read().clone()
    }

    pub fn scholar(&self) -> Option<Arc<dyn ScholarEngine>> {
        self.scholar.read().clone()
    }

    /// Names of the engines currently registered
    pub fn registered(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.soldier.read().is_some() {
            names.push("soldier");
        }
        if self.commander.read().is_some() {
            names.push("commander");
        }
        if self.scholar.read().is_some() {
            names.push("scholar");
        }
        names
    }
}
