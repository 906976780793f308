//! Event model and wire format
//!
//! Events are the only currency crossing module boundaries. The JSON wire
//! shape is stable (field order follows declaration order) so persisted
//! events diff cleanly and replay across versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Closed set of typed channels
///
/// Numeric codes are never reused; new channels extend the list. The wire
/// value is the snake_case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Decision-layer channels
    DecisionRequest,
    DecisionMade,
    AnalysisCompleted,
    MemoryUpdated,

    // Evolution channels
    FactorDiscovered,
    ArenaTestCompleted,
    StrategyGenerated,
    Z2hCertified,
    Z2hRevoked,
    SecurityAlert,

    // Cross-subsystem evolution alerts
    FactorArenaCompleted,
    StrategyArenaCompleted,
    SimulationCompleted,
    FactorDecayDetected,
    StrategyRetired,

    // Infrastructure channels
    DataUpdated,
    SystemAlert,
    ConfigChanged,

    // Services channels
    MarketDataReceived,
    PortfolioUpdated,
    TradeExecuted,

    // Scheduling channels
    ScheduleTriggered,
    TimerExpired,
    Heartbeat,

    // Cross-engine requests
    ResearchRequest,
    MarketDataRequest,
    StrategyRequest,

    // Audit channels
    AuditCompleted,
    AuditRequest,

    // Query/response channels
    SystemQuery,
    SystemResponse,
    MemoryQuery,
    ScheduleQuery,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        // serde's snake_case rename is the single source of truth; this keeps
        // log lines and handler-id generation allocation-free.
        match self {
            EventType::DecisionRequest => "decision_request",
            EventType::DecisionMade => "decision_made",
            EventType::AnalysisCompleted => "analysis_completed",
            EventType::MemoryUpdated => "memory_updated",
            EventType::FactorDiscovered => "factor_discovered",
            EventType::ArenaTestCompleted => "arena_test_completed",
            EventType::StrategyGenerated => "strategy_generated",
            EventType::Z2hCertified => "z2h_certified",
            EventType::Z2hRevoked => "z2h_revoked",
            EventType::SecurityAlert => "security_alert",
            EventType::FactorArenaCompleted => "factor_arena_completed",
            EventType::StrategyArenaCompleted => "strategy_arena_completed",
            EventType::SimulationCompleted => "simulation_completed",
            EventType::FactorDecayDetected => "factor_decay_detected",
            EventType::StrategyRetired => "strategy_retired",
            EventType::DataUpdated => "data_updated",
            EventType::SystemAlert => "system_alert",
            EventType::ConfigChanged => "config_changed",
            EventType::MarketDataReceived => "market_data_received",
            EventType::PortfolioUpdated => "portfolio_updated",
            EventType::TradeExecuted => "trade_executed",
            EventType::ScheduleTriggered => "schedule_triggered",
            EventType::TimerExpired => "timer_expired",
            EventType::Heartbeat => "heartbeat",
            EventType::ResearchRequest => "research_request",
            EventType::MarketDataRequest => "market_data_request",
            EventType::StrategyRequest => "strategy_request",
            EventType::AuditCompleted => "audit_completed",
            EventType::AuditRequest => "audit_request",
            EventType::SystemQuery => "system_query",
            EventType::SystemResponse => "system_response",
            EventType::MemoryQuery => "memory_query",
            EventType::ScheduleQuery => "schedule_query",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {s}"))
    }
}

/// Queue-selection priority; does not affect retry semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl EventPriority {
    /// Dispatch order, most urgent first
    pub const DESCENDING: [EventPriority; 4] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Normal,
        EventPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "LOW",
            EventPriority::Normal => "NORMAL",
            EventPriority::High => "HIGH",
            EventPriority::Critical => "CRITICAL",
        }
    }

    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(EventPriority::Low),
            2 => Some(EventPriority::Normal),
            3 => Some(EventPriority::High),
            4 => Some(EventPriority::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Wire value is the integer 1..4.
impl Serialize for EventPriority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for EventPriority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        EventPriority::from_wire(code)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid priority code: {code}")))
    }
}

/// A single event as it travels the bus
///
/// Identity is generated at construction and never reassigned. Producers own
/// the payload until `publish` hands it to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub source_module: String,
    /// None broadcasts to every handler of the type
    #[serde(default)]
    pub target_module: Option<String>,
    pub priority: EventPriority,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub processed: bool,
}

fn default_max_retries() -> u32 {
    3
}

impl Event {
    pub fn new(event_type: EventType, source_module: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            source_module: source_module.into(),
            target_module: None,
            priority: EventPriority::Normal,
            data: Map::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            processed: false,
        }
    }

    pub fn with_target(mut self, target_module: impl Into<String>) -> Self {
        self.target_module = Some(target_module.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Insert one payload field
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|deadline| now > deadline).unwrap_or(false)
    }

    /// Stable JSON form used for persistence and replay
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("event serialization is infallible")
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_priority_wire_codes() {
        assert_eq!(EventPriority::Low as u8, 1);
        assert_eq!(EventPriority::Critical as u8, 4);
        assert_eq!(EventPriority::from_wire(3), Some(EventPriority::High));
        assert_eq!(EventPriority::from_wire(0), None);
        assert_eq!(EventPriority::from_wire(5), None);
        assert!(EventPriority::Low < EventPriority::Normal);
        assert!(EventPriority::High < EventPriority::Critical);
    }

    #[test]
    fn test_event_type_strings_match_serde() {
        for event_type in [
            EventType::DecisionRequest,
            EventType::Z2hCertified,
            EventType::FactorDecayDetected,
            EventType::SystemAlert,
            EventType::ScheduleQuery,
        ] {
            let wire = serde_json::to_value(event_type).unwrap();
            assert_eq!(wire, Value::String(event_type.as_str().to_string()));
            let back: EventType = event_type.as_str().parse().unwrap();
            assert_eq!(back, event_type);
        }
        assert!("not_a_channel".parse::<EventType>().is_err());
    }

    #[test]
    fn test_event_round_trip_all_fields() {
        let mut event = Event::new(EventType::DecisionMade, "soldier")
            .with_target("coordinator")
            .with_priority(EventPriority::High)
            .set("action", Value::String("buy".into()))
            .set("confidence", serde_json::json!(0.82));
        event.metadata.insert("trace".into(), Value::String("t-1".into()));
        event.expires_at = Some(event.created_at + Duration::seconds(60));
        event.retry_count = 2;
        event.processed = true;

        let value = event.to_value();
        let back = Event::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_wire_fields() {
        let event = Event::new(EventType::Heartbeat, "chronos");
        let value = event.to_value();
        let obj = value.as_object().unwrap();

        for field in [
            "event_id",
            "event_type",
            "source_module",
            "target_module",
            "priority",
            "data",
            "metadata",
            "created_at",
            "expires_at",
            "retry_count",
            "max_retries",
            "processed",
        ] {
            assert!(obj.contains_key(field), "missing wire field {field}");
        }
        assert_eq!(obj["event_type"], Value::String("heartbeat".into()));
        assert_eq!(obj["priority"], serde_json::json!(2));
        assert_eq!(obj["target_module"], Value::Null);
        assert_eq!(obj["max_retries"], serde_json::json!(3));
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        let mut event = Event::new(EventType::Heartbeat, "test");
        assert!(!event.is_expired(now));

        event.expires_at = Some(now - Duration::seconds(1));
        assert!(event.is_expired(now));

        event.expires_at = Some(now + Duration::seconds(1));
        assert!(!event.is_expired(now));
    }

    #[test]
    fn test_unique_event_ids() {
        let a = Event::new(EventType::Heartbeat, "test");
        let b = Event::new(EventType::Heartbeat, "test");
        assert_ne!(a.event_id, b.event_id);
    }
}
