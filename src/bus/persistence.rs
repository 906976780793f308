//! Optional event persistence through an external KV store
//!
//! The store itself is out of process; the bus only needs `HSET` and
//! `EXPIRE`. Failures here are logged and swallowed, publishing never fails
//! because persistence did.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use super::event::Event;

/// Retention for persisted events
pub const EVENT_TTL_SECS: u64 = 86_400;

/// Minimal hash-store surface the bus persists through
#[async_trait]
pub trait EventSink: Send + Sync {
    /// `HSET key field value ...`
    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> anyhow::Result<()>;

    /// `EXPIRE key seconds`
    async fn expire(&self, key: &str, seconds: u64) -> anyhow::Result<()>;
}

/// Write one event under `event:<id>` with a 24-hour expiry
///
/// Returns whether the write fully succeeded; the caller decides what to do
/// with a failure (the bus logs, counts and raises a persistence alert).
pub async fn persist_event(sink: &Arc<dyn EventSink>, event: &Event) -> bool {
    let key = format!("event:{}", event.event_id);
    let mut fields = HashMap::new();
    fields.insert("data".to_string(), event.to_value().to_string());
    fields.insert("created_at".to_string(), event.created_at.to_rfc3339());

    if let Err(err) = sink.hset(&key, fields).await {
        tracing::error!(event_id = %event.event_id, error = %err, "event persistence hset failed");
        return false;
    }
    if let Err(err) = sink.expire(&key, EVENT_TTL_SECS).await {
        tracing::error!(event_id = %event.event_id, error = %err, "event persistence expire failed");
        return false;
    }
    true
}

/// In-memory sink for tests and single-process runs
#[derive(Default)]
pub struct MemorySink {
    entries: parking_lot::Mutex<HashMap<String, StoredEntry>>,
}

#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub fields: HashMap<String, String>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StoredEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| StoredEntry {
            fields: HashMap::new(),
            expires_at: None,
        });
        entry.fields.extend(fields);
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Utc::now() + chrono::Duration::seconds(seconds as i64));
                Ok(())
            }
            None => anyhow::bail!("no such key: {key}"),
        }
    }
}

/// Sink that always fails; exercises the swallow-and-alert path in tests
#[cfg(test)]
pub struct FailingSink;

#[cfg(test)]
#[async_trait]
impl EventSink for FailingSink {
    async fn hset(&self, _key: &str, _fields: HashMap<String, String>) -> anyhow::Result<()> {
        anyhow::bail!("kv store unreachable")
    }

    async fn expire(&self, _key: &str, _seconds: u64) -> anyhow::Result<()> {
        anyhow::bail!("kv store unreachable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::EventType;

    #[tokio::test]
    async fn test_persist_event_writes_key_and_expiry() {
        let sink = Arc::new(MemorySink::new());
        let event = Event::new(EventType::TradeExecuted, "executor");

        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        assert!(persist_event(&dyn_sink, &event).await);

        let entry = sink.get(&format!("event:{}", event.event_id)).unwrap();
        assert!(entry.expires_at.is_some());

        let stored: serde_json::Value = serde_json::from_str(&entry.fields["data"]).unwrap();
        assert_eq!(stored["event_id"], serde_json::json!(event.event_id));
        assert_eq!(stored["event_type"], serde_json::json!("trade_executed"));
    }

    #[tokio::test]
    async fn test_persist_event_reports_failure() {
        let sink: Arc<dyn EventSink> = Arc::new(FailingSink);
        let event = Event::new(EventType::Heartbeat, "test");
        assert!(!persist_event(&sink, &event).await);
    }
}
