//! Fingerprint-keyed decision cache with TTL and bounded capacity

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use crate::models::SoldierDecision;

struct CacheEntry {
    decision: SoldierDecision,
    inserted_at: Instant,
}

/// TTL cache over (symbol, market-data) fingerprints
///
/// Entries older than the TTL are unobservable. Capacity is enforced by
/// evicting the oldest insertion, O(1) per insert.
pub struct DecisionCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<u64, CacheEntry>,
    insertion_order: VecDeque<u64>,
}

impl DecisionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Stable fingerprint over the symbol and canonicalized market data
    ///
    /// Key order in the incoming JSON map must not change the fingerprint,
    /// so objects are serialized with sorted keys before hashing.
    pub fn fingerprint(symbol: &str, market_data: &Map<String, Value>) -> u64 {
        let mut canonical = String::new();
        canonicalize(&Value::Object(market_data.clone()), &mut canonical);

        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        canonical.hash(&mut hasher);
        hasher.finish()
    }

    pub fn get(&self, key: u64) -> Option<SoldierDecision> {
        let inner = self.inner.lock();
        inner.entries.get(&key).and_then(|entry| {
            (entry.inserted_at.elapsed() < self.ttl).then(|| entry.decision.clone())
        })
    }

    pub fn insert(&self, key: u64, decision: SoldierDecision) {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&key) {
            inner.insertion_order.push_back(key);
        }
        inner.entries.insert(
            key,
            CacheEntry {
                decision,
                inserted_at: Instant::now(),
            },
        );

        while inner.entries.len() > self.capacity {
            match inner.insertion_order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.insertion_order.clear();
    }
}

/// Append a key-sorted textual form of `value` to `out`
fn canonicalize(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                canonicalize(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
