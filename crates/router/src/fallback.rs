//! Degraded responses for routes whose downstream call failed.

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

/// How a route degrades when its dependency is unavailable.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    /// Serve the last successful response for the same path.
    LastKnown,
    /// Serve a fixed body.
    Static(Value),
}

impl Fallback {
    pub(crate) fn resolve(&self, cache: &ResponseCache, key: &str) -> Option<Value> {
        match self {
            Fallback::LastKnown => cache.get(key),
            Fallback::Static(body) => Some(body.clone()),
        }
    }
}

/// Bounded cache of successful read responses, keyed by request path.
///
/// When full, the entry written longest ago is dropped.
pub struct ResponseCache {
    capacity: usize,
    entries: DashMap<String, (Value, Instant)>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().0.clone())
    }

    pub fn put(&self, key: impl Into<String>, value: Value) {
        if self.capacity == 0 {
            return;
        }
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().1)
                .map(|entry| entry.key().clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (value, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cache_evicts_oldest_entry() {
        let cache = ResponseCache::new(2);
        cache.put("/products/1", json!({ "id": 1 }));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put("/products/2", json!({ "id": 2 }));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put("/products/3", json!({ "id": 3 }));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("/products/1").is_none());
        assert_eq!(cache.get("/products/3"), Some(json!({ "id": 3 })));
    }

    #[test]
    fn test_resolve() {
        let cache = ResponseCache::new(4);
        cache.put("/users/USR-1", json!({ "user_id": "USR-1" }));

        assert_eq!(
            Fallback::LastKnown.resolve(&cache, "/users/USR-1"),
            Some(json!({ "user_id": "USR-1" }))
        );
        assert_eq!(Fallback::LastKnown.resolve(&cache, "/users/USR-2"), None);
        assert_eq!(
            Fallback::Static(json!({ "degraded": true })).resolve(&cache, "/anything"),
            Some(json!({ "degraded": true }))
        );
    }
}
