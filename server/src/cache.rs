use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Short-lived JSON response cache keyed by request path and query.
pub struct ResponseCache {
	ttl: Duration,
	max_entries: usize,
	entries: StdMutex<HashMap<String, (Instant, Value)>>,
}

impl ResponseCache {
	pub fn new(ttl: Duration, max_entries: usize) -> Self {
		Self { ttl, max_entries, entries: StdMutex::new(HashMap::new()) }
	}

	pub fn get(&self, key: &str) -> Option<Value> {
		let guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
		guard.get(key).filter(|(at, _)| at.elapsed() <= self.ttl).map(|(_, v)| v.clone())
	}

	pub fn put(&self, key: impl Into<String>, value: Value) {
		let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
		guard.insert(key.into(), (Instant::now(), value));
	}

	/// Drop every entry whose key starts with `prefix`; `None` clears all.
	pub fn invalidate(&self, prefix: Option<&str>) {
		let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
		match prefix {
			Some(p) => guard.retain(|k, _| !k.starts_with(p)),
			None => guard.clear(),
		}
	}

	/// Expire stale entries, then evict oldest-first down to the size cap.
	pub fn prune(&self) -> usize {
		let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
		let before = guard.len();
		guard.retain(|_, (at, _)| at.elapsed() <= self.ttl);
		if guard.len() > self.max_entries {
			let mut items: Vec<(String, Instant)> = guard.iter().map(|(k, (at, _))| (k.clone(), *at)).collect();
			items.sort_by_key(|(_, at)| *at);
			let excess = guard.len() - self.max_entries;
			for (k, _) in items.into_iter().take(excess) {
				guard.remove(&k);
			}
		}
		before - guard.len()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn invalidate_by_prefix() {
		let cache = ResponseCache::new(Duration::from_secs(30), 10);
		cache.put("/api/route?from=a&to=b", json!(["a", "b"]));
		cache.put("/health/sync", json!({}));
		cache.invalidate(Some("/api/route"));
		assert!(cache.get("/api/route?from=a&to=b").is_none());
		assert_eq!(cache.get("/health/sync"), Some(json!({})));
		cache.invalidate(None);
		assert_eq!(cache.len(), 0);
	}

	#[test]
	fn prune_expires_and_caps() {
		let cache = ResponseCache::new(Duration::from_millis(0), 10);
		cache.put("a", json!(1));
		std::thread::sleep(Duration::from_millis(5));
		assert!(cache.get("a").is_none());
		assert_eq!(cache.prune(), 1);

		let cache = ResponseCache::new(Duration::from_secs(60), 2);
		for k in ["x", "y", "z"] {
			cache.put(k, json!(k));
			std::thread::sleep(Duration::from_millis(2));
		}
		assert_eq!(cache.prune(), 1);
		assert!(cache.get("x").is_none());
		assert!(cache.get("z").is_some());
	}
}
