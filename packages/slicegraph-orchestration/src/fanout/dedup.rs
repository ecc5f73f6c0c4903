use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Entries older than the window are pruned once the cache grows past this
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_key: String,
}

impl DedupKey {
    pub fn new(tenant_id: &str, entity_type: &str, entity_key: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_key: entity_key.to_string(),
        }
    }
}

/// Recently fanned-out upstream keys, per engine instance
#[derive(Default)]
pub struct DeduplicationCache {
    seen: Mutex<HashMap<DedupKey, Instant>>,
}

impl DeduplicationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `key` was recorded within `window`; otherwise records it
    ///
    /// A zero window disables deduplication and records nothing.
    pub fn check_and_record(&self, key: DedupKey, window: Duration) -> bool {
        if window.is_zero() {
            return false;
        }

        let now = Instant::now();
        let mut seen = self.seen.lock();
        if let Some(last) = seen.get(&key) {
            if now.duration_since(*last) < window {
                return true;
            }
        }

        if seen.len() >= PRUNE_THRESHOLD {
            seen.retain(|_, at| now.duration_since(*at) < window);
        }
        seen.insert(key, now);
        false
    }

    /// Drop `key` so the next call within the window is not suppressed
    pub fn forget(&self, key: &DedupKey) {
        self.seen.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> DedupKey {
        DedupKey::new("t1", "BRAND", id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window() {
        let cache = DeduplicationCache::new();
        let window = Duration::from_secs(1);

        assert!(!cache.check_and_record(key("BRAND#t1#BR001"), window));
        assert!(cache.check_and_record(key("BRAND#t1#BR001"), window));
        assert!(!cache.check_and_record(key("BRAND#t1#BR002"), window));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(!cache.check_and_record(key("BRAND#t1#BR001"), window));
    }

    #[tokio::test]
    async fn test_zero_window_disables() {
        let cache = DeduplicationCache::new();
        assert!(!cache.check_and_record(key("BRAND#t1#BR001"), Duration::ZERO));
        assert!(!cache.check_and_record(key("BRAND#t1#BR001"), Duration::ZERO));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_releases_one_key() {
        let cache = DeduplicationCache::new();
        let window = Duration::from_secs(60);
        cache.check_and_record(key("BRAND#t1#BR001"), window);
        cache.check_and_record(key("BRAND#t1#BR002"), window);

        cache.forget(&key("BRAND#t1#BR001"));
        assert!(!cache.check_and_record(key("BRAND#t1#BR001"), window));
        assert!(cache.check_and_record(key("BRAND#t1#BR002"), window));
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = DeduplicationCache::new();
        let window = Duration::from_secs(60);
        cache.check_and_record(key("BRAND#t1#BR001"), window);
        cache.clear();
        assert!(!cache.check_and_record(key("BRAND#t1#BR001"), window));
    }
}
