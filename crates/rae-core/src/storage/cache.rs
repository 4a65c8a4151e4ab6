//! Tenant-namespaced cache
//!
//! LRU with per-entry TTL. The key space is namespaced by tenant; a
//! cross-tenant key collision is a correctness bug, so keys can only be built
//! through [`CacheKey::new`], which requires the tenant up front.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::tenant::TenantId;

// ============================================================================
// CACHE KEY
// ============================================================================

/// A cache key scoped to a tenant. Renders as `tenant:<t>:kind:<k>:hash:<h>`.
///
/// The private field means a key cannot be assembled from a raw string;
/// every cache operation is tenant-isolated by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    rendered: String,
}

impl CacheKey {
    /// Build a key for `(tenant, kind, hash)`.
    pub fn new(tenant: &TenantId, kind: &str, hash: &str) -> Self {
        Self {
            rendered: format!("tenant:{}:kind:{}:hash:{}", tenant.as_str(), kind, hash),
        }
    }

    /// Prefix covering every key of one kind for one tenant.
    pub fn prefix(tenant: &TenantId, kind: &str) -> String {
        format!("tenant:{}:kind:{}:", tenant.as_str(), kind)
    }

    /// Prefix covering every key of one tenant.
    pub fn tenant_prefix(tenant: &TenantId) -> String {
        format!("tenant:{}:", tenant.as_str())
    }

    /// The rendered key string.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

// ============================================================================
// CACHE TRAIT
// ============================================================================

/// Byte-level cache used for deduplicated LLM responses, hot query contexts,
/// and embedding computations.
pub trait Cache: Send + Sync {
    /// Fetch a live (non-expired) entry.
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>>;

    /// Insert with a TTL.
    fn set_with_ttl(&self, key: CacheKey, value: Vec<u8>, ttl: Duration);

    /// Drop every entry whose rendered key starts with `prefix`.
    fn invalidate_prefix(&self, prefix: &str);
}

// ============================================================================
// LRU IMPLEMENTATION
// ============================================================================

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-wide LRU cache with TTL, shared by all tenants but isolated
/// through the key space.
pub struct TenantCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl TenantCache {
    /// Cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for TenantCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl Cache for TenantCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get(key.as_str()) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key.as_str());
                None
            }
            None => None,
        }
    }

    fn set_with_ttl(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache lock");
        entries.put(
            key.as_str().to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().expect("cache lock");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            entries.pop(&key);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_tenant_namespaced() {
        let t1 = TenantId::from("t1");
        let t2 = TenantId::from("t2");
        let k1 = CacheKey::new(&t1, "embed", "abc");
        let k2 = CacheKey::new(&t2, "embed", "abc");
        assert_ne!(k1, k2);
        assert!(k1.as_str().starts_with("tenant:t1:"));
    }

    #[test]
    fn get_respects_ttl() {
        let cache = TenantCache::new(8);
        let key = CacheKey::new(&TenantId::from("t1"), "embed", "abc");
        cache.set_with_ttl(key.clone(), b"v".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get(&key), Some(b"v".to_vec()));

        cache.set_with_ttl(key.clone(), b"v".to_vec(), Duration::from_millis(0));
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn prefix_invalidation_is_scoped() {
        let cache = TenantCache::new(8);
        let t1 = TenantId::from("t1");
        let t2 = TenantId::from("t2");
        let k1 = CacheKey::new(&t1, "embed", "a");
        let k2 = CacheKey::new(&t2, "embed", "a");
        cache.set_with_ttl(k1.clone(), b"1".to_vec(), Duration::from_secs(60));
        cache.set_with_ttl(k2.clone(), b"2".to_vec(), Duration::from_secs(60));

        cache.invalidate_prefix(&CacheKey::tenant_prefix(&t1));
        assert_eq!(cache.get(&k1), None);
        assert_eq!(cache.get(&k2), Some(b"2".to_vec()));
    }
}
