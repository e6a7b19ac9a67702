//! In-memory cache of unwrapped DEKs.
//!
//! Entries are keyed by `(tenant, purpose, slot)` where the slot is either a
//! concrete version or the `Active` pointer. The cache is an explicitly
//! constructed component: share one `Arc<KeyCache>` per process and give tests
//! their own instance.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use {dashmap::DashMap, tracing::debug, zeroize::Zeroizing};

use crate::types::KeyPurpose;

/// Which key of a (tenant, purpose) pair an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySlot {
    Active,
    Version(u32),
}

/// An unwrapped DEK with its identity. Cloning shares the key bytes.
#[derive(Clone)]
pub struct CachedKey {
    pub key_id: String,
    pub version: u32,
    pub material: Arc<Zeroizing<[u8; 32]>>,
}

impl CachedKey {
    pub fn new(key_id: impl Into<String>, version: u32, material: Zeroizing<[u8; 32]>) -> Self {
        Self {
            key_id: key_id.into(),
            version,
            material: Arc::new(material),
        }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.material
    }
}

impl fmt::Debug for CachedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedKey")
            .field("key_id", &self.key_id)
            .field("version", &self.version)
            .field("material", &"[redacted]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: String,
    purpose: KeyPurpose,
    slot: KeySlot,
}

struct CacheEntry {
    key: CachedKey,
    inserted_at: Instant,
}

/// Concurrency-safe DEK cache.
///
/// Each (tenant, purpose) pair carries an active epoch that
/// [`invalidate_active`](Self::invalidate_active) bumps. A caller that read the
/// active key from the store passes the epoch it observed *before* that read
/// to [`put_active`](Self::put_active); if a rotation happened in between, the
/// stale pointer is dropped instead of cached.
pub struct KeyCache {
    entries: DashMap<CacheKey, CacheEntry>,
    epochs: DashMap<(String, KeyPurpose), u64>,
    ttl: Option<Duration>,
}

impl KeyCache {
    /// A cache whose entries never expire.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epochs: DashMap::new(),
            ttl: None,
        }
    }

    /// A cache whose entries expire after `ttl`. A zero TTL means no expiry.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: (!ttl.is_zero()).then_some(ttl),
            ..Self::new()
        }
    }

    fn cache_key(tenant_id: &str, purpose: KeyPurpose, slot: KeySlot) -> CacheKey {
        CacheKey {
            tenant_id: tenant_id.to_string(),
            purpose,
            slot,
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }

    pub fn get(&self, tenant_id: &str, purpose: KeyPurpose, slot: KeySlot) -> Option<CachedKey> {
        let cache_key = Self::cache_key(tenant_id, purpose, slot);
        let hit = match self.entries.get(&cache_key) {
            Some(entry) if !self.is_expired(&entry) => Some(entry.key.clone()),
            Some(entry) => {
                drop(entry);
                self.entries.remove(&cache_key);
                None
            },
            None => None,
        };

        #[cfg(feature = "metrics")]
        {
            use keyward_metrics::{cache, counter, labels};
            let slot_label = if matches!(slot, KeySlot::Active) {
                "active"
            } else {
                "version"
            };
            if hit.is_some() {
                counter!(cache::HITS_TOTAL, labels::SLOT => slot_label).increment(1);
            } else {
                counter!(cache::MISSES_TOTAL, labels::SLOT => slot_label).increment(1);
            }
        }

        debug!(tenant_id, %purpose, ?slot, hit = hit.is_some(), "key cache lookup");
        hit
    }

    /// Cache a key under its concrete version slot.
    pub fn put_version(&self, tenant_id: &str, purpose: KeyPurpose, key: CachedKey) {
        let cache_key = Self::cache_key(tenant_id, purpose, KeySlot::Version(key.version));
        self.entries.insert(cache_key, CacheEntry {
            key,
            inserted_at: Instant::now(),
        });
    }

    /// The pair's current active epoch. Read it before fetching the active
    /// key from the store.
    pub fn active_epoch(&self, tenant_id: &str, purpose: KeyPurpose) -> u64 {
        self.epochs
            .get(&(tenant_id.to_string(), purpose))
            .map(|e| *e)
            .unwrap_or(0)
    }

    /// Cache `key` as the active key if no invalidation happened since
    /// `observed_epoch`. Returns whether the entry was installed.
    pub fn put_active(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        key: CachedKey,
        observed_epoch: u64,
    ) -> bool {
        // The epoch guard stays held while the entry is written so a
        // concurrent invalidation is ordered entirely before or after us.
        let epoch = self
            .epochs
            .entry((tenant_id.to_string(), purpose))
            .or_insert(0);
        if *epoch != observed_epoch {
            debug!(tenant_id, %purpose, "skipping stale active key");
            return false;
        }
        self.put_version(tenant_id, purpose, key.clone());
        self.entries
            .insert(Self::cache_key(tenant_id, purpose, KeySlot::Active), CacheEntry {
                key,
                inserted_at: Instant::now(),
            });
        drop(epoch);
        true
    }

    /// Drop the active pointer for a pair. Must run right after a rotation.
    /// Version slots stay cached: superseded keys remain valid for decrypt.
    pub fn invalidate_active(&self, tenant_id: &str, purpose: KeyPurpose) {
        let mut epoch = self
            .epochs
            .entry((tenant_id.to_string(), purpose))
            .or_insert(0);
        *epoch += 1;
        self.entries
            .remove(&Self::cache_key(tenant_id, purpose, KeySlot::Active));
        drop(epoch);

        #[cfg(feature = "metrics")]
        keyward_metrics::counter!(keyward_metrics::cache::INVALIDATIONS_TOTAL).increment(1);

        debug!(tenant_id, %purpose, "active key invalidated");
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, version: u32, byte: u8) -> CachedKey {
        CachedKey::new(id, version, Zeroizing::new([byte; 32]))
    }

    #[test]
    fn miss_then_hit() {
        let cache = KeyCache::new();
        assert!(cache.get("acme", KeyPurpose::Pii, KeySlot::Active).is_none());

        let epoch = cache.active_epoch("acme", KeyPurpose::Pii);
        assert!(cache.put_active("acme", KeyPurpose::Pii, key("k1", 1, 1), epoch));

        let active = cache.get("acme", KeyPurpose::Pii, KeySlot::Active).unwrap();
        assert_eq!(active.key_id, "k1");
        let by_version = cache
            .get("acme", KeyPurpose::Pii, KeySlot::Version(1))
            .unwrap();
        assert_eq!(by_version.bytes(), &[1; 32]);
    }

    #[test]
    fn entries_are_isolated_by_tenant_and_purpose() {
        let cache = KeyCache::new();
        cache.put_version("acme", KeyPurpose::Pii, key("k1", 1, 1));
        assert!(cache.get("globex", KeyPurpose::Pii, KeySlot::Version(1)).is_none());
        assert!(cache.get("acme", KeyPurpose::Tokens, KeySlot::Version(1)).is_none());
    }

    #[test]
    fn invalidate_active_keeps_versions() {
        let cache = KeyCache::new();
        cache.put_active("acme", KeyPurpose::Pii, key("k1", 1, 1), 0);
        cache.invalidate_active("acme", KeyPurpose::Pii);

        assert!(cache.get("acme", KeyPurpose::Pii, KeySlot::Active).is_none());
        assert!(cache.get("acme", KeyPurpose::Pii, KeySlot::Version(1)).is_some());
    }

    #[test]
    fn stale_active_put_is_rejected() {
        let cache = KeyCache::new();
        let observed = cache.active_epoch("acme", KeyPurpose::Pii);

        // A rotation lands between the store read and the cache write.
        cache.invalidate_active("acme", KeyPurpose::Pii);

        assert!(!cache.put_active("acme", KeyPurpose::Pii, key("old", 1, 1), observed));
        assert!(cache.get("acme", KeyPurpose::Pii, KeySlot::Active).is_none());

        let fresh = cache.active_epoch("acme", KeyPurpose::Pii);
        assert!(cache.put_active("acme", KeyPurpose::Pii, key("new", 2, 2), fresh));
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = KeyCache::with_ttl(Duration::from_millis(10));
        cache.put_version("acme", KeyPurpose::Pii, key("k1", 1, 1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("acme", KeyPurpose::Pii, KeySlot::Version(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let cache = KeyCache::with_ttl(Duration::ZERO);
        cache.put_version("acme", KeyPurpose::Pii, key("k1", 1, 1));
        assert!(cache.get("acme", KeyPurpose::Pii, KeySlot::Version(1)).is_some());
    }

    #[test]
    fn debug_redacts_material() {
        let rendered = format!("{:?}", key("k1", 1, 0xAB));
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(KeyCache::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for v in 0..200u32 {
                        cache.put_version("acme", KeyPurpose::General, key("k", v, t as u8));
                        let _ = cache.get("acme", KeyPurpose::General, KeySlot::Version(v));
                        if v % 50 == 0 {
                            cache.invalidate_active("acme", KeyPurpose::General);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 200);
    }
}
