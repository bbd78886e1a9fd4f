//! In-memory cache of enrolled face embeddings.
//!
//! Persistence stays authoritative: the cache only ever holds a subset of
//! persisted identities that carry a usable embedding. Reads go through
//! [`IdentityCache::snapshot`], which hands out an immutable `Arc` so a
//! concurrent insert or reload can never be observed half-applied.

use crate::persistence::IdentitySource;
use crate::types::{Embedding, EmbeddingError, IdentityId};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Point-in-time view of the cache, ordered by [`IdentityId`].
pub type Snapshot = Arc<BTreeMap<IdentityId, Embedding>>;

pub struct IdentityCache {
    /// Expected embedding length; `None` accepts any length.
    dimension: Option<usize>,
    entries: RwLock<Snapshot>,
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityCache {
    /// Cache that accepts embeddings of any length.
    pub fn new() -> Self {
        Self {
            dimension: None,
            entries: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    /// Cache that rejects embeddings whose length differs from `dimension`.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            ..Self::new()
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Replace the whole cache with the source's active identities.
    ///
    /// Records with no embedding, the wrong dimension or a zero-norm
    /// embedding are skipped. Returns the number of cached entries.
    pub async fn load<S: IdentitySource>(&self, source: &S) -> Result<usize, S::Error> {
        let records = source.load_active_identities().await?;
        let total = records.len();

        let mut fresh = BTreeMap::new();
        for record in records {
            let Some(embedding) = record.embedding else {
                tracing::debug!(id = %record.id, "identity has no embedding; not cached");
                continue;
            };
            match self.prepare(embedding) {
                Ok(normalized) => {
                    fresh.insert(record.id, normalized);
                }
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "skipping unusable embedding");
                }
            }
        }

        let count = fresh.len();
        self.replace(fresh);
        tracing::info!(loaded = count, records = total, "identity cache loaded");
        Ok(count)
    }

    /// Add or overwrite a single entry, e.g. right after enrollment.
    pub fn insert(&self, id: IdentityId, embedding: Embedding) -> Result<(), EmbeddingError> {
        let normalized = self.prepare(embedding)?;
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut next = BTreeMap::clone(&guard);
        next.insert(id, normalized);
        *guard = Arc::new(next);
        tracing::debug!(id = %id, entries = guard.len(), "identity cached");
        Ok(())
    }

    /// Drop one entry. Returns whether it was present.
    pub fn remove(&self, id: IdentityId) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(&id) {
            return false;
        }
        let mut next = BTreeMap::clone(&guard);
        next.remove(&id);
        *guard = Arc::new(next);
        true
    }

    /// Clear the cache and reload it from `source`.
    ///
    /// The cache stays empty if the reload fails; an empty cache only ever
    /// produces `Empty` matches.
    pub async fn invalidate<S: IdentitySource>(&self, source: &S) -> Result<usize, S::Error> {
        self.replace(BTreeMap::new());
        tracing::info!("identity cache invalidated");
        self.load(source).await
    }

    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.entries.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn replace(&self, entries: BTreeMap<IdentityId, Embedding>) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(entries);
    }

    fn prepare(&self, embedding: Embedding) -> Result<Embedding, EmbeddingError> {
        if let Some(expected) = self.dimension {
            if embedding.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
        }
        embedding.normalize()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::IdentityRecord;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("source offline")]
    pub struct Offline;

    /// In-memory identity source for tests.
    #[derive(Default)]
    pub struct MemorySource {
        pub records: Mutex<Vec<IdentityRecord>>,
        pub offline: Mutex<bool>,
    }

    impl MemorySource {
        pub fn with(records: Vec<IdentityRecord>) -> Self {
            Self {
                records: Mutex::new(records),
                offline: Mutex::new(false),
            }
        }
    }

    impl IdentitySource for MemorySource {
        type Error = Offline;

        async fn load_active_identities(&self) -> Result<Vec<IdentityRecord>, Offline> {
            if *self.offline.lock().unwrap() {
                return Err(Offline);
            }
            Ok(self.records.lock().unwrap().clone())
        }
    }

    pub fn record(id: i64, name: &str, values: Option<&[f32]>) -> IdentityRecord {
        IdentityRecord {
            id: IdentityId(id),
            display_name: name.into(),
            embedding: values.map(|v| Embedding::new(v.to_vec())),
            enrolled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_load_skips_missing_and_degenerate() {
        let source = MemorySource::with(vec![
            record(1, "anna", Some(&[1.0, 0.0])),
            record(2, "boris", None),
            record(3, "clara", Some(&[0.0, 0.0])),
            record(4, "dmitri", Some(&[0.0, 2.0])),
        ]);
        let cache = IdentityCache::new();
        assert_eq!(cache.load(&source).await.unwrap(), 2);

        let snap = cache.snapshot();
        assert_eq!(snap.keys().copied().collect::<Vec<_>>(), vec![IdentityId(1), IdentityId(4)]);
        assert!(snap[&IdentityId(4)].is_normalized(1e-6));
    }

    #[tokio::test]
    async fn test_load_is_full_replace() {
        let source = MemorySource::with(vec![record(1, "anna", Some(&[1.0, 0.0]))]);
        let cache = IdentityCache::new();
        cache.load(&source).await.unwrap();
        cache.insert(IdentityId(9), Embedding::new(vec![0.0, 1.0])).unwrap();
        assert_eq!(cache.len(), 2);

        *source.records.lock().unwrap() = vec![record(2, "boris", Some(&[0.5, 0.5]))];
        cache.load(&source).await.unwrap();
        cache.load(&source).await.unwrap();

        let keys: Vec<_> = cache.snapshot().keys().copied().collect();
        assert_eq!(keys, vec![IdentityId(2)]);
    }

    #[tokio::test]
    async fn test_load_enforces_dimension() {
        let source = MemorySource::with(vec![
            record(1, "anna", Some(&[1.0, 0.0, 0.0])),
            record(2, "boris", Some(&[1.0, 0.0])),
        ]);
        let cache = IdentityCache::with_dimension(3);
        assert_eq!(cache.load(&source).await.unwrap(), 1);
        assert!(matches!(
            cache.insert(IdentityId(5), Embedding::new(vec![1.0])),
            Err(EmbeddingError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn test_invalidate_reloads() {
        let source = MemorySource::with(vec![record(1, "anna", Some(&[1.0, 0.0]))]);
        let cache = IdentityCache::new();
        cache.insert(IdentityId(7), Embedding::new(vec![0.0, 1.0])).unwrap();

        assert_eq!(cache.invalidate(&source).await.unwrap(), 1);
        assert!(cache.snapshot().contains_key(&IdentityId(1)));
        assert!(!cache.snapshot().contains_key(&IdentityId(7)));
    }

    #[tokio::test]
    async fn test_invalidate_failure_leaves_cache_empty() {
        let source = MemorySource::with(vec![]);
        *source.offline.lock().unwrap() = true;
        let cache = IdentityCache::new();
        cache.insert(IdentityId(7), Embedding::new(vec![0.0, 1.0])).unwrap();

        assert!(cache.invalidate(&source).await.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let cache = IdentityCache::new();
        cache.insert(IdentityId(1), Embedding::new(vec![1.0, 0.0])).unwrap();
        let before = cache.snapshot();

        cache.insert(IdentityId(2), Embedding::new(vec![0.0, 1.0])).unwrap();
        assert!(cache.remove(IdentityId(1)));
        assert!(!cache.remove(IdentityId(1)));

        assert_eq!(before.len(), 1);
        assert!(before.contains_key(&IdentityId(1)));
        assert_eq!(cache.len(), 1);
        assert!(cache.snapshot().contains_key(&IdentityId(2)));
    }

    #[test]
    fn test_insert_rejects_degenerate() {
        let cache = IdentityCache::new();
        assert_eq!(
            cache.insert(IdentityId(1), Embedding::new(vec![0.0, 0.0])),
            Err(EmbeddingError::Degenerate)
        );
        assert!(cache.is_empty());
    }
}
