use dashmap::DashMap;
use image::DynamicImage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::metadata::ComicMetadata;
use crate::archive::ArchiveInfo;

/// Metadata of already imported files, keyed by quick hash.
pub type MetadataCache = AgedCache<ComicMetadata>;

/// Preloaded archive summaries and cover previews, keyed by quick hash.
pub type PreloadCache = AgedCache<PreloadedFile>;

/// What a low-priority preload leaves behind for a later import or reader.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadedFile {
    pub info: ArchiveInfo,
    /// First page scaled to the configured preview edge.
    #[serde(skip)]
    pub cover_preview: Option<Arc<DynamicImage>>,
}

#[derive(Debug, Clone)]
struct Aged<V> {
    sequence: u64,
    value: V,
}

/// Concurrent map bounded by insertion age: once above capacity the oldest
/// quarter of the entries (at least one) is dropped until the bound holds
/// again.
pub struct AgedCache<V> {
    entries: DashMap<String, Aged<V>>,
    sequence: AtomicU64,
    capacity: usize,
    // Serializes pruning so concurrent inserts don't evict twice.
    pruning: Mutex<()>,
}

impl<V: Clone> AgedCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            sequence: AtomicU64::new(0),
            capacity: capacity.max(1),
            pruning: Mutex::new(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace; a replaced entry counts as new for eviction.
    /// Returns true when the cache is now above capacity.
    pub fn insert(&self, key: String, value: V) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, Aged { sequence, value });
        self.is_over_capacity()
    }

    pub fn is_over_capacity(&self) -> bool {
        self.entries.len() > self.capacity
    }

    /// Evict oldest entries until the cache fits. Returns how many went.
    pub fn prune(&self) -> usize {
        let Ok(_guard) = self.pruning.lock() else {
            return 0;
        };

        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let mut by_age: Vec<(u64, String)> = self
                .entries
                .iter()
                .map(|entry| (entry.sequence, entry.key().clone()))
                .collect();
            by_age.sort_unstable();

            let batch = (by_age.len() / 4).max(1);
            for (_, key) in by_age.into_iter().take(batch) {
                if self.entries.remove(&key).is_some() {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            log::debug!(
                "Pruned {} cache entries ({} left)",
                evicted,
                self.entries.len()
            );
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
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

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveFormat, DocumentKind};
    use crate::import::metadata::FileNameInfo;
    use crate::import::ProcessingStrategy;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn sample(title: &str) -> ComicMetadata {
        ComicMetadata {
            title: title.to_string(),
            file_path: PathBuf::from(format!("/library/{title}.cbz")),
            file_name: format!("{title}.cbz"),
            file_size: 1,
            modified_at: None,
            imported_at: Utc::now(),
            quick_hash: title.to_string(),
            kind: DocumentKind::Archive(ArchiveFormat::Zip),
            page_count: 1,
            archive: None,
            cover: None,
            name_info: FileNameInfo::default(),
            custom_fields: BTreeMap::new(),
            analysis: None,
            tags: Vec::new(),
            strategy: ProcessingStrategy::Fast,
            extraction_errors: Vec::new(),
        }
    }

    #[test]
    fn prune_drops_the_oldest_quarter() {
        let cache = MetadataCache::new(8);
        for i in 0..8 {
            assert!(!cache.insert(format!("k{i}"), sample(&format!("t{i}"))));
        }
        assert!(cache.insert("k8".to_string(), sample("t8")));

        // 9 entries, a quarter of that is 2.
        assert_eq!(cache.prune(), 2);
        assert_eq!(cache.len(), 7);
        assert!(!cache.contains("k0"));
        assert!(!cache.contains("k1"));
        assert!(cache.contains("k2"));
        assert!(cache.contains("k8"));
    }

    #[test]
    fn prune_always_evicts_at_least_one() {
        let cache = MetadataCache::new(2);
        cache.insert("a".to_string(), sample("a"));
        cache.insert("b".to_string(), sample("b"));
        cache.insert("c".to_string(), sample("c"));

        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").map(|m| m.title), Some("c".to_string()));
    }

    #[test]
    fn prune_within_capacity_is_a_no_op() {
        let cache = MetadataCache::new(4);
        cache.insert("a".to_string(), sample("a"));
        assert_eq!(cache.prune(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reinsert_refreshes_age() {
        let cache = MetadataCache::new(2);
        cache.insert("a".to_string(), sample("a"));
        cache.insert("b".to_string(), sample("b"));
        cache.insert("a".to_string(), sample("a2"));
        cache.insert("c".to_string(), sample("c"));

        cache.prune();
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").map(|m| m.title), Some("a2".to_string()));
    }
}
