//! Loading indexes from disk or from the index cache.

use std::sync::Arc;

use crate::cache::{CacheHandle, IndexCache};
use crate::handle::{IndexHandle, IndexRef};
use crate::meta::{IndexMeta, IndexType};
use crate::params::{resolve_cache_key, FetchParams, IndexReaderOptions};
use crate::persist;
use crate::IndexError;

/// A loaded index plus, when it came through the cache, the lease that pins
/// the cache entry for as long as the index is in use.
#[derive(Debug)]
pub struct LoadedIndex {
    index: IndexRef,
    lease: Option<CacheHandle>,
}

impl LoadedIndex {
    /// Wrap an index that is not tracked by any cache.
    pub fn detached(index: IndexRef) -> Self {
        Self { index, lease: None }
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    pub fn index_ref(&self) -> IndexRef {
        Arc::clone(&self.index)
    }

    pub fn is_cached(&self) -> bool {
        self.lease.is_some()
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.lease.as_ref().map(CacheHandle::key)
    }
}

impl From<CacheHandle> for LoadedIndex {
    fn from(lease: CacheHandle) -> Self {
        Self {
            index: lease.index_ref(),
            lease: Some(lease),
        }
    }
}

pub trait IndexReader: Send {
    /// Load the index stored at `path`. An empty path is only valid when the
    /// index can be served from the cache.
    fn read_index(&mut self, path: &str) -> Result<LoadedIndex, IndexError>;

    fn options(&self) -> &IndexReaderOptions;

    /// Consult `cache` instead of the process-wide cache.
    fn set_index_cache(&mut self, cache: Arc<IndexCache>);
}

/// Reader for the families implemented in this crate.
pub struct NativeIndexReader {
    index_type: IndexType,
    options: IndexReaderOptions,
    cache: Option<Arc<IndexCache>>,
}

impl NativeIndexReader {
    pub fn new(index_type: IndexType, options: IndexReaderOptions) -> Self {
        Self {
            index_type,
            options,
            cache: None,
        }
    }

    pub fn from_meta(meta: &IndexMeta) -> Result<Self, IndexError> {
        let index_type = meta.index_type()?;
        let options = IndexReaderOptions::fetch(meta)?;
        Ok(Self::new(index_type, options))
    }

    fn cache(&self) -> Arc<IndexCache> {
        self.cache.clone().unwrap_or_else(IndexCache::global)
    }

    fn check_family(&self, handle: &IndexHandle) -> Result<(), IndexError> {
        if handle.index_type() != self.index_type {
            return Err(IndexError::IndexTypeMismatch {
                expected: self.index_type,
                actual: handle.index_type(),
            });
        }
        Ok(())
    }
}

impl IndexReader for NativeIndexReader {
    fn read_index(&mut self, path: &str) -> Result<LoadedIndex, IndexError> {
        let use_cache = self.options.cache_index_file || self.options.force_read_and_overwrite_cache;
        let key = resolve_cache_key(&self.options.custom_cache_key, path).map(str::to_string);

        if self.options.cache_index_file && !self.options.force_read_and_overwrite_cache {
            if let Some(key) = key.as_deref() {
                if let Some(lease) = self.cache().lookup(key) {
                    self.check_family(lease.index())?;
                    tracing::debug!(key, "index served from cache");
                    return Ok(lease.into());
                }
                tracing::debug!(key, "index cache miss");
            }
        }

        if path.is_empty() {
            return Err(IndexError::invalid_parameter(
                "path",
                "index is not cached and no path was given",
            ));
        }

        let handle = persist::load_from_path(path)?;
        if handle.index_type() != self.index_type {
            return Err(IndexError::InvalidPersistence(format!(
                "{path} holds a {} index, expected {}",
                handle.index_type(),
                self.index_type
            )));
        }
        let index: IndexRef = Arc::new(handle);

        match key {
            Some(key) if use_cache => {
                let lease = self.cache().insert_and_lease(&key, index);
                tracing::debug!(key = %key, "cached index read from disk");
                Ok(lease.into())
            }
            _ => Ok(LoadedIndex::detached(index)),
        }
    }

    fn options(&self) -> &IndexReaderOptions {
        &self.options
    }

    fn set_index_cache(&mut self, cache: Arc<IndexCache>) {
        self.cache = Some(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheCapacity, IndexCacheConfig};
    use crate::hnsw::HnswIndex;
    use crate::MetricType;

    fn private_cache() -> Arc<IndexCache> {
        Arc::new(IndexCache::new(IndexCacheConfig {
            num_shards: 2,
            capacity: CacheCapacity::Entries(8),
        }))
    }

    fn saved_index(dir: &tempfile::TempDir) -> String {
        let mut index = HnswIndex::new(2, MetricType::L2Distance, false, 8, 20).unwrap();
        index.add(&[1.0, 0.0, 0.0, 1.0], None).unwrap();
        let path = dir.path().join("idx.bin");
        persist::save_to_path(&IndexHandle::hnsw(index), &path).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn plain_read_does_not_touch_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved_index(&dir);
        let cache = private_cache();
        let mut reader = NativeIndexReader::new(IndexType::Hnsw, IndexReaderOptions::default());
        reader.set_index_cache(Arc::clone(&cache));
        let loaded = reader.read_index(&path).unwrap();
        assert!(!loaded.is_cached());
        assert_eq!(loaded.index().len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn cached_read_is_served_from_cache_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved_index(&dir);
        let cache = private_cache();
        let options = IndexReaderOptions {
            cache_index_file: true,
            ..Default::default()
        };
        let mut reader = NativeIndexReader::new(IndexType::Hnsw, options);
        reader.set_index_cache(Arc::clone(&cache));

        let first = reader.read_index(&path).unwrap();
        assert_eq!(first.cache_key(), Some(path.as_str()));
        std::fs::remove_file(&path).unwrap();

        let second = reader.read_index(&path).unwrap();
        assert!(Arc::ptr_eq(&first.index_ref(), &second.index_ref()));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn empty_path_without_cache_hit_fails() {
        let mut reader = NativeIndexReader::new(
            IndexType::Hnsw,
            IndexReaderOptions {
                cache_index_file: true,
                custom_cache_key: "absent".to_string(),
                force_read_and_overwrite_cache: false,
            },
        );
        reader.set_index_cache(private_cache());
        assert!(matches!(
            reader.read_index(""),
            Err(IndexError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn forced_read_replaces_the_cached_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved_index(&dir);
        let cache = private_cache();
        let stale: IndexRef = Arc::new(IndexHandle::external(IndexType::Hnsw, "stale"));
        cache.insert("seg", stale);

        let mut reader = NativeIndexReader::new(
            IndexType::Hnsw,
            IndexReaderOptions {
                cache_index_file: true,
                custom_cache_key: "seg".to_string(),
                force_read_and_overwrite_cache: true,
            },
        );
        reader.set_index_cache(Arc::clone(&cache));
        let loaded = reader.read_index(&path).unwrap();
        assert!(loaded.index().as_hnsw().is_ok());
        let lease = cache.lookup("seg").unwrap();
        assert!(lease.index().as_hnsw().is_ok());
    }

    #[test]
    fn wrong_family_on_disk_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved_index(&dir);
        let mut reader = NativeIndexReader::new(IndexType::IvfPq, IndexReaderOptions::default());
        assert!(matches!(
            reader.read_index(&path),
            Err(IndexError::InvalidPersistence(_))
        ));
    }
}
