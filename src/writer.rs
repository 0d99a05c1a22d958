//! Publishing built indexes to disk and to the index cache.

use std::sync::Arc;

use crate::cache::IndexCache;
use crate::handle::IndexRef;
use crate::meta::{IndexMeta, IndexType};
use crate::params::{resolve_cache_key, FetchParams, IndexWriterOptions};
use crate::persist;
use crate::IndexError;

/// Persists a built index and optionally publishes it in the cache.
pub trait IndexWriter: Send {
    /// Write `index` to `path`. With `memory_only` nothing touches the disk
    /// and the index is only published in the cache (when enabled).
    fn write_index(&mut self, index: &IndexRef, path: &str, memory_only: bool) -> Result<(), IndexError>;

    fn options(&self) -> &IndexWriterOptions;

    /// Publish into `cache` instead of the process-wide cache.
    fn set_index_cache(&mut self, cache: Arc<IndexCache>);
}

/// Writer for the families implemented in this crate.
pub struct NativeIndexWriter {
    index_type: IndexType,
    options: IndexWriterOptions,
    cache: Option<Arc<IndexCache>>,
}

impl NativeIndexWriter {
    pub fn new(index_type: IndexType, options: IndexWriterOptions) -> Self {
        Self {
            index_type,
            options,
            cache: None,
        }
    }

    pub fn from_meta(meta: &IndexMeta) -> Result<Self, IndexError> {
        let index_type = meta.index_type()?;
        let options = IndexWriterOptions::fetch(meta)?;
        Ok(Self::new(index_type, options))
    }

    fn cache(&self) -> Arc<IndexCache> {
        self.cache.clone().unwrap_or_else(IndexCache::global)
    }
}

impl IndexWriter for NativeIndexWriter {
    fn write_index(&mut self, index: &IndexRef, path: &str, memory_only: bool) -> Result<(), IndexError> {
        if index.index_type() != self.index_type {
            return Err(IndexError::IndexTypeMismatch {
                expected: self.index_type,
                actual: index.index_type(),
            });
        }

        if !memory_only {
            if path.is_empty() {
                return Err(IndexError::invalid_parameter("path", "index path must not be empty"));
            }
            persist::save_to_path(index, path)?;
        }

        if self.options.write_index_cache {
            let Some(key) = resolve_cache_key(&self.options.custom_cache_key, path) else {
                return Err(IndexError::invalid_parameter(
                    "custom_cache_key",
                    "caching an index needs a cache key or a path",
                ));
            };
            self.cache().insert(key, Arc::clone(index));
            tracing::debug!(key, index_type = %self.index_type, "published index to cache");
        } else if memory_only {
            tracing::warn!(
                index_type = %self.index_type,
                "memory-only write with caching disabled, the index is not retained"
            );
        }
        Ok(())
    }

    fn options(&self) -> &IndexWriterOptions {
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
    use crate::handle::IndexHandle;
    use crate::hnsw::HnswIndex;
    use crate::MetricType;

    fn handle() -> IndexRef {
        let mut index = HnswIndex::new(2, MetricType::L2Distance, false, 8, 20).unwrap();
        index.add(&[1.0, 0.0, 0.0, 1.0], None).unwrap();
        Arc::new(IndexHandle::hnsw(index))
    }

    fn private_cache() -> Arc<IndexCache> {
        Arc::new(IndexCache::new(IndexCacheConfig {
            num_shards: 2,
            capacity: CacheCapacity::Entries(8),
        }))
    }

    #[test]
    fn writes_to_disk_and_cache_under_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.idx");
        let path = path.to_str().unwrap();
        let cache = private_cache();
        let mut writer = NativeIndexWriter::new(
            IndexType::Hnsw,
            IndexWriterOptions {
                write_index_cache: true,
                custom_cache_key: String::new(),
            },
        );
        writer.set_index_cache(Arc::clone(&cache));
        writer.write_index(&handle(), path, false).unwrap();
        assert!(std::path::Path::new(path).exists());
        assert!(cache.contains(path));
    }

    #[test]
    fn memory_only_uses_the_custom_key() {
        let cache = private_cache();
        let mut writer = NativeIndexWriter::new(
            IndexType::Hnsw,
            IndexWriterOptions {
                write_index_cache: true,
                custom_cache_key: "segment-1".to_string(),
            },
        );
        writer.set_index_cache(Arc::clone(&cache));
        writer.write_index(&handle(), "", true).unwrap();
        assert!(cache.contains("segment-1"));
    }

    #[test]
    fn family_mismatch_is_rejected() {
        let mut writer = NativeIndexWriter::new(IndexType::IvfPq, IndexWriterOptions::default());
        assert!(matches!(
            writer.write_index(&handle(), "", true),
            Err(IndexError::IndexTypeMismatch { .. })
        ));
    }

    #[test]
    fn disk_write_needs_a_path() {
        let mut writer = NativeIndexWriter::new(IndexType::Hnsw, IndexWriterOptions::default());
        assert!(matches!(
            writer.write_index(&handle(), "", false),
            Err(IndexError::InvalidParameter { .. })
        ));
    }
}
