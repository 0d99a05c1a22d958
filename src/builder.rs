//! Build side of the lifecycle.
//!
//! A builder moves through `Unopened -> Opened -> Closed`. Rows are added
//! while opened; `flush` finalizes the native index and hands it to the
//! configured [`IndexWriter`]. Calls made in the wrong state fail with
//! [`IndexError::InvalidState`] and leave the builder untouched.

use std::sync::Arc;

use crate::cache::IndexCache;
use crate::handle::{IndexHandle, IndexRef};
use crate::hnsw::HnswIndex;
use crate::ivf_pq::IvfPqIndex;
use crate::meta::{IndexMeta, IndexType};
use crate::params::{
    FetchParams, HnswIndexParams, IvfPqIndexParams, VectorIndexCommonParams, VectorIndexExtraParams,
};
use crate::seq_view::{ColumnView, RowBatch};
use crate::writer::{IndexWriter, NativeIndexWriter};
use crate::{IndexError, MetricType, StateError};

const BUILDER: &str = "index builder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unopened,
    Opened,
    Closed,
}

pub trait IndexBuilder: Send {
    /// Open for an in-memory build; `flush` only publishes to the cache.
    fn open(&mut self) -> Result<(), IndexError>;

    /// Open for a build persisted to `path` on every `flush`.
    fn open_path(&mut self, path: &str) -> Result<(), IndexError>;

    /// Add one column of vectors. `row_ids` are required when custom row ids
    /// are enabled and rejected otherwise; rows whose `null_flags` entry is
    /// non-zero are skipped.
    fn add(
        &mut self,
        columns: &[ColumnView<'_>],
        row_ids: Option<&[i64]>,
        null_flags: Option<&[u8]>,
    ) -> Result<(), IndexError>;

    fn flush(&mut self) -> Result<(), IndexError>;

    fn close(&mut self) -> Result<(), IndexError>;

    fn state(&self) -> LifecycleState;

    /// Rows accepted so far, null rows excluded.
    fn rows_added(&self) -> usize;

    /// The index once it has been flushed.
    fn index_ref(&self) -> Option<IndexRef>;

    fn set_index_writer(&mut self, writer: Box<dyn IndexWriter>);

    fn set_index_cache(&mut self, cache: Arc<IndexCache>);

    /// Require caller-supplied row ids on every `add`. Only valid before `open`.
    fn enable_custom_row_id(&mut self) -> Result<(), IndexError>;
}

/// Family-specific part of a builder.
pub trait BuildFamily: Send + Sized {
    const INDEX_TYPE: IndexType;

    fn from_meta(meta: &IndexMeta, common: &VectorIndexCommonParams) -> Result<Self, IndexError>;

    fn create_index(&self, common: &VectorIndexCommonParams) -> Result<IndexHandle, IndexError>;

    fn append(&mut self, index: &mut IndexHandle, rows: &[f32], ids: &[i64]) -> Result<(), IndexError>;

    /// Bring the native index up to date before it is written.
    fn finish(&mut self, index: &mut IndexHandle) -> Result<(), IndexError>;
}

/// Graph family: rows go straight into the index, the graph is built on flush.
pub struct HnswBuild {
    params: HnswIndexParams,
}

impl BuildFamily for HnswBuild {
    const INDEX_TYPE: IndexType = IndexType::Hnsw;

    fn from_meta(meta: &IndexMeta, common: &VectorIndexCommonParams) -> Result<Self, IndexError> {
        common.require_metric(
            Self::INDEX_TYPE.as_str(),
            &[MetricType::L2Distance, MetricType::CosineSimilarity],
        )?;
        Ok(Self {
            params: HnswIndexParams::fetch(meta)?,
        })
    }

    fn create_index(&self, common: &VectorIndexCommonParams) -> Result<IndexHandle, IndexError> {
        let index = HnswIndex::new(
            common.dim,
            common.metric_type,
            common.is_vector_normed,
            self.params.m,
            self.params.ef_construction,
        )?;
        Ok(IndexHandle::hnsw(index))
    }

    fn append(&mut self, index: &mut IndexHandle, rows: &[f32], ids: &[i64]) -> Result<(), IndexError> {
        index.as_hnsw_mut()?.add(rows, Some(ids))
    }

    fn finish(&mut self, index: &mut IndexHandle) -> Result<(), IndexError> {
        index.as_hnsw()?.ensure_graph()
    }
}

/// Inverted-file family: rows are buffered and the index is trained and
/// filled on flush.
pub struct IvfPqBuild {
    params: IvfPqIndexParams,
    pending: Vec<f32>,
    pending_ids: Vec<i64>,
}

impl BuildFamily for IvfPqBuild {
    const INDEX_TYPE: IndexType = IndexType::IvfPq;

    fn from_meta(meta: &IndexMeta, common: &VectorIndexCommonParams) -> Result<Self, IndexError> {
        common.require_metric(Self::INDEX_TYPE.as_str(), &[MetricType::L2Distance])?;
        let params = IvfPqIndexParams::fetch(meta)?;
        params.validate_against(common)?;
        Ok(Self {
            params,
            pending: Vec::new(),
            pending_ids: Vec::new(),
        })
    }

    fn create_index(&self, common: &VectorIndexCommonParams) -> Result<IndexHandle, IndexError> {
        let index = IvfPqIndex::new(
            common.dim,
            self.params.nlist,
            self.params.m,
            self.params.nbits,
            common.metric_type,
        )?;
        Ok(IndexHandle::ivf_pq(index))
    }

    fn append(&mut self, _index: &mut IndexHandle, rows: &[f32], ids: &[i64]) -> Result<(), IndexError> {
        self.pending.extend_from_slice(rows);
        self.pending_ids.extend_from_slice(ids);
        Ok(())
    }

    fn finish(&mut self, index: &mut IndexHandle) -> Result<(), IndexError> {
        if self.pending_ids.is_empty() {
            return Ok(());
        }
        let index = index.as_ivf_pq_mut()?;
        if !index.is_trained() {
            index.train(&self.pending)?;
        }
        index.add(&self.pending, Some(&self.pending_ids))?;
        tracing::debug!(rows = self.pending_ids.len(), total = index.len(), "encoded buffered rows");
        self.pending.clear();
        self.pending_ids.clear();
        Ok(())
    }
}

enum IndexSlot {
    Empty,
    Building(IndexHandle),
    Shared(IndexRef),
}

/// Builder shared by the native families.
pub struct NativeIndexBuilder<F: BuildFamily> {
    family: F,
    common: VectorIndexCommonParams,
    extra: VectorIndexExtraParams,
    state: LifecycleState,
    custom_row_id: bool,
    memory_only: bool,
    path: String,
    rows_added: usize,
    slot: IndexSlot,
    writer: Box<dyn IndexWriter>,
}

pub type HnswIndexBuilder = NativeIndexBuilder<HnswBuild>;
pub type IvfPqIndexBuilder = NativeIndexBuilder<IvfPqBuild>;

impl<F: BuildFamily> NativeIndexBuilder<F> {
    /// Fetch and validate every parameter group. Nothing native is created
    /// until `open`.
    pub fn from_meta(meta: &IndexMeta) -> Result<Self, IndexError> {
        let declared = meta.index_type()?;
        if declared != F::INDEX_TYPE {
            return Err(IndexError::IndexTypeMismatch {
                expected: F::INDEX_TYPE,
                actual: declared,
            });
        }
        let common = VectorIndexCommonParams::fetch(meta)?;
        let extra = VectorIndexExtraParams::fetch(meta)?;
        let family = F::from_meta(meta, &common)?;
        let writer = NativeIndexWriter::from_meta(meta)?;
        Ok(Self {
            family,
            common,
            extra,
            state: LifecycleState::Unopened,
            custom_row_id: false,
            memory_only: true,
            path: String::new(),
            rows_added: 0,
            slot: IndexSlot::Empty,
            writer: Box::new(writer),
        })
    }

    pub fn common_params(&self) -> &VectorIndexCommonParams {
        &self.common
    }

    pub fn comments(&self) -> Option<&str> {
        self.extra.comments.as_deref()
    }

    fn require_opened(&self) -> Result<(), IndexError> {
        match self.state {
            LifecycleState::Opened => Ok(()),
            LifecycleState::Unopened => Err(StateError::NotOpened(BUILDER).into()),
            LifecycleState::Closed => Err(StateError::AlreadyClosed(BUILDER).into()),
        }
    }

    fn open_with(&mut self, path: Option<&str>) -> Result<(), IndexError> {
        match self.state {
            LifecycleState::Unopened => {}
            LifecycleState::Opened => return Err(StateError::AlreadyOpened(BUILDER).into()),
            LifecycleState::Closed => return Err(StateError::AlreadyClosed(BUILDER).into()),
        }
        if path == Some("") {
            return Err(IndexError::invalid_parameter("path", "index path must not be empty"));
        }
        let index = self.family.create_index(&self.common)?;
        self.slot = IndexSlot::Building(index);
        self.memory_only = path.is_none();
        self.path = path.unwrap_or_default().to_string();
        self.state = LifecycleState::Opened;
        tracing::debug!(
            index_type = %F::INDEX_TYPE,
            path = %self.path,
            memory_only = self.memory_only,
            "index builder opened"
        );
        Ok(())
    }

    /// Validate the arguments of `add` and return the rows to insert with
    /// their ids.
    fn prepare_rows(
        &self,
        columns: &[ColumnView<'_>],
        row_ids: Option<&[i64]>,
        null_flags: Option<&[u8]>,
    ) -> Result<(Vec<f32>, Vec<i64>), IndexError> {
        let [column] = columns else {
            return Err(IndexError::invalid_parameter(
                "columns",
                format!("expected exactly one vector column, got {}", columns.len()),
            ));
        };
        match (self.custom_row_id, row_ids, null_flags) {
            (true, None, _) => {
                return Err(IndexError::invalid_parameter(
                    "row_ids",
                    "custom row ids are enabled, ids are required",
                ))
            }
            (false, Some(_), _) => {
                return Err(IndexError::invalid_parameter(
                    "row_ids",
                    "custom row ids are not enabled",
                ))
            }
            (_, None, Some(_)) => {
                return Err(IndexError::invalid_parameter(
                    "null_flags",
                    "null flags are only accepted together with row ids",
                ))
            }
            _ => {}
        }

        let batch = RowBatch::from_column(column, self.common.dim)?;
        let n = batch.num_rows();
        if let Some(ids) = row_ids {
            if ids.len() != n {
                return Err(IndexError::invalid_parameter(
                    "row_ids",
                    format!("expected {n} ids, got {}", ids.len()),
                ));
            }
        }
        if let Some(flags) = null_flags {
            if flags.len() != n {
                return Err(IndexError::invalid_parameter(
                    "null_flags",
                    format!("expected {n} flags, got {}", flags.len()),
                ));
            }
        }

        Ok(match (row_ids, null_flags) {
            (Some(ids), Some(flags)) => {
                let mut rows = Vec::with_capacity(batch.data.len());
                let mut kept = Vec::with_capacity(n);
                for ((row, id), flag) in batch.rows().zip(ids).zip(flags) {
                    if *flag == 0 {
                        rows.extend_from_slice(row);
                        kept.push(*id);
                    }
                }
                (rows, kept)
            }
            (Some(ids), None) => (batch.data.into_owned(), ids.to_vec()),
            _ => {
                let base = self.rows_added as i64;
                (batch.data.into_owned(), (0..n as i64).map(|i| base + i).collect())
            }
        })
    }
}

impl<F: BuildFamily> IndexBuilder for NativeIndexBuilder<F> {
    fn open(&mut self) -> Result<(), IndexError> {
        self.open_with(None)
    }

    fn open_path(&mut self, path: &str) -> Result<(), IndexError> {
        self.open_with(Some(path))
    }

    fn add(
        &mut self,
        columns: &[ColumnView<'_>],
        row_ids: Option<&[i64]>,
        null_flags: Option<&[u8]>,
    ) -> Result<(), IndexError> {
        self.require_opened()?;
        let (rows, ids) = self.prepare_rows(columns, row_ids, null_flags)?;
        if ids.is_empty() {
            return Ok(());
        }
        let index = match &mut self.slot {
            IndexSlot::Building(index) => index,
            IndexSlot::Shared(index) => Arc::get_mut(index).ok_or(StateError::IndexShared)?,
            IndexSlot::Empty => return Err(StateError::BuilderNotReady.into()),
        };
        self.family.append(index, &rows, &ids)?;
        self.rows_added += ids.len();
        tracing::trace!(rows = ids.len(), total = self.rows_added, "rows added to builder");
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IndexError> {
        self.require_opened()?;
        if self.rows_added == 0 {
            return Err(StateError::BuilderNotReady.into());
        }
        let index = match &mut self.slot {
            IndexSlot::Building(index) => index,
            IndexSlot::Shared(index) => Arc::get_mut(index).ok_or(StateError::IndexShared)?,
            IndexSlot::Empty => return Err(StateError::BuilderNotReady.into()),
        };
        self.family.finish(index)?;

        let shared = match std::mem::replace(&mut self.slot, IndexSlot::Empty) {
            IndexSlot::Building(index) => Arc::new(index),
            IndexSlot::Shared(index) => index,
            IndexSlot::Empty => return Err(StateError::BuilderNotReady.into()),
        };
        self.slot = IndexSlot::Shared(Arc::clone(&shared));
        self.writer.write_index(&shared, &self.path, self.memory_only)?;
        tracing::info!(
            index_type = %F::INDEX_TYPE,
            rows = self.rows_added,
            path = %self.path,
            "index flushed"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), IndexError> {
        self.require_opened()?;
        self.state = LifecycleState::Closed;
        tracing::debug!(index_type = %F::INDEX_TYPE, rows = self.rows_added, "index builder closed");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state
    }

    fn rows_added(&self) -> usize {
        self.rows_added
    }

    fn index_ref(&self) -> Option<IndexRef> {
        match &self.slot {
            IndexSlot::Shared(index) => Some(Arc::clone(index)),
            _ => None,
        }
    }

    fn set_index_writer(&mut self, writer: Box<dyn IndexWriter>) {
        self.writer = writer;
    }

    fn set_index_cache(&mut self, cache: Arc<IndexCache>) {
        self.writer.set_index_cache(cache);
    }

    fn enable_custom_row_id(&mut self) -> Result<(), IndexError> {
        if self.state != LifecycleState::Unopened {
            return Err(StateError::AlreadyOpened(BUILDER).into());
        }
        self.custom_row_id = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheCapacity, IndexCacheConfig};
    use crate::meta::Section;

    fn hnsw_meta() -> IndexMeta {
        let mut meta = IndexMeta::new(IndexType::Hnsw);
        meta.set(Section::Common, "dim", 2)
            .set(Section::Common, "metric_type", "l2_distance");
        meta
    }

    const ROWS: [f32; 8] = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0];

    #[test]
    fn lifecycle_misuse_is_rejected_without_side_effects() {
        let mut builder = HnswIndexBuilder::from_meta(&hnsw_meta()).unwrap();
        let column = ColumnView::array_f32(&ROWS, 2);

        let err = builder.add(&[column], None, None).unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(builder.state(), LifecycleState::Unopened);

        builder.open().unwrap();
        assert!(matches!(
            builder.flush(),
            Err(IndexError::InvalidState(StateError::BuilderNotReady))
        ));
        assert!(matches!(
            builder.open(),
            Err(IndexError::InvalidState(StateError::AlreadyOpened(_)))
        ));
        assert_eq!(builder.state(), LifecycleState::Opened);

        builder.add(&[column], None, None).unwrap();
        builder.close().unwrap();
        assert!(matches!(
            builder.add(&[column], None, None),
            Err(IndexError::InvalidState(StateError::AlreadyClosed(_)))
        ));
        assert!(builder.flush().unwrap_err().is_invalid_state());
        assert!(builder.close().unwrap_err().is_invalid_state());
        assert_eq!(builder.rows_added(), 4);
    }

    #[test]
    fn exactly_one_column_is_accepted() {
        let mut builder = HnswIndexBuilder::from_meta(&hnsw_meta()).unwrap();
        builder.open().unwrap();
        let column = ColumnView::array_f32(&ROWS, 2);
        assert!(matches!(
            builder.add(&[column, column], None, None),
            Err(IndexError::InvalidParameter { .. })
        ));
        assert!(builder.add(&[], None, None).is_err());
    }

    #[test]
    fn null_flags_require_ids() {
        let mut builder = HnswIndexBuilder::from_meta(&hnsw_meta()).unwrap();
        builder.open().unwrap();
        let column = ColumnView::array_f32(&ROWS, 2);
        assert!(builder.add(&[column], None, Some(&[0, 1, 0, 0])).is_err());
        assert!(builder.add(&[column], Some(&[1, 2, 3, 4]), None).is_err());
        assert_eq!(builder.rows_added(), 0);
    }

    #[test]
    fn null_rows_are_skipped() {
        let mut builder = HnswIndexBuilder::from_meta(&hnsw_meta()).unwrap();
        builder.enable_custom_row_id().unwrap();
        builder.open().unwrap();
        let column = ColumnView::array_f32(&ROWS, 2);
        assert!(builder.add(&[column], None, None).is_err());
        builder
            .add(&[column], Some(&[10, 11, 12, 13]), Some(&[0, 1, 0, 1]))
            .unwrap();
        assert_eq!(builder.rows_added(), 2);
        builder.flush().unwrap();

        let index = builder.index_ref().unwrap();
        let hnsw = index.as_hnsw().unwrap();
        assert_eq!(hnsw.len(), 2);
        let results = hnsw.search(&[3.0, 3.0], 2, 16, None).unwrap();
        assert_eq!(results.iter().map(|r| r.id).collect::<Vec<_>>(), vec![12, 10]);
    }

    #[test]
    fn dimension_errors_name_the_row() {
        let mut builder = HnswIndexBuilder::from_meta(&hnsw_meta()).unwrap();
        builder.open().unwrap();
        let values = [0.0f32, 0.0, 1.0, 1.0, 1.0];
        let offsets = [0u32, 2, 5];
        let err = builder
            .add(&[ColumnView::vl_array_f32(&values, &offsets)], None, None)
            .unwrap_err();
        assert!(err.to_string().contains("at row 1"), "{err}");
    }

    #[test]
    fn ivf_pq_rejects_cosine_before_allocating() {
        let mut meta = IndexMeta::new(IndexType::IvfPq);
        meta.set(Section::Common, "dim", 4)
            .set(Section::Common, "metric_type", "cosine_similarity");
        assert!(matches!(
            IvfPqIndexBuilder::from_meta(&meta),
            Err(IndexError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn adding_after_publishing_to_cache_is_rejected() {
        let mut meta = hnsw_meta();
        meta.set(Section::WriteIndex, "write_index_cache", true)
            .set(Section::WriteIndex, "custom_cache_key", "shared");
        let cache = Arc::new(IndexCache::new(IndexCacheConfig {
            num_shards: 1,
            capacity: CacheCapacity::Entries(4),
        }));
        let mut builder = HnswIndexBuilder::from_meta(&meta).unwrap();
        builder.set_index_cache(Arc::clone(&cache));
        builder.open().unwrap();
        let column = ColumnView::array_f32(&ROWS, 2);
        builder.add(&[column], None, None).unwrap();
        builder.flush().unwrap();
        assert!(cache.contains("shared"));
        assert!(matches!(
            builder.add(&[column], None, None),
            Err(IndexError::InvalidState(StateError::IndexShared))
        ));
        assert_eq!(builder.rows_added(), 4);
    }

    #[test]
    fn memory_only_index_can_grow_after_flush() {
        let mut builder = HnswIndexBuilder::from_meta(&hnsw_meta()).unwrap();
        builder.open().unwrap();
        let column = ColumnView::array_f32(&ROWS, 2);
        builder.add(&[column], None, None).unwrap();
        builder.flush().unwrap();
        builder.add(&[column], None, None).unwrap();
        builder.flush().unwrap();
        let index = builder.index_ref().unwrap();
        assert_eq!(index.len(), 8);
        let hnsw = index.as_hnsw().unwrap();
        let ids: Vec<i64> = hnsw
            .search(&[3.0, 3.0], 2, 16, None)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![3, 7]);
    }
}
