//! Query side of the lifecycle: searchers bind to a loaded index and answer
//! k-NN and range queries with the search parameters of their family.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use serde_json::Value;

use crate::cache::IndexCache;
use crate::filter::IdFilter;
use crate::handle::IndexHandle;
use crate::ivf_pq::IvfPqSearchOptions;
use crate::meta::{IndexMeta, IndexType};
use crate::params::{FetchParams, HnswSearchParams, IvfPqSearchParams, VectorIndexCommonParams};
use crate::reader::{IndexReader, LoadedIndex, NativeIndexReader};
use crate::{IndexError, MetricType, StateError};

/// Order of range search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    /// Row id, the custom one when the index was built with custom ids.
    pub id: i64,
    /// Squared L2 distance, or similarity for similarity metrics.
    pub score: f32,
}

/// Distance metrics can only be listed closest-first in ascending order,
/// similarity metrics in descending order.
pub fn check_order(metric: MetricType, order: ResultOrder) -> Result<(), IndexError> {
    let natural = if metric.is_similarity() {
        ResultOrder::Descending
    } else {
        ResultOrder::Ascending
    };
    if order != natural {
        return Err(IndexError::UnsupportedOrder { order, metric });
    }
    Ok(())
}

/// Sort best first for `metric`, ties resolved to the smaller id.
pub(crate) fn sort_results(results: &mut [SearchResult], metric: MetricType) {
    if metric.is_similarity() {
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    } else {
        results.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.id.cmp(&b.id)));
    }
}

/// Heap entry ranked so that the worst kept candidate sits on top.
#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    /// Score oriented so that smaller is better.
    rank: f32,
    result: SearchResult,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .total_cmp(&other.rank)
            .then(self.result.id.cmp(&other.result.id))
    }
}

/// Bounded collector of the `k` best results.
#[derive(Debug)]
pub(crate) struct TopK {
    k: usize,
    similarity: bool,
    heap: BinaryHeap<HeapEntry>,
}

impl TopK {
    pub fn new(k: usize, metric: MetricType) -> Self {
        Self {
            k,
            similarity: metric.is_similarity(),
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(1 << 16)),
        }
    }

    pub fn push(&mut self, id: i64, score: f32) {
        if self.k == 0 {
            return;
        }
        let rank = if self.similarity { -score } else { score };
        let entry = HeapEntry {
            rank,
            result: SearchResult { id, score },
        };
        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry < *worst {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Best first.
    pub fn into_sorted(self) -> Vec<SearchResult> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| entry.result)
            .collect()
    }
}

/// A searcher bound (or bindable) to one index of its family.
pub trait AnnSearcher: Send {
    /// Load an index through the searcher's reader and bind to it.
    fn read_index(&mut self, path: &str) -> Result<(), IndexError>;

    /// Bind to an index loaded elsewhere.
    fn bind(&mut self, index: LoadedIndex) -> Result<(), IndexError>;

    fn is_index_loaded(&self) -> bool;

    fn index_meta(&self) -> &IndexMeta;

    /// Override one search parameter. The whole search group is re-validated;
    /// on failure the previous value is restored.
    fn set_search_param_item(&mut self, key: &str, value: Value) -> Result<(), IndexError>;

    /// Consult `cache` instead of the process-wide cache when reading.
    fn set_index_cache(&mut self, cache: Arc<IndexCache>);

    fn ann_search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        self.ann_search_with_filter(query, k, None)
    }

    fn ann_search_with_filter(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError>;

    /// All results within `radius`, in `order`, truncated to `limit` when
    /// given.
    fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        limit: Option<usize>,
        order: ResultOrder,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError>;
}

/// State shared by every family searcher.
struct SearcherCore {
    index_type: IndexType,
    meta: IndexMeta,
    common: VectorIndexCommonParams,
    reader: NativeIndexReader,
    loaded: Option<LoadedIndex>,
}

impl SearcherCore {
    fn new(meta: &IndexMeta, index_type: IndexType) -> Result<Self, IndexError> {
        let declared = meta.index_type()?;
        if declared != index_type {
            return Err(IndexError::IndexTypeMismatch {
                expected: index_type,
                actual: declared,
            });
        }
        let common = VectorIndexCommonParams::fetch(meta)?;
        let reader = NativeIndexReader::from_meta(meta)?;
        Ok(Self {
            index_type,
            meta: meta.clone(),
            common,
            reader,
            loaded: None,
        })
    }

    fn index(&self) -> Result<&IndexHandle, IndexError> {
        self.loaded
            .as_ref()
            .map(LoadedIndex::index)
            .ok_or_else(|| StateError::IndexNotLoaded.into())
    }

    fn bind(&mut self, loaded: LoadedIndex, dim: impl Fn(&IndexHandle) -> Result<usize, IndexError>) -> Result<(), IndexError> {
        if loaded.index().index_type() != self.index_type {
            return Err(IndexError::IndexTypeMismatch {
                expected: self.index_type,
                actual: loaded.index().index_type(),
            });
        }
        let actual = dim(loaded.index())?;
        if actual != self.common.dim {
            return Err(IndexError::DimensionMismatch {
                row: None,
                expected: self.common.dim,
                actual,
            });
        }
        tracing::debug!(
            index_type = %self.index_type,
            cached = loaded.is_cached(),
            len = loaded.index().len(),
            "searcher bound to index"
        );
        self.loaded = Some(loaded);
        Ok(())
    }

    fn read(&mut self, path: &str) -> Result<LoadedIndex, IndexError> {
        self.reader.read_index(path)
    }

    fn update_search_param<P: FetchParams>(&mut self, key: &str, value: Value) -> Result<P, IndexError> {
        let previous = self.meta.search.insert(key.to_string(), value);
        match P::fetch(&self.meta) {
            Ok(params) => Ok(params),
            Err(err) => {
                match previous {
                    Some(previous) => self.meta.search.insert(key.to_string(), previous),
                    None => self.meta.search.remove(key),
                };
                Err(err)
            }
        }
    }
}

fn finish_range(
    mut results: Vec<SearchResult>,
    metric: MetricType,
    limit: Option<usize>,
) -> Vec<SearchResult> {
    sort_results(&mut results, metric);
    if let Some(limit) = limit {
        results.truncate(limit);
    }
    results
}

/// Searcher over the graph family.
pub struct HnswSearcher {
    core: SearcherCore,
    params: HnswSearchParams,
}

impl HnswSearcher {
    pub fn from_meta(meta: &IndexMeta) -> Result<Self, IndexError> {
        let core = SearcherCore::new(meta, IndexType::Hnsw)?;
        core.common.require_metric(
            IndexType::Hnsw.as_str(),
            &[MetricType::L2Distance, MetricType::CosineSimilarity],
        )?;
        let params = HnswSearchParams::fetch(meta)?;
        Ok(Self { core, params })
    }

    pub fn params(&self) -> &HnswSearchParams {
        &self.params
    }
}

impl AnnSearcher for HnswSearcher {
    fn read_index(&mut self, path: &str) -> Result<(), IndexError> {
        let loaded = self.core.read(path)?;
        self.bind(loaded)
    }

    fn bind(&mut self, index: LoadedIndex) -> Result<(), IndexError> {
        self.core.bind(index, |handle| handle.as_hnsw().map(|i| i.dim()))
    }

    fn is_index_loaded(&self) -> bool {
        self.core.loaded.is_some()
    }

    fn index_meta(&self) -> &IndexMeta {
        &self.core.meta
    }

    fn set_search_param_item(&mut self, key: &str, value: Value) -> Result<(), IndexError> {
        self.params = self.core.update_search_param(key, value)?;
        Ok(())
    }

    fn set_index_cache(&mut self, cache: Arc<IndexCache>) {
        self.core.reader.set_index_cache(cache);
    }

    fn ann_search_with_filter(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let index = self.core.index()?.as_hnsw()?;
        index.search(query, k, self.params.ef_search, filter)
    }

    fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        limit: Option<usize>,
        order: ResultOrder,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let index = self.core.index()?.as_hnsw()?;
        check_order(index.metric(), order)?;
        let results = index.range_search(query, radius, self.params.ef_search, filter)?;
        Ok(finish_range(results, index.metric(), limit))
    }
}

/// Searcher over the inverted-file family.
pub struct IvfPqSearcher {
    core: SearcherCore,
    params: IvfPqSearchParams,
}

impl IvfPqSearcher {
    pub fn from_meta(meta: &IndexMeta) -> Result<Self, IndexError> {
        let core = SearcherCore::new(meta, IndexType::IvfPq)?;
        core.common
            .require_metric(IndexType::IvfPq.as_str(), &[MetricType::L2Distance])?;
        let params = IvfPqSearchParams::fetch(meta)?;
        Ok(Self { core, params })
    }

    pub fn params(&self) -> &IvfPqSearchParams {
        &self.params
    }

    fn options(&self) -> IvfPqSearchOptions {
        IvfPqSearchOptions {
            nprobe: self.params.nprobe,
            max_codes: self.params.max_codes,
            error_scale: self.params.error_scale(),
        }
    }
}

impl AnnSearcher for IvfPqSearcher {
    fn read_index(&mut self, path: &str) -> Result<(), IndexError> {
        let loaded = self.core.read(path)?;
        self.bind(loaded)
    }

    fn bind(&mut self, index: LoadedIndex) -> Result<(), IndexError> {
        self.core.bind(index, |handle| handle.as_ivf_pq().map(|i| i.dim()))
    }

    fn is_index_loaded(&self) -> bool {
        self.core.loaded.is_some()
    }

    fn index_meta(&self) -> &IndexMeta {
        &self.core.meta
    }

    fn set_search_param_item(&mut self, key: &str, value: Value) -> Result<(), IndexError> {
        self.params = self.core.update_search_param(key, value)?;
        Ok(())
    }

    fn set_index_cache(&mut self, cache: Arc<IndexCache>) {
        self.core.reader.set_index_cache(cache);
    }

    fn ann_search_with_filter(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let index = self.core.index()?.as_ivf_pq()?;
        index.search(query, k, &self.options(), filter)
    }

    fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        limit: Option<usize>,
        order: ResultOrder,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let index = self.core.index()?.as_ivf_pq()?;
        check_order(index.metric(), order)?;
        let results = index.range_search(query, radius, &self.options(), filter)?;
        Ok(finish_range(results, index.metric(), limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::HnswIndex;
    use crate::meta::Section;

    fn hnsw_meta() -> IndexMeta {
        let mut meta = IndexMeta::new(IndexType::Hnsw);
        meta.set(Section::Common, "dim", 2)
            .set(Section::Common, "metric_type", "l2_distance");
        meta
    }

    fn loaded_hnsw() -> LoadedIndex {
        let mut index = HnswIndex::new(2, MetricType::L2Distance, false, 8, 20).unwrap();
        index
            .add(&[0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0], None)
            .unwrap();
        LoadedIndex::detached(Arc::new(IndexHandle::hnsw(index)))
    }

    #[test]
    fn top_k_keeps_best_with_smaller_id_on_ties() {
        let mut top = TopK::new(2, MetricType::L2Distance);
        for (id, score) in [(5, 1.0), (3, 1.0), (9, 0.5), (1, 4.0)] {
            top.push(id, score);
        }
        let ids: Vec<i64> = top.into_sorted().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![9, 3]);

        let mut top = TopK::new(2, MetricType::CosineSimilarity);
        for (id, score) in [(1, 0.2), (2, 0.9), (3, 0.5)] {
            top.push(id, score);
        }
        let ids: Vec<i64> = top.into_sorted().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn order_rule_follows_metric() {
        assert!(check_order(MetricType::L2Distance, ResultOrder::Ascending).is_ok());
        assert!(matches!(
            check_order(MetricType::L2Distance, ResultOrder::Descending),
            Err(IndexError::UnsupportedOrder { .. })
        ));
        assert!(check_order(MetricType::InnerProduct, ResultOrder::Descending).is_ok());
        assert!(check_order(MetricType::CosineSimilarity, ResultOrder::Ascending).is_err());
    }

    #[test]
    fn search_before_binding_fails() {
        let searcher = HnswSearcher::from_meta(&hnsw_meta()).unwrap();
        assert!(!searcher.is_index_loaded());
        let err = searcher.ann_search(&[0.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, IndexError::InvalidState(StateError::IndexNotLoaded)));
    }

    #[test]
    fn bind_checks_dimension() {
        let mut meta = hnsw_meta();
        meta.set(Section::Common, "dim", 3);
        let mut searcher = HnswSearcher::from_meta(&meta).unwrap();
        assert!(matches!(
            searcher.bind(loaded_hnsw()),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn range_search_limit_truncates() {
        let mut searcher = HnswSearcher::from_meta(&hnsw_meta()).unwrap();
        searcher.bind(loaded_hnsw()).unwrap();
        let all = searcher
            .range_search(&[0.0, 0.0], 4.5, None, ResultOrder::Ascending, None)
            .unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        let capped = searcher
            .range_search(&[0.0, 0.0], 4.5, Some(2), ResultOrder::Ascending, None)
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn invalid_override_is_rolled_back() {
        let mut searcher = HnswSearcher::from_meta(&hnsw_meta()).unwrap();
        searcher
            .set_search_param_item("efSearch", Value::from(64))
            .unwrap();
        assert_eq!(searcher.params().ef_search, 64);
        assert!(searcher
            .set_search_param_item("efSearch", Value::from(0))
            .is_err());
        assert_eq!(searcher.params().ef_search, 64);
        assert_eq!(searcher.index_meta().search.get("efSearch"), Some(&Value::from(64)));
    }

    #[test]
    fn ivf_pq_searcher_rejects_cosine() {
        let mut meta = IndexMeta::new(IndexType::IvfPq);
        meta.set(Section::Common, "dim", 4)
            .set(Section::Common, "metric_type", "cosine_similarity");
        assert!(matches!(
            IvfPqSearcher::from_meta(&meta),
            Err(IndexError::InvalidParameter { .. })
        ));
    }
}
