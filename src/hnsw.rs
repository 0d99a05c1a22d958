//! Graph index backed by `hnsw_rs`.
//!
//! Vectors and ids are owned by [`HnswIndex`]; the navigable graph is derived
//! from them and rebuilt lazily after a load or an append. The graph always
//! runs on L2 over the stored vectors, which are unit-normalized for cosine
//! similarity so that both metrics share one graph ordering. Candidates coming
//! out of the graph are re-scored exactly before they are returned.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::filter::{accepts, IdFilter};
use crate::math::{cosine_similarity, l2_distance_sqr, normalize};
use crate::searcher::{SearchResult, TopK};
use crate::{IndexError, MetricType};

const MAX_LAYER: usize = 16;

#[derive(Serialize, Deserialize)]
pub struct HnswIndex {
    dim: usize,
    metric: MetricType,
    /// Input vectors are already unit length, skip normalization.
    is_vector_normed: bool,
    max_nb_connection: usize,
    ef_construction: usize,
    vectors: Vec<f32>,
    ids: Vec<i64>,
    #[serde(skip)]
    graph: RwLock<Option<Hnsw<'static, f32, DistL2>>>,
}

impl HnswIndex {
    pub fn new(
        dim: usize,
        metric: MetricType,
        is_vector_normed: bool,
        max_nb_connection: usize,
        ef_construction: usize,
    ) -> Result<Self, IndexError> {
        if !matches!(metric, MetricType::L2Distance | MetricType::CosineSimilarity) {
            return Err(IndexError::invalid_parameter(
                "metric_type",
                format!("{metric} is not supported by hnsw"),
            ));
        }
        if dim == 0 {
            return Err(IndexError::invalid_parameter("dim", "dimension must be positive"));
        }
        Ok(Self {
            dim,
            metric,
            is_vector_normed,
            max_nb_connection,
            ef_construction,
            vectors: Vec::new(),
            ids: Vec::new(),
            graph: RwLock::new(None),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> MetricType {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn has_graph(&self) -> bool {
        self.graph.read().is_some()
    }

    /// Structural consistency of a deserialized index.
    pub(crate) fn check_layout(&self) -> Result<(), IndexError> {
        if self.dim == 0 || self.vectors.len() != self.ids.len() * self.dim {
            return Err(IndexError::InvalidPersistence(format!(
                "hnsw holds {} floats for {} ids of dim {}",
                self.vectors.len(),
                self.ids.len(),
                self.dim
            )));
        }
        Ok(())
    }

    fn needs_normalization(&self) -> bool {
        self.metric == MetricType::CosineSimilarity && !self.is_vector_normed
    }

    fn row(&self, idx: usize) -> &[f32] {
        &self.vectors[idx * self.dim..(idx + 1) * self.dim]
    }

    /// Append rows. Without `ids` rows are numbered from the current size.
    /// Invalidates the graph.
    pub fn add(&mut self, data: &[f32], ids: Option<&[i64]>) -> Result<(), IndexError> {
        if data.len() % self.dim != 0 {
            return Err(IndexError::DimensionMismatch {
                row: Some(data.len() / self.dim),
                expected: self.dim,
                actual: data.len() % self.dim,
            });
        }
        let n = data.len() / self.dim;
        match ids {
            Some(ids) if ids.len() != n => {
                return Err(IndexError::invalid_parameter(
                    "row_ids",
                    format!("expected {n} ids, got {}", ids.len()),
                ));
            }
            Some(ids) => self.ids.extend_from_slice(ids),
            None => {
                let base = self.ids.len() as i64;
                self.ids.extend((0..n as i64).map(|i| base + i));
            }
        }

        let start = self.vectors.len();
        self.vectors.extend_from_slice(data);
        if self.needs_normalization() {
            for row in self.vectors[start..].chunks_exact_mut(self.dim) {
                normalize(row);
            }
        }
        *self.graph.get_mut() = None;
        Ok(())
    }

    /// Build the navigable graph if it is missing.
    pub fn ensure_graph(&self) -> Result<(), IndexError> {
        {
            let graph = self.graph.read();
            if graph.is_some() {
                return Ok(());
            }
        }

        let mut graph = self.graph.write();
        if graph.is_some() {
            return Ok(());
        }

        let nb_elements = self.len().max(1);
        let max_layer = MAX_LAYER
            .min((nb_elements as f32).ln().ceil() as usize)
            .max(1);
        let rows: Vec<Vec<f32>> = self.vectors.chunks_exact(self.dim).map(<[f32]>::to_vec).collect();
        let data_with_id: Vec<(&Vec<f32>, usize)> = rows.iter().zip(0..rows.len()).collect();

        let mut built = catch_unwind(AssertUnwindSafe(|| {
            let hnsw = Hnsw::<f32, DistL2>::new(
                self.max_nb_connection,
                nb_elements,
                max_layer,
                self.ef_construction,
                DistL2 {},
            );
            hnsw.parallel_insert(&data_with_id);
            hnsw
        }))
        .map_err(|_| IndexError::NativeLibraryError("hnsw graph construction panicked".to_string()))?;
        built.set_searching_mode(true);
        tracing::debug!(
            n = self.len(),
            max_nb_connection = self.max_nb_connection,
            max_layer,
            "built hnsw graph"
        );
        *graph = Some(built);
        Ok(())
    }

    fn check_query(&self, query: &[f32]) -> Result<(), IndexError> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                row: None,
                expected: self.dim,
                actual: query.len(),
            });
        }
        Ok(())
    }

    fn score(&self, query: &[f32], idx: usize) -> f32 {
        match self.metric {
            MetricType::CosineSimilarity => cosine_similarity(query, self.row(idx)),
            _ => l2_distance_sqr(query, self.row(idx)),
        }
    }

    fn graph_query(&self, query: &[f32]) -> Vec<f32> {
        let mut q = query.to_vec();
        if self.metric == MetricType::CosineSimilarity {
            normalize(&mut q);
        }
        q
    }

    /// Up to `fetch` graph candidates (row positions), closest first.
    fn graph_candidates(&self, query: &[f32], fetch: usize, ef: usize) -> Result<Vec<usize>, IndexError> {
        self.ensure_graph()?;
        let graph = self.graph.read();
        let Some(hnsw) = graph.as_ref() else {
            return Err(IndexError::NativeLibraryError("hnsw graph is missing".to_string()));
        };
        let neighbours = catch_unwind(AssertUnwindSafe(|| hnsw.search(query, fetch, ef)))
            .map_err(|_| IndexError::NativeLibraryError("hnsw search panicked".to_string()))?;
        Ok(neighbours.into_iter().map(|n| n.d_id).collect())
    }

    /// k nearest neighbours, best first. `filter` is applied to the graph
    /// candidates; when it rejects too many of them the candidate pool is
    /// widened until the whole index has been considered.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.check_query(query)?;
        let n = self.len();
        if k == 0 || n == 0 {
            return Ok(Vec::new());
        }

        let graph_query = self.graph_query(query);
        let mut fetch = k.max(ef_search).max(1);
        loop {
            let mut top = TopK::new(k, self.metric);
            if fetch >= n {
                self.scan_all(query, filter, |id, score| top.push(id, score));
                return Ok(top.into_sorted());
            }
            for idx in self.graph_candidates(&graph_query, fetch, ef_search.max(fetch))? {
                let id = self.ids[idx];
                if accepts(filter, id) {
                    top.push(id, self.score(query, idx));
                }
            }
            if top.len() >= k {
                return Ok(top.into_sorted());
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Every vector within `radius`: squared L2 distance at most `radius`, or
    /// cosine similarity at least `radius`. Unordered.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        ef_search: usize,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.check_query(query)?;
        let n = self.len();
        let mut results = Vec::new();
        if n == 0 {
            return Ok(results);
        }

        let within = |score: f32| match self.metric {
            MetricType::CosineSimilarity => score >= radius,
            _ => score <= radius,
        };
        let graph_query = self.graph_query(query);
        let mut fetch = ef_search.max(1);
        loop {
            results.clear();
            if fetch >= n {
                self.scan_all(query, filter, |id, score| {
                    if within(score) {
                        results.push(SearchResult { id, score });
                    }
                });
                return Ok(results);
            }
            let candidates = self.graph_candidates(&graph_query, fetch, ef_search.max(fetch))?;
            let mut frontier_inside = false;
            for (rank, idx) in candidates.iter().enumerate() {
                let score = self.score(query, *idx);
                let inside = within(score);
                if rank + 1 == candidates.len() {
                    frontier_inside = inside;
                }
                let id = self.ids[*idx];
                if inside && accepts(filter, id) {
                    results.push(SearchResult { id, score });
                }
            }
            if !frontier_inside && !candidates.is_empty() {
                return Ok(results);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    fn scan_all(&self, query: &[f32], filter: Option<&dyn IdFilter>, mut sink: impl FnMut(i64, f32)) {
        for (idx, id) in self.ids.iter().enumerate() {
            if accepts(filter, *id) {
                sink(*id, self.score(query, idx));
            }
        }
    }

    pub fn memory_usage(&self) -> usize {
        let graph = if self.has_graph() {
            self.len() * self.max_nb_connection * 2 * std::mem::size_of::<usize>()
        } else {
            0
        };
        std::mem::size_of::<Self>()
            + self.vectors.len() * std::mem::size_of::<f32>()
            + self.ids.len() * std::mem::size_of::<i64>()
            + graph
    }
}

impl fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dim", &self.dim)
            .field("metric", &self.metric)
            .field("len", &self.len())
            .field("max_nb_connection", &self.max_nb_connection)
            .field("ef_construction", &self.ef_construction)
            .field("has_graph", &self.has_graph())
            .finish()
    }
}
