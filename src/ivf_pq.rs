//! Inverted-file index over product-quantized residuals.
//!
//! Besides the usual IVF-PQ state, every stored code carries the L2 norm of
//! its reconstruction error (`residual - decode(code)`). Range search uses it
//! to widen the acceptance test so that vectors whose approximate distance
//! overshoots the radius by less than their own quantization error are kept.

use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::filter::{accepts, IdFilter};
use crate::kmeans::{nearest_centroid, run_kmeans};
use crate::math::{l2_distance_sqr, subtract, subtract_into};
use crate::pq::ProductQuantizer;
use crate::searcher::{SearchResult, TopK};
use crate::{IndexError, MetricType};

const TRAIN_SEED: u64 = 0x1f2e_3d4c;
const COARSE_ITERATIONS: usize = 20;

/// Ids and codes of one inverted list, codes packed `code_size` bytes apiece.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvertedList {
    ids: Vec<i64>,
    codes: Vec<u8>,
}

impl InvertedList {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }
}

/// Per-list reconstruction errors, parallel to the codes of each list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionErrorTable {
    lists: Vec<Vec<f32>>,
}

impl ReconstructionErrorTable {
    fn with_lists(nlist: usize) -> Self {
        Self {
            lists: vec![Vec::new(); nlist],
        }
    }

    pub fn list(&self, list_no: usize) -> Option<&[f32]> {
        self.lists.get(list_no).map(Vec::as_slice)
    }

    fn push(&mut self, list_no: usize, error: f32) {
        self.lists[list_no].push(error);
    }
}

/// Per-query search knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IvfPqSearchOptions {
    pub nprobe: usize,
    /// Stop after scanning this many codes, 0 for no limit.
    pub max_codes: usize,
    /// Weight applied to each reconstruction error in range search.
    pub error_scale: f32,
}

impl Default for IvfPqSearchOptions {
    fn default() -> Self {
        Self {
            nprobe: 1,
            max_codes: 0,
            error_scale: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfPqIndex {
    dim: usize,
    nlist: usize,
    m: usize,
    nbits: usize,
    metric: MetricType,
    /// Coarse centroids, `nlist * dim` values.
    centroids: Vec<f32>,
    pq: Option<ProductQuantizer>,
    lists: Vec<InvertedList>,
    errors: ReconstructionErrorTable,
    ntotal: usize,
}

impl IvfPqIndex {
    pub fn new(dim: usize, nlist: usize, m: usize, nbits: usize, metric: MetricType) -> Result<Self, IndexError> {
        if metric != MetricType::L2Distance {
            return Err(IndexError::invalid_parameter(
                "metric_type",
                format!("{metric} is not supported by ivf_pq"),
            ));
        }
        if dim == 0 || nlist == 0 || m == 0 || dim % m != 0 {
            return Err(IndexError::invalid_parameter(
                "M",
                format!("invalid layout dim={dim} nlist={nlist} M={m}"),
            ));
        }
        Ok(Self {
            dim,
            nlist,
            m,
            nbits,
            metric,
            centroids: Vec::new(),
            pq: None,
            lists: vec![InvertedList::default(); nlist],
            errors: ReconstructionErrorTable::with_lists(nlist),
            ntotal: 0,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn metric(&self) -> MetricType {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.ntotal
    }

    pub fn is_empty(&self) -> bool {
        self.ntotal == 0
    }

    pub fn is_trained(&self) -> bool {
        self.pq.is_some()
    }

    pub fn list(&self, list_no: usize) -> Option<&InvertedList> {
        self.lists.get(list_no)
    }

    pub fn reconstruction_errors(&self) -> &ReconstructionErrorTable {
        &self.errors
    }

    fn trained_pq(&self) -> Result<&ProductQuantizer, IndexError> {
        self.pq
            .as_ref()
            .ok_or_else(|| IndexError::NativeLibraryError("ivf_pq index is not trained".to_string()))
    }

    /// Train the coarse quantizer and the residual product quantizer.
    pub fn train(&mut self, data: &[f32]) -> Result<(), IndexError> {
        self.check_rows(data)?;
        let n = data.len() / self.dim;
        if n < self.nlist {
            return Err(IndexError::NativeLibraryError(format!(
                "training needs at least nlist={} vectors, got {n}",
                self.nlist
            )));
        }

        let mut rng = StdRng::seed_from_u64(TRAIN_SEED);
        let coarse = run_kmeans(data, self.dim, self.nlist, COARSE_ITERATIONS, &mut rng);

        let mut residuals = vec![0.0f32; data.len()];
        residuals
            .par_chunks_exact_mut(self.dim)
            .zip(data.par_chunks_exact(self.dim))
            .zip(coarse.assignments.par_iter())
            .for_each(|((dst, row), &list_no)| {
                let centroid = &coarse.centroids[list_no * self.dim..(list_no + 1) * self.dim];
                subtract_into(row, centroid, dst);
            });

        let pq = ProductQuantizer::train(&residuals, self.dim, self.m, self.nbits, &mut rng)?;
        tracing::debug!(n, nlist = self.nlist, m = self.m, nbits = self.nbits, "trained ivf_pq");
        self.centroids = coarse.centroids;
        self.pq = Some(pq);
        Ok(())
    }

    /// Index of the coarse centroid closest to `x`.
    pub fn assign(&self, x: &[f32]) -> Result<usize, IndexError> {
        self.check_query(x)?;
        self.trained_pq()?;
        Ok(self.nearest_list(x))
    }

    /// `x` minus the centroid of `list_no`.
    pub fn compute_residual(&self, x: &[f32], list_no: usize) -> Result<Vec<f32>, IndexError> {
        self.check_query(x)?;
        self.trained_pq()?;
        self.check_list(list_no)?;
        Ok(self.residual(x, list_no))
    }

    fn nearest_list(&self, x: &[f32]) -> usize {
        nearest_centroid(x, &self.centroids, self.dim).0
    }

    fn residual(&self, x: &[f32], list_no: usize) -> Vec<f32> {
        subtract(x, self.centroid(list_no))
    }

    fn check_list(&self, list_no: usize) -> Result<(), IndexError> {
        if list_no >= self.nlist {
            return Err(IndexError::invalid_parameter(
                "list_no",
                format!("{list_no} is out of range for nlist={}", self.nlist),
            ));
        }
        Ok(())
    }

    fn centroid(&self, list_no: usize) -> &[f32] {
        &self.centroids[list_no * self.dim..(list_no + 1) * self.dim]
    }

    /// Encode and append rows. Without `ids` rows are numbered from the
    /// current size of the index.
    pub fn add(&mut self, data: &[f32], ids: Option<&[i64]>) -> Result<(), IndexError> {
        self.check_rows(data)?;
        let n = data.len() / self.dim;
        if let Some(ids) = ids {
            if ids.len() != n {
                return Err(IndexError::invalid_parameter(
                    "row_ids",
                    format!("expected {n} ids, got {}", ids.len()),
                ));
            }
        }
        let pq = self.trained_pq()?;
        let code_size = pq.code_size();

        let encoded: Vec<(usize, Vec<u8>, f32)> = data
            .par_chunks_exact(self.dim)
            .map(|row| {
                let list_no = self.nearest_list(row);
                let residual = self.residual(row, list_no);
                let mut code = vec![0u8; code_size];
                pq.compute_code(&residual, &mut code);
                let mut decoded = vec![0.0f32; self.dim];
                pq.decode(&code, &mut decoded);
                (list_no, code, l2_distance_sqr(&residual, &decoded).sqrt())
            })
            .collect();

        let base = self.ntotal as i64;
        for (i, (list_no, code, error)) in encoded.into_iter().enumerate() {
            let id = ids.map_or(base + i as i64, |ids| ids[i]);
            let list = &mut self.lists[list_no];
            list.ids.push(id);
            list.codes.extend_from_slice(&code);
            self.errors.push(list_no, error);
            if self.errors.lists[list_no].len() != list.len() {
                return Err(IndexError::NativeLibraryError(format!(
                    "reconstruction error table out of sync for list {list_no}"
                )));
            }
        }
        self.ntotal += n;
        tracing::trace!(added = n, total = self.ntotal, "added rows to ivf_pq");
        Ok(())
    }

    fn check_rows(&self, data: &[f32]) -> Result<(), IndexError> {
        if data.len() % self.dim != 0 {
            return Err(IndexError::DimensionMismatch {
                row: Some(data.len() / self.dim),
                expected: self.dim,
                actual: data.len() % self.dim,
            });
        }
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

    /// Structural consistency of a deserialized index.
    pub(crate) fn check_layout(&self) -> Result<(), IndexError> {
        let corrupt = |what: String| Err(IndexError::InvalidPersistence(format!("ivf_pq {what}")));
        if self.dim == 0 || self.nlist == 0 || self.m == 0 || self.dim % self.m != 0 {
            return corrupt(format!("layout dim={} nlist={} M={}", self.dim, self.nlist, self.m));
        }
        if self.lists.len() != self.nlist || self.errors.lists.len() != self.nlist {
            return corrupt(format!(
                "has {} lists and {} error lists, expected {}",
                self.lists.len(),
                self.errors.lists.len(),
                self.nlist
            ));
        }
        let code_size = match &self.pq {
            Some(pq) => {
                if pq.dim() != self.dim || self.centroids.len() != self.nlist * self.dim {
                    return corrupt("quantizers do not match the dimension".to_string());
                }
                pq.code_size()
            }
            None => 0,
        };
        let mut total = 0usize;
        for (list_no, (list, errors)) in self.lists.iter().zip(&self.errors.lists).enumerate() {
            if self.pq.is_none() && !list.is_empty() {
                return corrupt(format!("list {list_no} holds codes but the index is untrained"));
            }
            if errors.len() != list.len() {
                return corrupt(format!(
                    "list {list_no} has {} ids and {} reconstruction errors",
                    list.len(),
                    errors.len()
                ));
            }
            if list.codes.len() != list.len() * code_size {
                return corrupt(format!(
                    "list {list_no} has {} code bytes, expected {}",
                    list.codes.len(),
                    list.len() * code_size
                ));
            }
            total += list.len();
        }
        if total != self.ntotal {
            return corrupt(format!("lists hold {total} codes, header says {}", self.ntotal));
        }
        Ok(())
    }

    /// The `nprobe` lists whose centroids are closest to `query`, nearest first.
    fn probe_lists(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut scored: Vec<(f32, usize)> = self
            .centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(list_no, centroid)| (l2_distance_sqr(query, centroid), list_no))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(nprobe.min(self.nlist));
        scored.into_iter().map(|(_, list_no)| list_no).collect()
    }

    pub fn scanner<'a>(&'a self, query: &'a [f32]) -> Result<InvertedListScanner<'a>, IndexError> {
        self.check_query(query)?;
        Ok(InvertedListScanner {
            index: self,
            pq: self.trained_pq()?,
            query,
            list_no: None,
            table: Vec::new(),
        })
    }

    /// Approximate k nearest neighbours, closest first.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        options: &IvfPqSearchOptions,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.check_query(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let mut scanner = self.scanner(query)?;
        let mut top = TopK::new(k, self.metric);
        let mut scanned = 0usize;
        for list_no in self.probe_lists(query, options.nprobe) {
            scanner.set_list(list_no)?;
            scanned += scanner.scan_codes(&mut top, filter);
            if options.max_codes > 0 && scanned >= options.max_codes {
                break;
            }
        }
        Ok(top.into_sorted())
    }

    /// Every vector whose error-corrected distance lower bound lies within
    /// `radius`, in ascending distance order.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        options: &IvfPqSearchOptions,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.check_query(query)?;
        if self.metric != MetricType::L2Distance {
            return Err(IndexError::invalid_parameter(
                "metric_type",
                "reconstruction error bound is only defined for l2_distance",
            ));
        }
        let mut results = Vec::new();
        if self.is_empty() {
            return Ok(results);
        }
        let mut scanner = self.scanner(query)?;
        let mut scanned = 0usize;
        for list_no in self.probe_lists(query, options.nprobe) {
            scanner.set_list(list_no)?;
            scanned += scanner.scan_codes_range(radius, options.error_scale, filter, &mut results);
            if options.max_codes > 0 && scanned >= options.max_codes {
                break;
            }
        }
        results.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    pub fn memory_usage(&self) -> usize {
        let lists: usize = self
            .lists
            .iter()
            .map(|l| l.ids.len() * std::mem::size_of::<i64>() + l.codes.len())
            .sum();
        std::mem::size_of::<Self>()
            + self.centroids.len() * std::mem::size_of::<f32>()
            + self.pq.as_ref().map_or(0, |pq| pq.memory_usage())
            + lists
            + self.ntotal * std::mem::size_of::<f32>()
    }
}

/// Scores the codes of one inverted list against a query.
pub struct InvertedListScanner<'a> {
    index: &'a IvfPqIndex,
    pq: &'a ProductQuantizer,
    query: &'a [f32],
    list_no: Option<usize>,
    table: Vec<f32>,
}

impl<'a> InvertedListScanner<'a> {
    /// Switch to `list_no`, recomputing the residual distance table.
    pub fn set_list(&mut self, list_no: usize) -> Result<(), IndexError> {
        self.index.check_list(list_no)?;
        let residual = self.index.residual(self.query, list_no);
        self.table = self.pq.compute_distance_table(&residual);
        self.list_no = Some(list_no);
        Ok(())
    }

    #[inline]
    pub fn distance_to_code(&self, code: &[u8]) -> f32 {
        self.pq.distance_to_code(&self.table, code)
    }

    fn current(&self) -> Option<(usize, &'a InvertedList)> {
        self.list_no.map(|list_no| (list_no, &self.index.lists[list_no]))
    }

    /// Feed every accepted code of the current list into `top`. Returns the
    /// number of codes scanned.
    pub(crate) fn scan_codes(&self, top: &mut TopK, filter: Option<&dyn IdFilter>) -> usize {
        let Some((_, list)) = self.current() else {
            return 0;
        };
        let code_size = self.pq.code_size();
        for (id, code) in list.ids.iter().zip(list.codes.chunks_exact(code_size)) {
            if !accepts(filter, *id) {
                continue;
            }
            top.push(*id, self.distance_to_code(code));
        }
        list.len()
    }

    /// Append every code of the current list that passes the error-corrected
    /// radius test. Returns the number of codes scanned.
    pub fn scan_codes_range(
        &self,
        radius: f32,
        error_scale: f32,
        filter: Option<&dyn IdFilter>,
        out: &mut Vec<SearchResult>,
    ) -> usize {
        let Some((list_no, list)) = self.current() else {
            return 0;
        };
        let radius_sqrt = radius.max(0.0).sqrt();
        let errors = &self.index.errors.lists[list_no];
        let code_size = self.pq.code_size();
        for ((id, code), error) in list
            .ids
            .iter()
            .zip(list.codes.chunks_exact(code_size))
            .zip(errors)
        {
            if !accepts(filter, *id) {
                continue;
            }
            let dis = self.distance_to_code(code);
            let lower_bound = (dis.sqrt() - error * error_scale).abs();
            if lower_bound <= radius_sqrt {
                out.push(SearchResult { id: *id, score: dis });
            }
        }
        list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RangeIdFilter;
    use crate::handle::IndexHandle;
    use crate::persist::{load_from_reader, save_to_writer};
    use std::collections::{HashMap, HashSet};

    fn random_data(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn trained_index(n: usize) -> (IvfPqIndex, Vec<f32>) {
        let dim = 8;
        let data = random_data(n, dim, 11);
        let mut index = IvfPqIndex::new(dim, 4, 4, 4, MetricType::L2Distance).unwrap();
        index.train(&data).unwrap();
        index.add(&data, None).unwrap();
        (index, data)
    }

    #[test]
    fn rejects_non_l2_metric() {
        assert!(IvfPqIndex::new(8, 4, 4, 4, MetricType::CosineSimilarity).is_err());
    }

    #[test]
    fn error_table_tracks_list_sizes() {
        let (index, _) = trained_index(300);
        assert_eq!(index.len(), 300);
        let mut total = 0;
        for list_no in 0..index.nlist() {
            let list = index.list(list_no).unwrap();
            let errors = index.reconstruction_errors().list(list_no).unwrap();
            assert_eq!(errors.len(), list.len());
            assert!(errors.iter().all(|e| *e >= 0.0));
            total += list.len();
        }
        assert_eq!(total, 300);
    }

    #[test]
    fn add_before_train_fails() {
        let mut index = IvfPqIndex::new(4, 2, 2, 4, MetricType::L2Distance).unwrap();
        assert!(matches!(
            index.add(&[0.0; 4], None),
            Err(IndexError::NativeLibraryError(_))
        ));
    }

    #[test]
    fn train_needs_nlist_points() {
        let mut index = IvfPqIndex::new(4, 8, 2, 4, MetricType::L2Distance).unwrap();
        assert!(index.train(&random_data(4, 4, 1)).is_err());
    }

    #[test]
    fn exhaustive_probe_finds_self_first() {
        let (index, data) = trained_index(300);
        let options = IvfPqSearchOptions {
            nprobe: 4,
            ..Default::default()
        };
        let query = &data[8 * 17..8 * 18];
        let results = index.search(query, 5, &options, None).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.windows(2).all(|w| w[0].score <= w[1].score));
        assert!(results.iter().any(|r| r.id == 17));
    }

    #[test]
    fn max_codes_stops_after_first_list() {
        let (index, data) = trained_index(300);
        let query = &data[..8];
        let limited = IvfPqSearchOptions {
            nprobe: 4,
            max_codes: 1,
            error_scale: 0.0,
        };
        let results = index.search(query, 300, &limited, None).unwrap();
        let first_list = index.probe_lists(query, 1)[0];
        assert_eq!(results.len(), index.list(first_list).unwrap().len());
    }

    #[test]
    fn zero_confidence_range_equals_plain_radius_filter() {
        let (index, data) = trained_index(300);
        let options = IvfPqSearchOptions {
            nprobe: 2,
            ..Default::default()
        };
        let query = &data[8 * 3..8 * 4];
        let all = index.search(query, index.len(), &options, None).unwrap();
        let radius = all[all.len() / 3].score;

        let ranged = index.range_search(query, radius, &options, None).unwrap();
        let expected: Vec<i64> = all
            .iter()
            .filter(|r| r.score.sqrt() <= radius.sqrt())
            .map(|r| r.id)
            .collect();
        let got: Vec<i64> = ranged.iter().map(|r| r.id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn range_filter_is_applied_before_scoring() {
        let (index, data) = trained_index(300);
        let options = IvfPqSearchOptions {
            nprobe: 4,
            max_codes: 0,
            error_scale: 1.0,
        };
        let filter = RangeIdFilter::new(0, 50);
        let results = index
            .range_search(&data[..8], 100.0, &options, Some(&filter))
            .unwrap();
        assert_eq!(results.len(), 50);
        assert!(results.iter().all(|r| (0..50).contains(&r.id)));
    }

    #[test]
    fn custom_ids_are_reported() {
        let dim = 4;
        let data = random_data(40, dim, 5);
        let ids: Vec<i64> = (0..40).map(|i| 1000 + i).collect();
        let mut index = IvfPqIndex::new(dim, 2, 2, 4, MetricType::L2Distance).unwrap();
        index.train(&data).unwrap();
        index.add(&data, Some(&ids)).unwrap();
        let options = IvfPqSearchOptions {
            nprobe: 2,
            ..Default::default()
        };
        let results = index.search(&data[..dim], 40, &options, None).unwrap();
        assert_eq!(results.len(), 40);
        assert!(results.iter().all(|r| r.id >= 1000));
    }

    #[test]
    fn confidence_widens_range_by_reconstruction_error() {
        let (index, data) = trained_index(500);
        let code_size = index.pq.as_ref().unwrap().code_size();
        assert!(index.errors.lists.iter().flatten().any(|e| *e > 0.0));

        let radius = 1.0f32;
        let exact = IvfPqSearchOptions {
            nprobe: index.nlist(),
            max_codes: 0,
            error_scale: 0.0,
        };
        let widened = IvfPqSearchOptions {
            error_scale: 1.0,
            ..exact
        };
        let (mut exact_hits, mut widened_hits) = (0, 0);
        for q in 0..10 {
            let query = &data[q * 7 * 8..(q * 7 + 1) * 8];

            // (code distance, reconstruction error) of every stored vector
            let mut scanner = index.scanner(query).unwrap();
            let mut bounds = HashMap::new();
            for list_no in 0..index.nlist() {
                scanner.set_list(list_no).unwrap();
                let list = &index.lists[list_no];
                let codes = list.codes.chunks_exact(code_size);
                for ((id, code), error) in list.ids.iter().zip(codes).zip(&index.errors.lists[list_no]) {
                    bounds.insert(*id, (scanner.distance_to_code(code), *error));
                }
            }

            let narrow = index.range_search(query, radius, &exact, None).unwrap();
            let wide = index.range_search(query, radius, &widened, None).unwrap();
            assert!(wide.windows(2).all(|w| w[0].score <= w[1].score));
            let wide_ids: HashSet<i64> = wide.iter().map(|r| r.id).collect();

            for hit in &narrow {
                let (distance, error) = bounds[&hit.id];
                assert!(hit.score.sqrt() <= radius.sqrt());
                assert!(wide_ids.contains(&hit.id) || error > distance.sqrt() + radius.sqrt());
            }
            for (id, (distance, error)) in &bounds {
                let within = (distance.sqrt() - error).abs() <= radius.sqrt();
                assert_eq!(within, wide_ids.contains(id), "id {id}");
            }
            exact_hits += narrow.len();
            widened_hits += wide.len();
        }
        assert!(widened_hits > exact_hits, "{widened_hits} <= {exact_hits}");
    }

    #[test]
    fn residual_helpers_check_training_and_bounds() {
        let untrained = IvfPqIndex::new(8, 4, 4, 4, MetricType::L2Distance).unwrap();
        let x = [0.5f32; 8];
        assert!(untrained.assign(&x).is_err());
        assert!(untrained.compute_residual(&x, 0).is_err());

        let (index, data) = trained_index(200);
        let list_no = index.assign(&data[..8]).unwrap();
        assert!(list_no < index.nlist());
        assert_eq!(index.compute_residual(&data[..8], list_no).unwrap().len(), 8);
        assert!(matches!(
            index.compute_residual(&data[..8], index.nlist()),
            Err(IndexError::InvalidParameter { .. })
        ));
        assert!(matches!(
            index.assign(&data[..4]),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(index.list(index.nlist()).is_none());
        assert!(index.reconstruction_errors().list(index.nlist()).is_none());

        let mut scanner = index.scanner(&data[..8]).unwrap();
        assert!(scanner.set_list(index.nlist()).is_err());
    }

    #[test]
    fn inconsistent_layout_is_rejected_on_load() {
        let (index, _) = trained_index(200);
        index.check_layout().unwrap();
        let list_no = (0..index.nlist()).find(|l| !index.lists[*l].is_empty()).unwrap();

        let mut short_errors = index.clone();
        short_errors.errors.lists[list_no].pop();
        let mut short_codes = index.clone();
        short_codes.lists[list_no].codes.pop();
        let mut extra_list = index.clone();
        extra_list.lists.push(InvertedList::default());

        for tampered in [short_errors, short_codes, extra_list] {
            assert!(matches!(tampered.check_layout(), Err(IndexError::InvalidPersistence(_))));
            let mut bytes = Vec::new();
            save_to_writer(&IndexHandle::ivf_pq(tampered), &mut bytes).unwrap();
            assert!(matches!(
                load_from_reader(bytes.as_slice()),
                Err(IndexError::InvalidPersistence(_))
            ));
        }
    }
}
