//! Exact search over caller-owned vectors.
//!
//! Used as ground truth for the approximate families and for small
//! collections where building an index does not pay off. Rows flagged in
//! `null_flags` are never returned; `ids` replace row positions in results.

use rayon::prelude::*;

use crate::math::{cosine_similarity, dot, l2_distance_sqr};
use crate::searcher::{check_order, sort_results, ResultOrder, SearchResult, TopK};
use crate::{IndexError, MetricType};

fn score(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricType::L2Distance => l2_distance_sqr(a, b),
        MetricType::CosineSimilarity => cosine_similarity(a, b),
        MetricType::InnerProduct => dot(a, b),
    }
}

fn within(metric: MetricType, score: f32, threshold: f32) -> bool {
    if metric.is_similarity() {
        score >= threshold
    } else {
        score <= threshold
    }
}

fn check_base(
    dim: usize,
    base: &[f32],
    null_flags: Option<&[u8]>,
    ids: Option<&[i64]>,
) -> Result<usize, IndexError> {
    if dim == 0 {
        return Err(IndexError::invalid_parameter("dim", "dimension must be positive"));
    }
    if base.len() % dim != 0 {
        return Err(IndexError::DimensionMismatch {
            row: Some(base.len() / dim),
            expected: dim,
            actual: base.len() % dim,
        });
    }
    let n = base.len() / dim;
    if null_flags.is_some_and(|flags| flags.len() != n) {
        return Err(IndexError::invalid_parameter("null_flags", format!("expected {n} flags")));
    }
    if ids.is_some_and(|ids| ids.len() != n) {
        return Err(IndexError::invalid_parameter("ids", format!("expected {n} ids")));
    }
    Ok(n)
}

/// Rows that take part in the search, with their reported ids.
fn live_rows<'a>(
    dim: usize,
    base: &'a [f32],
    null_flags: Option<&'a [u8]>,
    ids: Option<&'a [i64]>,
) -> impl Iterator<Item = (i64, &'a [f32])> + 'a {
    base.chunks_exact(dim)
        .enumerate()
        .filter(move |(row, _)| null_flags.map_or(true, |flags| flags[*row] == 0))
        .map(move |(row, v)| (ids.map_or(row as i64, |ids| ids[row]), v))
}

/// Exact k nearest neighbours of every query, best first.
pub fn brute_force_top_k(
    dim: usize,
    base: &[f32],
    null_flags: Option<&[u8]>,
    ids: Option<&[i64]>,
    queries: &[f32],
    metric: MetricType,
    k: usize,
) -> Result<Vec<Vec<SearchResult>>, IndexError> {
    check_base(dim, base, null_flags, ids)?;
    if queries.len() % dim != 0 {
        return Err(IndexError::DimensionMismatch {
            row: Some(queries.len() / dim),
            expected: dim,
            actual: queries.len() % dim,
        });
    }
    Ok(queries
        .par_chunks_exact(dim)
        .map(|query| {
            let mut top = TopK::new(k, metric);
            for (id, v) in live_rows(dim, base, null_flags, ids) {
                top.push(id, score(metric, query, v));
            }
            top.into_sorted()
        })
        .collect())
}

/// Every row within `threshold` of `query`: distance at most `threshold`, or
/// similarity at least `threshold`. `order` must be ascending for distance
/// metrics and descending for similarity metrics.
#[allow(clippy::too_many_arguments)]
pub fn brute_force_range_search(
    metric: MetricType,
    dim: usize,
    base: &[f32],
    null_flags: Option<&[u8]>,
    ids: Option<&[i64]>,
    query: &[f32],
    threshold: f32,
    limit: Option<usize>,
    order: ResultOrder,
) -> Result<Vec<SearchResult>, IndexError> {
    check_order(metric, order)?;
    check_base(dim, base, null_flags, ids)?;
    if query.len() != dim {
        return Err(IndexError::DimensionMismatch {
            row: None,
            expected: dim,
            actual: query.len(),
        });
    }
    let mut results: Vec<SearchResult> = live_rows(dim, base, null_flags, ids)
        .filter_map(|(id, v)| {
            let score = score(metric, query, v);
            within(metric, score, threshold).then_some(SearchResult { id, score })
        })
        .collect();
    sort_results(&mut results, metric);
    if let Some(limit) = limit {
        results.truncate(limit);
    }
    Ok(results)
}
