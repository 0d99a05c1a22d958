use rand::prelude::*;
use rayon::prelude::*;

use crate::math::l2_distance_sqr;

/// Centroids are stored row-major, `k * dim` values.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    pub centroids: Vec<f32>,
    pub assignments: Vec<usize>,
}

/// Run Lloyd's k-means with k-means++ seeding over `data`, a row-major
/// matrix of `data.len() / dim` points.
///
/// Callers guarantee `dim > 0`, `k > 0` and at least one point.
pub fn run_kmeans(data: &[f32], dim: usize, k: usize, max_iter: usize, rng: &mut StdRng) -> KMeansResult {
    debug_assert!(dim > 0 && k > 0 && !data.is_empty());
    let n = data.len() / dim;
    if k > n {
        tracing::warn!(k, n, "fewer training points than clusters, centroids will repeat");
    }

    let mut centroids = seed_plus_plus(data, dim, k, rng);
    let mut assignments = vec![usize::MAX; n];

    for iteration in 0..max_iter {
        let changed: usize = assignments
            .par_iter_mut()
            .zip(data.par_chunks_exact(dim))
            .map(|(assignment, point)| {
                let (best, _) = nearest_centroid(point, &centroids, dim);
                if *assignment != best {
                    *assignment = best;
                    1usize
                } else {
                    0usize
                }
            })
            .sum();

        if changed == 0 {
            tracing::trace!(iteration, "k-means converged");
            break;
        }

        update_centroids(data, dim, &assignments, &mut centroids, rng);
    }

    KMeansResult {
        centroids,
        assignments,
    }
}

/// Index and squared distance of the centroid closest to `point`.
pub fn nearest_centroid(point: &[f32], centroids: &[f32], dim: usize) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_distance = f32::MAX;
    for (cid, centroid) in centroids.chunks_exact(dim).enumerate() {
        let dist = l2_distance_sqr(point, centroid);
        if dist < best_distance {
            best_distance = dist;
            best = cid;
        }
    }
    (best, best_distance)
}

fn seed_plus_plus(data: &[f32], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len() / dim;
    let mut centroids = Vec::with_capacity(k * dim);
    let mut chosen = vec![false; n];

    let first = rng.gen_range(0..n);
    centroids.extend_from_slice(row(data, dim, first));
    chosen[first] = true;
    let mut seeded = 1usize;

    while seeded < k {
        let distances: Vec<f64> = data
            .par_chunks_exact(dim)
            .map(|point| nearest_centroid(point, &centroids, dim).1 as f64)
            .collect();
        let total: f64 = distances.iter().sum();
        if total <= f64::EPSILON {
            // Every point coincides with a centroid; repeat existing ones.
            while seeded < k {
                let src = (seeded % (centroids.len() / dim)) * dim;
                centroids.extend_from_within(src..src + dim);
                seeded += 1;
            }
            break;
        }

        let mut target = rng.gen::<f64>() * total;
        let mut next = n - 1;
        for (idx, weight) in distances.iter().enumerate() {
            target -= *weight;
            if target <= 0.0 {
                next = idx;
                break;
            }
        }
        if chosen[next] {
            next = (0..n).find(|i| !chosen[*i]).unwrap_or(next);
        }
        centroids.extend_from_slice(row(data, dim, next));
        chosen[next] = true;
        seeded += 1;
    }

    centroids
}

fn update_centroids(
    data: &[f32],
    dim: usize,
    assignments: &[usize],
    centroids: &mut [f32],
    rng: &mut StdRng,
) {
    let k = centroids.len() / dim;
    let n = data.len() / dim;

    let (sums, counts) = data
        .par_chunks_exact(dim)
        .zip(assignments.par_iter())
        .fold(
            || (vec![0.0f32; k * dim], vec![0usize; k]),
            |mut acc, (point, &cluster)| {
                acc.1[cluster] += 1;
                let sum = &mut acc.0[cluster * dim..(cluster + 1) * dim];
                for (s, v) in sum.iter_mut().zip(point) {
                    *s += *v;
                }
                acc
            },
        )
        .reduce(
            || (vec![0.0f32; k * dim], vec![0usize; k]),
            |mut left, right| {
                for (dst, src) in left.0.iter_mut().zip(&right.0) {
                    *dst += *src;
                }
                for (dst, src) in left.1.iter_mut().zip(&right.1) {
                    *dst += *src;
                }
                left
            },
        );

    for cid in 0..k {
        let centroid = &mut centroids[cid * dim..(cid + 1) * dim];
        if counts[cid] == 0 {
            let idx = rng.gen_range(0..n);
            centroid.copy_from_slice(row(data, dim, idx));
        } else {
            let inv = 1.0f32 / counts[cid] as f32;
            for (c, s) in centroid.iter_mut().zip(&sums[cid * dim..(cid + 1) * dim]) {
                *c = s * inv;
            }
        }
    }
}

#[inline]
fn row(data: &[f32], dim: usize, idx: usize) -> &[f32] {
    &data[idx * dim..(idx + 1) * dim]
}
