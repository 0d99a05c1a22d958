//! Product quantizer: splits a vector into `m` sub-vectors and encodes each one
//! as the index of its nearest sub-centroid.

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::kmeans::{nearest_centroid, run_kmeans};
use crate::math::l2_distance_sqr;
use crate::IndexError;

const TRAIN_ITERATIONS: usize = 25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dim: usize,
    m: usize,
    nbits: usize,
    dsub: usize,
    ksub: usize,
    /// `m` codebooks of `ksub * dsub` values each.
    codebooks: Vec<f32>,
}

impl ProductQuantizer {
    /// Train the codebooks on row-major `data`.
    pub fn train(
        data: &[f32],
        dim: usize,
        m: usize,
        nbits: usize,
        rng: &mut StdRng,
    ) -> Result<Self, IndexError> {
        if m == 0 || dim % m != 0 {
            return Err(IndexError::invalid_parameter(
                "M",
                format!("{m} does not divide the dimension {dim}"),
            ));
        }
        if !(1..=8).contains(&nbits) {
            return Err(IndexError::invalid_parameter("nbits", "must be between 1 and 8"));
        }
        if data.is_empty() || data.len() % dim != 0 {
            return Err(IndexError::NativeLibraryError(
                "product quantizer needs at least one training vector".to_string(),
            ));
        }

        let n = data.len() / dim;
        let dsub = dim / m;
        let ksub = 1usize << nbits;
        if n < ksub {
            tracing::warn!(n, ksub, "training set smaller than the codebook size");
        }

        let mut codebooks = Vec::with_capacity(m * ksub * dsub);
        let mut sub = vec![0.0f32; n * dsub];
        for sq in 0..m {
            for (dst, src) in sub.chunks_exact_mut(dsub).zip(data.chunks_exact(dim)) {
                dst.copy_from_slice(&src[sq * dsub..(sq + 1) * dsub]);
            }
            let mut sub_rng = StdRng::seed_from_u64(rng.gen());
            let result = run_kmeans(&sub, dsub, ksub, TRAIN_ITERATIONS, &mut sub_rng);
            codebooks.extend_from_slice(&result.centroids);
        }

        Ok(Self {
            dim,
            m,
            nbits,
            dsub,
            ksub,
            codebooks,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Bytes per encoded vector.
    pub fn code_size(&self) -> usize {
        self.m
    }

    pub fn nbits(&self) -> usize {
        self.nbits
    }

    fn codebook(&self, sq: usize) -> &[f32] {
        let len = self.ksub * self.dsub;
        &self.codebooks[sq * len..(sq + 1) * len]
    }

    fn centroid(&self, sq: usize, code: u8) -> &[f32] {
        let start = code as usize * self.dsub;
        &self.codebook(sq)[start..start + self.dsub]
    }

    /// Encode one vector into `code`, which holds [`Self::code_size`] bytes.
    pub fn compute_code(&self, x: &[f32], code: &mut [u8]) {
        debug_assert_eq!(x.len(), self.dim);
        for (sq, slot) in code.iter_mut().enumerate().take(self.m) {
            let sub = &x[sq * self.dsub..(sq + 1) * self.dsub];
            let (best, _) = nearest_centroid(sub, self.codebook(sq), self.dsub);
            *slot = best as u8;
        }
    }

    /// Reconstruct the approximation of a vector from its code.
    pub fn decode(&self, code: &[u8], out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.dim);
        for (sq, dst) in out.chunks_exact_mut(self.dsub).enumerate() {
            dst.copy_from_slice(self.centroid(sq, code[sq]));
        }
    }

    /// Squared distances from each sub-vector of `x` to every sub-centroid,
    /// laid out as `m` rows of `ksub` entries.
    pub fn compute_distance_table(&self, x: &[f32]) -> Vec<f32> {
        let mut table = Vec::with_capacity(self.m * self.ksub);
        for sq in 0..self.m {
            let sub = &x[sq * self.dsub..(sq + 1) * self.dsub];
            table.extend(
                self.codebook(sq)
                    .chunks_exact(self.dsub)
                    .map(|centroid| l2_distance_sqr(sub, centroid)),
            );
        }
        table
    }

    /// Asymmetric distance of a code against a precomputed table.
    #[inline]
    pub fn distance_to_code(&self, table: &[f32], code: &[u8]) -> f32 {
        code.iter()
            .enumerate()
            .map(|(sq, c)| table[sq * self.ksub + *c as usize])
            .sum()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.codebooks.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_data(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn rejects_m_that_does_not_divide_dim() {
        let data = random_data(32, 6, 1);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            ProductQuantizer::train(&data, 6, 4, 4, &mut rng),
            Err(IndexError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn table_distance_matches_decoded_distance() {
        let dim = 8;
        let data = random_data(256, dim, 2);
        let mut rng = StdRng::seed_from_u64(3);
        let pq = ProductQuantizer::train(&data, dim, 4, 4, &mut rng).unwrap();

        let query = &data[..dim];
        let table = pq.compute_distance_table(query);
        let mut code = vec![0u8; pq.code_size()];
        let mut decoded = vec![0.0f32; dim];
        for row in data.chunks_exact(dim).skip(1).take(16) {
            pq.compute_code(row, &mut code);
            pq.decode(&code, &mut decoded);
            let via_table = pq.distance_to_code(&table, &code);
            let direct = l2_distance_sqr(query, &decoded);
            assert!((via_table - direct).abs() < 1e-4, "{via_table} vs {direct}");
        }
    }

    #[test]
    fn exact_when_codebook_covers_the_data() {
        // Four distinct points and sixteen centroids per sub-space.
        let data = vec![0.0f32, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let mut rng = StdRng::seed_from_u64(4);
        let pq = ProductQuantizer::train(&data, 2, 2, 4, &mut rng).unwrap();
        let mut code = vec![0u8; 2];
        let mut decoded = vec![0.0f32; 2];
        for row in data.chunks_exact(2) {
            pq.compute_code(row, &mut code);
            pq.decode(&code, &mut decoded);
            assert_eq!(decoded, row);
        }
    }
}
