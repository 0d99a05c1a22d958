//! Typed parameter groups fetched from an [`IndexMeta`].
//!
//! Each group knows its keys, which of them are required and what the
//! defaults are. [`FetchParams::fetch`] reads the group and runs its
//! cross-field validation before returning, so nothing downstream ever sees
//! an unvalidated group.

use serde::{Deserialize, Serialize};

use crate::meta::{IndexMeta, Section};
use crate::{IndexError, MetricType};

/// A parameter group that can be read from an [`IndexMeta`].
pub trait FetchParams: Sized {
    /// Read the group and validate it.
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError>;

    /// Check cross-field constraints.
    fn validate(&self) -> Result<(), IndexError>;
}

/// Overwrite `target` when `key` is present in `section`.
fn fetch_optional<T: serde::de::DeserializeOwned>(
    meta: &IndexMeta,
    section: Section,
    key: &str,
    target: &mut T,
) -> Result<(), IndexError> {
    if let Some(value) = meta.optional(section, key)? {
        *target = value;
    }
    Ok(())
}

fn out_of_range(key: &str, reason: impl Into<String>) -> IndexError {
    IndexError::invalid_parameter(key, reason)
}

/// Parameters shared by every vector index family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexCommonParams {
    pub dim: usize,
    pub metric_type: MetricType,
    pub is_vector_normed: bool,
}

impl VectorIndexCommonParams {
    pub const DIM_KEY: &'static str = "dim";
    pub const METRIC_TYPE_KEY: &'static str = "metric_type";
    pub const IS_VECTOR_NORMED_KEY: &'static str = "is_vector_normed";

    /// Fail unless the metric is one of `supported`.
    pub fn require_metric(&self, family: &str, supported: &[MetricType]) -> Result<(), IndexError> {
        if supported.contains(&self.metric_type) {
            return Ok(());
        }
        let names: Vec<&str> = supported.iter().map(|m| m.as_str()).collect();
        Err(out_of_range(
            Self::METRIC_TYPE_KEY,
            format!(
                "{} is not supported by {family}, expected one of [{}]",
                self.metric_type,
                names.join(", ")
            ),
        ))
    }
}

impl FetchParams for VectorIndexCommonParams {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let mut params = Self {
            dim: meta.required(Section::Common, Self::DIM_KEY)?,
            metric_type: meta.required(Section::Common, Self::METRIC_TYPE_KEY)?,
            is_vector_normed: false,
        };
        fetch_optional(
            meta,
            Section::Common,
            Self::IS_VECTOR_NORMED_KEY,
            &mut params.is_vector_normed,
        )?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.dim == 0 {
            return Err(out_of_range(Self::DIM_KEY, "dimension must be positive"));
        }
        Ok(())
    }
}

/// Free-form parameters carried alongside the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexExtraParams {
    pub comments: Option<String>,
}

impl VectorIndexExtraParams {
    pub const COMMENTS_KEY: &'static str = "comments";
}

impl FetchParams for VectorIndexExtraParams {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let params = Self {
            comments: meta.optional(Section::Extra, Self::COMMENTS_KEY)?,
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Build parameters of the graph family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswIndexParams {
    /// Maximum number of neighbours per node.
    pub m: usize,
    pub ef_construction: usize,
}

impl HnswIndexParams {
    pub const M_KEY: &'static str = "M";
    pub const EF_CONSTRUCTION_KEY: &'static str = "efConstruction";
}

impl Default for HnswIndexParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 40,
        }
    }
}

impl FetchParams for HnswIndexParams {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let mut params = Self::default();
        fetch_optional(meta, Section::Index, Self::M_KEY, &mut params.m)?;
        fetch_optional(
            meta,
            Section::Index,
            Self::EF_CONSTRUCTION_KEY,
            &mut params.ef_construction,
        )?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if !(2..=255).contains(&self.m) {
            return Err(out_of_range(Self::M_KEY, "must be between 2 and 255"));
        }
        if self.ef_construction == 0 {
            return Err(out_of_range(Self::EF_CONSTRUCTION_KEY, "must be positive"));
        }
        Ok(())
    }
}

/// Search parameters of the graph family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswSearchParams {
    pub ef_search: usize,
}

impl HnswSearchParams {
    pub const EF_SEARCH_KEY: &'static str = "efSearch";
}

impl Default for HnswSearchParams {
    fn default() -> Self {
        Self { ef_search: 16 }
    }
}

impl FetchParams for HnswSearchParams {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let mut params = Self::default();
        fetch_optional(meta, Section::Search, Self::EF_SEARCH_KEY, &mut params.ef_search)?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.ef_search == 0 {
            return Err(out_of_range(Self::EF_SEARCH_KEY, "must be positive"));
        }
        Ok(())
    }
}

/// Build parameters of the inverted-file family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfPqIndexParams {
    /// Number of inverted lists (coarse centroids).
    pub nlist: usize,
    /// Number of PQ sub-quantizers; must divide the dimension.
    pub m: usize,
    /// Bits per sub-quantizer code.
    pub nbits: usize,
}

impl IvfPqIndexParams {
    pub const NLIST_KEY: &'static str = "nlist";
    pub const M_KEY: &'static str = "M";
    pub const NBITS_KEY: &'static str = "nbits";

    /// `M` must split `dim` evenly.
    pub fn validate_against(&self, common: &VectorIndexCommonParams) -> Result<(), IndexError> {
        if common.dim % self.m != 0 {
            return Err(out_of_range(
                Self::M_KEY,
                format!("{} does not divide the dimension {}", self.m, common.dim),
            ));
        }
        Ok(())
    }
}

impl Default for IvfPqIndexParams {
    fn default() -> Self {
        Self {
            nlist: 16,
            m: 8,
            nbits: 8,
        }
    }
}

impl FetchParams for IvfPqIndexParams {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let mut params = Self::default();
        fetch_optional(meta, Section::Index, Self::NLIST_KEY, &mut params.nlist)?;
        fetch_optional(meta, Section::Index, Self::M_KEY, &mut params.m)?;
        fetch_optional(meta, Section::Index, Self::NBITS_KEY, &mut params.nbits)?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.nlist == 0 {
            return Err(out_of_range(Self::NLIST_KEY, "must be positive"));
        }
        if self.m == 0 {
            return Err(out_of_range(Self::M_KEY, "must be positive"));
        }
        if !(1..=8).contains(&self.nbits) {
            return Err(out_of_range(Self::NBITS_KEY, "must be between 1 and 8"));
        }
        Ok(())
    }
}

/// Search parameters of the inverted-file family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfPqSearchParams {
    /// Number of inverted lists probed per query.
    pub nprobe: usize,
    /// Maximum number of codes scanned per query, 0 for no limit.
    pub max_codes: usize,
    /// Weight of the reconstruction-error correction in range search, in [0, 1].
    pub range_search_confidence: f32,
}

impl IvfPqSearchParams {
    pub const NPROBE_KEY: &'static str = "nprobe";
    pub const MAX_CODES_KEY: &'static str = "max_codes";
    pub const RANGE_SEARCH_CONFIDENCE_KEY: &'static str = "range_search_confidence";

    /// Multiplier applied to each stored reconstruction error at scan time.
    pub fn error_scale(&self) -> f32 {
        self.range_search_confidence
    }
}

impl Default for IvfPqSearchParams {
    fn default() -> Self {
        Self {
            nprobe: 1,
            max_codes: 0,
            range_search_confidence: 0.0,
        }
    }
}

impl FetchParams for IvfPqSearchParams {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let mut params = Self::default();
        fetch_optional(meta, Section::Search, Self::NPROBE_KEY, &mut params.nprobe)?;
        fetch_optional(meta, Section::Search, Self::MAX_CODES_KEY, &mut params.max_codes)?;
        fetch_optional(
            meta,
            Section::Search,
            Self::RANGE_SEARCH_CONFIDENCE_KEY,
            &mut params.range_search_confidence,
        )?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.nprobe == 0 {
            return Err(out_of_range(Self::NPROBE_KEY, "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.range_search_confidence) {
            return Err(out_of_range(
                Self::RANGE_SEARCH_CONFIDENCE_KEY,
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Options controlling where a writer publishes an index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexWriterOptions {
    /// Insert the written index into the index cache.
    pub write_index_cache: bool,
    /// Cache key to use instead of the index path.
    pub custom_cache_key: String,
}

impl IndexWriterOptions {
    pub const WRITE_INDEX_CACHE_KEY: &'static str = "write_index_cache";
    pub const CUSTOM_CACHE_KEY_KEY: &'static str = "custom_cache_key";
}

impl FetchParams for IndexWriterOptions {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let mut params = Self::default();
        fetch_optional(
            meta,
            Section::WriteIndex,
            Self::WRITE_INDEX_CACHE_KEY,
            &mut params.write_index_cache,
        )?;
        fetch_optional(
            meta,
            Section::WriteIndex,
            Self::CUSTOM_CACHE_KEY_KEY,
            &mut params.custom_cache_key,
        )?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Options controlling how a reader consults the index cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReaderOptions {
    /// Look the index up in the cache first and cache it after a disk read.
    pub cache_index_file: bool,
    /// Cache key to use instead of the index path.
    pub custom_cache_key: String,
    /// Always read from disk and replace whatever the cache holds.
    pub force_read_and_overwrite_cache: bool,
}

impl IndexReaderOptions {
    pub const CACHE_INDEX_FILE_KEY: &'static str = "cache_index_file";
    pub const CUSTOM_CACHE_KEY_KEY: &'static str = "custom_cache_key";
    pub const FORCE_READ_AND_OVERWRITE_CACHE_KEY: &'static str = "force_read_and_overwrite_cache";
}

impl FetchParams for IndexReaderOptions {
    fn fetch(meta: &IndexMeta) -> Result<Self, IndexError> {
        let mut params = Self::default();
        fetch_optional(
            meta,
            Section::ReadIndex,
            Self::CACHE_INDEX_FILE_KEY,
            &mut params.cache_index_file,
        )?;
        fetch_optional(
            meta,
            Section::ReadIndex,
            Self::CUSTOM_CACHE_KEY_KEY,
            &mut params.custom_cache_key,
        )?;
        fetch_optional(
            meta,
            Section::ReadIndex,
            Self::FORCE_READ_AND_OVERWRITE_CACHE_KEY,
            &mut params.force_read_and_overwrite_cache,
        )?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Pick the cache key: the custom key when set, otherwise the index path.
pub(crate) fn resolve_cache_key<'a>(custom_key: &'a str, path: &'a str) -> Option<&'a str> {
    if !custom_key.is_empty() {
        Some(custom_key)
    } else if !path.is_empty() {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::IndexType;

    fn ivf_pq_meta() -> IndexMeta {
        let mut meta = IndexMeta::new(IndexType::IvfPq);
        meta.set(Section::Common, "dim", 16)
            .set(Section::Common, "metric_type", "l2_distance");
        meta
    }

    #[test]
    fn common_params_require_dim_and_metric() {
        let mut meta = IndexMeta::new(IndexType::Hnsw);
        meta.set(Section::Common, "metric_type", "l2_distance");
        assert!(matches!(
            VectorIndexCommonParams::fetch(&meta),
            Err(IndexError::MissingRequiredParameter(key)) if key == "common.dim"
        ));

        meta.set(Section::Common, "dim", 0);
        assert!(matches!(
            VectorIndexCommonParams::fetch(&meta),
            Err(IndexError::InvalidParameter { name, .. }) if name == "dim"
        ));

        meta.set(Section::Common, "dim", 8);
        let params = VectorIndexCommonParams::fetch(&meta).unwrap();
        assert_eq!(params.dim, 8);
        assert!(!params.is_vector_normed);
    }

    #[test]
    fn unknown_metric_is_rejected_at_fetch() {
        let mut meta = ivf_pq_meta();
        meta.set(Section::Common, "metric_type", "hamming");
        assert!(matches!(
            VectorIndexCommonParams::fetch(&meta),
            Err(IndexError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn family_metric_restriction() {
        let mut meta = ivf_pq_meta();
        meta.set(Section::Common, "metric_type", "cosine_similarity");
        let common = VectorIndexCommonParams::fetch(&meta).unwrap();
        let err = common
            .require_metric("ivf_pq", &[MetricType::L2Distance])
            .unwrap_err();
        assert!(err.to_string().contains("cosine_similarity"));
    }

    #[test]
    fn ivf_pq_defaults_and_overrides() {
        let mut meta = ivf_pq_meta();
        let params = IvfPqIndexParams::fetch(&meta).unwrap();
        assert_eq!(params, IvfPqIndexParams::default());

        meta.set(Section::Index, "nlist", 4).set(Section::Index, "nbits", 9);
        assert!(matches!(
            IvfPqIndexParams::fetch(&meta),
            Err(IndexError::InvalidParameter { name, .. }) if name == "nbits"
        ));

        meta.set(Section::Index, "nbits", 4).set(Section::Index, "M", 3);
        let params = IvfPqIndexParams::fetch(&meta).unwrap();
        assert_eq!(params.nlist, 4);
        let common = VectorIndexCommonParams::fetch(&meta).unwrap();
        assert!(params.validate_against(&common).is_err());
    }

    #[test]
    fn range_search_confidence_must_be_a_fraction() {
        let mut meta = ivf_pq_meta();
        meta.set(Section::Search, "range_search_confidence", 1.5);
        assert!(IvfPqSearchParams::fetch(&meta).is_err());

        meta.set(Section::Search, "range_search_confidence", 0.25);
        let params = IvfPqSearchParams::fetch(&meta).unwrap();
        assert_eq!(params.error_scale(), 0.25);
    }

    #[test]
    fn reader_and_writer_options() {
        let mut meta = ivf_pq_meta();
        meta.set(Section::WriteIndex, "write_index_cache", true)
            .set(Section::WriteIndex, "custom_cache_key", "k1")
            .set(Section::ReadIndex, "cache_index_file", true);
        let writer = IndexWriterOptions::fetch(&meta).unwrap();
        assert!(writer.write_index_cache);
        assert_eq!(writer.custom_cache_key, "k1");
        let reader = IndexReaderOptions::fetch(&meta).unwrap();
        assert!(reader.cache_index_file);
        assert!(!reader.force_read_and_overwrite_cache);
        assert_eq!(reader.custom_cache_key, "");
    }

    #[test]
    fn cache_key_prefers_custom_key() {
        assert_eq!(resolve_cache_key("custom", "/tmp/a"), Some("custom"));
        assert_eq!(resolve_cache_key("", "/tmp/a"), Some("/tmp/a"));
        assert_eq!(resolve_cache_key("", ""), None);
    }
}
