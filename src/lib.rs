pub mod bruteforce;
pub mod builder;
pub mod cache;
pub mod factory;
pub mod filter;
pub mod handle;
pub mod hnsw;
pub mod ivf_pq;
pub mod meta;
pub mod params;
pub mod persist;
pub mod pq;
pub mod reader;
pub mod searcher;
pub mod seq_view;
pub mod threads;
pub mod writer;

mod kmeans;
mod math;

pub use builder::{HnswIndexBuilder, IndexBuilder, IvfPqIndexBuilder, LifecycleState};
pub use cache::{CacheCapacity, CacheHandle, CacheStats, IndexCache, IndexCacheConfig};
pub use factory::{AnnSearcherFactory, IndexFactory};
pub use filter::{ArrayIdFilter, BitmapIdFilter, IdFilter, RangeIdFilter};
pub use handle::{IndexHandle, IndexRef, NativeIndex};
pub use meta::{IndexMeta, IndexType, Section};
pub use reader::{IndexReader, LoadedIndex};
pub use searcher::{AnnSearcher, ResultOrder, SearchResult};
pub use seq_view::{ColumnView, PrimitiveSlice, PrimitiveType};
pub use writer::IndexWriter;

// Re-export RoaringBitmap so callers can build bitmap filters without a direct dependency.
pub use roaring::RoaringBitmap;


/// Distance or similarity function used to score vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Squared Euclidean distance, smaller is closer.
    L2Distance,
    /// Cosine similarity, larger is closer.
    CosineSimilarity,
    /// Inner product, larger is closer.
    InnerProduct,
}

impl MetricType {
    /// Whether larger scores mean closer vectors.
    pub fn is_similarity(self) -> bool {
        !matches!(self, MetricType::L2Distance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::L2Distance => "l2_distance",
            MetricType::CosineSimilarity => "cosine_similarity",
            MetricType::InnerProduct => "inner_product",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle violations. Every variant surfaces as [`IndexError::InvalidState`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("{0} has already been opened")]
    AlreadyOpened(&'static str),
    #[error("{0} has not been opened")]
    NotOpened(&'static str),
    #[error("{0} has already been closed")]
    AlreadyClosed(&'static str),
    /// Returned by `flush` when no row has reached the native index yet.
    #[error("index builder is not ready: no data has been added")]
    BuilderNotReady,
    /// Returned when a built index has been shared and can no longer be mutated.
    #[error("index has been shared and can no longer be modified")]
    IndexShared,
    #[error("no index has been loaded")]
    IndexNotLoaded,
    #[error("{0} has already been initialized")]
    AlreadyInitialized(&'static str),
}

/// Errors that can occur when building, persisting, caching or querying an index.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// Returned when an operation is called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(#[from] StateError),
    /// Returned when the configuration document lacks a required key.
    #[error("missing required parameter `{0}`")]
    MissingRequiredParameter(String),
    /// Returned when a parameter or an input argument is malformed or out of range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },
    /// Returned when the requested index family has no registered implementation.
    #[error("unsupported index type: {0}")]
    UnsupportedIndexType(String),
    /// Returned when a handle does not hold the family an operation expects.
    #[error("index type mismatch: expected {expected}, got {actual}")]
    IndexTypeMismatch {
        expected: meta::IndexType,
        actual: meta::IndexType,
    },
    /// Returned when the dimension of an input vector does not match the index.
    #[error("dimension mismatch{}: expected {expected}, got {actual}", describe_row(.row))]
    DimensionMismatch {
        row: Option<usize>,
        expected: usize,
        actual: usize,
    },
    /// Returned when a range search asks for an order the metric cannot honour.
    #[error("unsupported result order {order:?} for metric {metric}")]
    UnsupportedOrder {
        order: searcher::ResultOrder,
        metric: MetricType,
    },
    /// Returned when the native index primitives fail (training, encoding, graph search).
    #[error("native index error: {0}")]
    NativeLibraryError(String),
    /// Returned when persistence encounters an I/O failure.
    #[error("i/o error while reading or writing an index: {0}")]
    Io(#[from] std::io::Error),
    /// Returned when the persisted bytes are inconsistent or corrupt.
    #[error("invalid persisted index: {0}")]
    InvalidPersistence(String),
}

impl IndexError {
    pub(crate) fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        IndexError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error reports lifecycle misuse.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, IndexError::InvalidState(_))
    }
}

fn describe_row(row: &Option<usize>) -> String {
    match row {
        Some(row) => format!(" at row {row}"),
        None => String::new(),
    }
}
