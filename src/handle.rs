//! Type-erased, shareable index handles.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::hnsw::HnswIndex;
use crate::ivf_pq::IvfPqIndex;
use crate::meta::IndexType;
use crate::IndexError;

/// Concrete index held by an [`IndexHandle`].
pub enum NativeIndex {
    Hnsw(HnswIndex),
    IvfPq(IvfPqIndex),
    /// Index owned by an implementation outside this crate.
    External(Box<dyn Any + Send + Sync>),
}

/// An index tagged with its family. Accessors check the tag before handing
/// out the concrete type.
pub struct IndexHandle {
    index_type: IndexType,
    native: NativeIndex,
}

/// Shared, immutable reference to a built index.
pub type IndexRef = Arc<IndexHandle>;

impl IndexHandle {
    pub fn hnsw(index: HnswIndex) -> Self {
        Self {
            index_type: IndexType::Hnsw,
            native: NativeIndex::Hnsw(index),
        }
    }

    pub fn ivf_pq(index: IvfPqIndex) -> Self {
        Self {
            index_type: IndexType::IvfPq,
            native: NativeIndex::IvfPq(index),
        }
    }

    pub fn external<T: Any + Send + Sync>(index_type: IndexType, value: T) -> Self {
        Self {
            index_type,
            native: NativeIndex::External(Box::new(value)),
        }
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn native(&self) -> &NativeIndex {
        &self.native
    }

    fn mismatch(&self, expected: IndexType) -> IndexError {
        IndexError::IndexTypeMismatch {
            expected,
            actual: self.index_type,
        }
    }

    pub fn as_hnsw(&self) -> Result<&HnswIndex, IndexError> {
        match &self.native {
            NativeIndex::Hnsw(index) if self.index_type == IndexType::Hnsw => Ok(index),
            _ => Err(self.mismatch(IndexType::Hnsw)),
        }
    }

    pub fn as_hnsw_mut(&mut self) -> Result<&mut HnswIndex, IndexError> {
        let actual = self.index_type;
        match &mut self.native {
            NativeIndex::Hnsw(index) if actual == IndexType::Hnsw => Ok(index),
            _ => Err(IndexError::IndexTypeMismatch {
                expected: IndexType::Hnsw,
                actual,
            }),
        }
    }

    pub fn as_ivf_pq(&self) -> Result<&IvfPqIndex, IndexError> {
        match &self.native {
            NativeIndex::IvfPq(index) if self.index_type == IndexType::IvfPq => Ok(index),
            _ => Err(self.mismatch(IndexType::IvfPq)),
        }
    }

    pub fn as_ivf_pq_mut(&mut self) -> Result<&mut IvfPqIndex, IndexError> {
        let actual = self.index_type;
        match &mut self.native {
            NativeIndex::IvfPq(index) if actual == IndexType::IvfPq => Ok(index),
            _ => Err(IndexError::IndexTypeMismatch {
                expected: IndexType::IvfPq,
                actual,
            }),
        }
    }

    /// Borrow an external index as `T`. `None` when the handle is native or
    /// holds another type.
    pub fn downcast_external<T: Any>(&self) -> Option<&T> {
        match &self.native {
            NativeIndex::External(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Number of indexed vectors; 0 for external indexes.
    pub fn len(&self) -> usize {
        match &self.native {
            NativeIndex::Hnsw(index) => index.len(),
            NativeIndex::IvfPq(index) => index.len(),
            NativeIndex::External(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate heap footprint in bytes, used as the cache charge.
    pub fn memory_usage(&self) -> usize {
        match &self.native {
            NativeIndex::Hnsw(index) => index.memory_usage(),
            NativeIndex::IvfPq(index) => index.memory_usage(),
            NativeIndex::External(_) => std::mem::size_of::<Self>(),
        }
    }
}

impl fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("IndexHandle");
        s.field("index_type", &self.index_type);
        match &self.native {
            NativeIndex::Hnsw(index) => s.field("native", index),
            NativeIndex::IvfPq(index) => s.field("len", &index.len()),
            NativeIndex::External(_) => s.field("native", &"<external>"),
        };
        s.finish()
    }
}

impl Drop for IndexHandle {
    fn drop(&mut self) {
        tracing::trace!(index_type = %self.index_type, len = self.len(), "dropping index");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricType;

    #[test]
    fn accessors_check_the_family() {
        let index = HnswIndex::new(4, MetricType::L2Distance, false, 16, 40).unwrap();
        let handle = IndexHandle::hnsw(index);
        assert!(handle.as_hnsw().is_ok());
        match handle.as_ivf_pq() {
            Err(IndexError::IndexTypeMismatch { expected, actual }) => {
                assert_eq!(expected, IndexType::IvfPq);
                assert_eq!(actual, IndexType::Hnsw);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn external_handles_downcast_by_type() {
        let handle = IndexHandle::external(IndexType::IvfPq, String::from("opaque"));
        assert_eq!(handle.downcast_external::<String>().map(String::as_str), Some("opaque"));
        assert!(handle.downcast_external::<u32>().is_none());
        assert!(handle.as_ivf_pq().is_err());
        assert!(handle.is_empty());
    }
}
