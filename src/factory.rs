//! Family dispatch.
//!
//! Each supported [`IndexType`] maps to one [`FamilyEntry`] of constructor
//! functions. Every `create_*_from_meta` call resolves the family declared in
//! the meta first, so an unknown or unset tag always fails here with
//! [`IndexError::UnsupportedIndexType`].

use crate::builder::{HnswIndexBuilder, IndexBuilder, IvfPqIndexBuilder};
use crate::meta::{IndexMeta, IndexType};
use crate::reader::{IndexReader, NativeIndexReader};
use crate::searcher::{AnnSearcher, HnswSearcher, IvfPqSearcher};
use crate::writer::{IndexWriter, NativeIndexWriter};
use crate::IndexError;

type BuilderCtor = fn(&IndexMeta) -> Result<Box<dyn IndexBuilder>, IndexError>;
type WriterCtor = fn(&IndexMeta) -> Result<Box<dyn IndexWriter>, IndexError>;
type ReaderCtor = fn(&IndexMeta) -> Result<Box<dyn IndexReader>, IndexError>;
type SearcherCtor = fn(&IndexMeta) -> Result<Box<dyn AnnSearcher>, IndexError>;

struct FamilyEntry {
    index_type: IndexType,
    builder: BuilderCtor,
    writer: WriterCtor,
    reader: ReaderCtor,
    searcher: SearcherCtor,
}

fn native_writer(meta: &IndexMeta) -> Result<Box<dyn IndexWriter>, IndexError> {
    Ok(Box::new(NativeIndexWriter::from_meta(meta)?))
}

fn native_reader(meta: &IndexMeta) -> Result<Box<dyn IndexReader>, IndexError> {
    Ok(Box::new(NativeIndexReader::from_meta(meta)?))
}

fn hnsw_builder(meta: &IndexMeta) -> Result<Box<dyn IndexBuilder>, IndexError> {
    Ok(Box::new(HnswIndexBuilder::from_meta(meta)?))
}

fn ivf_pq_builder(meta: &IndexMeta) -> Result<Box<dyn IndexBuilder>, IndexError> {
    Ok(Box::new(IvfPqIndexBuilder::from_meta(meta)?))
}

fn hnsw_searcher(meta: &IndexMeta) -> Result<Box<dyn AnnSearcher>, IndexError> {
    Ok(Box::new(HnswSearcher::from_meta(meta)?))
}

fn ivf_pq_searcher(meta: &IndexMeta) -> Result<Box<dyn AnnSearcher>, IndexError> {
    Ok(Box::new(IvfPqSearcher::from_meta(meta)?))
}

static FAMILIES: &[FamilyEntry] = &[
    FamilyEntry {
        index_type: IndexType::Hnsw,
        builder: hnsw_builder,
        writer: native_writer,
        reader: native_reader,
        searcher: hnsw_searcher,
    },
    FamilyEntry {
        index_type: IndexType::IvfPq,
        builder: ivf_pq_builder,
        writer: native_writer,
        reader: native_reader,
        searcher: ivf_pq_searcher,
    },
];

fn family(meta: &IndexMeta) -> Result<&'static FamilyEntry, IndexError> {
    let index_type = meta.index_type()?;
    FAMILIES
        .iter()
        .find(|entry| entry.index_type == index_type)
        .ok_or_else(|| IndexError::UnsupportedIndexType(index_type.to_string()))
}

/// Families with a registered implementation.
pub fn supported_index_types() -> impl Iterator<Item = IndexType> {
    FAMILIES.iter().map(|entry| entry.index_type)
}

/// Constructs the build-side objects of the family named in a meta.
pub struct IndexFactory;

impl IndexFactory {
    pub fn create_builder_from_meta(meta: &IndexMeta) -> Result<Box<dyn IndexBuilder>, IndexError> {
        let entry = family(meta)?;
        tracing::debug!(index_type = %entry.index_type, "creating index builder");
        (entry.builder)(meta)
    }

    pub fn create_writer_from_meta(meta: &IndexMeta) -> Result<Box<dyn IndexWriter>, IndexError> {
        (family(meta)?.writer)(meta)
    }

    pub fn create_reader_from_meta(meta: &IndexMeta) -> Result<Box<dyn IndexReader>, IndexError> {
        (family(meta)?.reader)(meta)
    }
}

/// Constructs searchers for the family named in a meta.
pub struct AnnSearcherFactory;

impl AnnSearcherFactory {
    pub fn create_searcher_from_meta(meta: &IndexMeta) -> Result<Box<dyn AnnSearcher>, IndexError> {
        let entry = family(meta)?;
        tracing::debug!(index_type = %entry.index_type, "creating searcher");
        (entry.searcher)(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::LifecycleState;
    use crate::meta::Section;

    fn meta(index_type: IndexType) -> IndexMeta {
        let mut meta = IndexMeta::new(index_type);
        meta.set(Section::Common, "dim", 8)
            .set(Section::Common, "metric_type", "l2_distance");
        meta
    }

    #[test]
    fn every_family_is_registered() {
        let types: Vec<IndexType> = supported_index_types().collect();
        assert_eq!(types, vec![IndexType::Hnsw, IndexType::IvfPq]);
        for index_type in types {
            let meta = meta(index_type);
            let builder = IndexFactory::create_builder_from_meta(&meta).unwrap();
            assert_eq!(builder.state(), LifecycleState::Unopened);
            IndexFactory::create_writer_from_meta(&meta).unwrap();
            IndexFactory::create_reader_from_meta(&meta).unwrap();
            let searcher = AnnSearcherFactory::create_searcher_from_meta(&meta).unwrap();
            assert!(!searcher.is_index_loaded());
        }
    }

    #[test]
    fn unknown_tag_is_reported_by_name() {
        let mut meta = IndexMeta::from_json_str(r#"{"index_type": "diskann"}"#).unwrap();
        meta.set(Section::Common, "dim", 4);
        match IndexFactory::create_builder_from_meta(&meta) {
            Err(IndexError::UnsupportedIndexType(tag)) => assert_eq!(tag, "diskann"),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert!(matches!(
            AnnSearcherFactory::create_searcher_from_meta(&meta),
            Err(IndexError::UnsupportedIndexType(_))
        ));
    }

    #[test]
    fn unset_tag_is_unsupported() {
        let meta = IndexMeta::from_json_str("{}").unwrap();
        assert!(matches!(
            IndexFactory::create_reader_from_meta(&meta),
            Err(IndexError::UnsupportedIndexType(_))
        ));
    }

    #[test]
    fn family_parameters_are_validated_at_construction() {
        let mut meta = meta(IndexType::IvfPq);
        meta.set(Section::Index, "M", 3);
        assert!(matches!(
            IndexFactory::create_builder_from_meta(&meta),
            Err(IndexError::InvalidParameter { .. })
        ));
    }
}
