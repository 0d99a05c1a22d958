//! Index metadata document.
//!
//! An [`IndexMeta`] carries everything needed to construct a builder, writer,
//! reader or searcher: the family tag plus six JSON namespaces. Typed access
//! goes through [`IndexMeta::required`] and [`IndexMeta::optional`]; the
//! parameter groups in [`crate::params`] are built on top of them.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::IndexError;

/// Current version written by [`IndexMeta::new`].
pub const META_VERSION: u32 = 0;

/// Index families with a registered implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// Graph-based index (hierarchical navigable small world).
    Hnsw,
    /// Inverted file with product-quantized residuals.
    IvfPq,
}

impl IndexType {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexType::Hnsw => "hnsw",
            IndexType::IvfPq => "ivf_pq",
        }
    }

    pub(crate) fn to_tag(self) -> u8 {
        match self {
            IndexType::Hnsw => 1,
            IndexType::IvfPq => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(IndexType::Hnsw),
            2 => Some(IndexType::IvfPq),
            _ => None,
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hnsw" => Ok(IndexType::Hnsw),
            "ivf_pq" => Ok(IndexType::IvfPq),
            "" => Err(IndexError::UnsupportedIndexType("<unset>".to_string())),
            other => Err(IndexError::UnsupportedIndexType(other.to_string())),
        }
    }
}

/// Namespaces of an [`IndexMeta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Common,
    Index,
    Search,
    Extra,
    WriteIndex,
    ReadIndex,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Common => "common",
            Section::Index => "index",
            Section::Search => "search",
            Section::Extra => "extra",
            Section::WriteIndex => "index_writer_options",
            Section::ReadIndex => "index_reader_options",
        }
    }
}

/// Versioned configuration document describing one index.
///
/// The family is stored as a free-form string so that an unknown tag survives
/// deserialization and can be reported by the factory by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexMeta {
    pub meta_version: u32,
    pub index_type: String,
    pub common: Map<String, Value>,
    pub index: Map<String, Value>,
    pub search: Map<String, Value>,
    pub extra: Map<String, Value>,
    pub index_writer_options: Map<String, Value>,
    pub index_reader_options: Map<String, Value>,
}

impl IndexMeta {
    pub fn new(index_type: IndexType) -> Self {
        Self {
            meta_version: META_VERSION,
            index_type: index_type.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, IndexError> {
        serde_json::from_str(json)
            .map_err(|err| IndexError::invalid_parameter("index_meta", err.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String, IndexError> {
        serde_json::to_string(self)
            .map_err(|err| IndexError::invalid_parameter("index_meta", err.to_string()))
    }

    /// Resolve the family tag. Unknown or unset tags fail with `UnsupportedIndexType`.
    pub fn index_type(&self) -> Result<IndexType, IndexError> {
        self.index_type.parse()
    }

    pub fn set_index_type(&mut self, index_type: IndexType) -> &mut Self {
        self.index_type = index_type.as_str().to_string();
        self
    }

    pub fn section(&self, section: Section) -> &Map<String, Value> {
        match section {
            Section::Common => &self.common,
            Section::Index => &self.index,
            Section::Search => &self.search,
            Section::Extra => &self.extra,
            Section::WriteIndex => &self.index_writer_options,
            Section::ReadIndex => &self.index_reader_options,
        }
    }

    pub fn section_mut(&mut self, section: Section) -> &mut Map<String, Value> {
        match section {
            Section::Common => &mut self.common,
            Section::Index => &mut self.index,
            Section::Search => &mut self.search,
            Section::Extra => &mut self.extra,
            Section::WriteIndex => &mut self.index_writer_options,
            Section::ReadIndex => &mut self.index_reader_options,
        }
    }

    /// Set one key, converting the value into JSON.
    pub fn set<V: Into<Value>>(&mut self, section: Section, key: &str, value: V) -> &mut Self {
        self.section_mut(section).insert(key.to_string(), value.into());
        self
    }

    /// Fetch a key that must be present.
    pub fn required<T: DeserializeOwned>(&self, section: Section, key: &str) -> Result<T, IndexError> {
        match self.optional(section, key)? {
            Some(value) => Ok(value),
            None => Err(IndexError::MissingRequiredParameter(format!(
                "{}.{key}",
                section.as_str()
            ))),
        }
    }

    /// Fetch a key that may be absent. A present key of the wrong type is an error.
    pub fn optional<T: DeserializeOwned>(
        &self,
        section: Section,
        key: &str,
    ) -> Result<Option<T>, IndexError> {
        match self.section(section).get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value).map(Some).map_err(|err| {
                IndexError::invalid_parameter(format!("{}.{key}", section.as_str()), err.to_string())
            }),
        }
    }
}
