//! In-memory representation of a document's content at one pipeline stage.
//!
//! The shape of the data is decided once, when the document is set up, and is
//! carried explicitly from then on. Filters receive a read-only view of the
//! upstream shape and declare the shape they produce; nothing downstream ever
//! infers a shape from the contents.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// Single opaque blob, text or binary.
    Generic,
    /// Ordered list of named sections.
    Sectioned,
    /// Unordered key to value map.
    KeyValue,
}

/// One named section of sectioned data. Insertion order is meaningful and
/// section names are unique within a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub contents: String,
}

/// Artifact content container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "data", rename_all = "lowercase")]
pub enum Data {
    Generic(Vec<u8>),
    Sectioned(Vec<Section>),
    KeyValue(BTreeMap<String, String>),
}

impl Data {
    pub fn text(contents: impl Into<String>) -> Self {
        Data::Generic(contents.into().into_bytes())
    }

    pub fn shape(&self) -> Shape {
        match self {
            Data::Generic(_) => Shape::Generic,
            Data::Sectioned(_) => Shape::Sectioned,
            Data::KeyValue(_) => Shape::KeyValue,
        }
    }

    /// Canonical textual rendering. Sections are joined in order, key-value
    /// pairs are rendered one per line.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Data::Generic(bytes) => String::from_utf8_lossy(bytes),
            Data::Sectioned(sections) => {
                let text = sections
                    .iter()
                    .map(|s| s.contents.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                Cow::Owned(text)
            }
            Data::KeyValue(map) => {
                let text = map
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                Cow::Owned(text)
            }
        }
    }

    /// Canonical byte rendering, used for output hashing.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Data::Generic(bytes) => bytes.clone(),
            other => other.as_text().into_owned().into_bytes(),
        }
    }

    pub fn section(&self, name: &str) -> Option<&str> {
        match self {
            Data::Sectioned(sections) => sections
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.contents.as_str()),
            _ => None,
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        match self {
            Data::KeyValue(map) => map.get(key).map(String::as_str),
            _ => None,
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        match self {
            Data::Generic(_) => vec![],
            Data::Sectioned(sections) => sections.iter().map(|s| s.name.as_str()).collect(),
            Data::KeyValue(map) => map.keys().map(String::as_str).collect(),
        }
    }

    /// Conversion between shapes is always an explicit failure.
    pub fn expect_sectioned(&self) -> Result<&[Section], StorageError> {
        match self {
            Data::Sectioned(sections) => Ok(sections),
            other => Err(StorageError::ShapeMismatch {
                expected: Shape::Sectioned,
                found: other.shape(),
            }),
        }
    }

    pub fn expect_keyvalue(&self) -> Result<&BTreeMap<String, String>, StorageError> {
        match self {
            Data::KeyValue(map) => Ok(map),
            other => Err(StorageError::ShapeMismatch {
                expected: Shape::KeyValue,
                found: other.shape(),
            }),
        }
    }
}
