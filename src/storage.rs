//! Key-value persistence of computed artifacts, addressed by content hash.
//!
//! Every artifact lives under the artifacts directory as one file named
//! `<hash><ext>`. Writes go through a temporary sibling which is renamed into
//! place, so a reader never observes a half-written cache entry and a failed
//! write leaves the previous artifact intact.
//!
//! Next to each artifact sits a small CBOR sidecar (`<hash>.meta`) recording
//! the argument fingerprint, the upstream stage hash, and the source file
//! mtime at the time of the write. The sidecar is what lets the engine detect
//! a settings change independently of the content hash.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Data, Shape};
use crate::error::StorageError;
use crate::hash::Hash32;

/// Abstract read/write contract for one cached artifact.
pub trait Storage: Send + Sync {
    /// Path of the backing data file.
    fn data_file(&self) -> &Utf8Path;

    fn data_file_exists(&self) -> bool {
        self.data_file().exists()
    }

    fn write_data(&self, data: &Data) -> Result<(), StorageError>;

    fn read_data(&self) -> Result<Data, StorageError>;
}

/// Write `bytes` to `path` atomically: write a temporary sibling, then rename
/// it into place.
pub fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().unwrap_or_default()
    ));

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

/// Flat file storage for [`Shape::Generic`] artifacts. The bytes on disk are
/// exactly the artifact bytes.
pub struct FlatStorage {
    path: Utf8PathBuf,
}

impl Storage for FlatStorage {
    fn data_file(&self) -> &Utf8Path {
        &self.path
    }

    fn write_data(&self, data: &Data) -> Result<(), StorageError> {
        write_atomic(&self.path, &data.to_bytes())
    }

    fn read_data(&self) -> Result<Data, StorageError> {
        if !self.path.exists() {
            return Err(StorageError::Missing(self.path.clone()));
        }

        Ok(Data::Generic(fs::read(&self.path)?))
    }
}

/// JSON storage for structured artifacts. Sections serialize as an array, so
/// insertion order survives the round trip.
pub struct JsonStorage {
    path: Utf8PathBuf,
}

impl Storage for JsonStorage {
    fn data_file(&self) -> &Utf8Path {
        &self.path
    }

    fn write_data(&self, data: &Data) -> Result<(), StorageError> {
        if data.shape() == Shape::Generic {
            return Err(StorageError::ShapeMismatch {
                expected: Shape::Sectioned,
                found: Shape::Generic,
            });
        }

        let bytes = serde_json::to_vec(data).map_err(StorageError::Encode)?;
        write_atomic(&self.path, &bytes)
    }

    fn read_data(&self) -> Result<Data, StorageError> {
        if !self.path.exists() {
            return Err(StorageError::Missing(self.path.clone()));
        }

        let bytes = fs::read(&self.path)?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Decode(self.path.clone(), e))
    }
}

type StorageFactory = fn(Utf8PathBuf) -> Box<dyn Storage>;

/// Lookup table from storage alias to constructor. Backends are registered
/// explicitly, once, at setup; there is no scanning or reflection.
pub struct StorageRegistry {
    factories: HashMap<&'static str, StorageFactory>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("flat", |path| Box::new(FlatStorage { path }));
        registry.register("json", |path| Box::new(JsonStorage { path }));
        registry
    }

    pub fn register(&mut self, alias: &'static str, factory: StorageFactory) {
        self.factories.insert(alias, factory);
    }

    /// The alias used for artifacts of a given shape.
    pub fn alias_for_shape(shape: Shape) -> &'static str {
        match shape {
            Shape::Generic => "flat",
            Shape::Sectioned | Shape::KeyValue => "json",
        }
    }

    /// Open storage for the artifact addressed by `(hash, ext)`.
    pub fn open(
        &self,
        alias: &str,
        artifacts_dir: &Utf8Path,
        hash: Hash32,
        ext: &str,
    ) -> Box<dyn Storage> {
        let factory = self
            .factories
            .get(alias)
            .or_else(|| self.factories.get("flat"))
            .expect("builtin flat storage is always registered");

        factory(artifact_path(artifacts_dir, hash, ext))
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub fn artifact_path(artifacts_dir: &Utf8Path, hash: Hash32, ext: &str) -> Utf8PathBuf {
    artifacts_dir.join(format!("{}{}", hash.to_hex(), ext))
}

/// Sidecar metadata persisted next to each artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Fingerprint of the stage key plus its settings.
    pub fingerprint: Hash32,
    /// Hash of the upstream stage, if any.
    pub prior: Option<Hash32>,
    /// Source file mtime in nanoseconds since the epoch, for real files.
    pub source_mtime: Option<u128>,
}

fn meta_path(artifacts_dir: &Utf8Path, hash: Hash32) -> Utf8PathBuf {
    artifacts_dir.join(format!("{}.meta", hash.to_hex()))
}

pub fn write_meta(
    artifacts_dir: &Utf8Path,
    hash: Hash32,
    meta: &ArtifactMeta,
) -> Result<(), StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(meta, &mut bytes).map_err(std::io::Error::other)?;
    write_atomic(&meta_path(artifacts_dir, hash), &bytes)
}

/// Reads are fail-safe: a missing or corrupt sidecar is a cache miss, not an
/// error.
pub fn read_meta(artifacts_dir: &Utf8Path, hash: Hash32) -> Option<ArtifactMeta> {
    let path = meta_path(artifacts_dir, hash);
    if !path.exists() {
        return None;
    }

    let file = BufReader::new(File::open(&path).ok()?);
    let meta = ciborium::from_reader::<ArtifactMeta, _>(file);

    if meta.is_err() {
        debug!("discarding corrupt artifact sidecar at {path}");
    }

    meta.ok()
}
