//! Batch records.
//!
//! Every run writes a JSON record of what it did: one entry per stage with
//! its final state and output hash. The record of the most recent run is
//! reachable through a pointer file, so tooling can inspect the last run
//! without listing the directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::RunError;
use crate::hash::Hash32;
use crate::node::State;
use crate::storage::write_atomic;

pub const BATCH_DIR: &str = "batches";
const MOST_RECENT: &str = "most-recent";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub state: State,
    pub output: Option<Hash32>,
    pub ext: String,
    pub elapsed_secs: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    /// Wall-clock start, seconds since the Unix epoch.
    pub started_at: u64,
    pub elapsed_secs: f64,
    /// Stage key to record, every stage of every doc plus bundle keys.
    pub docs: BTreeMap<String, DocRecord>,
    pub filters_used: BTreeSet<String>,
}

impl Batch {
    pub fn new() -> Self {
        let started_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            id: Uuid::new_v4(),
            started_at,
            elapsed_secs: 0.0,
            docs: BTreeMap::new(),
            filters_used: BTreeSet::new(),
        }
    }

    pub fn record(&mut self, key: impl Into<String>, record: DocRecord) {
        self.docs.insert(key.into(), record);
    }

    pub fn record_filter(&mut self, alias: impl Into<String>) {
        self.filters_used.insert(alias.into());
    }

    /// Records for keys in a given state, sorted by key.
    pub fn in_state(&self, state: State) -> Vec<(&str, &DocRecord)> {
        self.docs
            .iter()
            .filter(|(_, record)| record.state == state)
            .map(|(key, record)| (key.as_str(), record))
            .collect()
    }

    /// Saves the record under `artifacts_dir/batches/<id>.json` and points
    /// `most-recent` at it.
    pub fn save(&self, artifacts_dir: &Utf8Path) -> Result<Utf8PathBuf, RunError> {
        let dir = artifacts_dir.join(BATCH_DIR);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.id));
        let json = serde_json::to_vec_pretty(self).map_err(RunError::Batch)?;
        write_atomic(&path, &json)?;
        write_atomic(&dir.join(MOST_RECENT), format!("{}\n", self.id).as_bytes())?;

        debug!("saved batch record to '{path}'");
        Ok(path)
    }

    pub fn load(artifacts_dir: &Utf8Path, id: Uuid) -> Result<Self, RunError> {
        let path = artifacts_dir.join(BATCH_DIR).join(format!("{id}.json"));
        let text = fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(RunError::Batch)
    }

    pub fn load_most_recent(artifacts_dir: &Utf8Path) -> Result<Option<Self>, RunError> {
        let pointer = artifacts_dir.join(BATCH_DIR).join(MOST_RECENT);
        if !pointer.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&pointer)?;
        let id = Uuid::try_parse(text.trim())
            .map_err(|e| RunError::Node(MOST_RECENT.to_string(), e.into()))?;

        Ok(Some(Self::load(artifacts_dir, id)?))
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifacts() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        (tmp, dir)
    }

    fn record(state: State) -> DocRecord {
        DocRecord {
            state,
            output: Some(Hash32::hash(b"out")),
            ext: ".txt".to_string(),
            elapsed_secs: 0.1,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let (_tmp, dir) = artifacts();

        let mut batch = Batch::new();
        batch.record("a.txt|upper", record(State::Ran));
        batch.record_filter("upper");
        batch.save(&dir).unwrap();

        let loaded = Batch::load(&dir, batch.id).unwrap();
        assert_eq!(loaded.id, batch.id);
        assert_eq!(loaded.docs.len(), 1);
        assert_eq!(loaded.docs["a.txt|upper"].state, State::Ran);
        assert!(loaded.filters_used.contains("upper"));
    }

    #[test]
    fn most_recent_tracks_the_last_save() {
        let (_tmp, dir) = artifacts();

        assert!(Batch::load_most_recent(&dir).unwrap().is_none());

        let first = Batch::new();
        first.save(&dir).unwrap();

        let mut second = Batch::new();
        second.record("b.txt", record(State::Consolidated));
        second.save(&dir).unwrap();

        let recent = Batch::load_most_recent(&dir).unwrap().unwrap();
        assert_eq!(recent.id, second.id);

        // Earlier batches stay on disk.
        assert!(Batch::load(&dir, first.id).is_ok());
    }

    #[test]
    fn in_state_filters_records() {
        let mut batch = Batch::new();
        batch.record("a.txt|f", record(State::Ran));
        batch.record("b.txt|f", record(State::Consolidated));
        batch.record("c.txt|f", record(State::Ran));

        let ran = batch.in_state(State::Ran);
        assert_eq!(ran.len(), 2);
        assert_eq!(ran[0].0, "a.txt|f");
        assert_eq!(ran[1].0, "c.txt|f");
    }
}
