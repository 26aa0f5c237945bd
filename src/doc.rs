//! A document is a chain of filter applications. Each stage carries a
//! content hash derived from the previous stage's hash plus the stage's own
//! settings and filter identity, so the cache can be reused per stage, not
//! just per document.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::debug;

use crate::ast::{Args, arg_truthy};
use crate::data::{Data, Shape};
use crate::error::{ConfigError, RunError, StorageError};
use crate::filter::{Filter, FilterRegistry};
use crate::hash::{Hash32, hashid};
use crate::node::State;
use crate::process::TimeoutExpired;
use crate::storage::{ArtifactMeta, StorageRegistry, read_meta, write_meta};

/// Engine-level argument keys. These steer execution and node selection and
/// are not part of any stage's settings, so changing them never invalidates
/// cached output.
const RESERVED_ARGS: &[&str] = &[
    "inactive",
    "disabled",
    "default",
    "contents",
    "timeout",
    "ignore-nonzero-exit",
    "except",
    "recurse",
    "priority",
    "allinputs",
    "depends",
];

/// One filter application within a chain.
pub struct Stage {
    /// Key of the chain up to and including this stage, e.g. `a.txt|f1`.
    pub key: String,
    pub alias: String,
    pub filter: Arc<dyn Filter>,
    /// Settings that affect this stage's output, part of its hash.
    pub settings: Args,
    /// Fingerprint of `(stage key, settings)`, persisted in the artifact
    /// sidecar and compared on every cache lookup.
    pub fingerprint: Hash32,
    pub shape: Shape,
    /// Output extension after this stage, with leading dot.
    pub ext: String,
}

pub struct Chain {
    pub name: Utf8PathBuf,
    pub stages: Vec<Stage>,
    initial_ext: String,
}

impl Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chain({}", self.name)?;
        for stage in &self.stages {
            write!(f, "|{}", stage.alias)?;
        }
        write!(f, ")")
    }
}

/// Settings for one stage: doc-level args minus engine keys and minus
/// settings nested under other stages' aliases, then anything nested under
/// this stage's own alias flattened on top.
fn stage_settings(args: &Args, alias: &str, chain_aliases: &[&str]) -> Args {
    let mut settings = Args::new();

    for (key, value) in args {
        if RESERVED_ARGS.contains(&key.as_str()) {
            continue;
        }
        if chain_aliases.contains(&key.as_str()) {
            continue;
        }
        settings.insert(key.clone(), value.clone());
    }

    if let Some(Value::Object(nested)) = args.get(alias) {
        for (key, value) in nested {
            settings.insert(key.clone(), value.clone());
        }
    }

    settings
}

impl Chain {
    /// Builds the chain for `key`, validating every pipe segment. All
    /// configuration problems surface here, before any execution.
    pub fn new(key: &str, args: &Args, filters: &FilterRegistry) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = key.split('|').collect();
        let name = parts[0];

        if name.is_empty() {
            return Err(ConfigError::BlankAlias(key.to_string()));
        }

        let name = Utf8PathBuf::from(name);
        let initial_ext = name
            .extension()
            .map(|e| format!(".{e}"))
            .unwrap_or_default();

        let chain_aliases = &parts[1..];
        let mut ext = initial_ext.clone();
        let mut stage_key = name.to_string();
        let mut stages = vec![];

        for &alias in chain_aliases {
            if alias.is_empty() {
                return Err(ConfigError::BlankAlias(key.to_string()));
            }

            stage_key = format!("{stage_key}|{alias}");

            let filter = filters.get(alias).ok_or_else(|| ConfigError::UnknownFilter {
                alias: alias.to_string(),
                key: key.to_string(),
            })?;

            let settings = stage_settings(args, alias, chain_aliases);

            // Variable capture must be rejected up front, not as an opaque
            // crash once a subprocess has already been spawned.
            if arg_truthy(&settings, "record-vars") && !filter.supports_vars() {
                return Err(ConfigError::NoVarsCommand {
                    key: stage_key,
                    alias: alias.to_string(),
                });
            }

            let shape = filter.output_shape(&settings);
            if let Some(e) = filter.extension() {
                ext = e.to_string();
            }

            stages.push(Stage {
                key: stage_key.clone(),
                fingerprint: hashid(&stage_key, &settings),
                alias: alias.to_string(),
                filter,
                settings,
                shape,
                ext: ext.clone(),
            });
        }

        Ok(Self {
            name,
            stages,
            initial_ext,
        })
    }

    pub fn key(&self) -> String {
        match self.stages.last() {
            Some(stage) => stage.key.clone(),
            None => self.name.to_string(),
        }
    }

    /// Executes the chain, reusing cached stages where the lookup hits.
    pub fn execute(
        &self,
        args: &Args,
        upstream: &[Hash32],
        cx: &RunContext,
    ) -> Result<ChainOutcome, RunError> {
        let initial = self.setup_initial(args, upstream, cx)?;

        let mut prev_hash = initial.hash;
        let mut prev_ext = self.initial_ext.clone();
        let mut prev_shape = initial.shape;
        let mut current: Option<Data> = None;
        let mut ran = initial.ran;
        let mut outcomes = vec![];

        for (i, stage) in self.stages.iter().enumerate() {
            let stage_hash = Hash32::chain([
                prev_hash.as_bytes().as_slice(),
                stage.alias.as_bytes(),
                stage.fingerprint.as_bytes().as_slice(),
            ]);

            let alias = StorageRegistry::alias_for_shape(stage.shape);
            let storage = cx
                .storages
                .open(alias, cx.artifacts_dir, stage_hash, &stage.ext);

            let meta = read_meta(cx.artifacts_dir, stage_hash);
            let hit = storage.data_file_exists()
                && meta.is_some_and(|m| {
                    m.fingerprint == stage.fingerprint && m.prior == Some(prev_hash)
                });

            if hit {
                debug!("cache hit for '{}' at {}", stage.key, stage_hash.to_hex());
                outcomes.push(StageOutcome {
                    key: stage.key.clone(),
                    state: State::Consolidated,
                    hash: stage_hash,
                    ext: stage.ext.clone(),
                });
                current = None;
            } else {
                let input = match current.take() {
                    Some(data) => data,
                    None => self.load_stage_input(i, args, prev_hash, &prev_ext, prev_shape, cx)?,
                };

                let settings = self.runtime_settings(stage, args, cx);
                let output = stage
                    .filter
                    .apply(&input, &settings)
                    .map_err(|e| match e.downcast_ref::<TimeoutExpired>() {
                        Some(timeout) => RunError::Timeout(stage.key.clone(), timeout.0),
                        None => RunError::Node(stage.key.clone(), e),
                    })?;

                if output.shape() != stage.shape {
                    return Err(RunError::Storage(StorageError::ShapeMismatch {
                        expected: stage.shape,
                        found: output.shape(),
                    }));
                }

                storage.write_data(&output)?;
                write_meta(
                    cx.artifacts_dir,
                    stage_hash,
                    &ArtifactMeta {
                        fingerprint: stage.fingerprint,
                        prior: Some(prev_hash),
                        source_mtime: initial.source_mtime,
                    },
                )?;

                ran = true;
                outcomes.push(StageOutcome {
                    key: stage.key.clone(),
                    state: State::Ran,
                    hash: stage_hash,
                    ext: stage.ext.clone(),
                });
                current = Some(output);
            }

            prev_hash = stage_hash;
            prev_ext = stage.ext.clone();
            prev_shape = stage.shape;
        }

        Ok(ChainOutcome {
            stages: outcomes,
            output: prev_hash,
            ext: prev_ext,
            ran,
        })
    }

    /// Per-run settings handed to the filter: the hashed stage settings plus
    /// execution policy, which is deliberately not part of the hash.
    fn runtime_settings(&self, stage: &Stage, args: &Args, cx: &RunContext) -> Args {
        let mut settings = stage.settings.clone();

        if let Some(timeout) = args.get("timeout") {
            settings.insert("timeout".into(), timeout.clone());
        }
        if cx.ignore_nonzero_exit || arg_truthy(args, "ignore-nonzero-exit") {
            settings.insert("ignore-nonzero-exit".into(), Value::Bool(true));
        }

        settings
    }

    /// Sets up the initial artifact: a real file read from disk or virtual
    /// contents from the `contents` arg. The initial hash folds in the file
    /// mtime and the outputs of every upstream node, so touching the source
    /// or rebuilding a dependency invalidates the whole chain.
    fn setup_initial(
        &self,
        args: &Args,
        upstream: &[Hash32],
        cx: &RunContext,
    ) -> Result<InitialArtifact, RunError> {
        let path = cx.project_root.join(&self.name);

        let (hash, shape, source_mtime) = if path.exists() {
            let mtime = fs::metadata(&path)?
                .modified()?
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();

            let content = Hash32::hash_file(&path)?;

            let mut parts: Vec<&[u8]> = vec![content.as_bytes()];
            let mtime_bytes = mtime.to_le_bytes();
            parts.push(&mtime_bytes);
            for hash in upstream {
                parts.push(hash.as_bytes());
            }

            (Hash32::chain(parts), Shape::Generic, Some(mtime))
        } else if let Some(contents) = args.get("contents") {
            let data = virtual_contents(contents);
            let bytes = data.to_bytes();

            let mut parts: Vec<&[u8]> = vec![&bytes];
            for hash in upstream {
                parts.push(hash.as_bytes());
            }

            (Hash32::chain(parts), data.shape(), None)
        } else {
            return Err(RunError::Node(
                self.key(),
                anyhow!("'{}' does not exist and no 'contents' were given", self.name),
            ));
        };

        // The initial artifact is cached too, so later stages can re-read
        // their input without going back to the source.
        let alias = StorageRegistry::alias_for_shape(shape);
        let storage = cx
            .storages
            .open(alias, cx.artifacts_dir, hash, &self.initial_ext);

        let ran = if storage.data_file_exists() {
            false
        } else {
            storage.write_data(&self.initial_data(args, cx)?)?;
            write_meta(
                cx.artifacts_dir,
                hash,
                &ArtifactMeta {
                    fingerprint: hash,
                    prior: None,
                    source_mtime,
                },
            )?;
            true
        };

        Ok(InitialArtifact {
            hash,
            shape,
            source_mtime,
            ran,
        })
    }

    fn initial_data(&self, args: &Args, cx: &RunContext) -> Result<Data, RunError> {
        let path = cx.project_root.join(&self.name);

        if path.exists() {
            return Ok(Data::Generic(fs::read(&path)?));
        }

        let contents = args.get("contents").ok_or_else(|| {
            RunError::Node(self.key(), anyhow!("virtual doc '{}' lost its contents", self.name))
        })?;
        Ok(virtual_contents(contents))
    }

    /// Input for stage `i`: the initial artifact for the first stage, the
    /// previous stage's cached output otherwise.
    fn load_stage_input(
        &self,
        i: usize,
        args: &Args,
        prev_hash: Hash32,
        prev_ext: &str,
        prev_shape: Shape,
        cx: &RunContext,
    ) -> Result<Data, RunError> {
        let alias = StorageRegistry::alias_for_shape(prev_shape);
        let storage = cx.storages.open(alias, cx.artifacts_dir, prev_hash, prev_ext);

        if storage.data_file_exists() {
            return Ok(storage.read_data()?);
        }

        // The initial artifact may have been evicted; fall back to source.
        if i == 0 {
            return self.initial_data(args, cx);
        }

        Err(RunError::Storage(StorageError::Missing(
            storage.data_file().to_owned(),
        )))
    }
}

fn virtual_contents(value: &Value) -> Data {
    match value {
        Value::String(text) => Data::text(text.clone()),
        Value::Object(map) => {
            let mut kv = BTreeMap::new();
            for (key, value) in map {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                kv.insert(key.clone(), rendered);
            }
            Data::KeyValue(kv)
        }
        other => Data::text(other.to_string()),
    }
}

struct InitialArtifact {
    hash: Hash32,
    shape: Shape,
    source_mtime: Option<u128>,
    ran: bool,
}

#[derive(Debug)]
pub struct StageOutcome {
    pub key: String,
    pub state: State,
    pub hash: Hash32,
    pub ext: String,
}

#[derive(Debug)]
pub struct ChainOutcome {
    /// One outcome per filter stage, in chain order.
    pub stages: Vec<StageOutcome>,
    /// Content hash of the final output.
    pub output: Hash32,
    pub ext: String,
    /// Whether any stage (or the initial artifact) actually ran.
    pub ran: bool,
}

pub struct RunContext<'a> {
    pub project_root: &'a Utf8Path,
    pub artifacts_dir: &'a Utf8Path,
    pub storages: &'a StorageRegistry,
    pub ignore_nonzero_exit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSpec;
    use crate::storage::artifact_path;

    struct Project {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
        artifacts: Utf8PathBuf,
        storages: StorageRegistry,
    }

    impl Project {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
            let artifacts = root.join("artifacts");
            fs::create_dir_all(&artifacts).unwrap();

            Self {
                _tmp: tmp,
                root,
                artifacts,
                storages: StorageRegistry::with_builtins(),
            }
        }

        fn cx(&self) -> RunContext<'_> {
            RunContext {
                project_root: &self.root,
                artifacts_dir: &self.artifacts,
                storages: &self.storages,
                ignore_nonzero_exit: false,
            }
        }
    }

    #[test]
    fn blank_alias_is_a_config_error() {
        let filters = FilterRegistry::with_builtins();
        for key in ["a.txt|", "a.txt||upper", "|upper"] {
            let err = Chain::new(key, &Args::new(), &filters).unwrap_err();
            assert!(matches!(err, ConfigError::BlankAlias(_)), "{key}");
        }
    }

    #[test]
    fn unknown_filter_is_a_config_error() {
        let filters = FilterRegistry::with_builtins();
        let err = Chain::new("a.txt|nope", &Args::new(), &filters).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFilter { .. }));
    }

    #[test]
    fn record_vars_needs_a_vars_command() {
        let mut filters = FilterRegistry::with_builtins();
        filters.register_process(
            "plain",
            ProcessSpec {
                executable: "cat".into(),
                ..ProcessSpec::default()
            },
        );
        filters.register_process(
            "versioned",
            ProcessSpec {
                executable: "cat".into(),
                vars_command: Some("printf V=1".into()),
                ..ProcessSpec::default()
            },
        );

        let mut args = Args::new();
        args.insert("record-vars".into(), serde_json::json!(true));

        // Rejected before any subprocess is spawned.
        let err = Chain::new("a.txt|plain", &args, &filters).unwrap_err();
        assert!(matches!(err, ConfigError::NoVarsCommand { .. }));

        assert!(Chain::new("a.txt|versioned", &args, &filters).is_ok());
    }

    #[test]
    fn settings_nested_under_other_aliases_do_not_leak() {
        let filters = FilterRegistry::with_builtins();

        let mut args = Args::new();
        args.insert("upper".into(), serde_json::json!({"x": 1}));
        args.insert("shared".into(), serde_json::json!("s"));

        let chain = Chain::new("a.txt|identity|upper", &args, &filters).unwrap();

        let identity = &chain.stages[0];
        assert!(!identity.settings.contains_key("upper"));
        assert!(!identity.settings.contains_key("x"));
        assert_eq!(identity.settings["shared"], serde_json::json!("s"));

        let upper = &chain.stages[1];
        assert_eq!(upper.settings["x"], serde_json::json!(1));
    }

    #[test]
    fn first_run_runs_second_run_consolidates() {
        let project = Project::new();
        fs::write(project.root.join("a.txt"), "hello").unwrap();

        let filters = FilterRegistry::with_builtins();
        let chain = Chain::new("a.txt|identity|upper", &Args::new(), &filters).unwrap();

        let first = chain.execute(&Args::new(), &[], &project.cx()).unwrap();
        assert!(first.ran);
        assert_eq!(first.stages.len(), 2);
        assert_eq!(first.stages[0].key, "a.txt|identity");
        assert_eq!(first.stages[1].key, "a.txt|identity|upper");
        assert!(first.stages.iter().all(|s| s.state == State::Ran));

        let path = artifact_path(&project.artifacts, first.output, &first.ext);
        assert_eq!(fs::read_to_string(path).unwrap(), "HELLO");

        let second = chain.execute(&Args::new(), &[], &project.cx()).unwrap();
        assert!(!second.ran);
        assert!(second.stages.iter().all(|s| s.state == State::Consolidated));
        assert_eq!(second.output, first.output);

        // Cache hit output is byte-identical to the fresh run.
        let path = artifact_path(&project.artifacts, second.output, &second.ext);
        assert_eq!(fs::read_to_string(path).unwrap(), "HELLO");
    }

    #[test]
    fn touching_the_source_invalidates_every_stage() {
        let project = Project::new();
        let source = project.root.join("a.txt");
        fs::write(&source, "hello").unwrap();

        let filters = FilterRegistry::with_builtins();
        let chain = Chain::new("a.txt|identity|upper", &Args::new(), &filters).unwrap();

        let first = chain.execute(&Args::new(), &[], &project.cx()).unwrap();

        // Same content, newer mtime.
        let later = fs::File::options().append(true).open(&source).unwrap();
        later.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(5))
            .unwrap();
        drop(later);

        let second = chain.execute(&Args::new(), &[], &project.cx()).unwrap();
        assert!(second.ran);
        assert!(second.stages.iter().all(|s| s.state == State::Ran));
        assert_ne!(second.output, first.output);
    }

    #[test]
    fn changing_settings_invalidates_without_content_change() {
        let project = Project::new();
        fs::write(project.root.join("a.txt"), "hello").unwrap();

        let filters = FilterRegistry::with_builtins();

        let chain = Chain::new("a.txt|upper", &Args::new(), &filters).unwrap();
        chain.execute(&Args::new(), &[], &project.cx()).unwrap();

        let mut args = Args::new();
        args.insert("upper".into(), serde_json::json!({"mode": "aggressive"}));
        let changed = Chain::new("a.txt|upper", &args, &filters).unwrap();

        let outcome = changed.execute(&args, &[], &project.cx()).unwrap();
        assert!(outcome.ran);
        assert_eq!(outcome.stages[0].state, State::Ran);
    }

    #[test]
    fn upstream_hash_flows_into_the_chain() {
        let project = Project::new();
        fs::write(project.root.join("a.txt"), "hello").unwrap();

        let filters = FilterRegistry::with_builtins();
        let chain = Chain::new("a.txt|upper", &Args::new(), &filters).unwrap();

        let one = chain
            .execute(&Args::new(), &[Hash32::hash(b"dep-v1")], &project.cx())
            .unwrap();
        let two = chain
            .execute(&Args::new(), &[Hash32::hash(b"dep-v2")], &project.cx())
            .unwrap();

        assert_ne!(one.output, two.output);
        assert!(two.ran);
    }

    #[test]
    fn virtual_doc_runs_from_contents() {
        let project = Project::new();
        let filters = FilterRegistry::with_builtins();

        let mut args = Args::new();
        args.insert("contents".into(), serde_json::json!("virtual"));

        let chain = Chain::new("ghost.txt|upper", &args, &filters).unwrap();
        let outcome = chain.execute(&args, &[], &project.cx()).unwrap();

        let path = artifact_path(&project.artifacts, outcome.output, &outcome.ext);
        assert_eq!(fs::read_to_string(path).unwrap(), "VIRTUAL");
    }

    #[test]
    fn missing_file_without_contents_fails() {
        let project = Project::new();
        let filters = FilterRegistry::with_builtins();
        let chain = Chain::new("gone.txt|upper", &Args::new(), &filters).unwrap();

        assert!(matches!(
            chain.execute(&Args::new(), &[], &project.cx()),
            Err(RunError::Node(_, _))
        ));
    }

    #[test]
    fn partial_miss_reloads_input_from_cache() {
        let project = Project::new();
        fs::write(project.root.join("a.txt"), "hello").unwrap();

        let filters = FilterRegistry::with_builtins();
        let chain = Chain::new("a.txt|identity", &Args::new(), &filters).unwrap();
        chain.execute(&Args::new(), &[], &project.cx()).unwrap();

        // Extending the chain consolidates the shared prefix and runs only
        // the new stage, reading its input back from storage.
        let longer = Chain::new("a.txt|identity|upper", &Args::new(), &filters).unwrap();
        let outcome = longer.execute(&Args::new(), &[], &project.cx()).unwrap();

        assert_eq!(outcome.stages[0].state, State::Consolidated);
        assert_eq!(outcome.stages[1].state, State::Ran);

        let path = artifact_path(&project.artifacts, outcome.output, &outcome.ext);
        assert_eq!(fs::read_to_string(path).unwrap(), "HELLO");
    }
}
