//! Top-level orchestration: scan the project tree, load configs, resolve the
//! node graph, and execute it in dependency order.

use std::collections::BTreeSet;
use std::fs;
use std::time::Instant;

use camino::Utf8PathBuf;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use tracing::{debug, info, warn};

use crate::ast::{AbstractSyntaxTree, ResolveContext, ResolvedGraph};
use crate::batch::{Batch, DocRecord};
use crate::doc::RunContext;
use crate::error::{ConfigError, NodeError, RunError};
use crate::filter::FilterRegistry;
use crate::hash::Hash32;
use crate::node::{NodeKind, State};
use crate::parser::{ParserRegistry, find_config};
use crate::storage::StorageRegistry;

/// A directory containing this file is left out of the scan entirely.
pub const STOP_MARKER: &str = ".nokumihimo";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: Utf8PathBuf,
    /// Artifact cache directory, relative to the project root.
    pub artifacts_dir: Utf8PathBuf,
    /// Run only nodes whose key starts with this prefix.
    pub target: Option<String>,
    /// Include nodes configured with `default: false`.
    pub full: bool,
    /// Glob patterns of paths left out of the file map.
    pub exclude: Vec<String>,
    pub recurse: bool,
    pub ignore_nonzero_exit: bool,
    /// Resolve and report without executing or writing anything.
    pub dry_run: bool,
    /// Show a progress bar and a summary line on stderr.
    pub progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            artifacts_dir: Utf8PathBuf::from("artifacts"),
            target: None,
            full: false,
            exclude: vec![],
            recurse: true,
            ignore_nonzero_exit: false,
            dry_run: false,
            progress: false,
        }
    }
}

/// Wrapper lifecycle, advanced in order by [`Wrapper::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperState {
    New,
    /// Project root and artifact directory verified.
    Valid,
    /// Configs parsed and the node graph resolved.
    Walked,
    /// Execution order established, graph known acyclic.
    Checked,
    Ran,
    Error,
}

pub struct Wrapper {
    options: RunOptions,
    pub filters: FilterRegistry,
    pub parsers: ParserRegistry,
    pub storages: StorageRegistry,
    state: WrapperState,
    filemap: BTreeSet<Utf8PathBuf>,
    graph: Option<ResolvedGraph>,
    order: Vec<NodeIndex>,
}

impl Wrapper {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            filters: FilterRegistry::with_builtins(),
            parsers: ParserRegistry::with_builtins(),
            storages: StorageRegistry::with_builtins(),
            state: WrapperState::New,
            filemap: BTreeSet::new(),
            graph: None,
            order: vec![],
        }
    }

    pub fn state(&self) -> WrapperState {
        self.state
    }

    /// Files visible to the last walk, relative to the project root.
    pub fn filemap(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.filemap
    }

    fn artifacts_dir(&self) -> Utf8PathBuf {
        self.options.root.join(&self.options.artifacts_dir)
    }

    fn validate(&mut self) -> Result<(), RunError> {
        if !self.options.root.is_dir() {
            let cause =
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory");
            return Err(ConfigError::Io(self.options.root.clone(), cause).into());
        }

        if !self.options.dry_run {
            fs::create_dir_all(self.artifacts_dir())?;
        }

        self.state = WrapperState::Valid;
        Ok(())
    }

    /// Scans the tree, parses every config found, and resolves the graph.
    pub fn walk(&mut self) -> Result<(), RunError> {
        self.validate()?;

        let (filemap, configs) = self.scan()?;
        debug!("found {} files, {} configs", filemap.len(), configs.len());
        self.filemap = filemap;

        let mut ast = AbstractSyntaxTree::new();
        for (dir, config) in &configs {
            let path = self.options.root.join(config);
            let text =
                fs::read_to_string(&path).map_err(|e| ConfigError::Io(config.clone(), e))?;

            let Some(parser) = self.parsers.for_file(config.file_name().unwrap_or_default())
            else {
                continue;
            };
            parser.parse(dir, &text, &mut ast)?;
        }

        let ctx = ResolveContext {
            target: self.options.target.as_deref(),
            full: self.options.full,
            filemap: &self.filemap,
            filters: &self.filters,
        };
        let graph = ast.walk(&ctx)?;

        self.graph = Some(graph);
        self.state = WrapperState::Walked;
        Ok(())
    }

    /// Walks the project tree with sorted directory entries, so config order
    /// and the file map are stable across runs.
    fn scan(
        &self,
    ) -> Result<(BTreeSet<Utf8PathBuf>, Vec<(Utf8PathBuf, Utf8PathBuf)>), RunError> {
        let mut excludes = vec![];
        for pattern in &self.options.exclude {
            excludes.push(
                glob::Pattern::new(pattern)
                    .map_err(|e| ConfigError::Pattern(pattern.clone(), e))?,
            );
        }

        let config_names = self.parsers.filenames();
        let mut filemap = BTreeSet::new();
        let mut configs = vec![];
        let mut pending = vec![Utf8PathBuf::new()];

        while let Some(dir) = pending.pop() {
            let abs = self.options.root.join(&dir);

            if abs.join(STOP_MARKER).exists() {
                debug!("skipping '{dir}', stop marker present");
                continue;
            }

            if let Some(config) = find_config(&self.parsers, &self.options.root, &dir)? {
                configs.push((dir.clone(), config));
            }

            let mut entries = vec![];
            for entry in abs.read_dir_utf8()? {
                entries.push(entry?);
            }
            entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));

            for entry in entries {
                let name = entry.file_name();
                if name.starts_with('.') {
                    continue;
                }

                let rel = dir.join(name);
                if rel == self.options.artifacts_dir {
                    continue;
                }
                if excludes.iter().any(|p| p.matches_path(rel.as_std_path())) {
                    debug!("excluding '{rel}'");
                    continue;
                }

                if entry.file_type()?.is_dir() {
                    if self.options.recurse {
                        pending.push(rel);
                    }
                } else if !config_names.iter().any(|c| *c == name) {
                    filemap.insert(rel);
                }
            }
        }

        configs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok((filemap, configs))
    }

    /// Establishes the execution order, failing on a dependency cycle.
    pub fn check(&mut self) -> Result<(), RunError> {
        if self.state != WrapperState::Walked {
            self.walk()?;
        }

        let Some(resolved) = &self.graph else {
            return Ok(());
        };

        self.order = toposort(&resolved.graph, None).map_err(|cycle| {
            ConfigError::CircularDependency(resolved.graph[cycle.node_id()].key.clone())
        })?;

        self.state = WrapperState::Checked;
        Ok(())
    }

    /// Runs the whole pipeline and returns the batch record. On failure the
    /// partial batch is still saved, so the run remains inspectable.
    pub fn run(&mut self) -> Result<Batch, RunError> {
        match self.execute() {
            Ok(batch) => {
                self.state = WrapperState::Ran;
                Ok(batch)
            }
            Err(e) => {
                self.state = WrapperState::Error;
                Err(e)
            }
        }
    }

    fn execute(&mut self) -> Result<Batch, RunError> {
        if self.state != WrapperState::Checked {
            self.check()?;
        }

        let mut batch = Batch::new();
        let start = Instant::now();

        if self.options.dry_run {
            let Some(resolved) = &self.graph else {
                return Ok(batch);
            };
            for &idx in &self.order {
                let node = &resolved.graph[idx];
                batch.record(
                    node.key.clone(),
                    DocRecord {
                        state: node.state,
                        output: None,
                        ext: String::new(),
                        elapsed_secs: 0.0,
                    },
                );
            }
            info!("dry run, {} nodes resolved", self.order.len());
            return Ok(batch);
        }

        let artifacts = self.artifacts_dir();
        let cx = RunContext {
            project_root: &self.options.root,
            artifacts_dir: &artifacts,
            storages: &self.storages,
            ignore_nonzero_exit: self.options.ignore_nonzero_exit,
        };

        let bar = if self.options.progress {
            ProgressBar::new(self.order.len() as u64).with_style(
                ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            )
        } else {
            ProgressBar::hidden()
        };

        let Some(resolved) = self.graph.as_mut() else {
            return Ok(batch);
        };

        for &idx in &self.order {
            // Inputs sort by key so the upstream hash sequence is stable.
            let mut inputs: Vec<(String, Hash32)> = vec![];
            for input in resolved.graph.neighbors_directed(idx, Direction::Incoming) {
                let node = &resolved.graph[input];
                let output = node.output.ok_or_else(|| NodeError::UnexpectedState {
                    key: node.key.clone(),
                    state: node.state,
                })?;
                inputs.push((node.key.clone(), output));
            }
            inputs.sort();
            let upstream: Vec<Hash32> = inputs.into_iter().map(|(_, h)| h).collect();

            let node = &resolved.graph[idx];
            let key = node.key.clone();
            bar.set_message(key.clone());

            match &node.kind {
                NodeKind::Bundle => {
                    // A bundle's output is just its identity plus whatever
                    // its inputs produced.
                    let mut parts: Vec<&[u8]> = vec![node.hashid.as_bytes()];
                    for hash in &upstream {
                        parts.push(hash.as_bytes());
                    }
                    let output = Hash32::chain(parts);

                    batch.record(
                        key,
                        DocRecord {
                            state: State::Consolidated,
                            output: Some(output),
                            ext: String::new(),
                            elapsed_secs: 0.0,
                        },
                    );

                    let node = &mut resolved.graph[idx];
                    node.output = Some(output);
                    node.transition(State::Consolidated)?;
                    node.transition(State::Complete)?;
                }
                NodeKind::Doc(chain) => {
                    for stage in &chain.stages {
                        batch.record_filter(stage.alias.clone());
                    }

                    let node_start = Instant::now();
                    let outcome = match chain.execute(&node.args, &upstream, &cx) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!("node '{key}' failed: {e}");
                            batch.record(
                                key.clone(),
                                DocRecord {
                                    state: State::Error,
                                    output: None,
                                    ext: String::new(),
                                    elapsed_secs: node_start.elapsed().as_secs_f64(),
                                },
                            );
                            batch.elapsed_secs = start.elapsed().as_secs_f64();
                            if let Err(save) = batch.save(&artifacts) {
                                warn!("couldn't save partial batch: {save}");
                            }

                            resolved.graph[idx].transition(State::Error)?;
                            return Err(e);
                        }
                    };
                    let elapsed = node_start.elapsed();

                    for stage in &outcome.stages {
                        batch.record(
                            stage.key.clone(),
                            DocRecord {
                                state: stage.state,
                                output: Some(stage.hash),
                                ext: stage.ext.clone(),
                                elapsed_secs: match stage.state {
                                    State::Ran => elapsed.as_secs_f64(),
                                    _ => 0.0,
                                },
                            },
                        );
                    }

                    // A filterless doc still gets a record under its own key.
                    if outcome.stages.is_empty() {
                        batch.record(
                            key,
                            DocRecord {
                                state: if outcome.ran {
                                    State::Ran
                                } else {
                                    State::Consolidated
                                },
                                output: Some(outcome.output),
                                ext: outcome.ext.clone(),
                                elapsed_secs: elapsed.as_secs_f64(),
                            },
                        );
                    }

                    let node = &mut resolved.graph[idx];
                    node.output = Some(outcome.output);
                    node.elapsed = Some(elapsed);
                    node.transition(if outcome.ran {
                        State::Ran
                    } else {
                        State::Consolidated
                    })?;
                    node.transition(State::Complete)?;
                }
            }

            bar.inc(1);
        }

        bar.finish_and_clear();
        batch.elapsed_secs = start.elapsed().as_secs_f64();
        batch.save(&artifacts)?;

        let ran = batch.in_state(State::Ran).len();
        let reused = batch.in_state(State::Consolidated).len();
        info!("batch {} finished, {ran} ran, {reused} reused", batch.id);

        if self.options.progress {
            eprintln!(
                "{} {ran} ran, {reused} reused in {:.2}s",
                style("done").green().bold(),
                batch.elapsed_secs,
            );
        }

        Ok(batch)
    }
}
