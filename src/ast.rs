//! Pre-resolution graph description built from parsed config files.
//!
//! Parsers of every config format feed `(key, args, dependency edges)` into
//! one shared tree; [`AbstractSyntaxTree::walk`] then resolves it into the
//! concrete node graph. The `tree` list holds the current roots, nodes no
//! other node depends on, and is maintained incrementally on every mutation
//! because parsing nested config structures interleaves registration and
//! edge creation arbitrarily.

use std::collections::{BTreeSet, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use tracing::debug;

use crate::doc::Chain;
use crate::error::ConfigError;
use crate::filter::FilterRegistry;
use crate::node::{Node, NodeKind, State};

/// Configuration key to value mapping for one node. `BTreeMap` keeps the
/// serialization order-independent, which the hashid invariant relies on.
pub type Args = std::collections::BTreeMap<String, Value>;

/// True when `args[key]` is present and not `false`/`null`.
pub fn arg_truthy(args: &Args, key: &str) -> bool {
    match args.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

#[derive(Debug, Default, Clone)]
pub struct AstEntry {
    pub args: Args,
    pub inputs: Vec<String>,
}

#[derive(Debug, Default)]
pub struct AbstractSyntaxTree {
    lookup_table: HashMap<String, AstEntry>,
    /// Keys in discovery order.
    order: Vec<String>,
    /// Current roots: keys never referenced as another node's input.
    tree: Vec<String>,
    /// Directory-level default args, applied under node args.
    defaults: Vec<(Utf8PathBuf, Args)>,
}

impl AbstractSyntaxTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, key: &str) {
        if !self.lookup_table.contains_key(key) {
            self.lookup_table.insert(key.to_string(), AstEntry::default());
            self.order.push(key.to_string());
            // A fresh key has no dependents yet, so it starts as a root.
            self.tree.push(key.to_string());
        }
    }

    /// Registers or updates a node's argument set. Idempotent: later calls
    /// merge over earlier ones, overriding matching keys.
    pub fn add_node(&mut self, key: &str, args: Args) {
        self.register(key);
        let entry = self.lookup_table.get_mut(key).expect("just registered");
        entry.args.extend(args);
    }

    /// Declares that `parent` requires `child`'s output. Both endpoints are
    /// auto-registered. A self-loop is a no-op, a node cannot depend on its
    /// own output.
    pub fn add_dependency(&mut self, parent: &str, child: &str) {
        if parent == child {
            return;
        }

        self.register(parent);
        self.register(child);

        let entry = self.lookup_table.get_mut(parent).expect("just registered");
        if !entry.inputs.iter().any(|i| i == child) {
            entry.inputs.push(child.to_string());
        }

        self.clean_tree(child);
    }

    /// Incremental root maintenance: a key that just became someone's input
    /// leaves the root set.
    fn clean_tree(&mut self, referenced: &str) {
        self.tree.retain(|key| key != referenced);
    }

    pub fn add_default_args(&mut self, dir: impl Into<Utf8PathBuf>, args: Args) {
        self.defaults.push((dir.into(), args));
    }

    /// Directory defaults applying to `key`, shallowest directory first.
    pub fn default_args_for(&self, key: &str) -> Args {
        let name = key.split('|').next().unwrap_or(key);
        let node_dir = Utf8Path::new(name).parent().unwrap_or(Utf8Path::new(""));

        let mut applicable: Vec<_> = self
            .defaults
            .iter()
            .filter(|(dir, _)| node_dir.starts_with(dir))
            .collect();
        applicable.sort_by_key(|(dir, _)| dir.components().count());

        let mut merged = Args::new();
        for (_, args) in applicable {
            merged.extend(args.clone());
        }
        merged
    }

    pub fn roots(&self) -> &[String] {
        &self.tree
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn entry(&self, key: &str) -> Option<&AstEntry> {
        self.lookup_table.get(key)
    }

    /// Structural cycle check over the whole tree. The resolution walk only
    /// visits keys reachable from a root, and a cycle with no external
    /// dependent has no root at all, so it must be caught here instead of
    /// quietly resolving to nothing.
    fn check_cycles(&self) -> Result<(), ConfigError> {
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();

        for key in &self.order {
            self.visit_for_cycles(key, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    fn visit_for_cycles<'a>(
        &'a self,
        key: &'a str,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), ConfigError> {
        if done.contains(key) {
            return Ok(());
        }
        if !visiting.insert(key) {
            return Err(ConfigError::CircularDependency(key.to_string()));
        }

        if let Some(entry) = self.lookup_table.get(key) {
            for child in &entry.inputs {
                self.visit_for_cycles(child, visiting, done)?;
            }
        }

        visiting.remove(key);
        done.insert(key);
        Ok(())
    }

    /// Resolves the tree into the concrete node graph, dependency-first.
    /// Each key is instantiated into exactly one node: diamond dependencies
    /// share one instance. Nodes marked `inactive`/`disabled` are skipped, as
    /// are `default: false` nodes unless a full run was requested or the key
    /// matches the run target. A dependency cycle anywhere in the tree fails
    /// resolution, even when no selected root reaches it.
    pub fn walk(&self, ctx: &ResolveContext) -> Result<ResolvedGraph, ConfigError> {
        self.check_cycles()?;

        let mut resolution = Resolution {
            ast: self,
            ctx,
            graph: DiGraph::new(),
            index: HashMap::new(),
            visiting: HashSet::new(),
        };

        // Fuzzy target matching: every key starting with the target prefix
        // is included. When no root matches, fall back to any node.
        let selected: Vec<&String> = match ctx.target {
            Some(target) => {
                let roots: Vec<_> = self
                    .tree
                    .iter()
                    .filter(|key| key.starts_with(target))
                    .collect();
                if roots.is_empty() {
                    self.order
                        .iter()
                        .filter(|key| key.starts_with(target))
                        .collect()
                } else {
                    roots
                }
            }
            None => self.tree.iter().collect(),
        };

        for key in &selected {
            resolution.resolve(key, None)?;
        }

        let roots = selected
            .iter()
            .filter_map(|key| resolution.index.get(key.as_str()).copied())
            .collect();

        Ok(ResolvedGraph {
            graph: resolution.graph,
            index: resolution.index,
            roots,
        })
    }
}

pub struct ResolveContext<'a> {
    /// Run target prefix, if any.
    pub target: Option<&'a str>,
    /// Whether a full run was requested (includes `default: false` nodes).
    pub full: bool,
    /// Every real file visible to the run, relative to the project root.
    pub filemap: &'a BTreeSet<Utf8PathBuf>,
    pub filters: &'a FilterRegistry,
}

impl ResolveContext<'_> {
    fn matches_target(&self, key: &str) -> bool {
        self.target.is_some_and(|t| key.starts_with(t))
    }
}

#[derive(Debug)]
pub struct ResolvedGraph {
    /// Edges point from input to dependent, so a topological sort yields
    /// dependencies first.
    pub graph: DiGraph<Node, ()>,
    pub index: HashMap<String, NodeIndex>,
    pub roots: Vec<NodeIndex>,
}

struct Resolution<'a> {
    ast: &'a AbstractSyntaxTree,
    ctx: &'a ResolveContext<'a>,
    graph: DiGraph<Node, ()>,
    index: HashMap<String, NodeIndex>,
    visiting: HashSet<String>,
}

impl Resolution<'_> {
    /// Post-order resolution of one key. Returns `None` for skipped nodes.
    fn resolve(
        &mut self,
        key: &str,
        parent: Option<&str>,
    ) -> Result<Option<NodeIndex>, ConfigError> {
        if let Some(&index) = self.index.get(key) {
            return Ok(Some(index));
        }

        if self.visiting.contains(key) {
            return Err(ConfigError::CircularDependency(key.to_string()));
        }

        let Some(entry) = self.ast.entry(key) else {
            return Err(ConfigError::UnresolvedInput {
                parent: parent.unwrap_or("<run target>").to_string(),
                child: key.to_string(),
            });
        };

        let mut args = self.ast.default_args_for(key);
        args.extend(entry.args.clone());

        if arg_truthy(&args, "inactive") || arg_truthy(&args, "disabled") {
            debug!("skipping inactive node '{key}'");
            return Ok(None);
        }

        if args.get("default") == Some(&Value::Bool(false))
            && !self.ctx.full
            && !self.ctx.matches_target(key)
        {
            debug!("skipping non-default node '{key}'");
            return Ok(None);
        }

        self.visiting.insert(key.to_string());

        let mut inputs = vec![];
        for child in &entry.inputs {
            if let Some(index) = self.resolve(child, Some(key))? {
                inputs.push(index);
            }
        }

        let name = key.split('|').next().unwrap_or(key);
        let index = if name.contains('*') {
            self.expand_pattern(key, name, &args, &mut inputs)?
        } else {
            let kind = self.kind_for(key, name, &args)?;
            self.insert(key, kind, args)?
        };

        for input in inputs {
            self.graph.add_edge(input, index, ());
        }

        self.visiting.remove(key);
        Ok(Some(index))
    }

    /// Bundle name vs file path disambiguation: an existing file always wins;
    /// a key is a bundle only when it has no `.`, `|` or `*` and no such file
    /// exists.
    fn kind_for(&self, key: &str, name: &str, args: &Args) -> Result<NodeKind, ConfigError> {
        let is_file = key.contains('|')
            || name.contains('.')
            || self.ctx.filemap.contains(Utf8Path::new(name));

        if is_file {
            let chain = Chain::new(key, args, self.ctx.filters)?;
            Ok(NodeKind::Doc(chain))
        } else {
            Ok(NodeKind::Bundle)
        }
    }

    fn insert(&mut self, key: &str, kind: NodeKind, args: Args) -> Result<NodeIndex, ConfigError> {
        let mut node = Node::new(key, kind, args);
        node.transition(State::Populated)
            .expect("fresh node is always 'new'");

        let index = self.graph.add_node(node);
        self.index.insert(key.to_string(), index);
        Ok(index)
    }

    /// A pattern key creates one doc per matching file, all feeding a bundle
    /// that stands for the pattern itself.
    fn expand_pattern(
        &mut self,
        key: &str,
        name: &str,
        args: &Args,
        inputs: &mut Vec<NodeIndex>,
    ) -> Result<NodeIndex, ConfigError> {
        let pattern = glob::Pattern::new(name)
            .map_err(|e| ConfigError::Pattern(key.to_string(), e))?;
        let except = args
            .get("except")
            .and_then(Value::as_str)
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ConfigError::Pattern(key.to_string(), e))?;

        let suffix = &key[name.len()..];

        // With `recurse: false` a `*` never crosses a directory separator,
        // so the pattern only picks up files beside the config.
        let options = glob::MatchOptions {
            require_literal_separator: args.get("recurse") == Some(&Value::Bool(false)),
            ..glob::MatchOptions::default()
        };

        for file in self.ctx.filemap {
            if !pattern.matches_path_with(file.as_std_path(), options) {
                continue;
            }

            if let Some(except) = &except
                && except.matches_path(file.as_std_path())
            {
                debug!("pattern '{key}' skipping '{file}', matches except");
                continue;
            }

            let doc_key = format!("{file}{suffix}");
            if self.index.contains_key(&doc_key) {
                inputs.push(self.index[&doc_key]);
                continue;
            }

            let chain = Chain::new(&doc_key, args, self.ctx.filters)?;
            let index = self.insert(&doc_key, NodeKind::Doc(chain), args.clone())?;
            inputs.push(index);
        }

        self.insert(key, NodeKind::Bundle, args.clone())
    }
}
