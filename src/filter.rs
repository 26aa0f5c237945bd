//! Filter trait and the alias registry.
//!
//! A filter receives a read-only view of the upstream data and produces a new
//! [`Data`] of a declared shape. Failure is signalled by returning an error;
//! filters wrapping external tools translate nonzero exit codes into that
//! error. Filters are looked up by string alias through an explicit registry,
//! populated once at setup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::Args;
use crate::data::{Data, Section, Shape};
use crate::error::FilterResult;
use crate::process::{ProcessRunner, ProcessSpec};

pub trait Filter: Send + Sync {
    fn alias(&self) -> &str;

    /// Output file extension, with leading dot. `None` keeps the input
    /// extension.
    fn extension(&self) -> Option<&'static str> {
        None
    }

    /// Shape of the data this filter produces. Decided once, at document
    /// setup, from the filter identity and its settings.
    fn output_shape(&self, _settings: &Args) -> Shape {
        Shape::Generic
    }

    /// Whether this filter can capture variables when `record-vars` is set.
    fn supports_vars(&self) -> bool {
        false
    }

    fn apply(&self, input: &Data, settings: &Args) -> FilterResult<Data>;
}

struct Identity;

impl Filter for Identity {
    fn alias(&self) -> &str {
        "identity"
    }

    fn apply(&self, input: &Data, _: &Args) -> FilterResult<Data> {
        Ok(input.clone())
    }
}

struct Upper;

impl Filter for Upper {
    fn alias(&self) -> &str {
        "upper"
    }

    fn apply(&self, input: &Data, _: &Args) -> FilterResult<Data> {
        Ok(Data::text(input.as_text().to_uppercase()))
    }
}

struct Lower;

impl Filter for Lower {
    fn alias(&self) -> &str {
        "lower"
    }

    fn apply(&self, input: &Data, _: &Args) -> FilterResult<Data> {
        Ok(Data::text(input.as_text().to_lowercase()))
    }
}

/// Splits text on `@export "name"` marker lines into named sections. Content
/// before the first marker lands in a section called "1".
struct Sections;

const EXPORT_MARKER: &str = "@export";

impl Filter for Sections {
    fn alias(&self) -> &str {
        "sections"
    }

    fn extension(&self) -> Option<&'static str> {
        Some(".json")
    }

    fn output_shape(&self, _: &Args) -> Shape {
        Shape::Sectioned
    }

    fn apply(&self, input: &Data, _: &Args) -> FilterResult<Data> {
        let text = input.as_text();
        let mut sections = vec![];
        let mut name = "1".to_string();
        let mut buffer = vec![];

        for line in text.lines() {
            match parse_export_marker(line) {
                Some(next) => {
                    if !buffer.is_empty() {
                        sections.push(Section {
                            name: std::mem::replace(&mut name, next),
                            contents: buffer.join("\n"),
                        });
                        buffer.clear();
                    } else {
                        name = next;
                    }
                }
                None => buffer.push(line),
            }
        }

        if !buffer.is_empty() {
            sections.push(Section {
                name,
                contents: buffer.join("\n"),
            });
        }

        Ok(Data::Sectioned(sections))
    }
}

/// Recognizes lines like `### @export "setup"` anywhere in a comment prefix.
fn parse_export_marker(line: &str) -> Option<String> {
    let at = line.find(EXPORT_MARKER)?;
    let rest = line[at + EXPORT_MARKER.len()..].trim();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// External process filter built on [`ProcessRunner`]. One struct configured
/// per external tool instead of a subclass per tool.
pub struct SubprocessFilter {
    alias: String,
    runner: ProcessRunner,
}

impl Filter for SubprocessFilter {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn output_shape(&self, settings: &Args) -> Shape {
        if crate::ast::arg_truthy(settings, "record-vars") {
            Shape::KeyValue
        } else {
            Shape::Generic
        }
    }

    fn supports_vars(&self) -> bool {
        self.runner.spec.vars_command.is_some()
    }

    fn apply(&self, input: &Data, settings: &Args) -> FilterResult<Data> {
        self.runner.run(input, settings)
    }
}

/// Lookup table from filter alias to implementation. One explicit
/// registration call per filter; no reflection, no class scanning.
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Identity));
        registry.register(Arc::new(Upper));
        registry.register(Arc::new(Lower));
        registry.register(Arc::new(Sections));
        registry
    }

    pub fn register(&mut self, filter: Arc<dyn Filter>) {
        self.filters.insert(filter.alias().to_string(), filter);
    }

    /// Register an external tool as a filter under `alias`.
    pub fn register_process(&mut self, alias: impl Into<String>, spec: ProcessSpec) {
        let alias = alias.into();
        self.filters.insert(
            alias.clone(),
            Arc::new(SubprocessFilter {
                alias,
                runner: ProcessRunner::new(spec),
            }),
        );
    }

    pub fn get(&self, alias: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(alias).cloned()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_aliases_resolve() {
        let registry = FilterRegistry::with_builtins();
        for alias in ["identity", "upper", "lower", "sections"] {
            assert!(registry.get(alias).is_some(), "missing builtin {alias}");
        }
        assert!(registry.get("md2html").is_none());
    }

    #[test]
    fn upper_filter() {
        let registry = FilterRegistry::with_builtins();
        let upper = registry.get("upper").unwrap();
        let out = upper.apply(&Data::text("hello"), &Args::new()).unwrap();
        assert_eq!(out.as_text(), "HELLO");
    }

    #[test]
    fn sections_filter_splits_on_export_markers() {
        let registry = FilterRegistry::with_builtins();
        let sections = registry.get("sections").unwrap();

        let input = Data::text(
            "preamble\n### @export \"setup\"\nlet x = 1;\n### @export \"run\"\nrun(x);",
        );
        let out = sections.apply(&input, &Args::new()).unwrap();

        assert_eq!(out.keys(), vec!["1", "setup", "run"]);
        assert_eq!(out.section("setup"), Some("let x = 1;"));
        assert_eq!(out.shape(), Shape::Sectioned);
    }

    #[test]
    fn sections_without_markers_yields_single_section() {
        let registry = FilterRegistry::with_builtins();
        let sections = registry.get("sections").unwrap();
        let out = sections.apply(&Data::text("plain text"), &Args::new()).unwrap();
        assert_eq!(out.keys(), vec!["1"]);
    }
}
