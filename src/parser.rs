//! Config file parsers.
//!
//! Three formats describe the same thing, a set of doc keys with arguments
//! and dependencies, and all of them feed the same [`AbstractSyntaxTree`].
//! Keys are qualified with the config file's directory, so a config in
//! `sub/` talks about `sub/` files without spelling the prefix out.

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::debug;

use crate::ast::{AbstractSyntaxTree, Args, arg_truthy};
use crate::error::ConfigError;

pub trait ConfigParser {
    /// File name this parser claims, e.g. `kumihimo.yaml`.
    fn filename(&self) -> &'static str;

    /// Parses `text` (the config found in `dir`) into the tree.
    fn parse(
        &self,
        dir: &Utf8Path,
        text: &str,
        ast: &mut AbstractSyntaxTree,
    ) -> Result<(), ConfigError>;
}

/// Prefixes the name portion of `key` with `dir`, leaving the filter part
/// untouched: `("sub", "a.txt|f1")` gives `sub/a.txt|f1`.
pub fn qualify_key(dir: &Utf8Path, key: &str) -> String {
    if dir.as_str().is_empty() {
        return key.to_string();
    }

    match key.split_once('|') {
        Some((name, rest)) => format!("{}|{rest}", dir.join(name)),
        None => dir.join(key).to_string(),
    }
}

pub struct ParserRegistry {
    parsers: Vec<Box<dyn ConfigParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { parsers: vec![] }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(YamlParser));
        registry.register(Box::new(TextParser));
        registry.register(Box::new(JsonParser));
        registry
    }

    pub fn register(&mut self, parser: Box<dyn ConfigParser>) {
        self.parsers.push(parser);
    }

    pub fn filenames(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.filename()).collect()
    }

    pub fn for_file(&self, name: &str) -> Option<&dyn ConfigParser> {
        self.parsers
            .iter()
            .find(|p| p.filename() == name)
            .map(|p| p.as_ref())
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// The nested YAML format. Top-level keys are doc or bundle keys; a
/// sequence entry is either a plain child key, a nested node (value is a
/// sequence), or an argument for the parent (anything else). A top-level
/// `defaults` mapping sets directory-level default args.
pub struct YamlParser;

impl ConfigParser for YamlParser {
    fn filename(&self) -> &'static str {
        "kumihimo.yaml"
    }

    fn parse(
        &self,
        dir: &Utf8Path,
        text: &str,
        ast: &mut AbstractSyntaxTree,
    ) -> Result<(), ConfigError> {
        let path = dir.join(self.filename());
        let doc: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| ConfigError::Parse(path.clone(), e.to_string()))?;

        let map = match doc {
            serde_yaml::Value::Mapping(map) => map,
            serde_yaml::Value::Null => return Ok(()),
            _ => {
                return Err(ConfigError::Parse(
                    path,
                    "expected a mapping of doc keys".to_string(),
                ));
            }
        };

        for (key, value) in map {
            let key = key.as_str().ok_or_else(|| {
                ConfigError::Parse(path.clone(), format!("non-string key {key:?}"))
            })?;

            if key == "defaults" {
                let args = yaml_args(&value)
                    .ok_or_else(|| ConfigError::Parse(path.clone(), "'defaults' must be a mapping".to_string()))?;
                ast.add_default_args(dir, args);
                continue;
            }

            self.parse_node(dir, &qualify_key(dir, key), &value, ast)?;
        }

        Ok(())
    }
}

impl YamlParser {
    fn parse_node(
        &self,
        dir: &Utf8Path,
        key: &str,
        value: &serde_yaml::Value,
        ast: &mut AbstractSyntaxTree,
    ) -> Result<(), ConfigError> {
        let entries = match value {
            serde_yaml::Value::Sequence(entries) => entries,
            serde_yaml::Value::Null => return Err(ConfigError::EmptyConfig(key.to_string())),
            _ => return Err(ConfigError::ExpectedSequence(key.to_string())),
        };

        ast.add_node(key, Args::new());

        for entry in entries {
            match entry {
                serde_yaml::Value::String(child) => {
                    ast.add_dependency(key, &qualify_key(dir, child));
                }
                serde_yaml::Value::Mapping(map) => {
                    for (k, v) in map {
                        let k = k.as_str().ok_or_else(|| {
                            ConfigError::Parse(
                                dir.join(self.filename()),
                                format!("non-string key {k:?} under '{key}'"),
                            )
                        })?;

                        if let serde_yaml::Value::Sequence(_) = v {
                            // A nested sequence is a child node, anything
                            // else is an argument on the parent.
                            let child = qualify_key(dir, k);
                            self.parse_node(dir, &child, v, ast)?;
                            ast.add_dependency(key, &child);
                        } else {
                            let mut args = Args::new();
                            args.insert(k.to_string(), yaml_to_json(v));
                            ast.add_node(key, args);
                        }
                    }
                }
                other => {
                    return Err(ConfigError::Parse(
                        dir.join(self.filename()),
                        format!("unexpected entry {other:?} under '{key}'"),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn yaml_args(value: &serde_yaml::Value) -> Option<Args> {
    let map = value.as_mapping()?;
    let mut args = Args::new();
    for (k, v) in map {
        args.insert(k.as_str()?.to_string(), yaml_to_json(v));
    }
    Some(args)
}

fn yaml_to_json(value: &serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_yaml::Value::String(s) => Value::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => Value::Array(seq.iter().map(yaml_to_json).collect()),
        serde_yaml::Value::Mapping(map) => {
            let mut object = serde_json::Map::new();
            for (k, v) in map {
                let key = match k.as_str() {
                    Some(s) => s.to_string(),
                    None => continue,
                };
                object.insert(key, yaml_to_json(v));
            }
            Value::Object(object)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

/// The line-oriented format: one doc key per line, optionally followed by a
/// JSON object of arguments. `#` starts a comment. Each doc depends on every
/// doc listed before it, so the file reads as a sequential recipe.
pub struct TextParser;

impl ConfigParser for TextParser {
    fn filename(&self) -> &'static str {
        "kumihimo.txt"
    }

    fn parse(
        &self,
        dir: &Utf8Path,
        text: &str,
        ast: &mut AbstractSyntaxTree,
    ) -> Result<(), ConfigError> {
        let path = dir.join(self.filename());
        let mut seen: Vec<String> = vec![];

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (raw_key, args) = match line.find('{') {
                Some(brace) => {
                    let args: Args =
                        serde_json::from_str(&line[brace..]).map_err(|e| {
                            ConfigError::Parse(
                                path.clone(),
                                format!("line {}: {e}", lineno + 1),
                            )
                        })?;
                    (line[..brace].trim(), args)
                }
                None => (line, Args::new()),
            };

            let key = qualify_key(dir, raw_key);
            ast.add_node(&key, args);

            for earlier in &seen {
                ast.add_dependency(&key, earlier);
            }
            seen.push(key);
        }

        debug!("parsed {} docs from '{path}'", seen.len());
        Ok(())
    }
}

/// The flat JSON format: an object of doc keys to argument objects. A
/// `depends` array names explicit inputs; `allinputs` makes the doc depend
/// on every other doc in the same config.
pub struct JsonParser;

impl ConfigParser for JsonParser {
    fn filename(&self) -> &'static str {
        "kumihimo.json"
    }

    fn parse(
        &self,
        dir: &Utf8Path,
        text: &str,
        ast: &mut AbstractSyntaxTree,
    ) -> Result<(), ConfigError> {
        let path = dir.join(self.filename());
        let doc: serde_json::Map<String, Value> = serde_json::from_str(text)
            .map_err(|e| ConfigError::Parse(path.clone(), e.to_string()))?;

        let mut keys = vec![];

        for (raw_key, value) in &doc {
            let args: Args = match value {
                Value::Object(map) => map.clone().into_iter().collect(),
                _ => {
                    return Err(ConfigError::Parse(
                        path,
                        format!("'{raw_key}' must map to an argument object"),
                    ));
                }
            };

            let key = qualify_key(dir, raw_key);
            ast.add_node(&key, args.clone());

            if let Some(Value::Array(depends)) = args.get("depends") {
                for dep in depends {
                    let dep = dep.as_str().ok_or_else(|| {
                        ConfigError::Parse(
                            path.clone(),
                            format!("non-string entry in 'depends' of '{raw_key}'"),
                        )
                    })?;
                    ast.add_dependency(&key, &qualify_key(dir, dep));
                }
            }

            keys.push(key);
        }

        // Second pass, 'allinputs' docs depend on every other known doc.
        // When such a doc carries an explicit `priority`, it additionally
        // depends on allinputs docs of strictly lower priority (default 10),
        // so summary-of-summaries chains order themselves.
        let known: Vec<String> = ast.keys().to_vec();

        for key in &keys {
            let Some(entry) = ast.entry(key) else { continue };
            if !arg_truthy(&entry.args, "allinputs") {
                continue;
            }
            let priority = entry.args.get("priority").and_then(Value::as_i64);

            let inputs: Vec<String> = known
                .iter()
                .filter(|other| *other != key)
                .filter(|other| match ast.entry(other) {
                    None => true,
                    Some(e) if !arg_truthy(&e.args, "allinputs") => true,
                    Some(e) => priority.is_some_and(|mine| {
                        e.args
                            .get("priority")
                            .and_then(Value::as_i64)
                            .unwrap_or(DEFAULT_ALLINPUTS_PRIORITY)
                            < mine
                    }),
                })
                .cloned()
                .collect();

            for input in inputs {
                ast.add_dependency(key, &input);
            }
        }

        Ok(())
    }
}

/// Priority assumed for an `allinputs` doc that doesn't set one.
const DEFAULT_ALLINPUTS_PRIORITY: i64 = 10;

/// Finds the config file in `dir`, erroring when more than one format is
/// present. Ambiguity is a hard error, not a precedence rule.
pub fn find_config(
    registry: &ParserRegistry,
    root: &Utf8Path,
    dir: &Utf8Path,
) -> Result<Option<Utf8PathBuf>, ConfigError> {
    let mut found: Option<Utf8PathBuf> = None;

    for filename in registry.filenames() {
        let candidate = dir.join(filename);
        if !root.join(&candidate).is_file() {
            continue;
        }

        if let Some(first) = &found {
            return Err(ConfigError::MultipleConfigs {
                dir: dir.to_owned(),
                first: first.file_name().unwrap_or_default().to_string(),
                second: filename.to_string(),
            });
        }
        found = Some(candidate);
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qualify_leaves_the_filter_part_alone() {
        assert_eq!(qualify_key(Utf8Path::new("sub"), "a.txt|f1|f2"), "sub/a.txt|f1|f2");
        assert_eq!(qualify_key(Utf8Path::new(""), "a.txt|f1"), "a.txt|f1");
        assert_eq!(qualify_key(Utf8Path::new("sub"), "bundle"), "sub/bundle");
    }

    #[test]
    fn yaml_nested_bundles_and_args() {
        let text = r#"
            site:
                - index.md|upper
                - posts:
                    - one.md|upper:
                        - contents: "hi"
                - title: My Site
        "#;

        let mut ast = AbstractSyntaxTree::new();
        YamlParser
            .parse(Utf8Path::new(""), text, &mut ast)
            .unwrap();

        assert_eq!(ast.roots(), ["site"]);
        assert_eq!(
            ast.entry("site").unwrap().inputs,
            ["index.md|upper", "posts"]
        );
        assert_eq!(ast.entry("site").unwrap().args["title"], json!("My Site"));
        assert_eq!(ast.entry("posts").unwrap().inputs, ["one.md|upper"]);
        assert_eq!(
            ast.entry("one.md|upper").unwrap().args["contents"],
            json!("hi")
        );
    }

    #[test]
    fn yaml_defaults_key_sets_directory_defaults() {
        let text = r#"
            defaults:
                timeout: 10
            a.txt|upper:
                - contents: "x"
        "#;

        let mut ast = AbstractSyntaxTree::new();
        YamlParser
            .parse(Utf8Path::new("sub"), text, &mut ast)
            .unwrap();

        let defaults = ast.default_args_for("sub/a.txt|upper");
        assert_eq!(defaults["timeout"], json!(10));
        // Defaults in `sub` don't apply outside it.
        assert!(ast.default_args_for("other/a.txt").is_empty());
    }

    #[test]
    fn yaml_scalar_node_value_is_rejected() {
        let mut ast = AbstractSyntaxTree::new();
        let err = YamlParser
            .parse(Utf8Path::new(""), "a.txt|upper: 12\n", &mut ast)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ExpectedSequence(_)));
    }

    #[test]
    fn yaml_empty_config_is_fine() {
        let mut ast = AbstractSyntaxTree::new();
        YamlParser.parse(Utf8Path::new(""), "", &mut ast).unwrap();
        assert!(ast.keys().is_empty());
    }

    #[test]
    fn text_lines_depend_on_earlier_lines() {
        let text = "\
            # a comment\n\
            a.txt|upper\n\
            \n\
            b.txt|upper { \"timeout\": 3 }\n\
            c.txt\n";

        let mut ast = AbstractSyntaxTree::new();
        TextParser
            .parse(Utf8Path::new(""), text, &mut ast)
            .unwrap();

        assert!(ast.entry("a.txt|upper").unwrap().inputs.is_empty());
        assert_eq!(ast.entry("b.txt|upper").unwrap().inputs, ["a.txt|upper"]);
        assert_eq!(ast.entry("b.txt|upper").unwrap().args["timeout"], json!(3));
        assert_eq!(
            ast.entry("c.txt").unwrap().inputs,
            ["a.txt|upper", "b.txt|upper"]
        );
    }

    #[test]
    fn text_bad_json_args_name_the_line() {
        let mut ast = AbstractSyntaxTree::new();
        let err = TextParser
            .parse(Utf8Path::new(""), "a.txt { not json\n", &mut ast)
            .unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn json_depends_and_allinputs() {
        let text = r#"{
            "a.txt|upper": {},
            "b.txt|upper": { "depends": ["a.txt|upper"] },
            "summary.txt|upper": { "allinputs": true, "contents": "done" }
        }"#;

        let mut ast = AbstractSyntaxTree::new();
        JsonParser
            .parse(Utf8Path::new(""), text, &mut ast)
            .unwrap();

        assert_eq!(ast.entry("b.txt|upper").unwrap().inputs, ["a.txt|upper"]);

        let summary = ast.entry("summary.txt|upper").unwrap();
        assert!(summary.inputs.contains(&"a.txt|upper".to_string()));
        assert!(summary.inputs.contains(&"b.txt|upper".to_string()));
        assert_eq!(ast.roots(), ["summary.txt|upper"]);
    }

    #[test]
    fn json_allinputs_priority_orders_summaries() {
        let text = r#"{
            "a.txt|upper": {},
            "early.txt|upper": { "allinputs": true, "priority": 1, "contents": "x" },
            "late.txt|upper": { "allinputs": true, "priority": 5, "contents": "y" }
        }"#;

        let mut ast = AbstractSyntaxTree::new();
        JsonParser
            .parse(Utf8Path::new(""), text, &mut ast)
            .unwrap();

        let early = ast.entry("early.txt|upper").unwrap();
        assert!(early.inputs.contains(&"a.txt|upper".to_string()));
        assert!(!early.inputs.contains(&"late.txt|upper".to_string()));

        let late = ast.entry("late.txt|upper").unwrap();
        assert!(late.inputs.contains(&"a.txt|upper".to_string()));
        assert!(late.inputs.contains(&"early.txt|upper".to_string()));
        assert_eq!(ast.roots(), ["late.txt|upper"]);
    }

    #[test]
    fn json_allinputs_without_priority_skips_other_summaries() {
        let text = r#"{
            "a.txt|upper": {},
            "s1.txt|upper": { "allinputs": true, "contents": "x" },
            "s2.txt|upper": { "allinputs": true, "priority": 3, "contents": "y" }
        }"#;

        let mut ast = AbstractSyntaxTree::new();
        JsonParser
            .parse(Utf8Path::new(""), text, &mut ast)
            .unwrap();

        // Without an explicit priority the doc only gathers plain docs.
        let s1 = ast.entry("s1.txt|upper").unwrap();
        assert_eq!(s1.inputs, ["a.txt|upper"]);

        // Priority 3 is below the default of 10 assumed for s1, so s2
        // does not pull s1 in either.
        let s2 = ast.entry("s2.txt|upper").unwrap();
        assert_eq!(s2.inputs, ["a.txt|upper"]);
    }

    #[test]
    fn find_config_rejects_ambiguity() {
        let tmp = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let registry = ParserRegistry::with_builtins();

        assert!(find_config(&registry, &root, Utf8Path::new("")).unwrap().is_none());

        std::fs::write(root.join("kumihimo.yaml"), "").unwrap();
        assert_eq!(
            find_config(&registry, &root, Utf8Path::new(""))
                .unwrap()
                .unwrap(),
            "kumihimo.yaml"
        );

        std::fs::write(root.join("kumihimo.txt"), "").unwrap();
        assert!(matches!(
            find_config(&registry, &root, Utf8Path::new("")),
            Err(ConfigError::MultipleConfigs { .. })
        ));
    }
}
