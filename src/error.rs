use camino::Utf8PathBuf;
use thiserror::Error;

use crate::data::Shape;
use crate::node::State;

/// Result type for userland filter code.
pub type FilterResult<T> = anyhow::Result<T, anyhow::Error>;

/// Errors detected while loading or resolving the declarative configuration.
/// All of these fail the run before any node executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("more than one config file in directory '{dir}': '{first}' and '{second}'")]
    MultipleConfigs {
        dir: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("couldn't parse config file '{0}':\n{1}")]
    Parse(Utf8PathBuf, String),

    #[error("empty doc config for '{0}'")]
    EmptyConfig(String),

    #[error("expected a sequence for '{0}', got a mapping")]
    ExpectedSequence(String),

    #[error("circular dependency involving '{0}'")]
    CircularDependency(String),

    #[error("node '{parent}' requires '{child}', which could not be resolved")]
    UnresolvedInput { parent: String, child: String },

    #[error("unknown filter alias '{alias}' in '{key}'")]
    UnknownFilter { alias: String, key: String },

    #[error("blank filter alias in '{0}', you may have a trailing or doubled '|'")]
    BlankAlias(String),

    #[error("'record-vars' requested in '{key}' but filter '{alias}' defines no vars command")]
    NoVarsCommand { key: String, alias: String },

    #[error("invalid glob pattern in '{0}':\n{1}")]
    Pattern(String, glob::PatternError),

    #[error("couldn't read config file '{0}':\n{1}")]
    Io(Utf8PathBuf, std::io::Error),
}

/// Contract violations inside the engine. These are defects, not user
/// errors, and are surfaced with full context instead of being swallowed.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid state transition {from:?} => {to:?} for '{key}'")]
    InvalidTransition { key: String, from: State, to: State },

    #[error("unexpected state {state:?} for '{key}'")]
    UnexpectedState { key: String, state: State },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("couldn't decode artifact '{0}':\n{1}")]
    Decode(Utf8PathBuf, serde_json::Error),

    #[error("couldn't encode artifact:\n{0}")]
    Encode(serde_json::Error),

    #[error("no cached artifact at '{0}'")]
    Missing(Utf8PathBuf),

    #[error("expected {expected:?} data, found {found:?}")]
    ShapeMismatch { expected: Shape, found: Shape },
}

/// Top-level error surfaced by the [`Wrapper`](crate::Wrapper). Wraps every
/// failure mode of one invocation.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("node '{0}':\n{1:#}")]
    Node(String, anyhow::Error),

    #[error("node '{0}' timed out after {1}s")]
    Timeout(String, u64),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Internal(#[from] NodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("couldn't save batch record:\n{0}")]
    Batch(serde_json::Error),
}
