#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod ast;
pub mod batch;
pub mod data;
pub mod doc;
mod error;
pub mod filter;
mod hash;
mod node;
pub mod parser;
pub mod process;
pub mod storage;
mod wrapper;

pub use crate::ast::{AbstractSyntaxTree, Args, ResolvedGraph};
pub use crate::batch::{Batch, DocRecord};
pub use crate::data::{Data, Section, Shape};
pub use crate::error::*;
pub use crate::filter::{Filter, FilterRegistry};
pub use crate::hash::{Hash32, hashid};
pub use crate::node::{Node, NodeKind, State};
pub use crate::parser::{ConfigParser, ParserRegistry};
pub use crate::process::{ProcessRunner, ProcessSpec, PromptStrategy, StdinMode};
pub use crate::storage::{Storage, StorageRegistry};
pub use crate::wrapper::{RunOptions, STOP_MARKER, Wrapper, WrapperState};

/// Initializes a global `tracing` subscriber honoring `RUST_LOG`. Call this
/// once, early, from binaries that want the engine's logs.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
