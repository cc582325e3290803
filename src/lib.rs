#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
pub mod core;
pub mod dev;
pub mod engine;
mod error;
pub mod graph;
pub mod hash;
mod io;
pub mod manifest;
pub mod pipeline;
pub mod rewrite;
pub mod transform;
mod utils;

pub use crate::config::{CONFIG_FILE, Config};
pub use crate::core::{CancelToken, Environment, Hash32, Mode, TaskContext};
pub use crate::engine::{Blueprint, BuildEngine, BuildReport, TaskReport};
pub use crate::error::*;
pub use crate::graph::{BuildTask, TaskGraph, TaskResult, TaskState};
pub use crate::io::INCOMPLETE_MARKER;
pub use crate::manifest::{ManifestClass, ManifestStore, RenameManifest};
pub use crate::pipeline::FrontendPipeline;
pub use crate::transform::{SourceFile, Toolchain, Transform};
pub use crate::utils::init_logging;
