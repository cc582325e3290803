use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::manifest::ManifestClass;

/// Problems with the pipeline definition or the options it was built from.
/// These are always detected before any file in the output tree is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Dependency cycle detected at task '{task}'")]
    Cycle { task: String },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{0}' is registered more than once")]
    DuplicateTask(String),

    #[error("Tasks '{first}' and '{second}' run in the same batch but both write to '{path}'")]
    OutputOverlap {
        first: String,
        second: String,
        path: String,
    },

    #[error("Source directory '{0}' does not exist")]
    MissingSource(Utf8PathBuf),

    #[error("Source and output directories must differ")]
    SameDirectories,

    #[error("Output directory '{0}' must not live inside the source directory")]
    NestedOutput(Utf8PathBuf),

    #[error("Output directory '{0}' must not contain the source directory")]
    NestedSource(Utf8PathBuf),

    #[error("Target HTML '{0}' must be \"*\" or a plain .html file name")]
    InvalidTargetHtml(String),

    #[error("Sass output '{0}' must be a plain .css file name")]
    InvalidSassOutput(String),

    #[error("Invalid glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't read configuration file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Malformed configuration file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),
}

/// The previous output tree could not be removed.
#[derive(Debug, Error)]
#[error("Couldn't clear '{path}'.\n{source}")]
pub struct CleanError {
    pub path: Utf8PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// An external tool (or the adapter wrapping it) failed.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed: {cause:#}")]
pub struct TransformError {
    pub stage: String,
    pub cause: anyhow::Error,
}

impl TransformError {
    pub fn new(stage: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            stage: stage.into(),
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("No {0} manifest is available, its hashing step has not run")]
    MissingManifest(ManifestClass),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Malformed manifest.\n{0}")]
    Manifest(#[from] serde_json::Error),
}

/// Coarse classification of a task failure, used for the summary and for
/// picking the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    Transform,
    Rewrite,
    Io,
    Panic,
    Other,
}

impl ErrorKind {
    pub(crate) fn classify(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<TransformError>().is_some() {
            ErrorKind::Transform
        } else if err.downcast_ref::<RewriteError>().is_some() {
            ErrorKind::Rewrite
        } else if err.downcast_ref::<std::io::Error>().is_some() {
            ErrorKind::Io
        } else {
            ErrorKind::Other
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transform => "transform",
            ErrorKind::Rewrite => "rewrite",
            ErrorKind::Io => "io",
            ErrorKind::Panic => "panic",
            ErrorKind::Other => "other",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: String,
    pub kind: ErrorKind,
    pub cause: String,
}

/// At least one task failed. Every failure is listed, not just the first.
#[derive(Debug, Error)]
pub struct BuildFailedError {
    /// Tasks that completed before or alongside the failures.
    pub succeeded: Vec<String>,
    pub failures: Vec<TaskFailure>,
}

impl BuildFailedError {
    /// The most specific kind among the failures; transform failures win
    /// over rewrite failures, which win over everything else.
    pub fn kind(&self) -> ErrorKind {
        self.failures
            .iter()
            .map(|failure| failure.kind)
            .min()
            .unwrap_or(ErrorKind::Other)
    }
}

impl fmt::Display for BuildFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} task(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "  {} [{}]: {}", failure.task, failure.kind, failure.cause)?;
        }
        Ok(())
    }
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Error)]
pub enum TessenError {
    #[error("Invalid configuration.\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while clearing the output directory:\n{0}")]
    Clean(#[from] CleanError),

    #[error("Build failed.\n{0}")]
    BuildFailed(#[from] BuildFailedError),

    #[error("Build interrupted, partial output left in place")]
    Interrupted,

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TessenError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            TessenError::Config(_) => 2,
            TessenError::Clean(_) => 3,
            TessenError::BuildFailed(err) => match err.kind() {
                ErrorKind::Transform => 4,
                ErrorKind::Rewrite => 5,
                _ => 6,
            },
            TessenError::Interrupted => 130,
            #[cfg(feature = "live")]
            TessenError::Watch(_) => 1,
            TessenError::Io(_) => 1,
        }
    }
}
