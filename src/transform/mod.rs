//! Transform adapters.
//!
//! Every external concern of the pipeline (style preprocessing, prefixing,
//! transpilation, minification) sits behind the same [`Transform`] contract:
//! a set of files goes in, a set of files comes out. Adapters compose with
//! [`Chain`], and tests swap any of them for a closure via [`from_fn`].

mod command;
mod css;
mod html;
mod sass;

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::config::Config;
use crate::error::TransformError;

pub use command::Command;
pub use css::MinifyCss;
pub use html::MinifyHtml;
pub use sass::Sass;

/// One file flowing through a transform. The path is relative to the
/// directory the branch reads from or writes to.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: Utf8PathBuf,
    pub data: Vec<u8>,
}

impl SourceFile {
    pub fn new(path: impl Into<Utf8PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }

    /// The contents as text, failing with a transform error of `stage` when
    /// they are not UTF-8.
    pub fn text(&self, stage: &str) -> Result<&str, TransformError> {
        std::str::from_utf8(&self.data).map_err(|e| {
            TransformError::new(stage, anyhow::anyhow!("{} is not valid UTF-8: {e}", self.path))
        })
    }
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("path", &self.path)
            .field("len", &self.data.len())
            .finish()
    }
}

/// File-in/file-out contract shared by every adapter.
pub trait Transform: Send + Sync {
    /// Name reported in [`TransformError::stage`].
    fn stage(&self) -> &str;

    fn apply(&self, files: Vec<SourceFile>) -> Result<Vec<SourceFile>, TransformError>;
}

/// Runs transforms one after another, feeding each the previous output.
pub struct Chain {
    stage: String,
    steps: Vec<Arc<dyn Transform>>,
}

impl Chain {
    pub fn new(steps: Vec<Arc<dyn Transform>>) -> Self {
        let stage = steps
            .iter()
            .map(|step| step.stage())
            .collect::<Vec<_>>()
            .join("+");

        Self { stage, steps }
    }
}

impl Transform for Chain {
    fn stage(&self) -> &str {
        &self.stage
    }

    fn apply(&self, mut files: Vec<SourceFile>) -> Result<Vec<SourceFile>, TransformError> {
        for step in &self.steps {
            files = step.apply(files)?;
        }
        Ok(files)
    }
}

/// Transform backed by a closure.
pub struct FnTransform<F> {
    stage: String,
    f: F,
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(Vec<SourceFile>) -> anyhow::Result<Vec<SourceFile>> + Send + Sync,
{
    fn stage(&self) -> &str {
        &self.stage
    }

    fn apply(&self, files: Vec<SourceFile>) -> Result<Vec<SourceFile>, TransformError> {
        (self.f)(files).map_err(|cause| TransformError::new(self.stage.clone(), cause))
    }
}

pub fn from_fn<F>(stage: impl Into<String>, f: F) -> Arc<dyn Transform>
where
    F: Fn(Vec<SourceFile>) -> anyhow::Result<Vec<SourceFile>> + Send + Sync + 'static,
{
    Arc::new(FnTransform {
        stage: stage.into(),
        f,
    })
}

/// The adapters used by the front-end pipeline, one per branch.
#[derive(Clone)]
pub struct Toolchain {
    /// All Sass entry points in, one concatenated stylesheet out.
    pub sass: Arc<dyn Transform>,
    /// Prefixing and minification of plain stylesheets.
    pub css: Arc<dyn Transform>,
    /// Transpilation and minification of scripts.
    pub js: Arc<dyn Transform>,
    pub html: Arc<dyn Transform>,
}

impl Toolchain {
    pub fn from_config(config: &Config) -> Self {
        let css: Arc<dyn Transform> = match &config.prefix_command {
            Some(argv) => {
                let prefix: Arc<dyn Transform> = Arc::new(Command::new("prefix", argv.clone()));
                let minify: Arc<dyn Transform> = Arc::new(MinifyCss);
                Arc::new(Chain::new(vec![prefix, minify]))
            }
            None => Arc::new(MinifyCss),
        };

        Self {
            sass: Arc::new(Sass::new(config.sass_dir(), &config.sass_output_filename)),
            css,
            js: Arc::new(Command::new("js", config.js_command.clone())),
            html: Arc::new(MinifyHtml),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_feeds_each_step_the_previous_output() {
        let upper = from_fn("upper", |files: Vec<SourceFile>| {
            Ok(files
                .into_iter()
                .map(|f| SourceFile::new(f.path, f.data.to_ascii_uppercase()))
                .collect())
        });
        let suffix = from_fn("suffix", |files: Vec<SourceFile>| {
            Ok(files
                .into_iter()
                .map(|mut f| {
                    f.data.extend_from_slice(b"!");
                    f
                })
                .collect())
        });

        let chain = Chain::new(vec![upper, suffix]);
        let out = chain.apply(vec![SourceFile::new("a.txt", "hi")]).unwrap();

        assert_eq!(chain.stage(), "upper+suffix");
        assert_eq!(out, vec![SourceFile::new("a.txt", "HI!")]);
    }

    #[test]
    fn closure_failures_carry_the_stage_name() {
        let failing = from_fn("sass", |_| anyhow::bail!("expected `}}`"));
        let err = failing.apply(Vec::new()).unwrap_err();

        assert_eq!(err.stage, "sass");
        assert!(err.to_string().contains("expected"));
    }
}
