use camino::Utf8PathBuf;

use super::{SourceFile, Transform};
use crate::error::TransformError;

const STAGE: &str = "sass";

/// Compiles every Sass entry point with `grass` and concatenates the results,
/// in path order, into a single stylesheet.
///
/// Partials (`_name.scss`) are only reachable through `@import`/`@use` and
/// are never compiled on their own.
pub struct Sass {
    root: Utf8PathBuf,
    output: String,
}

impl Sass {
    pub fn new(root: impl Into<Utf8PathBuf>, output: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            output: output.into(),
        }
    }
}

fn is_partial(file: &SourceFile) -> bool {
    file.path
        .file_name()
        .is_some_and(|name| name.starts_with('_'))
}

impl Transform for Sass {
    fn stage(&self) -> &str {
        STAGE
    }

    fn apply(&self, mut files: Vec<SourceFile>) -> Result<Vec<SourceFile>, TransformError> {
        files.retain(|file| !is_partial(file));
        files.sort_by(|a, b| a.path.cmp(&b.path));

        if files.is_empty() {
            return Ok(Vec::new());
        }

        let mut compiled = Vec::with_capacity(files.len());

        for file in &files {
            let dir = match file.path.parent() {
                Some(parent) => self.root.join(parent),
                None => self.root.clone(),
            };

            let options = grass::Options::default()
                .load_path(dir.as_std_path())
                .load_path(self.root.as_std_path());

            let css = grass::from_string(file.text(STAGE)?.to_owned(), &options)
                .map_err(|e| TransformError::new(STAGE, anyhow::anyhow!("{}: {e}", file.path)))?;

            compiled.push(css);
        }

        Ok(vec![SourceFile::new(
            self.output.as_str(),
            compiled.join("\n"),
        )])
    }
}
