use super::{SourceFile, Transform};
use crate::error::TransformError;

const STAGE: &str = "minify-css";

/// Minifies stylesheets by re-emitting them through `grass` in compressed
/// style. Plain CSS is valid SCSS, so nothing else is needed.
pub struct MinifyCss;

impl Transform for MinifyCss {
    fn stage(&self) -> &str {
        STAGE
    }

    fn apply(&self, files: Vec<SourceFile>) -> Result<Vec<SourceFile>, TransformError> {
        let options = grass::Options::default().style(grass::OutputStyle::Compressed);

        files
            .into_iter()
            .map(|file| -> Result<SourceFile, TransformError> {
                let css = grass::from_string(file.text(STAGE)?.to_owned(), &options).map_err(|e| {
                    TransformError::new(STAGE, anyhow::anyhow!("{}: {e}", file.path))
                })?;

                Ok(SourceFile::new(file.path, css.trim_end()))
            })
            .collect()
    }
}
