use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::{SourceFile, Transform};
use crate::error::TransformError;

const STAGE: &str = "minify-html";

/// Elements whose contents are whitespace sensitive and copied verbatim.
static RAW_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<pre\b.*?</pre>|<textarea\b.*?</textarea>|<script\b.*?</script>|<style\b.*?</style>")
        .expect("raw block pattern is valid")
});

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment pattern is valid"));

/// Whitespace between two tags that spans a line break.
static TAG_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s*\n\s*<").expect("tag gap pattern is valid"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// `type` attributes that only restate the browser default.
static DEFAULT_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(<(?:script|style|link)\b[^>]*?)\s+type\s*=\s*(?:"text/(?:javascript|css)"|'text/(?:javascript|css)'|text/(?:javascript|css)\b)"#,
    )
    .expect("type attribute pattern is valid")
});

/// Built-in HTML minifier: drops comments (conditional comments survive),
/// collapses whitespace outside of `pre`/`textarea`/`script`/`style`, and
/// removes default `type` attributes from `script`, `style` and `link`.
pub struct MinifyHtml;

impl MinifyHtml {
    pub fn minify(html: &str) -> String {
        let mut out = String::with_capacity(html.len());
        let mut cursor = 0;

        for block in RAW_BLOCK.find_iter(html) {
            out.push_str(&collapse(&html[cursor..block.start()], cursor > 0, true));
            out.push_str(block.as_str());
            cursor = block.end();
        }
        out.push_str(&collapse(&html[cursor..], cursor > 0, false));

        DEFAULT_TYPE.replace_all(out.trim(), "$1").into_owned()
    }
}

/// Collapses one stretch of markup between raw blocks. Line-breaking
/// whitespace next to a neighbouring raw block is dropped like a gap between
/// two tags.
fn collapse(text: &str, after_block: bool, before_block: bool) -> String {
    let text = COMMENT.replace_all(text, |caps: &Captures| {
        let comment = &caps[0];
        if comment.starts_with("<!--[if") || comment.starts_with("<!--<![endif") {
            comment.to_owned()
        } else {
            String::new()
        }
    });

    let mut text: &str = &text;

    if after_block {
        let trimmed = text.trim_start();
        if text[..text.len() - trimmed.len()].contains('\n') {
            text = trimmed;
        }
    }

    if before_block {
        let trimmed = text.trim_end();
        if text[trimmed.len()..].contains('\n') {
            text = trimmed;
        }
    }

    let text = TAG_GAP.replace_all(text, "><");
    WHITESPACE.replace_all(&text, " ").into_owned()
}

impl Transform for MinifyHtml {
    fn stage(&self) -> &str {
        STAGE
    }

    fn apply(&self, files: Vec<SourceFile>) -> Result<Vec<SourceFile>, TransformError> {
        files
            .into_iter()
            .map(|file| -> Result<SourceFile, TransformError> {
                let html = Self::minify(file.text(STAGE)?);
                Ok(SourceFile::new(file.path, html))
            })
            .collect()
    }
}
