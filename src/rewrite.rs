//! Reference rewriting.
//!
//! Asset references inside HTML attribute values (`src`, `href`, `srcset`,
//! ...) are matched against a [`RenameManifest`] and replaced by their hashed
//! names. Only the matched part of the value changes, everything else in the
//! document is copied through byte for byte.
//!
//! A reference matches a manifest key when the key is a suffix of the
//! reference path starting at a `/` boundary; the longest such key wins.
//! References that already point at an older hashed variant of a key
//! (`app-0123456789.js` for `app.js`) are re-pointed as well, which makes
//! every pass safe to repeat on its own output.

use std::collections::BTreeSet;
use std::fs;
use std::ops::Range;
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;

use crate::error::RewriteError;
use crate::hash::unhashed_name;
use crate::manifest::RenameManifest;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

/// One attribute of a tag. Values are consumed whole, so names quoted inside
/// another attribute's value never match.
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s([^\s"'=<>/`]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#)
        .expect("attribute pattern is valid")
});

/// Attributes whose values hold URLs.
const URL_ATTRIBUTES: [&str; 7] = ["src", "href", "srcset", "data-src", "poster", "content", "data"];

/// Outcome of applying one manifest to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    /// Number of references replaced.
    pub replaced: usize,
    /// Manifest keys not referenced anywhere in the document.
    pub missing: Vec<String>,
}

/// Replaces every reference to a manifest key in `html`.
///
/// Keys that are not referenced are reported in [`Rewrite::missing`]; that
/// is expected and never an error.
pub fn rewrite(html: &str, manifest: &RenameManifest) -> Rewrite {
    let mut text = String::with_capacity(html.len());
    let mut used = BTreeSet::new();
    let mut replaced = 0;
    let mut cursor = 0;

    for (offset, caps) in TAG
        .find_iter(html)
        .flat_map(|tag| ATTRIBUTE.captures_iter(tag.as_str()).map(move |caps| (tag.start(), caps)))
    {
        let name = &caps[1];
        if !URL_ATTRIBUTES.iter().any(|url| name.eq_ignore_ascii_case(url)) {
            continue;
        }

        let is_srcset = name.eq_ignore_ascii_case("srcset");
        let Some(value) = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4)) else {
            continue;
        };
        let value_start = offset + value.start();

        for span in reference_spans(value.as_str(), is_srcset) {
            let start = value_start + span.start;
            let reference = &html[start..value_start + span.end];

            if let Some((range, key, hashed)) = resolve(reference, manifest) {
                text.push_str(&html[cursor..start + range.start]);
                text.push_str(hashed);
                cursor = start + range.end;
                used.insert(key);
                replaced += 1;
            }
        }
    }

    text.push_str(&html[cursor..]);

    let missing = manifest
        .keys()
        .filter(|key| !used.contains(*key))
        .map(String::from)
        .collect();

    Rewrite {
        text,
        replaced,
        missing,
    }
}

/// Applies `manifest` to the document at `path` in place.
pub fn rewrite_file(path: &Utf8Path, manifest: &RenameManifest) -> Result<Rewrite, RewriteError> {
    let html = fs::read_to_string(path)?;
    let result = rewrite(&html, manifest);

    if result.replaced > 0 {
        fs::write(path, &result.text)?;
    }

    for key in &result.missing {
        tracing::debug!(%path, %key, "reference not found in document");
    }

    Ok(result)
}

/// Splits an attribute value into the byte ranges holding URLs.
fn reference_spans(value: &str, is_srcset: bool) -> Vec<Range<usize>> {
    if !is_srcset {
        let trimmed = value.trim_start();
        let start = value.len() - trimmed.len();
        return vec![start..start + trimmed.trim_end().len()];
    }

    let mut spans = Vec::new();
    let mut offset = 0;

    for candidate in value.split(',') {
        let trimmed = candidate.trim_start();
        let start = offset + candidate.len() - trimmed.len();
        let url_len = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());

        if url_len > 0 {
            spans.push(start..start + url_len);
        }

        offset += candidate.len() + 1;
    }

    spans
}

fn is_external(reference: &str) -> bool {
    reference.starts_with("//")
        || reference.starts_with('#')
        || reference.contains("://")
        || reference.starts_with("data:")
        || reference.starts_with("mailto:")
        || reference.starts_with("javascript:")
}

/// Finds the longest manifest key that is a `/`-boundary suffix of the path
/// part of `reference`. Returns the range to replace, the key and the
/// hashed path.
fn resolve<'m>(reference: &str, manifest: &'m RenameManifest) -> Option<(Range<usize>, &'m str, &'m str)> {
    if reference.is_empty() || is_external(reference) {
        return None;
    }

    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    let path = &reference[..end];

    let starts = std::iter::once(0).chain(path.match_indices('/').map(|(i, _)| i + 1));

    for start in starts {
        let suffix = &path[start..];
        if suffix.is_empty() || suffix.starts_with("./") || suffix.starts_with("../") {
            continue;
        }

        if let Some((key, hashed)) = manifest.get_entry(suffix) {
            return Some((start..end, key, hashed));
        }

        let (dir, file) = match suffix.rfind('/') {
            Some(slash) => suffix.split_at(slash + 1),
            None => ("", suffix),
        };

        if let Some(original) = unhashed_name(file)
            && let Some((key, hashed)) = manifest.get_entry(&format!("{dir}{original}"))
        {
            return Some((start..end, key, hashed));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(entries: &[(&str, &str)]) -> RenameManifest {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rewrites_a_link() {
        let m = manifest(&[("a.css", "a-9f2c.css")]);
        let out = rewrite(r#"<link href="a.css">"#, &m);

        assert_eq!(out.text, r#"<link href="a-9f2c.css">"#);
        assert_eq!(out.replaced, 1);
        assert!(out.missing.is_empty());
    }

    #[test]
    fn unmatched_keys_leave_the_document_alone() {
        let m = manifest(&[("a.css", "a-9f2c.css"), ("b.css", "b-0000.css")]);
        let html = "<!doctype html>\n<link  href='a.css' rel=stylesheet>\n<p>b.css</p>";
        let out = rewrite(html, &m);

        assert_eq!(
            out.text,
            "<!doctype html>\n<link  href='a-9f2c.css' rel=stylesheet>\n<p>b.css</p>"
        );
        assert_eq!(out.missing, vec!["b.css".to_string()]);
    }

    #[test]
    fn matches_only_at_path_boundaries() {
        let m = manifest(&[("a.css", "a-9f2c.css")]);
        let out = rewrite(r#"<link href="data.css"><link href="css/a.css?v=2#x">"#, &m);

        assert_eq!(out.text, r#"<link href="data.css"><link href="css/a-9f2c.css?v=2#x">"#);
    }

    #[test]
    fn prefers_the_longest_key() {
        let m = manifest(&[
            ("style.css", "style-1111111111.css"),
            ("vendor/style.css", "vendor/style-2222222222.css"),
        ]);
        let out = rewrite(r#"<link href="/css/vendor/style.css"><link href="/css/style.css">"#, &m);

        assert_eq!(
            out.text,
            r#"<link href="/css/vendor/style-2222222222.css"><link href="/css/style-1111111111.css">"#
        );
    }

    #[test]
    fn repoints_previously_hashed_references() {
        let m = manifest(&[("app.js", "app-bbbbbbbbbb.js")]);
        let once = rewrite(r#"<script src="js/app-aaaaaaaaaa.js"></script>"#, &m);
        let twice = rewrite(&once.text, &m);

        assert_eq!(once.text, r#"<script src="js/app-bbbbbbbbbb.js"></script>"#);
        assert_eq!(twice.text, once.text);
    }

    #[test]
    fn leaves_external_urls_alone() {
        let m = manifest(&[("app.js", "app-bbbbbbbbbb.js")]);
        let html = r#"<script src="https://cdn.example.com/app.js"></script><script src="//cdn/app.js"></script>"#;

        assert_eq!(rewrite(html, &m).text, html);
    }

    #[test]
    fn handles_srcset_candidates() {
        let m = manifest(&[
            ("img/a.png", "img/a-1111111111.png"),
            ("img/a@2x.png", "img/a@2x-2222222222.png"),
        ]);
        let out = rewrite(r#"<img srcset="img/a.png 1x, img/a@2x.png 2x" src="img/a.png">"#, &m);

        assert_eq!(
            out.text,
            r#"<img srcset="img/a-1111111111.png 1x, img/a@2x-2222222222.png 2x" src="img/a-1111111111.png">"#
        );
        assert_eq!(out.replaced, 3);
    }

    #[test]
    fn later_passes_do_not_touch_earlier_rewrites() {
        let css = manifest(&[("style.css", "style-1111111111.css")]);
        let js = manifest(&[("app.js", "app-2222222222.js")]);

        let html = r#"<link href="style.css"><script src="app.js"></script>"#;
        let first = rewrite(html, &css);
        let second = rewrite(&first.text, &js);

        assert_eq!(
            second.text,
            r#"<link href="style-1111111111.css"><script src="app-2222222222.js"></script>"#
        );
    }

    #[test]
    fn ignores_text_and_other_attribute_values() {
        let m = manifest(&[("app.js", "app-0123456789.js")]);
        let html = "<p>set src=app.js in your config</p><a title='href=app.js' href=app.js>x</a>";
        let out = rewrite(html, &m);

        assert_eq!(
            out.text,
            "<p>set src=app.js in your config</p><a title='href=app.js' href=app-0123456789.js>x</a>"
        );
        assert_eq!(out.replaced, 1);
    }
}
