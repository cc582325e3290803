//! Build options.
//!
//! A [`Config`] is read once (optionally from `tessen.json`), adjusted by the
//! command line, validated, and then frozen behind an `Arc` for the lifetime
//! of the build engine. Nothing in the pipeline reads process-wide state.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// Name of the optional configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "tessen.json";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Root of all inputs.
    pub source_dir: Utf8PathBuf,
    /// Root of all outputs, wiped by every full build.
    pub output_dir: Utf8PathBuf,
    /// `"*"` for every top-level HTML document, or one file name.
    pub target_html: String,
    /// Name of the stylesheet the Sass sources are concatenated into.
    pub sass_output_filename: String,
    /// Dev server port.
    pub port: u16,
    /// Staging area for intermediate outputs, never shipped.
    pub cache_dir: Utf8PathBuf,
    pub sass_dir: Option<Utf8PathBuf>,
    pub css_dir: Option<Utf8PathBuf>,
    pub js_dir: Option<Utf8PathBuf>,
    /// External program used to transpile and minify scripts, fed on stdin.
    pub js_command: Vec<String>,
    /// Optional external CSS prefixer, fed on stdin.
    pub prefix_command: Option<Vec<String>>,
    /// Keep running independent branches after a task failed.
    pub keep_going: bool,
    /// How long in-flight tasks may keep running after a cancellation.
    pub cancel_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: "src".into(),
            output_dir: "dest".into(),
            target_html: "*".into(),
            sass_output_filename: "style.css".into(),
            port: 8090,
            cache_dir: ".cache/tessen".into(),
            sass_dir: None,
            css_dir: None,
            js_dir: None,
            js_command: ["esbuild", "--minify", "--target=es5", "--loader=js"]
                .into_iter()
                .map(String::from)
                .collect(),
            prefix_command: None,
            keep_going: false,
            cancel_grace_ms: 5000,
        }
    }
}

impl Config {
    /// Reads `path` if it exists, falling back to defaults otherwise.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(%path, "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    pub fn sass_dir(&self) -> Utf8PathBuf {
        self.sass_dir
            .clone()
            .unwrap_or_else(|| self.source_dir.join("sass"))
    }

    pub fn css_dir(&self) -> Utf8PathBuf {
        self.css_dir
            .clone()
            .unwrap_or_else(|| self.source_dir.join("css"))
    }

    pub fn js_dir(&self) -> Utf8PathBuf {
        self.js_dir
            .clone()
            .unwrap_or_else(|| self.source_dir.join("js"))
    }

    pub fn css_output_dir(&self) -> Utf8PathBuf {
        self.output_dir.join("css")
    }

    pub fn js_output_dir(&self) -> Utf8PathBuf {
        self.output_dir.join("js")
    }

    /// Where the Sass branch stages its concatenated stylesheet.
    pub fn sass_stage_dir(&self) -> Utf8PathBuf {
        self.cache_dir.join("sass")
    }

    pub fn targets_all_html(&self) -> bool {
        self.target_html == "*"
    }

    /// Checks the options without touching the output tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.source_dir.is_dir() {
            return Err(ConfigError::MissingSource(self.source_dir.clone()));
        }

        let source = absolute(&self.source_dir);
        let output = absolute(&self.output_dir);

        if source == output {
            return Err(ConfigError::SameDirectories);
        }

        if output.starts_with(&source) {
            return Err(ConfigError::NestedOutput(self.output_dir.clone()));
        }

        // Clearing the output would take the sources with it.
        if source.starts_with(&output) {
            return Err(ConfigError::NestedSource(self.output_dir.clone()));
        }

        if !self.targets_all_html() && !is_plain_file_name(&self.target_html, "html") {
            return Err(ConfigError::InvalidTargetHtml(self.target_html.clone()));
        }

        if !is_plain_file_name(&self.sass_output_filename, "css") {
            return Err(ConfigError::InvalidSassOutput(
                self.sass_output_filename.clone(),
            ));
        }

        Ok(())
    }
}

/// Normalized form of `path`, joined onto the working directory when relative.
fn absolute(path: &Utf8Path) -> Utf8PathBuf {
    let cwd = std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::try_from(dir).ok());

    match cwd {
        Some(cwd) if path.is_relative() => crate::utils::normalize_path(&cwd.join(path)),
        _ => crate::utils::normalize_path(path),
    }
}

fn is_plain_file_name(name: &str, ext: &str) -> bool {
    let path = Utf8Path::new(name);
    path.components().count() == 1
        && path.extension() == Some(ext)
        && path.file_stem().is_some_and(|stem| !stem.is_empty())
}
