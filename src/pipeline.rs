//! The front-end pipeline.
//!
//! ```text
//! sass ──► css ──► rewrite:css ──► rewrite:js ──► rewrite:assets ──► manifests:remove
//!          html ──┘                │                │
//!          js ─────────────────────┘                │
//!          assets ──────────────────────────────────┘
//! ```
//!
//! Each hashing branch writes its manifest next to its files, the rewrite
//! passes apply the manifests to the target documents in a fixed order, and
//! the last task deletes the manifests again.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::Config;
use crate::core::{Environment, TaskContext};
use crate::engine::Blueprint;
use crate::error::ConfigError;
use crate::graph::{TaskGraph, TaskResult};
use crate::hash::{AssetFile, hash};
use crate::io::{glob_files, glob_root};
use crate::manifest::{ManifestClass, ManifestStore, remove_manifests};
use crate::rewrite::rewrite_file;
use crate::transform::{SourceFile, Toolchain, Transform};

/// Extensions handled by a dedicated branch and never copied as assets.
const COMPILED: [&str; 4] = ["html", "js", "css", "scss"];

/// Lays out the standard front-end build: Sass, CSS, JS, HTML and static
/// assets, content hashing, and the three rewrite passes.
pub struct FrontendPipeline {
    toolchain: Toolchain,
    manifests: Arc<ManifestStore>,
}

impl FrontendPipeline {
    pub fn new(toolchain: Toolchain) -> Self {
        Self {
            toolchain,
            manifests: Arc::new(ManifestStore::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Toolchain::from_config(config))
    }

    /// Manifests retained from the last run of each hashing step.
    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }
}

impl Blueprint for FrontendPipeline {
    fn design(&self, env: &Arc<Environment>) -> Result<TaskGraph, ConfigError> {
        let config = &env.config;
        config.validate()?;

        let source = glob_root(&config.source_dir);
        let documents: Vec<Utf8PathBuf> = html_targets(config)?
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| config.output_dir.join(name))
            .collect();

        let mut graph = TaskGraph::new();

        let sass = self.toolchain.sass.clone();
        graph
            .add_task("sass", &[], move |ctx| build_sass(ctx, sass.as_ref()))
            .watch(&format!("{}/**/*.scss", glob_root(&config.sass_dir())))?
            .claim(config.sass_stage_dir());

        let css = self.toolchain.css.clone();
        let manifests = self.manifests.clone();
        graph
            .add_task("css", &["sass"], move |ctx| build_css(ctx, css.as_ref(), &manifests))
            .watch(&format!("{}/*.css", glob_root(&config.css_dir())))?
            .claim(config.css_output_dir());

        let js = self.toolchain.js.clone();
        let manifests = self.manifests.clone();
        graph
            .add_task("js", &[], move |ctx| build_js(ctx, js.as_ref(), &manifests))
            .watch(&format!("{}/*.js", glob_root(&config.js_dir())))?
            .claim(config.js_output_dir());

        let html = self.toolchain.html.clone();
        let task = graph
            .add_task("html", &[], move |ctx| build_html(ctx, html.as_ref()))
            .watch(&html_pattern(config))?;
        for document in &documents {
            task.claim(document.clone());
        }

        let manifests = self.manifests.clone();
        let task = graph
            .add_task("assets", &[], move |ctx| build_assets(ctx, &manifests))
            .watch(&format!("{source}/**/*"))?;
        for ext in COMPILED {
            task.exclude(&format!("{source}/**/*.{ext}"))?;
        }
        task.claim(ManifestClass::Assets.manifest_path(config));
        for asset in asset_sources(config)? {
            if let Ok(relative) = asset.strip_prefix(&config.source_dir) {
                task.claim_glob(&hashed_glob(&config.output_dir, relative))?;
            }
        }

        // One pass per manifest, each waiting for the previous pass.
        let mut previous = "html".to_string();
        for class in ManifestClass::ORDER {
            let producer = match class {
                ManifestClass::Css => "css",
                ManifestClass::Js => "js",
                ManifestClass::Assets => "assets",
            };

            let name = format!("rewrite:{class}");
            let manifests = self.manifests.clone();
            let task = graph.add_task(&name, &[producer, previous.as_str()], move |ctx| {
                rewrite_documents(ctx, class, &manifests)
            });
            for document in &documents {
                task.claim(document.clone());
            }

            previous = name;
        }

        graph.add_task("manifests:remove", &[previous.as_str()], |ctx| {
            let removed = remove_manifests(ctx.config())?;
            tracing::debug!(removed, "removed manifests");
            Ok(())
        });

        Ok(graph)
    }
}

/// The documents selected by `targetHtml`, in the source tree.
pub fn html_targets(config: &Config) -> Result<Vec<Utf8PathBuf>, ConfigError> {
    if config.targets_all_html() {
        return list(&format!("{}/*.html", glob_root(&config.source_dir)));
    }

    let path = config.source_dir.join(&config.target_html);
    if path.is_file() {
        Ok(vec![path])
    } else {
        tracing::warn!(%path, "target document does not exist");
        Ok(Vec::new())
    }
}

fn html_pattern(config: &Config) -> String {
    let root = glob_root(&config.source_dir);
    if config.targets_all_html() {
        format!("{root}/*.html")
    } else {
        format!("{root}/{}", glob::Pattern::escape(&config.target_html))
    }
}

/// Static files copied as they are: every source file no other branch
/// compiles, wherever it lives in the tree.
pub fn asset_sources(config: &Config) -> Result<Vec<Utf8PathBuf>, ConfigError> {
    let assets = list(&format!("{}/**/*", glob_root(&config.source_dir)))?
        .into_iter()
        .filter(|path| {
            !path
                .extension()
                .is_some_and(|ext| COMPILED.iter().any(|c| ext.eq_ignore_ascii_case(c)))
        })
        .collect();

    Ok(assets)
}

/// Sorted regular files matching `pattern`.
fn list(pattern: &str) -> Result<Vec<Utf8PathBuf>, ConfigError> {
    let mut files = Vec::new();

    for entry in glob::glob(pattern)? {
        let path = entry.map_err(|e| {
            let path = Utf8PathBuf::from(e.path().to_string_lossy().as_ref());
            ConfigError::Read(path, e.into())
        })?;
        match Utf8PathBuf::try_from(path) {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => tracing::warn!("skipping non UTF-8 path {:?}", e.as_path()),
        }
    }

    files.sort();
    Ok(files)
}

/// Every name the hashed copy of `relative` may take under `root`.
fn hashed_glob(root: &Utf8Path, relative: &Utf8Path) -> String {
    let dir = match relative.parent() {
        Some(parent) => root.join(parent),
        None => root.to_owned(),
    };

    let name = match (relative.file_stem(), relative.extension()) {
        (Some(stem), Some(ext)) => format!("{}-*.{}", glob::Pattern::escape(stem), glob::Pattern::escape(ext)),
        _ => format!("{}-*", glob::Pattern::escape(relative.file_name().unwrap_or_default())),
    };

    format!("{}/{name}", glob_root(&dir))
}

/// Reads every file matching `pattern` under `root`, with paths relative to
/// `root`.
fn read_sources(root: &Utf8Path, pattern: &str) -> anyhow::Result<Vec<SourceFile>> {
    let mut sources = Vec::new();

    for path in glob_files(&format!("{}/{pattern}", glob_root(root)))? {
        let data = fs::read(&path)?;
        let relative = path.strip_prefix(root)?.to_owned();
        sources.push(SourceFile::new(relative, data));
    }

    Ok(sources)
}

/// Writes `files` under the class directory, hashes them and retains the
/// resulting manifest.
fn publish(
    ctx: &TaskContext,
    files: Vec<SourceFile>,
    class: ManifestClass,
    manifests: &ManifestStore,
) -> TaskResult {
    let root = class.target_dir(ctx.config());
    fs::create_dir_all(&root)?;

    let mut assets = Vec::with_capacity(files.len());
    for file in files {
        crate::io::write(&root.join(&file.path), &file.data)?;
        assets.push(AssetFile::new(file.path, class));
    }

    let previous = manifests.get(class);
    let manifest = hash(&mut assets, &root, class, previous.as_ref())?;

    tracing::info!("hashed {} {class} file(s)", manifest.len());
    manifests.retain(class, manifest);

    Ok(())
}

fn build_sass(ctx: &TaskContext, sass: &dyn Transform) -> TaskResult {
    let config = ctx.config();
    let staged = config.sass_stage_dir().join(&config.sass_output_filename);

    match fs::remove_file(&staged) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let sources = read_sources(&config.sass_dir(), "**/*.scss")?;
    ctx.span.pb_set_message(&format!("Compiling {} Sass file(s)", sources.len()));

    for file in sass.apply(sources)? {
        crate::io::write(&config.sass_stage_dir().join(&file.path), &file.data)?;
    }

    Ok(())
}

fn build_css(ctx: &TaskContext, css: &dyn Transform, manifests: &ManifestStore) -> TaskResult {
    let config = ctx.config();

    let mut sources: BTreeMap<Utf8PathBuf, SourceFile> = read_sources(&config.css_dir(), "*.css")?
        .into_iter()
        .map(|file| (file.path.clone(), file))
        .collect();

    let staged = config.sass_stage_dir().join(&config.sass_output_filename);
    if staged.is_file() {
        let file = SourceFile::new(config.sass_output_filename.as_str(), fs::read(&staged)?);
        if sources.insert(file.path.clone(), file).is_some() {
            tracing::warn!(
                "{} in {} is replaced by the compiled Sass output",
                config.sass_output_filename,
                config.css_dir()
            );
        }
    }

    let files = css.apply(sources.into_values().collect())?;
    publish(ctx, files, ManifestClass::Css, manifests)
}

fn build_js(ctx: &TaskContext, js: &dyn Transform, manifests: &ManifestStore) -> TaskResult {
    let sources = read_sources(&ctx.config().js_dir(), "*.js")?;
    ctx.span.pb_set_message(&format!("Compiling {} script(s)", sources.len()));

    let files = js.apply(sources)?;
    publish(ctx, files, ManifestClass::Js, manifests)
}

fn build_html(ctx: &TaskContext, html: &dyn Transform) -> TaskResult {
    let config = ctx.config();

    let mut sources = Vec::new();
    for path in html_targets(config)? {
        let relative = path.strip_prefix(&config.source_dir)?.to_owned();
        sources.push(SourceFile::new(relative, fs::read(&path)?));
    }

    let script = ctx.env.get_refresh_script();

    for file in html.apply(sources)? {
        let text = String::from_utf8(file.data)?;
        let text = match &script {
            Some(script) => inject(text, script),
            None => text,
        };

        crate::io::write(&config.output_dir.join(&file.path), text)?;
    }

    Ok(())
}

/// Places `script` right before the closing `</body>`, or at the end.
fn inject(mut html: String, script: &str) -> String {
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(at) => html.insert_str(at, script),
        None => html.push_str(script),
    }

    html
}

fn build_assets(ctx: &TaskContext, manifests: &ManifestStore) -> TaskResult {
    let config = ctx.config();
    let sources = asset_sources(config)?;

    ctx.span.pb_set_length(sources.len() as u64);
    ctx.span.pb_set_message("Copying assets");

    let mut assets = Vec::with_capacity(sources.len());
    for path in sources {
        let relative = path.strip_prefix(&config.source_dir)?.to_owned();
        let target = config.output_dir.join(&relative);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&path, &target)?;

        assets.push(AssetFile::new(relative, ManifestClass::Assets));
        ctx.span.pb_inc(1);
    }

    let previous = manifests.get(ManifestClass::Assets);
    let manifest = hash(&mut assets, &config.output_dir, ManifestClass::Assets, previous.as_ref())?;

    tracing::info!("hashed {} asset(s)", manifest.len());
    manifests.retain(ManifestClass::Assets, manifest);

    Ok(())
}

fn rewrite_documents(ctx: &TaskContext, class: ManifestClass, manifests: &ManifestStore) -> TaskResult {
    let config = ctx.config();
    let manifest = manifests.load(class, config)?;

    let mut replaced = 0;
    let mut missing = 0;

    for source in html_targets(config)? {
        let Some(name) = source.file_name() else {
            continue;
        };

        let document = config.output_dir.join(name);
        if !document.is_file() {
            tracing::debug!(%document, "document not built, nothing to rewrite");
            continue;
        }

        let result = rewrite_file(&document, &manifest)?;
        replaced += result.replaced;
        missing += result.missing.len();
    }

    tracing::info!("rewrote {replaced} {class} reference(s), {missing} unreferenced");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::from_fn;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn config_in(root: &Utf8Path) -> Config {
        Config {
            source_dir: root.join("src"),
            output_dir: root.join("dest"),
            cache_dir: root.join("cache"),
            ..Config::default()
        }
    }

    fn pipeline(config: &Config) -> FrontendPipeline {
        let passthrough = from_fn("js", Ok);
        FrontendPipeline::new(Toolchain {
            js: passthrough,
            ..Toolchain::from_config(config)
        })
    }

    #[test]
    fn batches_follow_the_manifest_order() {
        let (_guard, root) = tempdir();
        crate::io::write(&root.join("src/index.html"), "<p>hi</p>").unwrap();
        crate::io::write(&root.join("src/img/logo.png"), "png").unwrap();

        let config = config_in(&root);
        let env = Arc::new(Environment::build(config.clone()));
        let mut graph = pipeline(&config).design(&env).unwrap();
        graph.validate().unwrap();

        let batches: Vec<Vec<&str>> = graph.batches().collect();
        assert_eq!(
            batches,
            vec![
                vec!["assets", "html", "js", "sass"],
                vec!["css"],
                vec!["rewrite:css"],
                vec!["rewrite:js"],
                vec!["rewrite:assets"],
                vec!["manifests:remove"],
            ]
        );
    }

    #[test]
    fn changed_paths_map_to_their_branch() {
        let (_guard, root) = tempdir();
        crate::io::write(&root.join("src/index.html"), "").unwrap();

        let config = config_in(&root);
        let env = Arc::new(Environment::build(config.clone()));
        let graph = pipeline(&config).design(&env).unwrap();

        let dirty = |path: &str| {
            let path = root.join(path);
            graph
                .dirty_tasks([path.as_path()])
                .into_iter()
                .collect::<Vec<_>>()
        };

        assert_eq!(dirty("src/js/app.js"), vec!["js"]);
        assert_eq!(dirty("src/sass/_vars.scss"), vec!["sass"]);
        assert_eq!(dirty("src/css/base.css"), vec!["css"]);
        assert_eq!(dirty("src/index.html"), vec!["html"]);
        assert_eq!(dirty("src/fonts/a.woff2"), vec!["assets"]);
        assert_eq!(dirty("src/css/img/bg.png"), vec!["assets"]);
        assert_eq!(dirty("src/about/page.html"), Vec::<String>::new());
    }

    #[test]
    fn assets_skip_only_compiled_sources() {
        let (_guard, root) = tempdir();
        for file in [
            "a.html",
            "img/b.png",
            "js/vendor.js.map",
            "css/img/bg.png",
            "css/site.css",
            "sass/c.scss",
            "d.txt",
            "lib/e.JS",
        ] {
            crate::io::write(&root.join("src").join(file), "x").unwrap();
        }

        let config = config_in(&root);
        let assets = asset_sources(&config).unwrap();

        assert_eq!(
            assets,
            vec![
                root.join("src/css/img/bg.png"),
                root.join("src/d.txt"),
                root.join("src/img/b.png"),
                root.join("src/js/vendor.js.map"),
            ]
        );
    }

    #[test]
    fn refresh_script_goes_before_the_body_end() {
        assert_eq!(inject("<body><p>x</p></BODY>".into(), "<s>"), "<body><p>x</p><s></BODY>");
        assert_eq!(inject("<p>x</p>".into(), "<s>"), "<p>x</p><s>");
    }

    #[test]
    fn specific_target_is_the_only_document() {
        let (_guard, root) = tempdir();
        crate::io::write(&root.join("src/index.html"), "").unwrap();
        crate::io::write(&root.join("src/test.html"), "").unwrap();

        let config = Config {
            target_html: "test.html".into(),
            ..config_in(&root)
        };

        assert_eq!(html_targets(&config).unwrap(), vec![root.join("src/test.html")]);
        assert_eq!(html_pattern(&config), format!("{}/test.html", root.join("src")));
    }

    #[test]
    fn hashed_globs_cover_the_hashed_copy() {
        let pattern = hashed_glob(Utf8Path::new("/dest"), Utf8Path::new("img/logo.png"));
        assert_eq!(pattern, "/dest/img/logo-*.png");
        assert!(glob::Pattern::new(&pattern).unwrap().matches("/dest/img/logo-0123456789.png"));
    }
}
