//! Development mode.
//!
//! A [`DevSession`] turns batches of changed paths into incremental builds
//! and emits exactly one reload signal per completed build, whether the
//! build succeeded or some tasks failed. The file watcher, the websocket
//! server that forwards the signal to browsers, and the HTTP server for the
//! output tree are thin shells around it (features `live` and `server`).

#[cfg(feature = "server")]
mod http;
#[cfg(feature = "live")]
mod reload;
#[cfg(feature = "live")]
mod watch;

use std::sync::mpsc::Sender;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::engine::{Blueprint, BuildEngine, BuildReport};
use crate::error::TessenError;
use crate::pipeline::html_targets;

#[cfg(feature = "live")]
pub use reload::reserve_port;
#[cfg(feature = "live")]
pub use watch::serve;

pub struct DevSession<B> {
    engine: BuildEngine<B>,
    reload: Sender<()>,
    /// Working directory, stripped from watcher paths when the source tree
    /// is configured relative to it.
    cwd: Option<Utf8PathBuf>,
}

impl<B: Blueprint> DevSession<B> {
    pub fn new(engine: BuildEngine<B>, reload: Sender<()>) -> Self {
        let cwd = if engine.env().config.source_dir.is_relative() {
            std::env::current_dir()
                .ok()
                .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
        } else {
            None
        };

        Self { engine, reload, cwd }
    }

    pub fn engine(&self) -> &BuildEngine<B> {
        &self.engine
    }

    /// Rebuilds what `paths` affect. A reload is signalled once the build
    /// has run to completion, even if tasks failed, so the browser shows the
    /// partial output; configuration errors and interruptions signal nothing.
    pub fn on_change(&mut self, paths: &[Utf8PathBuf]) -> Result<BuildReport, TessenError> {
        let paths: Vec<Utf8PathBuf> = paths.iter().map(|path| self.localize(path)).collect();
        let result = self.engine.run_incremental(&paths);

        if matches!(result, Ok(_) | Err(TessenError::BuildFailed(_))) && self.reload.send(()).is_err() {
            tracing::debug!("reload channel closed");
        }

        result
    }

    fn localize(&self, path: &Utf8Path) -> Utf8PathBuf {
        match &self.cwd {
            Some(cwd) => path.strip_prefix(cwd).unwrap_or(path).to_owned(),
            None => path.to_owned(),
        }
    }
}

/// The document served at `/`: the configured target, otherwise
/// `index.html`, otherwise the first document in name order.
pub fn index_document(config: &Config) -> Option<String> {
    if !config.targets_all_html() {
        return Some(config.target_html.clone());
    }

    let targets = html_targets(config).ok()?;
    let names: Vec<&str> = targets.iter().filter_map(|path| path.file_name()).collect();

    if names.contains(&"index.html") {
        return Some("index.html".into());
    }

    names.first().map(|name| name.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc::channel;

    use super::*;
    use crate::core::{Environment, TaskContext};
    use crate::error::ConfigError;
    use crate::graph::TaskGraph;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn config_in(root: &Utf8Path) -> Config {
        Config {
            source_dir: root.join("src"),
            output_dir: root.join("dest"),
            ..Config::default()
        }
    }

    #[test]
    fn one_reload_per_build_even_when_it_fails() {
        let (_guard, root) = tempdir();
        let src = root.join("src");

        let engine = BuildEngine::new(
            Environment::watch(config_in(&root), 1337),
            move |_: &Arc<Environment>| -> Result<TaskGraph, ConfigError> {
                let mut graph = TaskGraph::new();
                graph
                    .add_task("js", &[], |_: &TaskContext| Ok(()))
                    .watch(&format!("{src}/js/*.js"))?;
                graph
                    .add_task("sass", &[], |_: &TaskContext| anyhow::bail!("broken"))
                    .watch(&format!("{src}/sass/*.scss"))?;
                Ok(graph)
            },
        );

        let (tx, rx) = channel();
        let mut session = DevSession::new(engine, tx);

        session.on_change(&[root.join("src/js/app.js")]).unwrap();
        assert_eq!(rx.try_iter().count(), 1);

        let err = session
            .on_change(&[root.join("src/sass/app.scss")])
            .unwrap_err();
        assert!(matches!(err, TessenError::BuildFailed(_)));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn configuration_errors_do_not_reload() {
        let (_guard, root) = tempdir();

        let engine = BuildEngine::new(
            Environment::watch(config_in(&root), 1337),
            |_: &Arc<Environment>| -> Result<TaskGraph, ConfigError> {
                let mut graph = TaskGraph::new();
                graph.add_task("rewrite", &["missing"], |_: &TaskContext| Ok(()));
                Ok(graph)
            },
        );

        let (tx, rx) = channel();
        let mut session = DevSession::new(engine, tx);

        assert!(session.on_change(&[root.join("src/a.js")]).is_err());
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn index_prefers_target_then_index_then_first() {
        let (_guard, root) = tempdir();
        let config = config_in(&root);

        crate::io::write(&root.join("src/b.html"), "").unwrap();
        crate::io::write(&root.join("src/a.html"), "").unwrap();
        assert_eq!(index_document(&config).as_deref(), Some("a.html"));

        crate::io::write(&root.join("src/index.html"), "").unwrap();
        assert_eq!(index_document(&config).as_deref(), Some("index.html"));

        let specific = Config {
            target_html: "b.html".into(),
            ..config
        };
        assert_eq!(index_document(&specific).as_deref(), Some("b.html"));
    }
}
