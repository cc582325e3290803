//! Watch mode is implemented as a three-part system:
//!
//! 1. **File watcher**: Uses the `notify` crate to monitor the directories
//!    the tasks read from, with debouncing so a burst of saves becomes a
//!    single rebuild.
//! 2. **WebSocket server**: Spawns a dedicated thread using `tungstenite`
//!    to maintain persistent connections with open browser tabs.
//! 3. **Client script**: The [`Environment`](crate::core::Environment)
//!    injects a small script into the built documents which reloads the
//!    page when a `"reload"` message arrives.

use std::collections::{BTreeSet, HashSet};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;

use super::DevSession;
use super::reload::{new_thread_ws_incoming, new_thread_ws_reload};
use crate::engine::{Blueprint, BuildEngine};
use crate::error::{TessenError, WatchError};

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Runs the initial full build, then serves the output tree and rebuilds on
/// every change until the engine's cancel token fires.
///
/// Task failures in any build are reported and the session goes on;
/// configuration and clean errors of the initial build are fatal.
pub fn serve<B: Blueprint>(mut engine: BuildEngine<B>, listener: TcpListener) -> Result<(), TessenError> {
    let cancel = engine.cancel_token();

    tracing::info!("running initial build...");
    match engine.run_full() {
        Ok(report) => tracing::info!("initial build completed in {:?}", report.duration),
        Err(TessenError::BuildFailed(e)) => tracing::error!("initial build failed\n{}", e.render_summary()),
        Err(e) => return Err(e),
    }

    let graph = engine.graph()?;
    let mut watched = HashSet::new();
    let mut filters = Vec::new();
    for task in graph.tasks() {
        for input in task.inputs() {
            match resolve_watch_path(input.as_str()) {
                Ok((path, pattern)) => {
                    watched.insert(path);
                    filters.push(pattern);
                }
                Err(e) => tracing::warn!("not watching {}: {e}", input.as_str()),
            }
        }
    }
    drop(graph);

    let clients = Arc::new(Mutex::new(vec![]));
    let _thread_i = new_thread_ws_incoming(listener, clients.clone());
    let (tx_reload, _thread_o) = new_thread_ws_reload(clients);

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(DEBOUNCE, None, tx).map_err(WatchError::from)?;

    // Collapse watched paths to reduce the number of watches
    for path in collapse_watch_paths(watched) {
        tracing::info!("watching {}", path);
        debouncer
            .watch(path.as_std_path(), RecursiveMode::Recursive)
            .map_err(WatchError::from)?;
    }

    #[cfg(feature = "server")]
    let _thread_http = {
        let config = &engine.env().config;
        super::http::start(config.output_dir.clone(), super::index_document(config), config.port)
    };

    let mut session = DevSession::new(engine, tx_reload);

    loop {
        if cancel.is_cancelled() {
            return Err(TessenError::Interrupted);
        }

        let events = match rx.recv_timeout(DEBOUNCE) {
            Ok(Ok(events)) => events,
            Ok(Err(errors)) => {
                for e in errors {
                    tracing::error!("watch error: {e}");
                }
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };

        let changed: BTreeSet<Utf8PathBuf> = events
            .iter()
            .filter(|de| {
                matches!(
                    de.event.kind,
                    EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                )
            })
            .flat_map(|de| &de.event.paths)
            .filter(|path| filters.iter().any(|filter| filter.matches_path(path)))
            .filter_map(|path| Utf8Path::from_path(path).map(Utf8Path::to_owned))
            .collect();

        if changed.is_empty() {
            continue;
        }

        tracing::info!("change detected in {} file(s), rebuilding...", changed.len());

        match session.on_change(&changed.into_iter().collect::<Vec<_>>()) {
            Ok(report) => tracing::info!("rebuild completed in {:?}", report.duration),
            Err(TessenError::BuildFailed(e)) => tracing::error!("rebuild failed\n{}", e.render_summary()),
            Err(TessenError::Interrupted) => return Err(TessenError::Interrupted),
            Err(e) => tracing::error!("rebuild aborted: {e}"),
        }
    }
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(glob_str: impl AsRef<str>) -> anyhow::Result<(Utf8PathBuf, Pattern)> {
    let path = Utf8Path::new(glob_str.as_ref());

    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix_part: Utf8PathBuf = components.iter().skip(split_idx).collect();

    // The static root must exist on disk
    let absolute_root = root_part.canonicalize_utf8()?;

    // A concrete file is watched through its parent so atomic writes
    // (write to temp, rename over) are caught
    let (watch_root, pattern) = if suffix_part.as_str().is_empty() && absolute_root.is_file() {
        let parent = absolute_root
            .parent()
            .unwrap_or(&absolute_root)
            .to_path_buf();
        (parent, absolute_root)
    } else {
        let pattern = absolute_root.join(&suffix_part);
        (absolute_root, pattern)
    };

    let pattern = Pattern::new(pattern.as_str())?;

    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
