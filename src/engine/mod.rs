//! The build engine.
//!
//! A [`BuildEngine`] owns the frozen [`Environment`] and a [`Blueprint`] that
//! knows how to lay out the task graph. Every run asks the blueprint for a
//! fresh graph, validates it before any file is touched, then executes it
//! batch by batch: all tasks of a batch run concurrently on the rayon pool,
//! and the next batch starts only once the whole batch has reported back.
//!
//! Task states survive between runs so incremental builds can tell which
//! upstream tasks still hold valid output.

mod executor;
mod report;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{CancelToken, Environment};
use crate::error::{ConfigError, ErrorKind, TaskFailure, TessenError};
use crate::graph::{TaskGraph, TaskState};
use crate::io::{clear_output, mark_incomplete};
use crate::manifest::remove_manifests;

pub use report::{BuildReport, TaskReport, render_summary};

/// Lays out the task graph for an environment.
pub trait Blueprint: Send + Sync {
    fn design(&self, env: &Arc<Environment>) -> Result<TaskGraph, ConfigError>;
}

impl<F> Blueprint for F
where
    F: Fn(&Arc<Environment>) -> Result<TaskGraph, ConfigError> + Send + Sync,
{
    fn design(&self, env: &Arc<Environment>) -> Result<TaskGraph, ConfigError> {
        self(env)
    }
}

pub struct BuildEngine<B> {
    env: Arc<Environment>,
    blueprint: B,
    states: HashMap<String, TaskState>,
    cancel: CancelToken,
}

impl<B: Blueprint> BuildEngine<B> {
    pub fn new(env: Environment, blueprint: B) -> Self {
        Self {
            env: Arc::new(env),
            blueprint,
            states: HashMap::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn blueprint(&self) -> &B {
        &self.blueprint
    }

    /// A handle that stops the current (or next) run from launching further
    /// batches.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Last known state of a task, [`TaskState::Pending`] if it never ran.
    pub fn state(&self, name: &str) -> TaskState {
        self.states
            .get(name)
            .copied()
            .unwrap_or(TaskState::Pending)
    }

    /// A freshly designed and validated graph.
    pub fn graph(&self) -> Result<TaskGraph, ConfigError> {
        let mut graph = self.blueprint.design(&self.env)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Clears the output tree and runs every task.
    pub fn run_full(&mut self) -> Result<BuildReport, TessenError> {
        let graph = self.graph()?;

        clear_output(&self.env.config.output_dir)?;
        self.states.clear();

        self.execute(&graph, None)
    }

    /// Runs every task without clearing the output tree first.
    pub fn run_graph(&mut self) -> Result<BuildReport, TessenError> {
        let graph = self.graph()?;
        self.execute(&graph, None)
    }

    /// Runs the tasks affected by `changed`: every task whose inputs match a
    /// changed path, everything depending on those, and any upstream task
    /// that has not succeeded yet (together with its own dependents).
    ///
    /// When no task claims any of the paths the whole graph runs instead.
    pub fn run_incremental(&mut self, changed: &[Utf8PathBuf]) -> Result<BuildReport, TessenError> {
        let graph = self.graph()?;
        let dirty = graph.dirty_tasks(changed.iter().map(|path| path.as_path()));

        if dirty.is_empty() {
            tracing::info!("no task reads the changed paths, running the whole graph");
            return self.execute(&graph, None);
        }

        let affected = self.affected(&graph, &dirty);
        tracing::info!(
            "{} changed, running {}",
            crate::utils::format_active(dirty.iter().map(String::as_str)),
            crate::utils::format_active(affected.iter().map(String::as_str))
        );

        self.execute(&graph, Some(affected))
    }

    fn affected(&self, graph: &TaskGraph, dirty: &BTreeSet<String>) -> BTreeSet<String> {
        let mut affected = graph.descendants(dirty);

        loop {
            let stale: BTreeSet<String> = graph
                .ancestors(&affected)
                .into_iter()
                .filter(|name| self.state(name) != TaskState::Succeeded)
                .collect();

            if stale.is_empty() {
                return affected;
            }

            affected.extend(graph.descendants(&stale));
        }
    }

    fn execute(&mut self, graph: &TaskGraph, subset: Option<BTreeSet<String>>) -> Result<BuildReport, TessenError> {
        let started = Instant::now();
        let config = self.env.config.clone();
        let grace = Duration::from_millis(config.cancel_grace_ms);

        let selected = subset.unwrap_or_else(|| graph.tasks().map(|task| task.name().to_owned()).collect());
        let mut report = BuildReport::new(selected.iter().map(String::as_str));

        for name in &selected {
            self.states.insert(name.clone(), TaskState::Pending);
        }

        let root_span = tracing::span!(Level::INFO, "build");
        root_span.pb_set_length(selected.len() as u64);
        if let Ok(style) = crate::utils::get_style_batch() {
            root_span.pb_set_style(&style);
        }
        root_span.pb_set_message("Building tasks...");
        let _enter = root_span.enter();

        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut interrupted = false;

        for batch in graph.batches_of(&selected) {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            if !failed.is_empty() && !config.keep_going {
                tracing::warn!("a task failed, not starting further batches");
                break;
            }

            // With `keepGoing`, only branches below a failure are skipped.
            let blocked = graph.descendants(&failed);
            let mut runnable = Vec::new();

            for name in batch {
                if blocked.contains(name) {
                    tracing::info!(task = name, "skipped, a dependency failed");
                    root_span.pb_inc(1);
                    continue;
                }

                let Some(task) = graph.task(name) else {
                    continue;
                };

                self.states.insert(name.to_owned(), TaskState::Running);
                report.set_state(name, TaskState::Running);
                runnable.push((name.to_owned(), task.action()));
            }

            if runnable.is_empty() {
                continue;
            }

            root_span.pb_set_message(&crate::utils::format_active(runnable.iter().map(|(name, _)| name.as_str())));

            let outcome = executor::run_batch(&self.env, runnable, &self.cancel, grace, &root_span);

            for finished in outcome.finished {
                let state = match &finished.result {
                    Ok(()) => TaskState::Succeeded,
                    Err(_) => {
                        failed.insert(finished.name.clone());
                        TaskState::Failed
                    }
                };

                self.states.insert(finished.name.clone(), state);
                report.record(&finished.name, finished.duration, finished.result);
            }

            if !outcome.abandoned.is_empty() {
                if self.cancel.is_cancelled() {
                    interrupted = true;
                    break;
                }

                // Every sender is gone but these never reported.
                for name in outcome.abandoned {
                    let failure = TaskFailure {
                        task: name.clone(),
                        kind: ErrorKind::Panic,
                        cause: "task stopped without reporting a result".into(),
                    };
                    self.states.insert(name.clone(), TaskState::Failed);
                    report.record(&name, Duration::ZERO, Err(failure));
                    failed.insert(name);
                }
            }
        }

        match remove_manifests(&config) {
            Ok(0) => {}
            Ok(count) => tracing::debug!(count, "removed stray manifests"),
            Err(e) => tracing::warn!("couldn't remove manifests: {e}"),
        }

        report.duration = started.elapsed();

        if interrupted {
            if let Err(e) = mark_incomplete(&config.output_dir) {
                tracing::warn!("couldn't flag the output as incomplete: {e}");
            }
            tracing::warn!("build interrupted {}", crate::io::as_overhead(started));
            return Err(TessenError::Interrupted);
        }

        if report.is_success() {
            tracing::info!(
                "built {} task(s) {}",
                selected.len(),
                crate::io::as_overhead(started)
            );
            Ok(report)
        } else {
            Err(TessenError::BuildFailed(report.to_error()))
        }
    }
}
