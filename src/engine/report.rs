use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

use console::style;

use crate::error::{BuildFailedError, TaskFailure};
use crate::graph::TaskState;

/// What happened to one task during a run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub state: TaskState,
    /// Wall time of the action, when it ran.
    pub duration: Option<Duration>,
    pub failure: Option<TaskFailure>,
}

/// Per-task outcome of a single engine run.
///
/// Only the tasks selected for the run are listed. Tasks that were never
/// started (a batch was halted, a dependency failed, or the run was
/// cancelled) stay [`TaskState::Pending`].
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    tasks: BTreeMap<String, TaskReport>,
    pub duration: Duration,
}

impl BuildReport {
    pub(crate) fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let tasks = names
            .into_iter()
            .map(|name| {
                let report = TaskReport {
                    state: TaskState::Pending,
                    duration: None,
                    failure: None,
                };
                (name.to_owned(), report)
            })
            .collect();

        Self {
            tasks,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn set_state(&mut self, name: &str, state: TaskState) {
        if let Some(task) = self.tasks.get_mut(name) {
            task.state = state;
        }
    }

    pub(crate) fn record(&mut self, name: &str, duration: Duration, result: Result<(), TaskFailure>) {
        if let Some(task) = self.tasks.get_mut(name) {
            task.duration = Some(duration);
            match result {
                Ok(()) => task.state = TaskState::Succeeded,
                Err(failure) => {
                    task.state = TaskState::Failed;
                    task.failure = Some(failure);
                }
            }
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&str, &TaskReport)> {
        self.tasks.iter().map(|(name, task)| (name.as_str(), task))
    }

    /// Names of the tasks that were part of this run.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn succeeded(&self) -> Vec<String> {
        self.in_state(TaskState::Succeeded)
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.tasks
            .values()
            .filter_map(|task| task.failure.clone())
            .collect()
    }

    pub fn in_state(&self, state: TaskState) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.state == state)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.tasks
            .values()
            .all(|task| task.state == TaskState::Succeeded)
    }

    pub(crate) fn to_error(&self) -> BuildFailedError {
        BuildFailedError {
            succeeded: self.succeeded(),
            failures: self.failures(),
        }
    }

    pub fn render_summary(&self) -> String {
        let mut summary = render_summary(&self.succeeded(), &self.failures());

        let skipped = self.in_state(TaskState::Pending);
        if !skipped.is_empty() {
            let _ = writeln!(
                summary,
                "{} not run ({}): {}",
                style("-").dim(),
                skipped.len(),
                skipped.join(", ")
            );
        }

        summary
    }
}

impl BuildFailedError {
    pub fn render_summary(&self) -> String {
        render_summary(&self.succeeded, &self.failures)
    }
}

/// Successful tasks on one line, then one line per failure with its kind and
/// cause.
pub fn render_summary(succeeded: &[String], failures: &[TaskFailure]) -> String {
    let mut out = String::new();

    if !succeeded.is_empty() {
        let _ = writeln!(
            out,
            "{} succeeded ({}): {}",
            style("✓").green(),
            succeeded.len(),
            succeeded.join(", ")
        );
    }

    if !failures.is_empty() {
        let _ = writeln!(out, "{} failed ({}):", style("✗").red(), failures.len());
        for failure in failures {
            let _ = writeln!(
                out,
                "  {} [{}]: {}",
                style(&failure.task).bold(),
                failure.kind,
                failure.cause
            );
        }
    }

    out
}
