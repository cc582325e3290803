use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{CancelToken, Environment, TaskContext};
use crate::error::{ErrorKind, TaskFailure};
use crate::graph::Action;

/// How often the scheduler looks at the cancellation flag while waiting.
const POLL: Duration = Duration::from_millis(50);

/// A task that reported back, successfully or not.
#[derive(Debug)]
pub(crate) struct Finished {
    pub name: String,
    pub duration: Duration,
    pub result: Result<(), TaskFailure>,
}

#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub finished: Vec<Finished>,
    /// Tasks still running when the scheduler stopped waiting for them.
    pub abandoned: BTreeSet<String>,
}

/// Runs every task of one batch concurrently on the rayon pool and waits for
/// all of them.
///
/// Tasks only receive owned data (`Arc`s and names), so a task that is still
/// running after a cancellation grace period can be left behind without
/// borrowing anything from the scheduler.
pub(crate) fn run_batch(
    env: &Arc<Environment>,
    tasks: Vec<(String, Action)>,
    cancel: &CancelToken,
    grace: Duration,
    root: &Span,
) -> BatchOutcome {
    let style = crate::utils::get_style_task().unwrap_or_else(|_| ProgressStyle::default_spinner());
    let (sender, receiver) = channel::<Finished>();
    let mut outstanding: BTreeSet<String> = BTreeSet::new();

    for (name, action) in tasks {
        outstanding.insert(name.clone());

        let sender = sender.clone();
        let env = env.clone();
        let style = style.clone();
        let parent = root.clone();

        rayon::spawn(move || {
            let span = tracing::info_span!(parent: &parent, "task", name = %name);
            span.pb_set_style(&style);
            span.pb_set_message(&format!("Running {name}"));
            let _enter = span.enter();

            let context = TaskContext {
                env,
                name: name.clone(),
                span: span.clone(),
            };

            let start = Instant::now();

            let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| action(&context))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TaskFailure {
                    task: name.clone(),
                    kind: ErrorKind::classify(&e),
                    cause: format!("{e:#}"),
                }),
                Err(panic) => Err(TaskFailure {
                    task: name.clone(),
                    kind: ErrorKind::Panic,
                    cause: panic_message(panic.as_ref()),
                }),
            };

            let duration = start.elapsed();

            match &result {
                Ok(()) => tracing::debug!(task = %name, ?duration, "task finished"),
                Err(failure) => tracing::error!(task = %name, kind = %failure.kind, "{}", failure.cause),
            }

            // The scheduler may have given up on this task already.
            let _ = sender.send(Finished {
                name,
                duration,
                result,
            });
        });
    }

    drop(sender);

    let mut outcome = BatchOutcome::default();
    let mut deadline: Option<Instant> = None;

    while !outstanding.is_empty() {
        if deadline.is_none() && cancel.is_cancelled() {
            tracing::warn!(
                "cancelled, waiting up to {:?} for {}",
                grace,
                crate::utils::format_active(outstanding.iter().map(String::as_str))
            );
            deadline = Some(Instant::now() + grace);
        }

        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left.min(POLL)
            }
            None => POLL,
        };

        match receiver.recv_timeout(wait) {
            Ok(finished) => {
                outstanding.remove(&finished.name);
                root.pb_inc(1);
                outcome.finished.push(finished);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    outcome.abandoned = outstanding;
    outcome
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}
