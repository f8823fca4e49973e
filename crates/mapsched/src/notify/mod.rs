//! Out-of-band operator notifications for failed jobs.

pub mod email;

use std::error::Error;

use crate::jobs::Job;

pub use email::{EmailError, EmailNotifier};

/// Tells operators that a job failed. Implementations must never fail the
/// caller: delivery problems are logged and swallowed.
pub trait Notifier: Send + Sync {
    fn notify_failure(&self, job: &Job, error: &(dyn Error + 'static));
}

/// Notifier used when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_failure(&self, job: &Job, error: &(dyn Error + 'static)) {
        tracing::debug!(job_id = job.id, error = %error, "No notifier configured");
    }
}

/// Renders an error and its sources, outermost first, one per line.
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Body of a failure report: the error chain followed by the job as JSON.
pub fn failure_report(job: &Job, error: &(dyn Error + 'static)) -> String {
    let dump = serde_json::to_string_pretty(job).unwrap_or_else(|e| format!("<unserializable job: {}>", e));
    format!(
        "Job #{} failed.\n\nError:\n{}\n\nJob:\n{}\n",
        job.id,
        error_chain(error),
        dump
    )
}
