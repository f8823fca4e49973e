//! Database consistency checker.
//!
//! Walks every job row and runs a fixed list of checks. What happens on a
//! finding is up to the [`DbckHandler`]: the dry-run handler only describes
//! it, the repair handler fixes it.

use tracing::{info, warn};

use crate::db::job_repo::JobRow;
use crate::error::StoreError;
use crate::jobs::{JobStatus, JobStore, SqliteJobStore};

/// Locale assigned to jobs that have none.
pub const DEFAULT_LOCALE: &str = "en_US.UTF-8";

/// Reacts to findings. Each method returns the line reported for the job.
pub trait DbckHandler {
    fn name(&self) -> &'static str;

    /// A `Done` job whose output files are gone.
    fn obsolete(&self, store: &SqliteJobStore, row: &JobRow) -> Result<String, StoreError>;

    /// A job carrying both an administrative id and a bounding box.
    fn area_conflict(&self, store: &SqliteJobStore, row: &JobRow) -> Result<String, StoreError>;

    /// A job without a locale.
    fn missing_locale(&self, store: &SqliteJobStore, row: &JobRow) -> Result<String, StoreError>;
}

pub struct DryRunHandler;

impl DbckHandler for DryRunHandler {
    fn name(&self) -> &'static str {
        "dry run"
    }

    fn obsolete(&self, _store: &SqliteJobStore, _row: &JobRow) -> Result<String, StoreError> {
        Ok("eligible for obsolete status".to_string())
    }

    fn area_conflict(&self, _store: &SqliteJobStore, _row: &JobRow) -> Result<String, StoreError> {
        Ok("has both administrative id and bounding box".to_string())
    }

    fn missing_locale(&self, _store: &SqliteJobStore, _row: &JobRow) -> Result<String, StoreError> {
        Ok("no locale information".to_string())
    }
}

pub struct RepairHandler;

impl DbckHandler for RepairHandler {
    fn name(&self) -> &'static str {
        "repair"
    }

    fn obsolete(&self, store: &SqliteJobStore, row: &JobRow) -> Result<String, StoreError> {
        let mut job = store.get(row.id)?.ok_or(StoreError::NotFound(row.id))?;
        let (removed, _) = store.delete_output_files(&mut job)?;
        Ok(format!("removed {} file(s) and marked obsolete", removed))
    }

    fn area_conflict(&self, store: &SqliteJobStore, row: &JobRow) -> Result<String, StoreError> {
        store.clear_bounding_box(row.id)?;
        Ok(format!(
            "cleared bounding box, keeping osm id {}",
            row.admin_osm_id.unwrap_or_default()
        ))
    }

    fn missing_locale(&self, store: &SqliteJobStore, row: &JobRow) -> Result<String, StoreError> {
        store.set_locale(row.id, DEFAULT_LOCALE)?;
        Ok(format!("missing locale, fell back to {}", DEFAULT_LOCALE))
    }
}

/// Findings for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFindings {
    pub id: i64,
    pub title: String,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbckReport {
    pub jobs_checked: usize,
    pub findings: Vec<JobFindings>,
}

impl DbckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

type Check = fn(&SqliteJobStore, &JobRow, &dyn DbckHandler) -> Result<Option<String>, StoreError>;

const CHECKS: [(&str, Check); 3] = [
    ("obsolete", check_obsolete),
    ("area", check_area),
    ("locale", check_locale),
];

/// A `Done` job without a single map file left on disk is obsolete.
fn check_obsolete(
    store: &SqliteJobStore,
    row: &JobRow,
    handler: &dyn DbckHandler,
) -> Result<Option<String>, StoreError> {
    if row.status != JobStatus::Done.code() {
        return Ok(None);
    }
    let job = store.get(row.id)?.ok_or(StoreError::NotFound(row.id))?;
    if !store.output_files(&job).maps.is_empty() {
        return Ok(None);
    }
    handler.obsolete(store, row).map(Some)
}

fn check_area(
    store: &SqliteJobStore,
    row: &JobRow,
    handler: &dyn DbckHandler,
) -> Result<Option<String>, StoreError> {
    if row.admin_osm_id.is_some() && row.has_bbox() {
        return handler.area_conflict(store, row).map(Some);
    }
    Ok(None)
}

fn check_locale(
    store: &SqliteJobStore,
    row: &JobRow,
    handler: &dyn DbckHandler,
) -> Result<Option<String>, StoreError> {
    if row.locale.trim().is_empty() {
        return handler.missing_locale(store, row).map(Some);
    }
    Ok(None)
}

/// Runs every check over every job. A check that fails on one job is
/// reported as a finding and does not stop the run.
pub fn run(store: &SqliteJobStore, handler: &dyn DbckHandler) -> Result<DbckReport, StoreError> {
    let rows = store.all_rows()?;
    info!(
        jobs = rows.len(),
        checks = CHECKS.len(),
        handler = handler.name(),
        "Starting database check"
    );

    let mut report = DbckReport {
        jobs_checked: rows.len(),
        ..Default::default()
    };
    for row in &rows {
        let mut messages = Vec::new();
        for (name, check) in CHECKS {
            match check(store, row, handler) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = row.id, check = name, error = %e, "Check failed");
                    messages.push(format!("{} check failed: {}", name, e));
                }
            }
        }
        if !messages.is_empty() {
            report.findings.push(JobFindings {
                id: row.id,
                title: row.title.clone(),
                messages,
            });
        }
    }

    info!(jobs_with_findings = report.findings.len(), "Database check complete");
    Ok(report)
}
