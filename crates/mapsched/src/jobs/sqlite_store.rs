use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

use crate::db::job_repo::{self, JobRow};
use crate::config::Config;
use crate::db::Database;
use crate::error::StoreError;
use crate::jobs::model::{
    BoundingBox, Job, JobId, JobStatus, NewJob, RenderArea, RenderParams, RESULT_CANCELLED,
};
use crate::jobs::JobStore;
use crate::storage::OutputStorage;

/// [`JobStore`] backed by the SQLite `jobs` table.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
    storage: OutputStorage,
}

/// Timestamps are stored at whole-second precision so a job reloaded from
/// the database yields the same files prefix as the in-memory copy.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(id: i64, field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            id,
            reason: format!("invalid {} '{}': {}", field, value, e),
        })
}

fn parse_opt_ts(id: i64, field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| parse_ts(id, field, v)).transpose()
}

fn to_u32(id: i64, field: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::CorruptRow {
        id,
        reason: format!("{} out of range: {}", field, value),
    })
}

fn row_to_job(row: JobRow) -> Result<Job, StoreError> {
    let id = row.id;
    let status = JobStatus::from_code(row.status).ok_or_else(|| StoreError::CorruptRow {
        id,
        reason: format!("unknown status code {}", row.status),
    })?;

    // The administrative reference wins when both are present.
    let area = match (
        row.admin_osm_id,
        row.lat_upper_left,
        row.lon_upper_left,
        row.lat_bottom_right,
        row.lon_bottom_right,
    ) {
        (Some(osm_id), ..) => RenderArea::Administrative {
            city: row.admin_city.clone().unwrap_or_default(),
            osm_id,
        },
        (None, Some(lat_ul), Some(lon_ul), Some(lat_br), Some(lon_br)) => {
            RenderArea::BoundingBox(BoundingBox {
                lat_upper_left: lat_ul,
                lon_upper_left: lon_ul,
                lat_bottom_right: lat_br,
                lon_bottom_right: lon_br,
            })
        }
        _ => {
            return Err(StoreError::CorruptRow {
                id,
                reason: "neither an administrative id nor a complete bounding box".to_string(),
            })
        }
    };

    Ok(Job {
        id,
        status,
        params: RenderParams {
            title: row.title,
            area,
            stylesheet: row.stylesheet,
            layout: row.layout,
            paper_width_mm: to_u32(id, "paper_width_mm", row.paper_width_mm)?,
            paper_height_mm: to_u32(id, "paper_height_mm", row.paper_height_mm)?,
            locale: row.locale,
        },
        submitted_at: parse_ts(id, "submitted_at", &row.submitted_at)?,
        started_at: parse_opt_ts(id, "started_at", row.started_at.as_deref())?,
        finished_at: parse_opt_ts(id, "finished_at", row.finished_at.as_deref())?,
        result_message: row.result_message,
        queue_index_at_submission: to_u32(
            id,
            "queue_index_at_submission",
            row.queue_index_at_submission,
        )?,
    })
}

fn new_job_row(new_job: &NewJob, submitted_at: DateTime<Utc>) -> JobRow {
    let params = &new_job.params;
    let mut row = JobRow {
        title: params.title.clone(),
        stylesheet: params.stylesheet.clone(),
        layout: params.layout.clone(),
        paper_width_mm: i64::from(params.paper_width_mm),
        paper_height_mm: i64::from(params.paper_height_mm),
        status: JobStatus::Submitted.code(),
        submitted_at: format_ts(submitted_at),
        locale: params.locale.clone(),
        ..Default::default()
    };
    match &params.area {
        RenderArea::BoundingBox(bbox) => {
            row.lat_upper_left = Some(bbox.lat_upper_left);
            row.lon_upper_left = Some(bbox.lon_upper_left);
            row.lat_bottom_right = Some(bbox.lat_bottom_right);
            row.lon_bottom_right = Some(bbox.lon_bottom_right);
        }
        RenderArea::Administrative { city, osm_id } => {
            row.admin_city = Some(city.clone());
            row.admin_osm_id = Some(*osm_id);
        }
    }
    row
}

impl SqliteJobStore {
    pub fn new(db: Database, storage: OutputStorage) -> Self {
        Self { db, storage }
    }

    /// Opens the configured database over the configured output directory,
    /// which must already exist.
    pub fn open(config: &Config) -> crate::Result<Self> {
        let storage = OutputStorage::new(config.output_directory(), config.output_formats.clone());
        storage.validate()?;
        let db = Database::open(&config.database_path()?).map_err(StoreError::from)?;
        Ok(Self::new(db, storage))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Raw rows, for consistency checks that look at columns the domain
    /// model normalizes away.
    pub fn all_rows(&self) -> Result<Vec<JobRow>, StoreError> {
        Ok(job_repo::all(&self.db)?)
    }

    pub fn clear_bounding_box(&self, id: JobId) -> Result<(), StoreError> {
        Ok(job_repo::clear_bbox(&self.db, id)?)
    }

    pub fn set_locale(&self, id: JobId, locale: &str) -> Result<(), StoreError> {
        Ok(job_repo::set_locale(&self.db, id, locale)?)
    }
}

impl JobStore for SqliteJobStore {
    fn storage(&self) -> &OutputStorage {
        &self.storage
    }

    fn submit(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let row = new_job_row(&new_job, now());
        let id = job_repo::insert(&self.db, &row, JobStatus::Submitted.code())?;
        log::info!("Job #{} submitted: {}", id, new_job.params.title);
        self.get(id)?.ok_or(StoreError::NotFound(id))
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        job_repo::find_by_id(&self.db, id)?
            .map(row_to_job)
            .transpose()
    }

    fn next_queued(&self) -> Result<Option<Job>, StoreError> {
        job_repo::oldest_with_status(&self.db, JobStatus::Submitted.code())?
            .map(row_to_job)
            .transpose()
    }

    fn mark_started(&self, job: &mut Job) -> Result<bool, StoreError> {
        let started_at = now();
        let claimed = job_repo::transition_started(
            &self.db,
            job.id,
            JobStatus::Submitted.code(),
            JobStatus::InProgress.code(),
            &format_ts(started_at),
        )?;
        if claimed {
            job.status = JobStatus::InProgress;
            job.started_at = Some(started_at);
        }
        Ok(claimed)
    }

    fn mark_finished(&self, job: &mut Job, result_message: &str) -> Result<bool, StoreError> {
        let finished_at = now();
        let updated = job_repo::transition_finished(
            &self.db,
            job.id,
            JobStatus::InProgress.code(),
            JobStatus::Done.code(),
            &format_ts(finished_at),
            result_message,
        )?;
        if updated {
            job.status = JobStatus::Done;
            job.finished_at = Some(finished_at);
            job.result_message = Some(result_message.to_string());
        } else {
            log::warn!(
                "Job #{} was no longer in progress, result '{}' not recorded",
                job.id,
                result_message
            );
        }
        Ok(updated)
    }

    fn mark_cancelled(&self, job: &mut Job) -> Result<bool, StoreError> {
        let finished_at = now();
        let cancelled = job_repo::transition_finished(
            &self.db,
            job.id,
            JobStatus::Submitted.code(),
            JobStatus::Cancelled.code(),
            &format_ts(finished_at),
            RESULT_CANCELLED,
        )?;
        if cancelled {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(finished_at);
            job.result_message = Some(RESULT_CANCELLED.to_string());
        }
        Ok(cancelled)
    }

    fn reset_in_progress_to_submitted(&self) -> Result<usize, StoreError> {
        let mut requeued = 0;
        for row in job_repo::all_with_status(&self.db, JobStatus::InProgress.code())? {
            let job = row_to_job(row)?;
            // A waiting job owns nothing on disk; the crashed attempt's
            // partial output goes before the job re-enters the queue.
            if let Some(prefix) = job.files_prefix() {
                let removed = self.storage.purge_prefix(&prefix)?;
                if removed > 0 {
                    log::info!("Job #{}: removed {} file(s) of the interrupted attempt", job.id, removed);
                }
            }
            if job_repo::requeue(
                &self.db,
                job.id,
                JobStatus::InProgress.code(),
                JobStatus::Submitted.code(),
            )? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    fn find_by_output_filename(&self, name: &str) -> Result<Option<Job>, StoreError> {
        let Some((id_part, _)) = name.split_once('_') else {
            return Ok(None);
        };
        let Ok(id) = id_part.parse::<JobId>() else {
            return Ok(None);
        };
        let Some(job) = self.get(id)? else {
            return Ok(None);
        };
        match job.files_prefix() {
            Some(prefix) if name.starts_with(&prefix) => Ok(Some(job)),
            _ => Ok(None),
        }
    }

    fn delete_output_files(&self, job: &mut Job) -> Result<(usize, u64), StoreError> {
        let Some(prefix) = job.files_prefix() else {
            return Ok((0, 0));
        };
        let (removed, saved) = self.storage.remove_output_files(&prefix)?;
        if job.status == JobStatus::Done {
            job_repo::update_status(&self.db, job.id, JobStatus::DoneNoFiles.code())?;
            job.status = JobStatus::DoneNoFiles;
        }
        Ok((removed, saved))
    }

    fn queue_size(&self) -> Result<u64, StoreError> {
        Ok(job_repo::count_by_status(&self.db, JobStatus::Submitted.code())?)
    }

    fn queue_position(&self, job: &Job) -> Result<u64, StoreError> {
        Ok(job_repo::count_by_status_up_to(
            &self.db,
            JobStatus::Submitted.code(),
            job.id,
        )?)
    }

    fn all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        job_repo::all(&self.db)?
            .into_iter()
            .map(row_to_job)
            .collect()
    }
}
