//! Raw SQL on the `jobs` table.
//!
//! Rows are kept close to the table layout; conversion into the domain
//! [`crate::jobs::Job`] happens in the store.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRow {
    pub id: i64,
    pub title: String,
    pub stylesheet: String,
    pub layout: String,
    pub paper_width_mm: i64,
    pub paper_height_mm: i64,
    pub admin_city: Option<String>,
    pub admin_osm_id: Option<i64>,
    pub lat_upper_left: Option<f64>,
    pub lon_upper_left: Option<f64>,
    pub lat_bottom_right: Option<f64>,
    pub lon_bottom_right: Option<f64>,
    pub status: i64,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub result_message: Option<String>,
    pub queue_index_at_submission: i64,
    pub locale: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            stylesheet: row.get("stylesheet")?,
            layout: row.get("layout")?,
            paper_width_mm: row.get("paper_width_mm")?,
            paper_height_mm: row.get("paper_height_mm")?,
            admin_city: row.get("admin_city")?,
            admin_osm_id: row.get("admin_osm_id")?,
            lat_upper_left: row.get("lat_upper_left")?,
            lon_upper_left: row.get("lon_upper_left")?,
            lat_bottom_right: row.get("lat_bottom_right")?,
            lon_bottom_right: row.get("lon_bottom_right")?,
            status: row.get("status")?,
            submitted_at: row.get("submitted_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            result_message: row.get("result_message")?,
            queue_index_at_submission: row.get("queue_index_at_submission")?,
            locale: row.get("locale")?,
        })
    }

    /// Whether any of the four bounding box coordinates is set.
    pub fn has_bbox(&self) -> bool {
        self.lat_upper_left.is_some()
            || self.lon_upper_left.is_some()
            || self.lat_bottom_right.is_some()
            || self.lon_bottom_right.is_some()
    }
}

/// Inserts a new job row and returns its id. `row.id` and
/// `row.queue_index_at_submission` are ignored: the id is assigned by
/// SQLite and the queue index is the number of waiting jobs including
/// this one, both computed under the same lock.
pub fn insert(db: &Database, row: &JobRow, waiting_status: i64) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        let waiting: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![waiting_status],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO jobs (title, stylesheet, layout, paper_width_mm, paper_height_mm,
             admin_city, admin_osm_id, lat_upper_left, lon_upper_left, lat_bottom_right,
             lon_bottom_right, status, submitted_at, started_at, finished_at, result_message,
             queue_index_at_submission, locale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                row.title,
                row.stylesheet,
                row.layout,
                row.paper_width_mm,
                row.paper_height_mm,
                row.admin_city,
                row.admin_osm_id,
                row.lat_upper_left,
                row.lon_upper_left,
                row.lat_bottom_right,
                row.lon_bottom_right,
                row.status,
                row.submitted_at,
                row.started_at,
                row.finished_at,
                row.result_message,
                waiting + 1,
                row.locale,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Returns the oldest job (by submission time, then id) with the given status.
pub fn oldest_with_status(db: &Database, status: i64) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE status = ?1 ORDER BY submitted_at ASC, id ASC LIMIT 1",
                params![status],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Returns every job, oldest first.
pub fn all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Moves a job from `from` to `to` only if it currently holds `from`,
/// stamping the start time. Returns whether the row changed.
pub fn transition_started(
    db: &Database,
    id: i64,
    from: i64,
    to: i64,
    started_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, started_at = ?4 WHERE id = ?1 AND status = ?2",
            params![id, from, to, started_at],
        )?;
        Ok(changed == 1)
    })
}

/// Moves a job from `from` to `to` only if it currently holds `from`,
/// stamping the end time and result message. Returns whether the row changed.
pub fn transition_finished(
    db: &Database,
    id: i64,
    from: i64,
    to: i64,
    finished_at: &str,
    result_message: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, finished_at = ?4, result_message = ?5
             WHERE id = ?1 AND status = ?2",
            params![id, from, to, finished_at, result_message],
        )?;
        Ok(changed == 1)
    })
}

/// Updates only the status of a job.
pub fn update_status(db: &Database, id: i64, status: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    })
}

/// Every job holding `status`, oldest id first.
pub fn all_with_status(db: &Database, status: i64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![status], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Moves a job from `from` back to `to` and forgets its start time, so its
/// next claim gets a fresh files prefix. Returns whether the row changed.
pub fn requeue(db: &Database, id: i64, from: i64, to: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, started_at = NULL WHERE id = ?1 AND status = ?2",
            params![id, from, to],
        )?;
        Ok(changed == 1)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: i64) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Counts jobs with the given status whose id is at most `id`.
pub fn count_by_status_up_to(db: &Database, status: i64, id: i64) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1 AND id <= ?2",
            params![status, id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Clears the four bounding box columns of a job.
pub fn clear_bbox(db: &Database, id: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET lat_upper_left = NULL, lon_upper_left = NULL,
             lat_bottom_right = NULL, lon_bottom_right = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    })
}

/// Sets the locale of a job.
pub fn set_locale(db: &Database, id: i64, locale: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET locale = ?2 WHERE id = ?1",
            params![id, locale],
        )?;
        Ok(())
    })
}
