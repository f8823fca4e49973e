//! Schema upgrades for the job database.
//!
//! Each step runs in its own transaction and is recorded in
//! `schema_history`. The daemon and its worker processes open the same
//! file, so a binary refuses a database whose schema is newer than the
//! steps it knows about.

use rusqlite::{Connection, OptionalExtension};

use super::error::DatabaseError;

enum Step {
    Sql(&'static str),
    /// `ALTER TABLE .. ADD COLUMN`, skipped when an older daemon already
    /// added the column by hand.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

struct Migration {
    version: u32,
    name: &'static str,
    step: Step,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_jobs",
        step: Step::Sql(include_str!("sql/001_create_jobs.sql")),
    },
    Migration {
        version: 2,
        name: "jobs_locale",
        step: Step::AddColumn {
            table: "jobs",
            column: "locale",
            definition: "TEXT NOT NULL DEFAULT ''",
        },
    },
    Migration {
        version: 3,
        name: "jobs_status_index",
        step: Step::Sql(include_str!("sql/003_index_jobs_status.sql")),
    },
];

/// Highest schema version this build can work with.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Version recorded in `schema_history`, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_history", [], |r| {
            r.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Brings the schema up to [`latest_version`].
pub fn upgrade(conn: &mut Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_history (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let found = schema_version(conn)?;
    let supported = latest_version();
    if found > supported {
        return Err(DatabaseError::SchemaTooNew { found, supported });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > found) {
        let tx = conn.transaction()?;
        let applied = apply(&tx, &migration.step).map_err(|e| DatabaseError::Migration {
            version: migration.version,
            reason: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO schema_history (version, name) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.name],
        )?;
        tx.commit()?;

        if applied {
            log::info!("Applied schema v{} ({})", migration.version, migration.name);
        } else {
            log::info!(
                "Schema v{} ({}) already in place, recorded only",
                migration.version,
                migration.name
            );
        }
    }

    Ok(())
}

/// Runs one step, returning false when there was nothing to do.
fn apply(conn: &Connection, step: &Step) -> Result<bool, DatabaseError> {
    match step {
        Step::Sql(sql) => {
            conn.execute_batch(sql)?;
            Ok(true)
        }
        Step::AddColumn {
            table,
            column,
            definition,
        } => {
            if has_column(conn, table, column)? {
                return Ok(false);
            }
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {};",
                identifier(table)?,
                identifier(column)?,
                definition
            ))?;
            Ok(true)
        }
    }
}

fn identifier(name: &str) -> Result<&str, DatabaseError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid identifier: {}", name),
        })
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", identifier(table)?))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}
