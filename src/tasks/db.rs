//! # Task Database
//!
//! Embedded SQLite bookkeeping database holding one table per task type.
//! A single pool connection keeps the writer unique; the daily manager is
//! the only process expected to hold a task database open for writing.

use crate::error::{Result, SpecpipeError};
use crate::state_machine::TaskState;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TaskDb {
    pool: SqlitePool,
}

impl TaskDb {
    /// Open an in-memory database; used by tests and dry runs. The single
    /// connection must never be recycled or the database vanishes with it.
    pub async fn open_memory() -> Result<TaskDb> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(TaskDb { pool })
    }

    /// Open (creating if necessary) a file-backed database.
    pub async fn open_file(path: &Path) -> Result<TaskDb> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        Ok(TaskDb { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Bulk lifecycle update. The per-task `state_set` primitive is for
    /// incidental use; scheduling loops that touch many rows must come
    /// through here with a single statement instead.
    pub async fn bulk_state_set(
        &self,
        table: &str,
        names: &[String],
        state: TaskState,
    ) -> Result<u64> {
        if names.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!("UPDATE {table} SET state = ? WHERE name IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(state.to_int());
        for name in names {
            query = query.bind(name);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Names of all rows of one table currently in the given state.
    pub async fn names_in_state(&self, table: &str, state: TaskState) -> Result<Vec<String>> {
        let sql = format!("SELECT name FROM {table} WHERE state = ? ORDER BY name");
        let rows = sqlx::query(&sql)
            .bind(state.to_int())
            .fetch_all(&self.pool)
            .await?;
        use sqlx::Row;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("name")
                    .map_err(|e| SpecpipeError::DatabaseError(e.to_string()))
            })
            .collect()
    }
}
