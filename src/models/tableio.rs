//! # Table Persistence
//!
//! Whole-table CSV read/write for the exposure, processing and unprocessed
//! tables. Writes go through a temp file and an atomic rename so a killed
//! manager never leaves a half-written table behind; a missing table loads
//! as empty, which is what a fresh night looks like.

use crate::error::{Result, SpecpipeError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Load all rows of a table, or an empty vector when the file is absent.
pub fn load_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Table not found, starting empty");
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: T = record.map_err(|e| {
            SpecpipeError::TableError(format!("Malformed row in {}: {e}", path.display()))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Rewrite a table in full. The previous contents are replaced atomically.
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), rows = rows.len(), "Wrote table");
    Ok(())
}
