//! # Typed Table Schemas
//!
//! Each task type declares its backing table as an ordered list of
//! (column, type) pairs; SQL for table creation, insertion, retrieval and
//! state updates is generated from that descriptor with `?` placeholders
//! for every value. Task types can declare arbitrary extra columns without
//! any hand-spliced SQL.

use crate::error::{Result, SpecpipeError};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use std::fmt;

/// Semantic type of a task-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
        }
    }
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ctype: ColumnType,
}

impl ColumnSpec {
    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            ctype: ColumnType::Integer,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            ctype: ColumnType::Text,
        }
    }
}

/// A typed value bound into a generated query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskValue {
    Int(i64),
    Text(String),
}

impl TaskValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TaskValue::Int(v) => Some(*v),
            TaskValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskValue::Text(s) => Some(s),
            TaskValue::Int(_) => None,
        }
    }
}

impl fmt::Display for TaskValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskValue::Int(v) => write!(f, "{v}"),
            TaskValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Ordered property map for one task instance.
pub type TaskProps = BTreeMap<String, TaskValue>;

/// Table descriptor: declared columns plus the implicit `name` key and
/// `state` lifecycle column every task table carries.
#[derive(Debug, Clone)]
pub struct TableSchema {
    table: String,
    columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(table: &str, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table: table.to_string(),
            columns,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// `CREATE TABLE IF NOT EXISTS` statement; creation is idempotent.
    pub fn create_sql(&self) -> String {
        let mut cols = vec!["name TEXT PRIMARY KEY".to_string()];
        for col in &self.columns {
            cols.push(format!("{} {}", col.name, col.ctype.sql()));
        }
        cols.push("state INTEGER NOT NULL".to_string());
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            cols.join(", ")
        )
    }

    /// `INSERT OR REPLACE` with a placeholder per column.
    pub fn insert_sql(&self) -> String {
        let mut names = vec!["name".to_string()];
        names.extend(self.columns.iter().map(|c| c.name.to_string()));
        names.push("state".to_string());
        let placeholders = vec!["?"; names.len()].join(", ");
        format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            self.table,
            names.join(", "),
            placeholders
        )
    }

    pub fn select_sql(&self) -> String {
        format!("SELECT * FROM {} WHERE name = ?", self.table)
    }

    pub fn state_select_sql(&self) -> String {
        format!("SELECT state FROM {} WHERE name = ?", self.table)
    }

    pub fn state_update_sql(&self) -> String {
        format!("UPDATE {} SET state = ? WHERE name = ?", self.table)
    }

    /// Decode a fetched row back into typed properties.
    pub fn decode_row(&self, row: &SqliteRow) -> Result<TaskProps> {
        let mut props = TaskProps::new();
        for col in &self.columns {
            let value = match col.ctype {
                ColumnType::Integer => TaskValue::Int(row.try_get::<i64, _>(col.name)?),
                ColumnType::Text => TaskValue::Text(row.try_get::<String, _>(col.name)?),
            };
            props.insert(col.name.to_string(), value);
        }
        Ok(props)
    }

    /// Collect the bind values for an insert, in declared column order.
    /// Missing properties are a structural error.
    pub fn insert_values(&self, props: &TaskProps) -> Result<Vec<TaskValue>> {
        let mut values = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let value = props.get(col.name).ok_or_else(|| {
                SpecpipeError::TaskError(format!(
                    "Property '{}' missing for table {}",
                    col.name, self.table
                ))
            })?;
            match (col.ctype, value) {
                (ColumnType::Integer, TaskValue::Int(_))
                | (ColumnType::Text, TaskValue::Text(_)) => values.push(value.clone()),
                _ => {
                    return Err(SpecpipeError::TaskError(format!(
                        "Property '{}' has wrong type for table {}",
                        col.name, self.table
                    )))
                }
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(
            "preproc",
            vec![
                ColumnSpec::integer("night"),
                ColumnSpec::integer("expid"),
                ColumnSpec::text("camera"),
            ],
        )
    }

    #[test]
    fn test_create_sql_is_idempotent_form() {
        let sql = schema().create_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS preproc"));
        assert!(sql.contains("name TEXT PRIMARY KEY"));
        assert!(sql.contains("night INTEGER"));
        assert!(sql.contains("camera TEXT"));
        assert!(sql.contains("state INTEGER NOT NULL"));
    }

    #[test]
    fn test_insert_sql_uses_placeholders_only() {
        let sql = schema().insert_sql();
        assert_eq!(
            sql,
            "INSERT OR REPLACE INTO preproc (name, night, expid, camera, state) VALUES (?, ?, ?, ?, ?)"
        );
    }

    #[test]
    fn test_insert_values_checks_types() {
        let s = schema();
        let mut props = TaskProps::new();
        props.insert("night".into(), TaskValue::Int(20210115));
        props.insert("expid".into(), TaskValue::Int(42));
        props.insert("camera".into(), TaskValue::Text("b0".into()));
        assert_eq!(s.insert_values(&props).unwrap().len(), 3);

        props.insert("camera".into(), TaskValue::Int(0));
        assert!(s.insert_values(&props).is_err());

        props.remove("camera");
        assert!(s.insert_values(&props).is_err());
    }
}
