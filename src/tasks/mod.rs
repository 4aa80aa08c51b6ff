//! # Task State Machine
//!
//! Generic abstraction for a named, typed unit of pipeline work with a
//! persisted lifecycle (`waiting → running → done|fail`), dependency
//! declaration, and a database-backed create/insert/retrieve/update
//! contract. Concrete task types supply the behavior that varies: name
//! fields, output paths, dependencies, resource estimates, and the work
//! function itself. Every base default for those fails loudly so a
//! mis-registered type can never appear to succeed.

pub mod db;
pub mod registry;
pub mod schema;
pub mod types;

pub use db::TaskDb;
pub use registry::TaskRegistry;
pub use schema::{ColumnSpec, ColumnType, TableSchema, TaskProps, TaskValue};

use crate::error::{Result, SpecpipeError};
use crate::exec::CommandRunner;
use crate::paths::ProdPaths;
use crate::state_machine::TaskState;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Separator between the type tag and the name fields of a task name.
pub const TASK_NAME_SEP: &str = "_";

/// How one name field is rendered into and parsed out of a task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    /// Zero-padded integer of fixed width, e.g. expid as `00000042`.
    Int { width: usize },
    /// Verbatim text, e.g. camera `b0`. Must not contain the separator.
    Text,
}

/// One identifying field of a task name. Name fields must also appear as
/// columns of the task's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameField {
    pub name: &'static str,
    pub format: FieldFormat,
}

impl NameField {
    pub const fn int(name: &'static str, width: usize) -> Self {
        Self {
            name,
            format: FieldFormat::Int { width },
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            format: FieldFormat::Text,
        }
    }
}

/// A retrieved task row: identifying properties plus lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub name: String,
    pub props: TaskProps,
    pub state: TaskState,
}

/// Everything a task needs to do real work: production paths and the
/// command runner used to invoke external numerical routines.
#[derive(Clone)]
pub struct TaskContext {
    pub paths: ProdPaths,
    pub runner: Arc<dyn CommandRunner>,
}

impl TaskContext {
    pub fn new(paths: ProdPaths, runner: Arc<dyn CommandRunner>) -> Self {
        Self { paths, runner }
    }
}

/// Behavior contract for one task type.
///
/// The name encoding, table schema, and database primitives have working
/// defaults derived from the declared fields; the behavioral methods
/// (`paths`, `deps`, resource estimates, CLI rendering, `execute`) default
/// to a NotImplemented error.
#[async_trait]
pub trait PipelineTask: Send + Sync {
    /// Type tag; also the backing table name and the task-name prefix.
    fn type_tag(&self) -> &'static str;

    /// Ordered identifying fields with their name formats.
    fn name_fields(&self) -> &[NameField];

    /// Columns beyond the name fields (the state column is implicit).
    fn extra_columns(&self) -> &[ColumnSpec] {
        &[]
    }

    /// Table descriptor: name fields first, extra columns after.
    fn schema(&self) -> TableSchema {
        let mut columns: Vec<ColumnSpec> = self
            .name_fields()
            .iter()
            .map(|f| match f.format {
                FieldFormat::Int { .. } => ColumnSpec::integer(f.name),
                FieldFormat::Text => ColumnSpec::text(f.name),
            })
            .collect();
        columns.extend(self.extra_columns().iter().cloned());
        TableSchema::new(self.type_tag(), columns)
    }

    /// Deterministic, reversible encoding of the identifying fields into a
    /// single string key.
    fn name_join(&self, props: &TaskProps) -> Result<String> {
        let mut name = self.type_tag().to_string();
        for field in self.name_fields() {
            let value = props.get(field.name).ok_or_else(|| {
                SpecpipeError::TaskError(format!(
                    "Property '{}' missing for {} name",
                    field.name,
                    self.type_tag()
                ))
            })?;
            name.push_str(TASK_NAME_SEP);
            match (field.format, value) {
                (FieldFormat::Int { width }, TaskValue::Int(v)) => {
                    name.push_str(&format!("{v:0width$}"));
                }
                (FieldFormat::Text, TaskValue::Text(s)) => {
                    if s.contains(TASK_NAME_SEP) {
                        return Err(SpecpipeError::TaskError(format!(
                            "Field '{}' value '{s}' contains the name separator",
                            field.name
                        )));
                    }
                    name.push_str(s);
                }
                _ => {
                    return Err(SpecpipeError::TaskError(format!(
                        "Field '{}' has wrong type for {} name",
                        field.name,
                        self.type_tag()
                    )));
                }
            }
        }
        Ok(name)
    }

    /// Inverse of [`PipelineTask::name_join`]; structural error if the
    /// prefix or field count does not match this type.
    fn name_split(&self, name: &str) -> Result<TaskProps> {
        let fields: Vec<&str> = name.split(TASK_NAME_SEP).collect();
        if fields.len() != self.name_fields().len() + 1 || fields[0] != self.type_tag() {
            return Err(SpecpipeError::TaskError(format!(
                "Name '{name}' not valid for a {}",
                self.type_tag()
            )));
        }
        let mut props = TaskProps::new();
        for (field, token) in self.name_fields().iter().zip(&fields[1..]) {
            let value = match field.format {
                FieldFormat::Int { .. } => {
                    let v = token.parse::<i64>().map_err(|_| {
                        SpecpipeError::TaskError(format!(
                            "Field '{}' of '{name}' is not an integer",
                            field.name
                        ))
                    })?;
                    TaskValue::Int(v)
                }
                FieldFormat::Text => TaskValue::Text((*token).to_string()),
            };
            props.insert(field.name.to_string(), value);
        }
        Ok(props)
    }

    /// Idempotently ensure the backing table exists.
    async fn create(&self, db: &TaskDb) -> Result<()> {
        let sql = self.schema().create_sql();
        sqlx::query(&sql).execute(db.pool()).await?;
        Ok(())
    }

    /// Insert or replace a row. The state column is forced to `waiting`
    /// regardless of caller-supplied value, so newly scheduled tasks always
    /// begin in a known state.
    async fn insert(&self, db: &TaskDb, props: &TaskProps) -> Result<()> {
        let name = self.name_join(props)?;
        tracing::debug!(task = %name, "inserting");
        let schema = self.schema();
        let values = schema.insert_values(props)?;
        let sql = schema.insert_sql();
        let mut query = sqlx::query(&sql).bind(name);
        for value in &values {
            query = match value {
                TaskValue::Int(v) => query.bind(*v),
                TaskValue::Text(s) => query.bind(s.clone()),
            };
        }
        query = query.bind(TaskState::Waiting.to_int());
        query.execute(db.pool()).await?;
        Ok(())
    }

    /// Retrieve a task row; a missing row is an explicit error.
    async fn retrieve(&self, db: &TaskDb, name: &str) -> Result<TaskRecord> {
        let schema = self.schema();
        let sql = schema.select_sql();
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| {
                SpecpipeError::TaskError(format!("Task {name} not in database"))
            })?;
        use sqlx::Row;
        let props = schema.decode_row(&row)?;
        let state = TaskState::from_int(row.try_get::<i64, _>("state")?)
            .map_err(SpecpipeError::TaskError)?;
        Ok(TaskRecord {
            name: name.to_string(),
            props,
            state,
        })
    }

    /// Single-row lifecycle transition. Callers updating many rows should
    /// use [`TaskDb::bulk_state_set`] instead of looping over this.
    async fn state_set(&self, db: &TaskDb, name: &str, state: TaskState) -> Result<()> {
        let sql = self.schema().state_update_sql();
        let result = sqlx::query(&sql)
            .bind(state.to_int())
            .bind(name)
            .execute(db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(SpecpipeError::TaskError(format!(
                "Task {name} not in database"
            )));
        }
        Ok(())
    }

    /// Single-row state read; same bulk caveat as [`PipelineTask::state_set`].
    async fn state_get(&self, db: &TaskDb, name: &str) -> Result<TaskState> {
        let sql = self.schema().state_select_sql();
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| {
                SpecpipeError::TaskError(format!("Task {name} not in database"))
            })?;
        use sqlx::Row;
        TaskState::from_int(row.try_get::<i64, _>("state")?).map_err(SpecpipeError::TaskError)
    }

    /// Output files this task is contracted to produce.
    fn paths(&self, _props: &TaskProps, _paths: &ProdPaths) -> Result<Vec<PathBuf>> {
        Err(SpecpipeError::NotImplemented(format!(
            "paths() for task type {}",
            self.type_tag()
        )))
    }

    /// Names of upstream tasks this task requires.
    fn deps(&self, _props: &TaskProps) -> Result<Vec<String>> {
        Err(SpecpipeError::NotImplemented(format!(
            "deps() for task type {}",
            self.type_tag()
        )))
    }

    /// Maximum worker count this task type can exploit.
    fn run_max_procs(&self, _procs_per_node: usize) -> Result<usize> {
        Err(SpecpipeError::NotImplemented(format!(
            "run_max_procs() for task type {}",
            self.type_tag()
        )))
    }

    /// Estimated runtime in minutes at maximum concurrency.
    fn run_time_minutes(&self, _props: &TaskProps) -> Result<u32> {
        Err(SpecpipeError::NotImplemented(format!(
            "run_time_minutes() for task type {}",
            self.type_tag()
        )))
    }

    /// Default runtime options for this task type.
    fn run_defaults(&self) -> Result<serde_json::Value> {
        Err(SpecpipeError::NotImplemented(format!(
            "run_defaults() for task type {}",
            self.type_tag()
        )))
    }

    /// Equivalent command line for this task, without launcher decoration.
    fn run_cli(
        &self,
        _props: &TaskProps,
        _opts: &serde_json::Value,
        _paths: &ProdPaths,
    ) -> Result<String> {
        Err(SpecpipeError::NotImplemented(format!(
            "run_cli() for task type {}",
            self.type_tag()
        )))
    }

    /// Command line decorated with an optional launcher and log redirect.
    fn command_line(
        &self,
        props: &TaskProps,
        opts: &serde_json::Value,
        paths: &ProdPaths,
        launch: Option<&str>,
        procs: usize,
        log: Option<&str>,
    ) -> Result<String> {
        let mut command = self.run_cli(props, opts, paths)?;
        if let Some(launcher) = launch {
            command = format!("{launcher} {procs} {command}");
        }
        if let Some(logfile) = log {
            command = format!("{command} >{logfile} 2>&1");
        }
        Ok(command)
    }

    /// The work function. Errors are handled by [`PipelineTask::run`].
    async fn execute(
        &self,
        _props: &TaskProps,
        _opts: &serde_json::Value,
        _ctx: &TaskContext,
    ) -> Result<()> {
        Err(SpecpipeError::NotImplemented(format!(
            "execute() for task type {}",
            self.type_tag()
        )))
    }

    /// Run the task, converting any error into a failure count instead of
    /// propagating. A single task's crash never aborts the controlling
    /// process; the count is summed across the worker group by the caller.
    async fn run(&self, name: &str, opts: &serde_json::Value, ctx: &TaskContext) -> u32 {
        let props = match self.name_split(name) {
            Ok(props) => props,
            Err(e) => {
                tracing::error!(task = %name, error = %e, "FAILED: invalid task name");
                return 1;
            }
        };
        if let Ok(command) = self.run_cli(&props, opts, &ctx.paths) {
            tracing::debug!(task = %name, cmd = %command, "run by pipeline");
        }
        match self.execute(&props, opts, ctx).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(task = %name, error = %e, "FAILED: task raised an error");
                1
            }
        }
    }

    /// Run the task and update its persisted state. `done` requires both a
    /// zero failure count and every declared output existing on disk; the
    /// output check is the fallback for death without an error.
    async fn run_and_update(
        &self,
        db: &TaskDb,
        name: &str,
        opts: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<u32> {
        let mut failed = self.run(name, opts, ctx).await;

        if failed == 0 {
            let props = self.name_split(name)?;
            let outputs = self.paths(&props, &ctx.paths)?;
            for output in &outputs {
                if !output.exists() {
                    tracing::error!(
                        task = %name,
                        output = %output.display(),
                        "Declared output missing after run"
                    );
                    failed = 1;
                    break;
                }
            }
        }

        let state = if failed == 0 {
            TaskState::Done
        } else {
            TaskState::Fail
        };
        self.state_set(db, name, state).await?;
        Ok(failed)
    }
}
