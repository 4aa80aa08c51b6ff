//! # Task Type Registry
//!
//! Immutable registration table mapping type tags to task-type
//! implementations, built once at startup and passed by reference to every
//! resolver call. Resolution by name uses longest-tag-first matching so
//! type tags that are prefixes of one another (`psf` vs `psfnight`,
//! `fiberflat` vs `fiberflatnight`) stay unambiguous.

use crate::error::{Result, SpecpipeError};
use crate::tasks::db::TaskDb;
use crate::tasks::types;
use crate::tasks::{PipelineTask, TASK_NAME_SEP};
use std::sync::Arc;

pub struct TaskRegistry {
    /// Entries sorted by descending tag length, then tag.
    entries: Vec<(String, Arc<dyn PipelineTask>)>,
}

impl TaskRegistry {
    /// Build a registry from explicit task types. Duplicate tags are a
    /// configuration error.
    pub fn new(task_types: Vec<Arc<dyn PipelineTask>>) -> Result<TaskRegistry> {
        let mut entries: Vec<(String, Arc<dyn PipelineTask>)> = Vec::new();
        for task in task_types {
            let tag = task.type_tag().to_string();
            if entries.iter().any(|(existing, _)| *existing == tag) {
                return Err(SpecpipeError::ConfigurationError(format!(
                    "Task type '{tag}' registered twice"
                )));
            }
            entries.push((tag, task));
        }
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Ok(TaskRegistry { entries })
    }

    /// Registry holding every task type of the standard reduction chain.
    pub fn standard() -> TaskRegistry {
        TaskRegistry::new(types::standard_task_types())
            .expect("standard task types have unique tags")
    }

    /// Look up a type by exact tag.
    pub fn get(&self, tag: &str) -> Option<&Arc<dyn PipelineTask>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == tag)
            .map(|(_, task)| task)
    }

    /// Resolve a task name to its type: the longest registered tag that
    /// prefixes the name wins.
    pub fn resolve(&self, name: &str) -> Result<&Arc<dyn PipelineTask>> {
        for (tag, task) in &self.entries {
            if name == tag || name.starts_with(&format!("{tag}{TASK_NAME_SEP}")) {
                return Ok(task);
            }
        }
        Err(SpecpipeError::TaskError(format!(
            "No registered task type matches name '{name}'"
        )))
    }

    /// Registered tags, longest first.
    pub fn tags(&self) -> Vec<&str> {
        self.entries.iter().map(|(tag, _)| tag.as_str()).collect()
    }

    /// Idempotently create the backing table of every registered type.
    pub async fn create_all(&self, db: &TaskDb) -> Result<()> {
        for (_, task) in &self.entries {
            task.create(db).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let registry = TaskRegistry::standard();
        let name = "psfnight_20210115_b0";
        assert_eq!(registry.resolve(name).unwrap().type_tag(), "psfnight");
        let name = "psf_20210115_00000042_b0";
        assert_eq!(registry.resolve(name).unwrap().type_tag(), "psf");
        let name = "fiberflatnight_20210115_z3";
        assert_eq!(
            registry.resolve(name).unwrap().type_tag(),
            "fiberflatnight"
        );
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let registry = TaskRegistry::standard();
        assert!(registry.resolve("coadd_20210115").is_err());
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let t = types::standard_task_types();
        let mut doubled = t.clone();
        doubled.push(t[0].clone());
        assert!(TaskRegistry::new(doubled).is_err());
    }
}
