use thiserror::Error;

/// Crate-wide error type covering every subsystem boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpecpipeError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Table error: {0}")]
    TableError(String),
    #[error("Task error: {0}")]
    TaskError(String),
    #[error("Camword error: {0}")]
    CamwordError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Pipeline error: {0}")]
    PipelineError(String),
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Classification error: {0}")]
    ClassificationError(String),
    #[error("Missing dependency: {0}")]
    MissingDependency(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl From<sqlx::Error> for SpecpipeError {
    fn from(e: sqlx::Error) -> Self {
        SpecpipeError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for SpecpipeError {
    fn from(e: std::io::Error) -> Self {
        SpecpipeError::TableError(e.to_string())
    }
}

impl From<csv::Error> for SpecpipeError {
    fn from(e: csv::Error) -> Self {
        SpecpipeError::TableError(e.to_string())
    }
}

impl From<serde_json::Error> for SpecpipeError {
    fn from(e: serde_json::Error) -> Self {
        SpecpipeError::ClassificationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SpecpipeError>;
