// Error types for the usage log library and the tools built on it.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UsageError>;

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Log file {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Record has {found} fields but the schema has {expected} columns")]
    RecordLength { expected: usize, found: usize },

    #[error("Log file {path:?} has no column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("External tool `{tool}` failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Notification credentials: {0}")]
    Auth(String),

    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

impl UsageError {
    pub fn io(path: &Path, source: std::io::Error) -> UsageError {
        UsageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn csv(path: &Path, source: csv::Error) -> UsageError {
        UsageError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn external_tool(tool: &str, reason: impl Into<String>) -> UsageError {
        UsageError::ExternalTool {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}
