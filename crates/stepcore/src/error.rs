use std::fmt;
use thiserror::Error;

/// A single failed rule in a step configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A step was rejected at admission time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid step configuration in {file_path}: {}", join_errors(.errors))]
pub struct ValidationError {
    pub file_path: String,
    pub errors: Vec<FieldError>,
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Step not found: {0}")]
    NotFound(String),

    #[error("Invalid step descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

/// Failure of a single step invocation.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Unsupported file extension {file_path}")]
    UnsupportedRuntime { file_path: String },

    #[error("Executable {command} not found")]
    ExecutableNotFound { command: String },

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    #[error("Process exited with code {code}")]
    ExitCode { code: i32 },

    #[error("Step exceeded its deadline of {after_ms}ms")]
    DeadlineExceeded { after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutionError {
    /// Exit code reported by the worker, if the failure came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExitCode { code } => Some(*code),
            _ => None,
        }
    }
}

/// Failure reported by a state or stream backend.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
