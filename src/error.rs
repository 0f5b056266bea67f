//! Custom error types for the application.
//!
//! `EchemError` is the single error type shared by the dispatcher, the technique
//! backends and the workflow executor. Variants fall into three classes that
//! drive how far an error travels:
//!
//! - **Absorbed**: `Parse`, `Validation`, `UnknownTechnique`, `UnknownAction`,
//!   `UnknownLabware` and `Upload` fail a single unit operation or action. They
//!   are logged, recorded in the result, and never stop a workflow.
//! - **Escalating**: `Connection`, `Device` and `Measurement` come from
//!   infrastructure. A workflow keeps traversing but reports `false` overall.
//! - **Fatal**: `SafetyAbort`, `SafetyTimeout` and `Cancelled` stop the current
//!   workflow run immediately.
//!
//! Load-time problems (`CyclicWorkflow`, `NoRootNode`, `InvalidWorkflow`,
//! `Config`, `Configuration`) are reported before anything moves.

use crate::core::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, EchemError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum EchemError {
    #[error("Invalid value for '{field}': {message}")]
    Parse { field: String, message: String },

    #[error("Parameter validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Unknown experiment type: {0}")]
    UnknownTechnique(String),

    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Unknown labware '{0}'")]
    UnknownLabware(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Measurement error: {0}")]
    Measurement(String),

    #[error("Result upload failed: {0}")]
    Upload(String),

    #[error("Safety violation: {0}")]
    SafetyAbort(String),

    #[error("No safety verdict within {0:?}")]
    SafetyTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Workflow contains a cycle through nodes: {}", .0.join(", "))]
    CyclicWorkflow(Vec<String>),

    #[error("Workflow has no root node")]
    NoRootNode,

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl EchemError {
    /// Builds a `Parse` error for the named field.
    pub fn parse(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Serialisable classification carried by error results.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } | Self::Json(_) => ErrorKind::Parse,
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownTechnique(_) | Self::UnknownAction(_) | Self::UnknownLabware(_) => {
                ErrorKind::UnknownType
            }
            Self::Connection(_) => ErrorKind::Connection,
            Self::Device(_) | Self::Measurement(_) | Self::Io(_) => ErrorKind::Measurement,
            Self::Upload(_) | Self::ObjectStore(_) => ErrorKind::Upload,
            Self::SafetyAbort(_) | Self::SafetyTimeout(_) => ErrorKind::SafetyAbort,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::CyclicWorkflow(_)
            | Self::NoRootNode
            | Self::InvalidWorkflow(_)
            | Self::Config(_)
            | Self::Configuration(_) => ErrorKind::Internal,
        }
    }

    /// True when the error must mark a workflow run as failed.
    pub fn is_escalating(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Device(_)
                | Self::Measurement(_)
                | Self::Io(_)
                | Self::SafetyAbort(_)
                | Self::SafetyTimeout(_)
                | Self::Cancelled
        )
    }

    /// True when the error must stop the workflow run right away.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SafetyAbort(_) | Self::SafetyTimeout(_) | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EchemError::UnknownTechnique("XYZ".to_string());
        assert_eq!(err.to_string(), "Unknown experiment type: XYZ");

        let err = EchemError::parse("start_voltage", "unknown unit suffix 'volts'");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'start_voltage': unknown unit suffix 'volts'"
        );

        let err = EchemError::Validation(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Parameter validation failed: a; b");
    }

    #[test]
    fn test_error_classes() {
        assert!(EchemError::Connection("offline".into()).is_escalating());
        assert!(!EchemError::Connection("offline".into()).is_fatal());
        assert!(EchemError::SafetyTimeout(Duration::from_millis(5)).is_fatal());
        assert!(EchemError::Cancelled.is_fatal());
        assert!(!EchemError::Upload("denied".into()).is_escalating());
        assert!(!EchemError::Validation(vec![]).is_escalating());
        assert_eq!(
            EchemError::SafetyAbort("collision".into()).kind(),
            ErrorKind::SafetyAbort
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EchemError = io.into();
        assert!(matches!(err, EchemError::Io(_)));
    }
}
