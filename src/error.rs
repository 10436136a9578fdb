use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Stable, serializable tag for every failure the forge reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    ExecutionTimeout,
    ToolchainUnavailable,
    NoBackendAvailable,
    DeviceCommunicationError,
    ProgrammingVerificationFailure,
    BackendBusy,
    ExecutionError,
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("{0}")]
    Validation(String),

    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: String,
        timeout: Duration,
        output: String,
    },

    #[error("toolchain unavailable: {0}")]
    ToolchainUnavailable(String),

    #[error("no programmer backend available")]
    NoBackendAvailable,

    #[error("device communication failed: {message}")]
    DeviceCommunication { message: String, output: String },

    #[error("programming finished but verification failed: {message}")]
    VerificationFailed { message: String, output: String },

    #[error("programmer '{0}' is busy with another operation")]
    Busy(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        ForgeError::Validation(message.into())
    }

    pub fn device(message: impl Into<String>, output: impl Into<String>) -> Self {
        ForgeError::DeviceCommunication {
            message: message.into(),
            output: output.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ForgeError::Validation(_) => ErrorCode::ValidationError,
            ForgeError::Timeout { .. } => ErrorCode::ExecutionTimeout,
            ForgeError::ToolchainUnavailable(_) => ErrorCode::ToolchainUnavailable,
            ForgeError::NoBackendAvailable => ErrorCode::NoBackendAvailable,
            ForgeError::DeviceCommunication { .. } => ErrorCode::DeviceCommunicationError,
            ForgeError::VerificationFailed { .. } => ErrorCode::ProgrammingVerificationFailure,
            ForgeError::Busy(_) => ErrorCode::BackendBusy,
            ForgeError::Execution(_) | ForgeError::Io(_) => ErrorCode::ExecutionError,
        }
    }

    /// Raw tool or bridge output attached to the failure, empty when none was captured.
    pub fn raw_output(&self) -> &str {
        match self {
            ForgeError::Timeout { output, .. }
            | ForgeError::DeviceCommunication { output, .. }
            | ForgeError::VerificationFailed { output, .. } => output,
            _ => "",
        }
    }

    /// Validation and precondition failures are final; the rest may succeed on a later call.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.code(),
            ErrorCode::ValidationError
                | ErrorCode::ToolchainUnavailable
                | ErrorCode::NoBackendAvailable
        )
    }
}

pub type ForgeResult<T> = std::result::Result<T, ForgeError>;
