//! Error types for pipeline construction and lifecycle.
//!
//! Fallible APIs return `anyhow::Result` with one of these as the root cause,
//! so callers can `downcast_ref::<PipelineError>()` to branch on the kind.

use std::time::Duration;

/// Error type for pipeline operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Requested capture mode has no graph description
    UnsupportedCaptureMode(String),
    /// Requested codec cannot be built for the given capture
    UnsupportedCodec(String),
    /// Settings rejected before any native resource was allocated
    InvalidSettings(String),
    /// Graph was built but lacks a named element the component needs
    MissingElement(String),
    /// `start()` was already called
    AlreadyRunning,
    /// Component was stopped and cannot be started again
    Stopped,
    /// Native graph reported an internal error
    Failed { source: String, message: String },
    /// Graph did not reach the ready state in time
    StartTimeout(Duration),
}

impl PipelineError {
    /// Configuration errors are raised synchronously at construction and are
    /// never worth retrying with the same settings.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedCaptureMode(_)
                | PipelineError::UnsupportedCodec(_)
                | PipelineError::InvalidSettings(_)
                | PipelineError::MissingElement(_)
        )
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::UnsupportedCaptureMode(mode) => {
                write!(f, "unsupported capture mode: {}", mode)
            }
            PipelineError::UnsupportedCodec(codec) => write!(f, "unsupported codec: {}", codec),
            PipelineError::InvalidSettings(msg) => write!(f, "invalid settings: {}", msg),
            PipelineError::MissingElement(name) => write!(f, "element not found: {}", name),
            PipelineError::AlreadyRunning => write!(f, "pipe is already running"),
            PipelineError::Stopped => write!(f, "pipe was stopped"),
            PipelineError::Failed { source, message } => {
                write!(f, "pipeline failed at {}: {}", source, message)
            }
            PipelineError::StartTimeout(after) => {
                write!(f, "pipeline not ready after {:?}", after)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

/// Extract the pipeline error kind from an `anyhow` chain.
pub fn kind(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|e| e.downcast_ref::<PipelineError>())
}
