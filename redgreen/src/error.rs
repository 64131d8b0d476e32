//! Error taxonomy surfaced at the action boundary.

use std::path::PathBuf;

use crate::core::types::Phase;

/// Failure of a non-transactional restore.
///
/// Paths in `restored` were written before `failed_path` errored; paths in
/// `not_attempted` still hold their pre-restore content.
#[derive(Debug, thiserror::Error)]
#[error(
    "restore failed at {}: {source} (restored {} path(s), {} not attempted)",
    .failed_path.display(),
    .restored.len(),
    .not_attempted.len()
)]
pub struct RestoreError {
    pub restored: Vec<PathBuf>,
    pub failed_path: PathBuf,
    pub not_attempted: Vec<PathBuf>,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// Malformed or missing input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("phase violation: cannot move from {from} to {to}: {reason}")]
    PhaseViolation { from: Phase, to: Phase, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Test process failed to start or timed out.
    #[error("execution error: {0}")]
    Execution(String),

    /// Circuit breaker is open; the call was not attempted.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Generation call failed after retries or with a permanent error.
    #[error("service call failed: {0}")]
    Service(String),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl CycleError {
    /// Stable machine-readable kind for response payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Validation(_) => "validation",
            CycleError::PhaseViolation { .. } => "phase_violation",
            CycleError::NotFound(_) => "not_found",
            CycleError::Execution(_) => "execution",
            CycleError::ServiceUnavailable(_) => "service_unavailable",
            CycleError::Service(_) => "service",
            CycleError::Restore(_) => "restore",
            CycleError::Io(_) => "io",
        }
    }
}

pub type CycleResult<T> = Result<T, CycleError>;
