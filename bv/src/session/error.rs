//! Session coordinator error types

use thiserror::Error;

/// Errors from starting or stopping the coordinator's worker thread
///
/// Nothing else crosses the caller-facing API: connection and query failures
/// are reported as notifications.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to start session worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Session worker panicked")]
    WorkerPanicked,
}
