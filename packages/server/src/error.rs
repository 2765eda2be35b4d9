//! Error taxonomy for the ingestion and orchestration core.
//!
//! `anyhow::Result` is used at I/O boundaries (DB pool setup, HTTP calls) where
//! the caller only needs to propagate and log. `IngestError` is used at module
//! boundaries where a caller needs to branch on failure kind, e.g. the
//! [`crate::queue`] worker loop deciding whether to retry a job.

use thiserror::Error;

/// Failure kind for anything that flows through the job queue or pollers.
///
/// Mirrors the taxonomy in spec §7: transient failures are retried with
/// backoff, persistent/validation failures go straight to dead-letter,
/// queue-internal errors indicate a bug in this crate rather than upstream,
/// and `Fatal` should stop the owning loop rather than retry forever.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Upstream (UMS) or network failure expected to clear on its own:
    /// timeouts, connection resets, 5xx responses.
    #[error("transient failure for server {server_id:?}: {source}")]
    Transient {
        server_id: Option<i64>,
        #[source]
        source: anyhow::Error,
    },

    /// Failure that will not clear on retry: 4xx responses, malformed
    /// payloads that will always fail to parse the same way.
    #[error("persistent failure for server {server_id:?}: {source}")]
    Persistent {
        server_id: Option<i64>,
        #[source]
        source: anyhow::Error,
    },

    /// Input failed a shape/invariant check before any I/O was attempted.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The queue store itself misbehaved: a constraint violation that
    /// shouldn't be possible, a row disappearing mid-transaction, a lease
    /// invariant broken. Indicates a bug, not an upstream problem.
    #[error("queue internal error: {0}")]
    QueueInternal(#[source] anyhow::Error),

    /// A query or transaction exceeded its `statement_timeout` / lock wait.
    #[error("database stalled: {0}")]
    DbStall(#[source] anyhow::Error),

    /// The job handler's core work succeeded but committing the result
    /// (cursor advance, status row) failed.
    #[error("finalize failed for job {job_id}: {source}")]
    FinalizeFailure {
        job_id: uuid::Uuid,
        #[source]
        source: anyhow::Error,
    },

    /// Unrecoverable: the owning loop (poller, scheduler) should stop rather
    /// than retry.
    #[error("fatal error: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl IngestError {
    /// Whether a queue worker should schedule a retry for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Transient { .. } | IngestError::DbStall(_)
        )
    }

    pub fn server_id(&self) -> Option<i64> {
        match self {
            IngestError::Transient { server_id, .. } => *server_id,
            IngestError::Persistent { server_id, .. } => *server_id,
            _ => None,
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
