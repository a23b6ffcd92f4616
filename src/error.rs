use thiserror::Error;

/// Failure taxonomy for the offline queue and the risk index.
///
/// `Network` failures are transient: the mutation goes back to the queue and
/// is retried with backoff. `Conflict` and `Storage` are not retriable and
/// are surfaced to the caller.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed dataset {source_name}: {reason}")]
    DataFormat { source_name: String, reason: String },

    #[error("remote request failed: {0}")]
    Network(String),

    #[error("remote rejected upsert for {record_id}: concurrent conflicting write")]
    Conflict { record_id: String },

    #[error("local storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
