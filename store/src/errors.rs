use crate::metrics_defs::STORE_CONDITIONAL_CONFLICTS;
use crate::table::TableError;
use shared::counter;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A conditional insert found the key already present. Expected during
    /// idempotent re-ingestion.
    #[error("entity already exists")]
    AlreadyExists,

    #[error("driver {0} not found")]
    DriverNotFound(i64),

    #[error("{0} not found")]
    NotFound(String),

    #[error("transaction batch {batch}/{total} failed: {source}")]
    BatchFailed {
        batch: usize,
        total: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("table error: {0}")]
    Table(#[source] TableError),

    #[error("failed to encode or decode {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// True for a conditional-insert conflict, including one that failed a
    /// batched write.
    pub fn is_already_exists(&self) -> bool {
        match self {
            StoreError::AlreadyExists => true,
            StoreError::BatchFailed { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }
}

/// Maps table errors into the store's domain. Every condition failure
/// becomes `AlreadyExists`; callers that guard on existence rather than
/// absence remap it to their own not-found variant.
pub(crate) fn translate(error: TableError) -> StoreError {
    if error.is_condition_failure() {
        counter!(STORE_CONDITIONAL_CONFLICTS).increment(1);
        return StoreError::AlreadyExists;
    }
    StoreError::Table(error)
}

/// Translation for writes guarded by "key exists".
pub(crate) fn translate_missing(error: TableError, what: impl FnOnce() -> StoreError) -> StoreError {
    match translate(error) {
        StoreError::AlreadyExists => what(),
        other => other,
    }
}
