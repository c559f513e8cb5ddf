use racedata::{CacheError, ClientError};
use std::time::Duration;
use store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Upstream(#[from] ClientError),
    #[error("reference catalog unavailable: {0}")]
    Catalog(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed result for subsession {subsession_id}: {reason}")]
    Malformed { subsession_id: i64, reason: String },
    #[error("ingestion run did not finish within {0:?}")]
    Timeout(Duration),
}

impl IngestError {
    /// True when the access token was rejected and the caller must
    /// re-authenticate.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            IngestError::Upstream(e) => e.is_unauthorized(),
            IngestError::Catalog(e) => e.is_unauthorized(),
            _ => false,
        }
    }

    pub(crate) fn malformed<S: Into<String>>(subsession_id: i64, reason: S) -> Self {
        IngestError::Malformed {
            subsession_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_classification() {
        assert!(IngestError::Upstream(ClientError::Unauthorized).is_unauthorized());
        assert!(IngestError::Catalog(CacheError::Client(ClientError::Unauthorized)).is_unauthorized());
        assert!(!IngestError::malformed(1, "no main event").is_unauthorized());
        assert!(!IngestError::Store(StoreError::AlreadyExists).is_unauthorized());
    }
}
