//! Error types for the publish module.

use thiserror::Error;

use crate::claim::ClaimError;
use crate::failure::ErrorClass;
use crate::storage::StoreError;
use crate::work_item::WorkSourceError;

#[derive(Debug, Error)]
pub enum PublishError {
    /// The lease moved before the final write; nothing may be written.
    #[error("Lease lost during publish: {0}")]
    LeaseLost(String),

    #[error("Failed to upload {artifact}: {source}")]
    Upload {
        artifact: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to read artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write result to catalog: {0}")]
    Finalize(WorkSourceError),

    #[error("Publish failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<PublishError>,
    },
}

impl PublishError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PublishError::Upload { source, .. } => source.class(),
            PublishError::Finalize(e) if !e.is_retryable() => ErrorClass::Permanent,
            PublishError::Exhausted { last, .. } => last.class(),
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, PublishError::LeaseLost(_))
    }
}

impl From<ClaimError> for PublishError {
    fn from(e: ClaimError) -> Self {
        match e {
            ClaimError::Source(source) => PublishError::Finalize(source),
            other => PublishError::LeaseLost(other.to_string()),
        }
    }
}
