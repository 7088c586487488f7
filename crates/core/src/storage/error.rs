//! Error types for the storage module.

use thiserror::Error;

use crate::failure::ErrorClass;

/// Errors from object storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist (HTTP 404/410 or missing file).
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage rejected request for {location} (HTTP {status}): {message}")]
    Http {
        location: String,
        status: u16,
        message: String,
    },

    #[error("Storage request timed out: {0}")]
    Timeout(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid storage location: {0}")]
    InvalidLocation(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Missing or unaddressable objects are a property of the asset; anything
    /// else is the environment.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound(_) | StoreError::InvalidLocation(_) => ErrorClass::Permanent,
            StoreError::Http { status, .. } => match status {
                401 | 403 | 408 | 429 => ErrorClass::Transient,
                s if *s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            StoreError::Timeout(_) | StoreError::Unavailable(_) | StoreError::Io(_) => {
                ErrorClass::Transient
            }
        }
    }

    pub(crate) fn from_reqwest(location: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StoreError::Timeout(format!("{}: {}", location, e))
        } else {
            StoreError::Unavailable(format!("{}: {}", location, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> StoreError {
        StoreError::Http {
            location: "/hatrac/x".to_string(),
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            StoreError::NotFound("x".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(http(400).class(), ErrorClass::Permanent);
        assert_eq!(http(403).class(), ErrorClass::Transient);
        assert_eq!(http(503).class(), ErrorClass::Transient);
        assert_eq!(
            StoreError::Timeout("x".into()).class(),
            ErrorClass::Transient
        );
    }
}
