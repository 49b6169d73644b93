use thiserror::Error;

/// The central error type for all operations in the imagevault_engine.
#[derive(Error, Debug)]
pub enum ImageVaultError {
    #[error("Image decode error: {0}")]
    Decode(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown filter type: {0}")]
    UnknownFilter(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImageVaultError {
    /// Errors caused by the request itself. These are never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ImageVaultError::Decode(_)
                | ImageVaultError::UnsupportedFormat(_)
                | ImageVaultError::InvalidParameter(_)
                | ImageVaultError::UnknownFilter(_)
                | ImageVaultError::Unauthorized
                | ImageVaultError::NotFound(_)
                | ImageVaultError::Validation(_)
        )
    }

    /// Store or network failures that may succeed on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ImageVaultError::Storage(_) | ImageVaultError::Io(_))
    }
}

impl From<image::ImageError> for ImageVaultError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => ImageVaultError::UnsupportedFormat(e.to_string()),
            image::ImageError::IoError(e) => ImageVaultError::Io(e),
            other => ImageVaultError::Decode(other.to_string()),
        }
    }
}

// Variant-level equality. Foreign payloads (io, serde) only compare the variant.
impl PartialEq for ImageVaultError {
    fn eq(&self, other: &Self) -> bool {
        use ImageVaultError::*;
        match (self, other) {
            (Decode(a), Decode(b))
            | (UnsupportedFormat(a), UnsupportedFormat(b))
            | (InvalidParameter(a), InvalidParameter(b))
            | (UnknownFilter(a), UnknownFilter(b))
            | (NotFound(a), NotFound(b))
            | (Validation(a), Validation(b))
            | (Storage(a), Storage(b))
            | (Internal(a), Internal(b)) => a == b,
            (Unauthorized, Unauthorized) => true,
            (Io(_), Io(_)) => true,
            (Serialization(_), Serialization(_)) => true,
            _ => false,
        }
    }
}

/// A centralized result type for our library.
pub type Result<T> = std::result::Result<T, ImageVaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_message_leaks_nothing() {
        assert_eq!(ImageVaultError::Unauthorized.to_string(), "unauthorized");
    }

    #[test]
    fn test_classification() {
        assert!(ImageVaultError::InvalidParameter("x".into()).is_client_error());
        assert!(ImageVaultError::Unauthorized.is_client_error());
        assert!(!ImageVaultError::Storage("down".into()).is_client_error());
        assert!(ImageVaultError::Storage("down".into()).is_transient());
        assert!(!ImageVaultError::NotFound("img".into()).is_transient());
    }

    #[test]
    fn test_partial_eq_compares_payloads() {
        assert_eq!(
            ImageVaultError::NotFound("a".into()),
            ImageVaultError::NotFound("a".into())
        );
        assert_ne!(
            ImageVaultError::NotFound("a".into()),
            ImageVaultError::NotFound("b".into())
        );
        assert_ne!(
            ImageVaultError::NotFound("a".into()),
            ImageVaultError::Validation("a".into())
        );
    }
}
