//! Error taxonomy shared by the ingest pipeline, the category registry and
//! asset retrieval.

use thiserror::Error;

/// Failures surfaced by the core operations.
///
/// The display strings of the user-correctable variants double as the
/// message returned to API clients, so keep them short and free of internal
/// detail. `Storage` carries the underlying cause for logging only.
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Unsupported file type. Only MP4, AVI and MOV are allowed.")]
    UnsupportedMediaType,
    #[error("Maximum allowed file size is 100MB.")]
    PayloadTooLarge { length: u64 },
    #[error("The video could not be stored. Please try again later.")]
    Storage(#[source] anyhow::Error),
    #[error("not found")]
    NotFound,
}

impl VideoError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// True for failures the client can fix by changing the request.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::UnsupportedMediaType | Self::PayloadTooLarge { .. }
        )
    }
}

pub type VideoResult<T> = Result<T, VideoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn storage_errors_hide_their_cause() {
        let err = VideoError::Storage(anyhow!("disk /srv/media is full"));
        assert!(!err.to_string().contains("/srv/media"));
        assert!(!err.is_user_correctable());
    }

    #[test]
    fn validation_errors_are_user_correctable() {
        assert!(VideoError::invalid_input("No file provided").is_user_correctable());
        assert!(VideoError::UnsupportedMediaType.is_user_correctable());
        assert!(VideoError::PayloadTooLarge { length: 1 }.is_user_correctable());
        assert!(!VideoError::NotFound.is_user_correctable());
    }
}
