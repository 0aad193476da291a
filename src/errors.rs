use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the SparseInst head.
///
/// Each variant carries the context of its domain (filesystem, image decoding,
/// network collaborators, structural validation) so callers never have to parse
/// error strings. Numeric preconditions inside the kernels (odd kernel size,
/// single-image color similarity, stride divisibility) are not represented here:
/// they panic, because they can only be violated by an integration bug.
#[derive(Error, Debug)]
pub enum SparseInstError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SparseInstError>;

impl SparseInstError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build
/// `SparseInstError::FileSystem` itself.
impl From<std::io::Error> for SparseInstError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for SparseInstError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for SparseInstError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of reshaping network outputs, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for SparseInstError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message() {
        let err = SparseInstError::validation("pred_masks", "has 3 slots, expected 5");
        assert_eq!(
            err.to_string(),
            "Validation error: pred_masks has 3 slots, expected 5"
        );
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SparseInstError = io.into();
        assert!(matches!(err, SparseInstError::FileSystem { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }
}
