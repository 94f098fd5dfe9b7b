use warden_core::engine::{CheckError, ErrorKind};
use warden_core::schema::{BreakingChange, ValidationError};
use warden_core::tuple::ParseTupleError;
use warden_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("check error: {0}")]
    Check(#[from] CheckError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseTupleError),

    #[error("schema validation errors: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("breaking schema changes detected (use force to override): {}", join(.0))]
    BreakingChanges(Vec<BreakingChange>),

    #[error("schema not found")]
    SchemaNotFound,

    #[error("depth {depth} outside allowed range {min}..={max}")]
    InvalidDepth { depth: u32, min: u32, max: u32 },

    #[error("invalid relationship '{tuple}': {reason}")]
    InvalidRelationship { tuple: String, reason: String },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Check(err) => err.kind(),
            Self::Storage(StorageError::Internal(_)) => ErrorKind::Upstream,
            Self::Storage(_)
            | Self::Parse(_)
            | Self::Validation(_)
            | Self::BreakingChanges(_)
            | Self::InvalidDepth { .. }
            | Self::InvalidRelationship { .. } => ErrorKind::Validation,
            Self::SchemaNotFound => ErrorKind::NotFound,
        }
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_from_check_error() {
        let api_err: ApiError = CheckError::EntityNotFound("document".to_string()).into();

        assert!(
            api_err.to_string().contains("document"),
            "expected 'document' in error message, got: {api_err}"
        );
        assert_eq!(api_err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn api_error_from_storage_error() {
        let api_err: ApiError = StorageError::EmptyDeleteFilter.into();

        assert!(
            api_err.to_string().contains("delete filter"),
            "expected 'delete filter' in error message, got: {api_err}"
        );
        assert_eq!(api_err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn internal_storage_error_is_upstream() {
        let api_err: ApiError = StorageError::Internal("disk".to_string()).into();

        assert_eq!(api_err.kind(), ErrorKind::Upstream);
    }

    #[test]
    fn api_error_validation_formats_multiple_errors() {
        let errors = vec![
            ValidationError::TooManyTypes {
                count: 60,
                limit: 50,
            },
            ValidationError::TooManyRelations {
                type_name: "doc".to_string(),
                count: 40,
                limit: 30,
            },
        ];
        let msg = ApiError::Validation(errors).to_string();

        assert!(msg.contains("60"), "should contain count 60: {msg}");
        assert!(msg.contains("doc"), "should contain type name: {msg}");
    }

    #[test]
    fn depth_and_cancel_kinds_pass_through() {
        assert_eq!(
            ApiError::Check(CheckError::DepthExceeded(3)).kind(),
            ErrorKind::DepthExceeded
        );
        assert_eq!(ApiError::Check(CheckError::Canceled).kind(), ErrorKind::Canceled);
        assert_eq!(
            ApiError::InvalidDepth {
                depth: 1,
                min: 3,
                max: 50
            }
            .kind(),
            ErrorKind::Validation
        );
    }
}
