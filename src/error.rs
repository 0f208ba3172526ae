use thiserror::Error;

use crate::ports::RepositoryError;
use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for callers.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::InvalidTransition(_) => "INVALID_TRANSITION",
            AppError::Provider(_) => "PROVIDER_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Serialization(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Rejected before any scope opened; retrying the same input cannot help.
    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::Validation(_))
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(what) => AppError::NotFound(what),
            RepositoryError::Conflict(what) => AppError::Conflict(what),
            RepositoryError::Database(e) => AppError::Database(e.to_string()),
            RepositoryError::Decode(what) | RepositoryError::Overflow(what) => {
                AppError::Database(what)
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_code() {
        let error = AppError::Validation("amount must be positive".to_string());
        assert_eq!(error.code(), "VALIDATION_ERROR");
        assert!(error.is_validation());
    }

    #[test]
    fn test_repository_not_found_maps_to_not_found() {
        let error = AppError::from(RepositoryError::NotFound("transfer TRF1".to_string()));
        assert_eq!(error.code(), "NOT_FOUND");
    }

    #[test]
    fn test_repository_conflict_maps_to_conflict() {
        let error = AppError::from(RepositoryError::Conflict("idempotency key k1".to_string()));
        assert_eq!(error.code(), "CONFLICT");
    }

    #[test]
    fn test_database_error_code() {
        let error = AppError::from(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(error.code(), "DATABASE_ERROR");
        assert!(!error.is_validation());
    }

    #[test]
    fn test_provider_error_code() {
        let error = AppError::from(ProviderError::CircuitOpen);
        assert_eq!(error.code(), "PROVIDER_ERROR");
    }

    #[test]
    fn test_invalid_transition_code() {
        let error = AppError::InvalidTransition("COMPLETED -> FAILED".to_string());
        assert_eq!(error.code(), "INVALID_TRANSITION");
    }
}
