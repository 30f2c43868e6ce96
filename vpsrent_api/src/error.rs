use crate::retry::OpError;
use thiserror::Error;
use vpsrent_db::DbError;

/// Error surface of every service. The HTTP boundary maps each variant to a
/// status code; services never see HTTP types.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    PaymentRequired(String),
    #[error("{0}")]
    LimitExceeded(String),
    /// Hypervisor or gateway unreachable / timed out
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ServiceError::InvalidState(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ServiceError::Forbidden(msg.into())
    }
}

impl From<DbError> for ServiceError {
    fn from(e: DbError) -> Self {
        if e.is_not_found() {
            ServiceError::NotFound("Not found".to_string())
        } else {
            ServiceError::Internal(e.into())
        }
    }
}

impl From<OpError> for ServiceError {
    fn from(e: OpError) -> Self {
        match e {
            OpError::Transient(e) => ServiceError::Upstream(e.to_string()),
            OpError::Fatal(e) => ServiceError::Internal(e),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
