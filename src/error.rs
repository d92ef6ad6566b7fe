//! Error taxonomy shared by every service.
use crate::workflow::TransitionError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Permission(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("{0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("{0}")]
    Idempotency(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How an error is surfaced by whichever transport sits above the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Treatment {
    Forbidden,
    InvalidRequest,
    NotFound,
    Internal,
}

impl Error {
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn idempotency(message: impl Into<String>) -> Self {
        Self::Idempotency(message.into())
    }

    /// Business-rule failures raised by services on top of the table lookup.
    pub fn blocked(message: impl Into<String>) -> Self {
        Self::Transition(TransitionError::Blocked(message.into()))
    }

    pub fn treatment(&self) -> Treatment {
        match self {
            Error::Permission(_) => Treatment::Forbidden,
            Error::Transition(_) | Error::Validation(_) | Error::Idempotency(_) => {
                Treatment::InvalidRequest
            }
            Error::NotFound { .. } => Treatment::NotFound,
            Error::Storage(_) | Error::Encode(_) | Error::Decode(_) | Error::Config(_) => {
                Treatment::Internal
            }
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for Error {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        Error::Encode(value.to_string())
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(value: sled::transaction::TransactionError<Error>) -> Self {
        match value {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Error::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn treatments_follow_the_taxonomy() {
        assert_eq!(Error::permission("no").treatment(), Treatment::Forbidden);
        assert_eq!(Error::blocked("no").treatment(), Treatment::InvalidRequest);
        assert_eq!(Error::validation("no").treatment(), Treatment::InvalidRequest);
        assert_eq!(Error::idempotency("no").treatment(), Treatment::InvalidRequest);
        assert_eq!(
            Error::NotFound { entity: "incident", id: 4 }.treatment(),
            Treatment::NotFound
        );
    }

    #[test]
    fn role_errors_are_invalid_requests_not_forbidden() {
        let err: Error = TransitionError::RoleNotAuthorized {
            role: "Employee".into(),
            from: "DRAFT".into(),
            to: "ASSESSED".into(),
        }
        .into();
        assert_eq!(err.treatment(), Treatment::InvalidRequest);
    }
}
