pub mod driver;
pub mod event;
pub mod geo;
pub mod messaging;
pub mod repository;
pub mod services;
pub mod settlement;
pub mod ticket;
pub mod trip;

pub use driver::DriverDispatchContext;
pub use event::Event;
pub use geo::Point;
pub use settlement::{SettlementRecord, SettlementStatus};
pub use ticket::{EscalationPolicy, Ticket};
pub use trip::{Location, RouteSummary, TripRequest, MAX_ADDITIONAL_PRICE};
pub use hailing_shared::models::TripState;

/// Domain error shared by every layer of the dispatch engine.
///
/// `Storage`, `External` and `Internal` are infrastructure failures and are
/// retried by the outbox/subscription machinery. The remaining kinds are
/// permanent rule violations reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Already expired: {0}")]
    AlreadyExpired(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("External service error: {0}")]
    External(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Stable code for the HTTP layer
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "NOT_FOUND",
            DispatchError::Unauthorized(_) => "UNAUTHORIZED",
            DispatchError::InvalidOperation(_) => "INVALID_OPERATION",
            DispatchError::AlreadyExists(_) => "ALREADY_EXISTS",
            DispatchError::AlreadyExpired(_) => "ALREADY_EXPIRED",
            DispatchError::Storage(_) => "STORAGE_ERROR",
            DispatchError::External(_) => "EXTERNAL_ERROR",
            DispatchError::Internal(_) => "INTERNAL_ERROR",
            DispatchError::Cancelled => "CANCELLED",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::NotFound(_) => 404,
            DispatchError::Unauthorized(_) => 403,
            DispatchError::InvalidOperation(_) => 400,
            DispatchError::AlreadyExists(_) => 409,
            DispatchError::AlreadyExpired(_) => 410,
            DispatchError::Storage(_) | DispatchError::Internal(_) => 500,
            DispatchError::External(_) => 502,
            DispatchError::Cancelled => 503,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Storage(_) | DispatchError::External(_) | DispatchError::Internal(_)
        )
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        DispatchError::Storage(err.to_string())
    }

    pub fn external(err: impl std::fmt::Display) -> Self {
        DispatchError::External(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Internal(format!("serialization failed: {}", err))
    }
}

pub type CoreResult<T> = Result<T, DispatchError>;
