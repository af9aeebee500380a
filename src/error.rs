//! Errors returned by state operations

use crate::import::{LinkError, SourceError, SubscriptionError};
use crate::normalize::NormalizeError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(#[from] NormalizeError),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Apply already in progress")]
    Busy,
    #[error("Link import failed: {0}")]
    Link(#[from] LinkError),
    #[error("Subscription failed: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error("Source list refresh failed: {0}")]
    Source(#[from] SourceError),
    #[error("State persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Rejected before touching state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::Validation(_)
                | CoreError::InvalidRequest(_)
                | CoreError::Conflict(_)
                | CoreError::Link(_)
        )
    }
}
