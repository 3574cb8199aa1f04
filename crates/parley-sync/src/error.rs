use thiserror::Error;
use uuid::Uuid;

use parley_db::StoreError;
use parley_types::identity::IdentityError;

/// Failures surfaced to callers of `send` / `open_conversation`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Empty content, self-messaging, malformed ids, over-long content. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A concurrent conversation create that could not be resolved by refetching.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Timeout or connectivity failure. The outcome is unknown; retry with the same
    /// input. For a send, `message_id` is the id to resubmit with so a write that
    /// landed after the timeout is not duplicated.
    #[error("transient store error: {reason}")]
    Transient {
        reason: String,
        message_id: Option<Uuid>,
    },

    /// The referenced conversation does not exist (or is not visible to the viewer).
    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            message_id: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient { .. })
    }

    /// The message id a retry must reuse, when the failed call was a send.
    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            Self::Transient { message_id, .. } => *message_id,
            _ => None,
        }
    }

    /// Attach the id of the message whose send failed transiently.
    pub(crate) fn for_message(self, id: Uuid) -> Self {
        match self {
            Self::Transient { reason, .. } => Self::Transient {
                reason,
                message_id: Some(id),
            },
            other => other,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(reason) => Self::Conflict(reason),
            StoreError::Unavailable(reason) => Self::transient(reason),
            StoreError::NotFound(reason) => Self::NotFound(reason),
            StoreError::Invalid(reason) => Self::Validation(reason),
            StoreError::Sqlite(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<IdentityError> for SyncError {
    fn from(err: IdentityError) -> Self {
        Self::Validation(err.to_string())
    }
}
