//! Error types for the Relaydesk stores

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the customer/ticket/message stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or timed out. Safe to retry.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness invariant rejected the write (another writer won a race).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Closed and cancelled tickets accept no appends or status changes.
    #[error("Ticket {0} is closed")]
    TicketClosed(Uuid),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Whether the caller may retry the same operation and expect a different outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation
                if db_err.code().as_deref() == Some("23505") {
                    return StoreError::Conflict(db_err.message().to_string());
                }
                StoreError::Unavailable(db_err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::InvalidData(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}
