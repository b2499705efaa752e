//! Error taxonomy shared by the store, the remote client and the façade.

use thiserror::Error;

/// Errors surfaced by mediacheck operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad credentials or an expired token. The caller should re-login.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Input rejected by the server (or by local validation).
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    /// Network-level failure or timeout. Recoverable from local data.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// 5xx without a structured field error.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Local persistence failure.
    #[error("store error: {0}")]
    Store(#[from] redb::Error),

    /// Stored or received payload could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A draft is missing required fields.
    #[error("invalid media draft: {0}")]
    InvalidDraft(&'static str),

    /// The operation needs a server-assigned id that the record does not have yet.
    #[error("media '{0}' has not been synced yet")]
    Unsynced(String),

    /// No user is logged in.
    #[error("not logged in")]
    NoSession,
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when a local fallback is the right response.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_))
    }

    /// Message suitable for showing to a user: server field messages verbatim,
    /// everything else a generic retry hint.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { field, message } => format!("{field}: {message}"),
            Error::Auth(_) | Error::NoSession => "Please log in again.".to_string(),
            Error::NotFound { entity, .. } => format!("{entity} not found."),
            Error::Unsynced(title) => {
                format!("'{title}' is waiting to be synced. Try again once online.")
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

macro_rules! redb_into_store {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::Store(e.into())
                }
            }
        )*
    };
}

redb_into_store!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

/// Result type for mediacheck operations.
pub type Result<T> = std::result::Result<T, Error>;
