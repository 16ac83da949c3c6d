use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::{DatabaseError, EntryFlag};

/// Coarse classification used for retry and pass-failure decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unreachable, timed out, rate limited or a 5xx. Retryable.
    Network,
    /// Credentials rejected. Fatal to the pass.
    Auth,
    /// The feed or entry vanished remotely (or was never cached locally).
    NotFound,
    /// The server answered with something the client cannot use.
    Protocol,
    /// Local transaction failed and was rolled back. Fatal to the pass.
    LocalStorage,
    /// A pending mutation or a running pass blocks the request.
    Conflict,
    /// The caller's input was refused before anything was sent.
    InvalidInput,
}

impl ErrorKind {
    /// Short label for user-facing summaries.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not found",
            ErrorKind::Protocol => "protocol",
            ErrorKind::LocalStorage => "local storage",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidInput => "invalid input",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(DatabaseError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Entry {entry_id} already has a {flag} change in flight")]
    Conflict { entry_id: String, flag: EntryFlag },

    #[error("A sync pass is running")]
    PassRunning,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<DatabaseError> for SyncError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(what) => SyncError::NotFound(what),
            DatabaseError::PendingMutation { entry_id, flag } => SyncError::Conflict { entry_id, flag },
            other => SyncError::Storage(other),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Remote(remote) => match remote {
                RemoteError::Network(_)
                | RemoteError::Timeout
                | RemoteError::RateLimited { .. } => ErrorKind::Network,
                RemoteError::HttpStatus(status) if *status >= 500 => ErrorKind::Network,
                RemoteError::Auth => ErrorKind::Auth,
                RemoteError::NotFound(_) => ErrorKind::NotFound,
                RemoteError::InvalidUrl(_) => ErrorKind::InvalidInput,
                RemoteError::Local(_) => ErrorKind::LocalStorage,
                RemoteError::HttpStatus(_) | RemoteError::Malformed(_) | RemoteError::ResponseTooLarge => {
                    ErrorKind::Protocol
                }
            },
            SyncError::Storage(_) => ErrorKind::LocalStorage,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Conflict { .. } | SyncError::PassRunning => ErrorKind::Conflict,
            SyncError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Remote(remote) if remote.is_transient())
    }

    /// Errors that end the whole pass instead of one feed's share of it.
    pub fn is_pass_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth | ErrorKind::LocalStorage)
    }
}
