//! Domain error types
//!
//! Two layers live here:
//! - [`DomainError`]: construction-time validation of domain values
//! - [`SyncError`]: the taxonomy every sync component reports through,
//!   plus [`ErrorList`] for aggregating several causes into one result

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid content hash
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Invalid server uid
    #[error("Invalid server uid: {0}")]
    InvalidServerUid(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Path is not within the configured sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

// ============================================================================
// Sync error taxonomy
// ============================================================================

/// Failure of a single transfer attempt or operation against the remote
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Timeouts, connection resets, throttling, server errors
    #[error("Transient transfer failure: {0}")]
    Transient(String),

    /// Authorization, not-found, rejected content, or exhausted retries
    #[error("Permanent transfer failure: {0}")]
    Permanent(String),
}

impl TransferError {
    /// True if the operation may succeed when retried
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Human readable reason without the classification prefix
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(reason) | Self::Permanent(reason) => reason,
        }
    }
}

/// Error taxonomy of the sync core
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Bad configuration or input; fails fast, never retried automatically
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local Index read/write failure; fatal to the current pass
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network transfer failure
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A change lost conflict resolution and was discarded
    #[error("Conflict on {path}: {reason}")]
    Conflict {
        /// Path both sides changed
        path: String,
        /// Which side won and why
        reason: String,
    },

    /// Another operation holds the active-sync reservation
    #[error("Syncbox is reserved by {holder}")]
    Reservation {
        /// Description of the current holder
        holder: String,
    },

    /// The operation was cancelled before completing
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Short machine-friendly category name, used as a log/metric label
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Transfer(TransferError::Transient(_)) => "transfer_transient",
            Self::Transfer(TransferError::Permanent(_)) => "transfer_permanent",
            Self::Conflict { .. } => "conflict",
            Self::Reservation { .. } => "reservation",
            Self::Cancelled => "cancelled",
        }
    }

    /// True if this error must abort the current sync pass
    #[must_use]
    pub fn is_fatal_to_pass(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Validation(_) | Self::Reservation { .. } | Self::Cancelled
        )
    }

    /// Wrap any error chain as a storage failure
    pub fn storage(err: impl Display) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<DomainError> for SyncError {
    fn from(err: DomainError) -> Self {
        Self::Validation(err.to_string())
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Ordered list of error causes collected during one operation
///
/// Causes are only ever added through explicit calls ([`push`](Self::push),
/// [`extend`](Self::extend), [`merge`](Self::merge)); there is no implicit
/// conversion from arbitrary errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorList {
    causes: Vec<SyncError>,
}

impl ErrorList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one cause
    pub fn push(&mut self, err: SyncError) {
        self.causes.push(err);
    }

    /// Append several causes, preserving their order
    pub fn extend(&mut self, errs: impl IntoIterator<Item = SyncError>) {
        self.causes.extend(errs);
    }

    /// Move every cause of `other` to the end of this list
    pub fn merge(&mut self, other: ErrorList) {
        self.causes.extend(other.causes);
    }

    /// Record the error of a result, returning its success value if any
    pub fn collect<T>(&mut self, result: Result<T, SyncError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.causes.len()
    }

    #[must_use]
    pub fn causes(&self) -> &[SyncError] {
        &self.causes
    }

    /// True if any cause would abort a pass
    #[must_use]
    pub fn has_fatal(&self) -> bool {
        self.causes.iter().any(SyncError::is_fatal_to_pass)
    }

    /// `Ok(value)` when no cause was recorded, otherwise `Err(self)`
    ///
    /// # Errors
    /// Returns the list itself when it holds at least one cause
    pub fn into_result<T>(self, value: T) -> Result<T, ErrorList> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl Display for ErrorList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.causes.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.causes[0]),
            n => {
                write!(f, "{n} errors: ")?;
                for (i, cause) in self.causes.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{cause}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ErrorList {}

impl IntoIterator for ErrorList {
    type Item = SyncError;
    type IntoIter = std::vec::IntoIter<SyncError>;

    fn into_iter(self) -> Self::IntoIter {
        self.causes.into_iter()
    }
}
