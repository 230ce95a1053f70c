//! Core error types for sluice.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Referenced repo, branch, commit, job or pipeline is absent
    NotFound {
        /// Kind of object
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Object already exists
    AlreadyExists {
        /// Kind of object
        kind: String,
        /// Identifier that collided
        id: String,
    },

    /// Commit was finished before
    AlreadyFinished {
        /// Commit identifier
        commit: String,
    },

    /// A compare-and-swap lost against a concurrent writer
    Conflict {
        /// Key that changed underneath us
        key: String,
    },

    /// User transform failed on a datum
    DatumFailure {
        /// Datum identifier
        datum: String,
        /// Failure reason
        reason: String,
    },

    /// Job failed as a whole
    JobFailure {
        /// Job identifier
        job: String,
        /// Failure reason
        reason: String,
    },

    /// Coordinator or store backend unreachable
    Unavailable {
        /// Service that could not be reached
        service: String,
        /// Underlying reason
        reason: String,
    },

    /// Explicitly cancelled
    Cancelled,

    /// Caller does not hold the lease for a resource
    NotLeader {
        /// Leased resource
        resource: String,
    },

    /// Validation error
    Validation {
        /// Offending field
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Invalid encoding
    InvalidEncoding,

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`]
    #[must_use]
    pub fn not_found(kind: &str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for [`CoreError::AlreadyExists`]
    #[must_use]
    pub fn already_exists(kind: &str, id: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for [`CoreError::Validation`]
    #[must_use]
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CoreError::Unavailable`]
    #[must_use]
    pub fn unavailable(service: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CoreError::Internal`]
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation with fresh state may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Conflict { .. } | Self::Timeout { .. }
        )
    }

    /// Whether this is a [`CoreError::NotFound`]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is a [`CoreError::AlreadyExists`]
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether this is a [`CoreError::AlreadyFinished`]
    #[must_use]
    pub fn is_already_finished(&self) -> bool {
        matches!(self, Self::AlreadyFinished { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
            Self::AlreadyFinished { commit } => write!(f, "Commit {} already finished", commit),
            Self::Conflict { key } => write!(f, "Concurrent modification of {}", key),
            Self::DatumFailure { datum, reason } => {
                write!(f, "Datum {} failed: {}", datum, reason)
            }
            Self::JobFailure { job, reason } => write!(f, "Job {} failed: {}", job, reason),
            Self::Unavailable { service, reason } => {
                write!(f, "{} unavailable: {}", service, reason)
            }
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::NotLeader { resource } => write!(f, "Not the leader for {}", resource),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(_err: serde_json::Error) -> Self {
        Self::InvalidEncoding
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("io: {}", err),
        }
    }
}
