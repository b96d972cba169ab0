//! Error types for eventrig.
//!
//! All errors are strongly typed using thiserror and follow the engine's
//! taxonomy: registration failures, execution failures, subtask failures and
//! platform (collaborator) failures. Every error is `Clone` so that the first
//! failure of a test can be kept as the sticky result and reported at
//! `end_test`.

use std::any::Any;

use thiserror::Error;

use crate::platform::PlatformError;

/// Errors returned synchronously from `add_*` calls. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Trigger already registered: {id}")]
    DuplicateTrigger {
        id: String,
    },

    #[error("Action block '{name}' already registered")]
    DuplicateActionBlock {
        name: String,
    },

    #[error("Action block not registered: {id}")]
    UnknownActionBlock {
        id: String,
    },

    #[error("Descriptor '{name}' already registered")]
    DuplicateDescriptor {
        name: String,
    },

    #[error("{what} is not supported: {reason}")]
    Unsupported {
        what: String,
        reason: String,
    },

    #[error("Cannot register a trigger from inside a dispatch on the same thread")]
    ReentrantRegistration,
}

/// Errors raised while an action block runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Action '{action}' failed: {reason}")]
    ActionFailed {
        action: String,
        reason: String,
    },

    #[error("Action '{action}' panicked: {message}")]
    ActionPanicked {
        action: String,
        message: String,
    },

    #[error("Branch target {target} is outside block of length {len}")]
    BranchOutOfRange {
        target: usize,
        len: usize,
    },

    #[error("Mutex not found: {name}")]
    UnknownMutex {
        name: String,
    },

    #[error("Timed out after {duration_ms}ms waiting for mutex '{name}'")]
    MutexTimeout {
        name: String,
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

/// Errors produced by the subtask family.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubtaskError {
    #[error("Subtask {subtask} failed: {source}")]
    Fatal {
        subtask: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Failed to spawn subtask {subtask}: {reason}")]
    Spawn {
        subtask: String,
        reason: String,
    },

    #[error("Subtask {subtask} panicked")]
    Panicked {
        subtask: String,
    },
}

/// Top-level error type for eventrig.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Subtask error: {0}")]
    Subtask(#[from] SubtaskError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl EngineError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an action failure, the usual error of a concrete action payload.
    #[must_use]
    pub fn action_failed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::ActionFailed {
            action: action.into(),
            reason: reason.into(),
        })
    }

    /// Creates an unsupported-capability registration error.
    #[must_use]
    pub fn unsupported(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Registration(RegistrationError::Unsupported {
            what: what.into(),
            reason: reason.into(),
        })
    }

    /// Returns true if this is a registration error.
    #[must_use]
    pub const fn is_registration(&self) -> bool {
        matches!(self, Self::Registration(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a subtask error.
    #[must_use]
    pub const fn is_subtask(&self) -> bool {
        matches!(self, Self::Subtask(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Strips `SubtaskError::Fatal` wrappers and returns the underlying cause.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Subtask(SubtaskError::Fatal { source, .. }) => source.root_cause(),
            other => other,
        }
    }
}

pub(crate) fn lock_err(context: &'static str) -> EngineError {
    EngineError::internal(format!("poisoned lock: {context}"))
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result type alias for eventrig operations.
pub type EngineResult<T> = Result<T, EngineError>;
