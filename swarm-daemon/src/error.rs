//! Error taxonomy for transfer coordination
//!
//! Every failure that reaches a transfer's coordinator is a [`TransferError`].
//! Its [`ErrorCategory`] decides how the failure is reported and whether the
//! transfer's resume data survives it.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::constants::*;
use crate::shared::file_pool::FilePoolError;
use crate::shared::listener::ListenerError;

/// Failure raised inside a transfer or by one of its collaborators
#[derive(Debug, Error)]
pub enum TransferError {
    /// Shutdown requested by something outside the transfer
    #[error("{0}")]
    Shutdown(String),

    /// Fatal problem specific to this transfer, shown to the user verbatim
    #[error("{0}")]
    User(String),

    /// Disk or operating-system failure
    #[error("{context}: {source}")]
    Disk {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Anything else: a defect in the coordinator or a collaborator
    #[error("internal error: {message}")]
    Internal { message: String, trace: String },
}

/// How a [`TransferError`] is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Logged at error level; resume data is kept
    External,
    /// Logged at critical level with the message as-is
    Fatal,
    /// Logged at critical level with the OS message
    Disk,
    /// Routed through the exception callback with full diagnostics
    Internal,
}

/// Classify an error without side effects
pub fn classify(err: &TransferError) -> ErrorCategory {
    match err {
        TransferError::Shutdown(_) => ErrorCategory::External,
        TransferError::User(_) => ErrorCategory::Fatal,
        TransferError::Disk { .. } => ErrorCategory::Disk,
        TransferError::Internal { .. } => ErrorCategory::Internal,
    }
}

impl TransferError {
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown(message.into())
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn disk(context: impl Into<String>, source: io::Error) -> Self {
        Self::Disk {
            context: context.into(),
            source,
        }
    }

    /// Internal error, capturing a backtrace when `RUST_BACKTRACE` enables one
    pub fn internal(message: impl Into<String>) -> Self {
        let backtrace = Backtrace::capture();
        let trace = match backtrace.status() {
            BacktraceStatus::Captured => backtrace.to_string(),
            _ => String::new(),
        };
        Self::Internal {
            message: message.into(),
            trace,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        classify(self)
    }

    /// Message logged for this error
    ///
    /// Disk errors name the out-of-space condition explicitly. Internal errors
    /// include any captured backtrace.
    pub fn report_text(&self) -> String {
        match self {
            Self::Disk { source, .. } if source.kind() == io::ErrorKind::StorageFull => {
                format!("{ERR_DISK_FULL} ({self})")
            }
            Self::Disk { .. } => format!("{ERR_DISK_PREFIX}{self}"),
            Self::Internal { message, trace } if !trace.is_empty() => {
                format!("{message}\n{trace}")
            }
            Self::Internal { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    /// Activity line shown once a transfer dies from this error
    pub fn activity_text(&self) -> String {
        match self {
            Self::Shutdown(_) => MSG_ACTIVITY_SHUT_DOWN.to_string(),
            Self::User(message) => format!("{MSG_ACTIVITY_FAILED}{message}"),
            Self::Disk { source, .. } => format!("{MSG_ACTIVITY_DISK_ERROR}{source}"),
            Self::Internal { message, .. } => format!("{MSG_ACTIVITY_INTERNAL_ERROR}{message}"),
        }
    }
}

impl From<FilePoolError> for TransferError {
    fn from(err: FilePoolError) -> Self {
        Self::User(err.to_string())
    }
}

impl From<ListenerError> for TransferError {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Bind { source, .. } => Self::disk(ERR_LISTENER, source),
            other => Self::User(other.to_string()),
        }
    }
}

impl From<ConfigError> for TransferError {
    fn from(err: ConfigError) -> Self {
        Self::User(err.to_string())
    }
}

/// Failure constructing or reconfiguring the transfer manager
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Listen(#[from] ListenerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
