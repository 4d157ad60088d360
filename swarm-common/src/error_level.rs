//! Severity levels for errors reported to the embedding application

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a reported error
///
/// Levels are ordered: `Info < Warning < Error < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    /// Informational, nothing went wrong
    Info,

    /// Degraded behavior, the transfer keeps running
    Warning,

    /// A failure the user should know about
    Error,

    /// The transfer cannot continue
    Critical,
}

impl ErrorLevel {
    /// Convert to the string representation used in logs and status output
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Parse from string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorLevel> for String {
    fn from(level: ErrorLevel) -> Self {
        level.as_str().to_string()
    }
}
