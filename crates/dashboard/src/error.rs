//! Failure taxonomy for backend round trips.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerError {
    /// No response: unreachable, connection reset, or the request timed out.
    Network(String),
    /// The backend answered with a non-success status.
    Server { status: u16, body: String },
    /// The body was not JSON or did not have the expected shape.
    Decode(String),
    /// A response for a command that has since been superseded. Never stored
    /// in `last_error`.
    StaleCommand { seq: u64, latest: u64 },
    /// The tracker's view was unsubscribed; nothing further is applied.
    Detached,
}

impl TrackerError {
    /// Short tag for structured log fields and JSON descriptors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Server { .. } => "server",
            Self::Decode(_) => "decode",
            Self::StaleCommand { .. } => "stale_command",
            Self::Detached => "detached",
        }
    }

    /// Bookkeeping outcomes that are dropped quietly instead of surfaced.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::StaleCommand { .. } | Self::Detached)
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Server { status, body } if body.is_empty() => {
                write!(f, "server error: HTTP {status}")
            }
            Self::Server { status, body } => write!(f, "server error: HTTP {status}: {body}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::StaleCommand { seq, latest } => {
                write!(f, "stale command #{seq} (latest issued #{latest})")
            }
            Self::Detached => write!(f, "plant view detached"),
        }
    }
}

impl std::error::Error for TrackerError {}

impl Serialize for TrackerError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("TrackerError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Self::Server {
                status: status.as_u16(),
                body: String::new(),
            }
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            // timeouts, connect failures, body read failures
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
