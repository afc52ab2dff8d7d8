// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Error taxonomy surfaced through `ERROR` frames, scoped to the session id it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Session paths unavailable; cast subscription aborts, listener gets one ERROR.
    NotFound { message: String },
    /// Read error during history replay or live tail; tailing continues if possible.
    IoFailure { message: String },
    /// Malformed client frame; connection stays open.
    Protocol { message: String },
    /// Remote handshake failed or timed out; forwarded frames drop until reconnect.
    UpstreamUnavailable { message: String },
    /// Cast file shrank or was removed under an active tail; stop watching.
    Fatal { message: String },
}

impl CoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn io_failure(message: impl Into<String>) -> Self {
        Self::IoFailure { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable { message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal { message: message.into() }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::IoFailure { .. } => "IO_FAILURE",
            Self::Protocol { .. } => "PROTOCOL",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Fatal { .. } => "FATAL",
        }
    }

    /// The human-readable message placed in the `ERROR` frame's JSON payload.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound { message }
            | Self::IoFailure { message }
            | Self::Protocol { message }
            | Self::UpstreamUnavailable { message }
            | Self::Fatal { message } => message,
        }
    }

    /// Whether this error should terminate the owning hub's watch loop entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.as_str(), self.message())
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[yare::parameterized(
        not_found = { CoreError::not_found("x"), "NOT_FOUND", false },
        io_failure = { CoreError::io_failure("x"), "IO_FAILURE", false },
        protocol = { CoreError::protocol("x"), "PROTOCOL", false },
        upstream = { CoreError::upstream_unavailable("x"), "UPSTREAM_UNAVAILABLE", false },
        fatal = { CoreError::fatal("x"), "FATAL", true },
    )]
    fn taxonomy(err: CoreError, code: &str, is_fatal: bool) {
        assert_eq!(err.as_str(), code);
        assert_eq!(err.is_fatal(), is_fatal);
        assert_eq!(err.message(), "x");
    }
}
