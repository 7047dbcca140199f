//! Domain-specific error types for peerlink.
//!
//! All fallible operations return `Result<T, PeerError>`.
//! Protocol-level failures travel between peers as an [`ErrorCode`];
//! everything else stays local.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The canonical error type for peerlink.
#[derive(Debug, Error)]
pub enum PeerError {
    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The operation is not valid for the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A pairing PIN had the wrong shape.
    #[error("invalid pin: expected {expected} digits")]
    InvalidPin { expected: usize },

    /// No channel is currently bound.
    #[error("not connected")]
    NotConnected,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The transport was lost while a request was outstanding.
    #[error("request reset: transport lost")]
    Reset,

    /// The task was cancelled before it produced a result.
    #[error("cancelled")]
    Cancelled,

    // ── File Protocol Errors ─────────────────────────────────────
    /// Index or range outside the known bounds.
    #[error("out of range")]
    OutOfRange,

    /// Write-class operation against a read-only mount.
    #[error("read-only file system")]
    ReadOnly,

    /// The path does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// The peer does not understand the requested operation.
    #[error("unknown operation")]
    UnknownOperation,

    /// An unexpected failure on the remote side.
    #[error("internal error")]
    Internal,

    /// The peer reported an error code without a local counterpart.
    #[error("remote error: {0}")]
    Remote(ErrorCode),

    // ── Protocol Errors ──────────────────────────────────────────
    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// A transport frame failed validation.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl PeerError {
    /// The wire code reported to a remote caller for this error.
    ///
    /// Errors without a protocol meaning collapse to
    /// [`ErrorCode::InternalError`] so no local detail leaks.
    pub fn code(&self) -> ErrorCode {
        match self {
            PeerError::InvalidState(_) => ErrorCode::InvalidState,
            PeerError::InvalidPin { .. } => ErrorCode::InvalidPin,
            PeerError::NotConnected => ErrorCode::NotConnected,
            PeerError::Timeout(_) => ErrorCode::Timeout,
            PeerError::Reset => ErrorCode::Reset,
            PeerError::OutOfRange => ErrorCode::OutOfRange,
            PeerError::ReadOnly => ErrorCode::ReadOnly,
            PeerError::NotFound => ErrorCode::NotFound,
            PeerError::UnknownOperation => ErrorCode::UnknownOperation,
            PeerError::Remote(code) => *code,
            _ => ErrorCode::InternalError,
        }
    }

    /// Returns `true` for the variants that belong to the shared
    /// protocol taxonomy (as opposed to local plumbing failures).
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self.code(), ErrorCode::InternalError) || matches!(self, PeerError::Internal)
    }
}

// ── ErrorCode ─────────────────────────────────────────────────────

/// Error tags exchanged on the wire in `{rid, error}` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidState,
    InvalidPin,
    NotConnected,
    Timeout,
    Reset,
    OutOfRange,
    ReadOnly,
    #[serde(rename = "noent")]
    NotFound,
    NotDirectory,
    IsDirectory,
    Exists,
    UnknownOperation,
    InternalError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::InvalidState,
        ErrorCode::InvalidPin,
        ErrorCode::NotConnected,
        ErrorCode::Timeout,
        ErrorCode::Reset,
        ErrorCode::OutOfRange,
        ErrorCode::ReadOnly,
        ErrorCode::NotFound,
        ErrorCode::NotDirectory,
        ErrorCode::IsDirectory,
        ErrorCode::Exists,
        ErrorCode::UnknownOperation,
        ErrorCode::InternalError,
    ];

    /// Parse a wire code leniently; codes this build does not know
    /// collapse to `InternalError`.
    pub fn from_wire(code: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == code)
            .unwrap_or(ErrorCode::InternalError)
    }

    /// The wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::InvalidPin => "invalid_pin",
            ErrorCode::NotConnected => "not_connected",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Reset => "reset",
            ErrorCode::OutOfRange => "out_of_range",
            ErrorCode::ReadOnly => "read_only",
            ErrorCode::NotFound => "noent",
            ErrorCode::NotDirectory => "not_directory",
            ErrorCode::IsDirectory => "is_directory",
            ErrorCode::Exists => "exists",
            ErrorCode::UnknownOperation => "unknown_operation",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorCode> for PeerError {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotConnected => PeerError::NotConnected,
            ErrorCode::Reset => PeerError::Reset,
            ErrorCode::OutOfRange => PeerError::OutOfRange,
            ErrorCode::ReadOnly => PeerError::ReadOnly,
            ErrorCode::NotFound => PeerError::NotFound,
            ErrorCode::UnknownOperation => PeerError::UnknownOperation,
            ErrorCode::InternalError => PeerError::Internal,
            other => PeerError::Remote(other),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for PeerError {
    fn from(s: String) -> Self {
        PeerError::Other(s)
    }
}

impl From<&str> for PeerError {
    fn from(s: &str) -> Self {
        PeerError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PeerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PeerError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for PeerError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        PeerError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(e: serde_json::Error) -> Self {
        PeerError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = PeerError::InvalidPin { expected: 6 };
        assert!(e.to_string().contains('6'));

        let e = PeerError::FrameTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_string() {
        let e: PeerError = "something broke".into();
        assert!(matches!(e, PeerError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: PeerError = io_err.into();
        assert!(matches!(e, PeerError::Connection(_)));
    }

    #[test]
    fn plumbing_errors_do_not_leak_detail() {
        let e = PeerError::Other("disk exploded at /secret/path".into());
        assert_eq!(e.code(), ErrorCode::InternalError);
        assert!(!e.is_protocol_error());
        assert!(PeerError::Internal.is_protocol_error());
        assert!(PeerError::ReadOnly.is_protocol_error());
    }

    #[test]
    fn wire_codes_use_protocol_spelling() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotFound).unwrap(),
            "\"noent\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::UnknownOperation).unwrap(),
            "\"unknown_operation\""
        );
        let parsed: ErrorCode = serde_json::from_str("\"read_only\"").unwrap();
        assert_eq!(parsed, ErrorCode::ReadOnly);
        assert_eq!(ErrorCode::ReadOnly.to_string(), "read_only");
    }

    #[test]
    fn unknown_wire_code_is_internal() {
        assert_eq!(ErrorCode::from_wire("noent"), ErrorCode::NotFound);
        assert_eq!(ErrorCode::from_wire("quota_exceeded"), ErrorCode::InternalError);
    }

    #[test]
    fn codes_map_back_to_local_errors() {
        assert!(matches!(PeerError::from(ErrorCode::Reset), PeerError::Reset));
        assert!(matches!(
            PeerError::from(ErrorCode::NotFound),
            PeerError::NotFound
        ));
        assert!(matches!(
            PeerError::from(ErrorCode::IsDirectory),
            PeerError::Remote(ErrorCode::IsDirectory)
        ));
    }
}
