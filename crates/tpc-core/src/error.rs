//! Error taxonomy shared by every layer of the engine.
//!
//! Errors are `Clone` because one failure (a shutdown, a dead reactor, a
//! refused connect) is usually delivered to many invocation futures at once.

use std::fmt;
use std::net::SocketAddr;

use nix::errno::Errno;

use crate::frame::FrameError;

/// Error codes carried in the payload of an `ERROR` response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    UnknownOpcode = 1,
    OperationFailed = 2,
    OperationPanicked = 3,
    MalformedRequest = 4,
}

impl ErrorCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::UnknownOpcode),
            2 => Some(Self::OperationFailed),
            3 => Some(Self::OperationPanicked),
            4 => Some(Self::MalformedRequest),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownOpcode => "unknown opcode",
            Self::OperationFailed => "operation failed",
            Self::OperationPanicked => "operation panicked",
            Self::MalformedRequest => "malformed request",
        };
        f.write_str(name)
    }
}

/// A failure produced by an operation on the executing member.
///
/// Travels back to the caller inside the response frame, never as a panic
/// across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TpcError {
    // ── Lifecycle ──
    #[error("Shutting down")]
    ShuttingDown,

    #[error("engine not started")]
    NotStarted,

    #[error("reactor {0} unavailable")]
    ReactorUnavailable(usize),

    // ── Routing ──
    #[error("invalid partition id {0}")]
    InvalidPartition(i32),

    #[error("no owner known for partition {0}")]
    NoOwner(i32),

    // ── Transport ──
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bind failed: {0}")]
    Bind(String),

    // ── Protocol / dispatch ──
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    // ── Driver / setup ──
    #[error("I/O driver failure: {}", Errno::from_raw(*.0))]
    Driver(i32),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TpcError {
    /// Transport error from a negative completion result or raw errno.
    pub fn from_errno(context: &str, errno: i32) -> Self {
        Self::Transport(format!("{context}: {}", Errno::from_raw(errno.abs())))
    }

    /// True for errors raised by the local lifecycle rather than the peer.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::ShuttingDown | Self::NotStarted | Self::ReactorUnavailable(_)
        )
    }
}

impl From<RemoteError> for TpcError {
    fn from(e: RemoteError) -> Self {
        Self::Remote {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<FrameError> for TpcError {
    fn from(e: FrameError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for TpcError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::from_errno("io", errno),
            None => Self::Transport(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::UnknownOpcode,
            ErrorCode::OperationFailed,
            ErrorCode::OperationPanicked,
            ErrorCode::MalformedRequest,
        ] {
            assert_eq!(ErrorCode::from_u8(code as u8), Some(code));
        }
        assert_eq!(ErrorCode::from_u8(0), None);
        assert_eq!(ErrorCode::from_u8(200), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TpcError::ShuttingDown.to_string(), "Shutting down");
        let e: TpcError = RemoteError::new(ErrorCode::UnknownOpcode, "opcode 200").into();
        assert_eq!(e.to_string(), "remote error (unknown opcode): opcode 200");
    }

    #[test]
    fn test_from_errno() {
        let e = TpcError::from_errno("recv", -libc::ECONNRESET);
        match e {
            TpcError::Transport(msg) => assert!(msg.starts_with("recv: ")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(TpcError::ReactorUnavailable(2).is_lifecycle());
        assert!(!TpcError::NoOwner(1).is_lifecycle());
    }
}
