use crate::lxp::inverter::Serial;

use std::time::Duration;
use thiserror::Error;

/// A response frame that could not be trusted. Never fatal to a session; the
/// caller drops the frame and counts it against the retry budget.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid frame prefix {0:02x?}")]
    BadPrefix([u8; 2]),

    #[error("unexpected unit byte {0}")]
    BadUnit(u8),

    #[error("data length field says {declared} bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#06x}, received {received:#06x}")]
    ChecksumMismatch { expected: u16, received: u16 },

    #[error("serial mismatch: expected {expected}, received {received}")]
    SerialMismatch { expected: Serial, received: Serial },

    #[error("unexpected function code {0}")]
    UnexpectedFunctionCode(u8),

    #[error("device exception {code} replying to function {function}")]
    DeviceException { function: u8, code: u8 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("exchange cancelled by shutdown")]
    Cancelled,
}

impl ExchangeError {
    /// Errors after which the socket can no longer be trusted at all.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Cancelled)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("{0} unreachable")]
    Unreachable(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused by {0}")]
    Refused(String),

    #[error("handshake failed: {0}")]
    Handshake(ExchangeError),

    #[error("connect cancelled by shutdown")]
    Cancelled,
}

impl ConnectError {
    pub fn from_io(target: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused => Self::Refused(target.to_owned()),
            _ => Self::Unreachable(format!("{} ({})", target, err)),
        }
    }
}

/// Outcome of a failed read-modify-write. The switch state is unknown
/// afterwards and the next poll is the source of truth.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("inverter unreachable: {0}")]
    Unreachable(ExchangeError),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("could not read current value: {0}")]
    Stale(FrameError),

    #[error("no switch named {0}")]
    UnknownSwitch(String),

    #[error("inverter is read-only")]
    ReadOnly,
}
