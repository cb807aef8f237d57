use std::time::Duration;

use thiserror::Error;

use crate::protocol::Characteristic;

/// Link-level failures reported by the connection manager and its transports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("device not found during scan: {target}")]
    DeviceNotFound { target: String },
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("command write failed: {0}")]
    WriteFailed(String),
    #[error("subscribe to {characteristic:?} failed: {reason}")]
    SubscribeFailed {
        characteristic: Characteristic,
        reason: String,
    },
    #[error("link is not connected")]
    NotConnected,
}

/// A notification payload that could not be decoded.
///
/// Always absorbed by the capture session; never crosses the driver boundary.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MalformedNotification {
    #[error("empty notification payload")]
    Empty,
    #[error("notification too short: {len} bytes")]
    TooShort { len: usize },
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
}

/// Terminal failures of one capture attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture timed out after {after:?} without a completion status")]
    Timeout { after: Duration },
    #[error("device reported a capture error")]
    DeviceReportedError,
    #[error("start command write failed: {0}")]
    WriteFailed(String),
    #[error("capture completed but no samples were received")]
    MalformedStream,
    #[error("capture already in progress")]
    Busy,
    #[error("link error: {0}")]
    Link(#[from] ConnectionError),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
