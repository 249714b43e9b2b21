use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
/// Errors returned by the public entry points.
pub enum MgaError {
    /// The data is not a UBX stream, or its framing is corrupt.
    #[error("Data is not a valid UBX stream")]
    BadData,
    /// The data contained no messages that can be sent to the receiver.
    #[error("No assistance messages in data")]
    NoDataToSend,
    /// A time adjustment was requested but the data does not start with an INI time message.
    #[error("First message is not UBX-MGA-INI-TIME")]
    NoIniTime,
    /// An owned buffer could not be allocated.
    #[error("Out of memory")]
    OutOfMemory,
    /// A transfer is already in progress.
    #[error("Session is already running")]
    AlreadyRunning,
    /// No session is active.
    #[error("Session is already idle")]
    AlreadyIdle,
    /// The session has not been configured.
    #[error("Session is not configured")]
    NotConfigured,
    /// An argument is out of range or not supported for this message format.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The output buffer cannot hold the result and its terminator.
    #[error("Buffer too small, {needed} bytes needed")]
    BufferTooSmall {
        /// Bytes needed, including the terminator
        needed: usize,
    },
    /// A previous holder of the session lock panicked.
    #[error("Session lock poisoned")]
    LockPoisoned,
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, MgaError>;

impl From<std::collections::TryReserveError> for MgaError {
    fn from(_: std::collections::TryReserveError) -> Self {
        MgaError::OutOfMemory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Why a single message could not be transferred.
///
/// The first variants mirror the info codes of a negative UBX-MGA-ACK.
pub enum FailureReason {
    /// No reason given by the receiver
    NotSet,
    /// The receiver has no time and cannot use the message
    NoTime,
    /// The message version is not supported
    VersionNotSupported,
    /// Message size does not match its version
    SizeVersionMismatch,
    /// The receiver could not store the message
    CouldNotStore,
    /// The receiver is not ready
    ReceiverNotReady,
    /// Unknown message type
    MessageUnknown,
    /// A generic UBX-ACK-NAK was received for the message
    Rejected,
    /// No acknowledgement after the configured number of retries
    TooManyRetries,
}

impl FailureReason {
    /// Map the `infoCode` of a UBX-MGA-ACK to a failure reason.
    pub fn from_info_code(code: u8) -> Self {
        match code {
            1 => Self::NoTime,
            2 => Self::VersionNotSupported,
            3 => Self::SizeVersionMismatch,
            4 => Self::CouldNotStore,
            5 => Self::ReceiverNotReady,
            6 => Self::MessageUnknown,
            _ => Self::NotSet,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Why a transfer was terminated early.
pub enum TerminateReason {
    /// The host stopped the session
    HostCancel,
    /// The receiver refused to continue
    ReceiverNak,
    /// The receiver stopped answering
    ReceiverNotResponding,
    /// The receiver answered with something the protocol does not allow
    ProtocolError,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Failures of the host's HTTP layer, reported through progress events only.
pub enum ServiceErrorKind {
    /// The assistance server could not be reached
    CannotConnect,
    /// The server was reached but returned no usable data
    CannotGetData,
}
