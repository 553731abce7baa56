//! Error types

use thiserror::Error;

/// Result type alias with the crate error
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by the driver.
///
/// Any `Transport`, `StatusWord`, `MacMismatch`, or `ProtocolDesync` error
/// on a secured command tears down the active session: the host and card
/// command counters can no longer be assumed to agree, so the only way
/// forward is a fresh `AuthenticateEV2First`. `InvalidArgument` errors are
/// raised before any APDU is sent and leave the session intact.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying ISO-DEP transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// The tag answered with a status word other than `9100` (or `91AF`
    /// where an additional frame is expected)
    #[error("command {command:02X?} failed with status word {sw:04X}")]
    StatusWord {
        /// `CLA INS` of the command that failed
        command: [u8; 2],
        /// The offending status word
        sw: u16,
    },

    /// The response MAC did not verify against the session keys
    #[error("response MAC mismatch")]
    MacMismatch,

    /// A secured command was attempted without an authenticated session
    #[error("not authenticated")]
    NotAuthenticated,

    /// A parameter was rejected before any APDU was sent
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session state can no longer be trusted: command counter
    /// overflow, or a response that violates the expected wire format
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),
}

impl Error {
    /// Whether this error mandates tearing down the session
    pub(crate) fn is_fatal_to_session(&self) -> bool {
        !matches!(self, Error::InvalidArgument(_) | Error::NotAuthenticated)
    }
}

/// Create an `InvalidArgument` error with a formatted message
macro_rules! invalid_arg {
    ($msg:expr) => {
        crate::error::Error::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)+) => {
        crate::error::Error::InvalidArgument(format!($fmt, $($arg)+))
    };
}

/// Create a `ProtocolDesync` error with a formatted message
macro_rules! desync {
    ($msg:expr) => {
        crate::error::Error::ProtocolDesync($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)+) => {
        crate::error::Error::ProtocolDesync(format!($fmt, $($arg)+))
    };
}

pub(crate) use {desync, invalid_arg};
