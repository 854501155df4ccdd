//! Error classification shared by call results, error events, and the error latch.
//!
//! Two types live here:
//!
//! - [`ErrorCode`] is the flat classification.  It travels inside error
//!   events, inside failed command completions, and in the process-wide
//!   "first error" latch.
//! - [`NclError`] is the typed error every fallible library call returns.
//!   Each variant carries context and maps onto exactly one [`ErrorCode`]
//!   through [`NclError::code`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::device::NymiHandle;

/// Flat error classification.
///
/// `None` means "no error" and is what the latch holds until something fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    #[default]
    None = 0x00,
    /// The library has not been initialized.
    NotInitialized = 0x01,
    /// The library failed irrecoverably.
    NclFailed = 0x02,
    /// The transport backend (the local radio daemon) could not be reached.
    TransportUnavailable = 0x03,
    /// The transport link to the radio failed.
    TransportLinkFailed = 0x04,
    /// The handle does not name a tracked band.
    InvalidHandle = 0x05,
    /// A reply was malformed or did not belong to the command in flight.
    Mismatch = 0x06,
    /// The band (or the library) is in the wrong state for the request.
    WrongState = 0x07,
    /// The band's command channel (or the scanner) is busy.
    Busy = 0x08,
    /// An argument was rejected.
    BadValue = 0x09,
    /// The partner key could not be used.
    BadPartnerKey = 0x0A,
    OutOfMemory = 0x0B,
    /// The band refused the command because its battery is low.
    LowBattery = 0x0C,
    /// The band reported an internal failure.
    NymiFailed = 0x0D,
}

impl ErrorCode {
    /// Returns `true` for every code except [`ErrorCode::None`].
    pub const fn is_error(self) -> bool {
        !matches!(self, ErrorCode::None)
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(ErrorCode::None),
            0x01 => Ok(ErrorCode::NotInitialized),
            0x02 => Ok(ErrorCode::NclFailed),
            0x03 => Ok(ErrorCode::TransportUnavailable),
            0x04 => Ok(ErrorCode::TransportLinkFailed),
            0x05 => Ok(ErrorCode::InvalidHandle),
            0x06 => Ok(ErrorCode::Mismatch),
            0x07 => Ok(ErrorCode::WrongState),
            0x08 => Ok(ErrorCode::Busy),
            0x09 => Ok(ErrorCode::BadValue),
            0x0A => Ok(ErrorCode::BadPartnerKey),
            0x0B => Ok(ErrorCode::OutOfMemory),
            0x0C => Ok(ErrorCode::LowBattery),
            0x0D => Ok(ErrorCode::NymiFailed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::None => "no error",
            ErrorCode::NotInitialized => "not initialized",
            ErrorCode::NclFailed => "library failure",
            ErrorCode::TransportUnavailable => "transport unavailable",
            ErrorCode::TransportLinkFailed => "transport link failed",
            ErrorCode::InvalidHandle => "invalid handle",
            ErrorCode::Mismatch => "mismatch",
            ErrorCode::WrongState => "wrong state",
            ErrorCode::Busy => "busy",
            ErrorCode::BadValue => "bad value",
            ErrorCode::BadPartnerKey => "bad partner key",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::LowBattery => "low battery",
            ErrorCode::NymiFailed => "band failure",
        };
        f.write_str(text)
    }
}

/// Typed error returned by every fallible library call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NclError {
    #[error("the library is not initialized")]
    NotInitialized,

    /// `init` was called on a session that is already running.
    #[error("the library is already initialized")]
    AlreadyInitialized,

    #[error("library failure: {0}")]
    NclFailed(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("transport link failed: {0}")]
    TransportLinkFailed(String),

    #[error("{0} is not a tracked band")]
    InvalidHandle(NymiHandle),

    #[error("mismatch: {0}")]
    Mismatch(String),

    /// The request is not allowed right now.
    #[error("{operation} not allowed: {detail}")]
    WrongState {
        operation: &'static str,
        detail: String,
    },

    #[error("busy: {0}")]
    Busy(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("the partner key was rejected")]
    BadPartnerKey,

    #[error("out of memory")]
    OutOfMemory,

    #[error("the band battery is low")]
    LowBattery,

    #[error("the band reported a failure")]
    NymiFailed,
}

impl NclError {
    /// Shorthand for [`NclError::WrongState`].
    pub fn wrong_state(operation: &'static str, detail: impl Into<String>) -> Self {
        NclError::WrongState {
            operation,
            detail: detail.into(),
        }
    }

    /// Classifies this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            NclError::NotInitialized => ErrorCode::NotInitialized,
            NclError::AlreadyInitialized => ErrorCode::WrongState,
            NclError::NclFailed(_) => ErrorCode::NclFailed,
            NclError::TransportUnavailable(_) => ErrorCode::TransportUnavailable,
            NclError::TransportLinkFailed(_) => ErrorCode::TransportLinkFailed,
            NclError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            NclError::Mismatch(_) => ErrorCode::Mismatch,
            NclError::WrongState { .. } => ErrorCode::WrongState,
            NclError::Busy(_) => ErrorCode::Busy,
            NclError::BadValue(_) => ErrorCode::BadValue,
            NclError::BadPartnerKey => ErrorCode::BadPartnerKey,
            NclError::OutOfMemory => ErrorCode::OutOfMemory,
            NclError::LowBattery => ErrorCode::LowBattery,
            NclError::NymiFailed => ErrorCode::NymiFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_values_are_stable() {
        for raw in 0x00..=0x0D_u8 {
            let code = ErrorCode::try_from(raw).expect("every value in range is defined");
            assert_eq!(code as u8, raw);
        }
        assert!(ErrorCode::try_from(0x0E).is_err());
    }

    #[test]
    fn test_none_is_not_an_error() {
        assert!(!ErrorCode::None.is_error());
        assert!(ErrorCode::Busy.is_error());
    }

    #[test]
    fn test_already_initialized_classifies_as_wrong_state() {
        assert_eq!(NclError::AlreadyInitialized.code(), ErrorCode::WrongState);
    }

    #[test]
    fn test_wrong_state_message_names_operation() {
        // Arrange
        let err = NclError::wrong_state("provision", "nymi#2 is Discovered");

        // Act
        let text = err.to_string();

        // Assert
        assert_eq!(text, "provision not allowed: nymi#2 is Discovered");
        assert_eq!(err.code(), ErrorCode::WrongState);
    }
}
