//! Binary codec for command completion frames.
//!
//! A transport hands the library one frame per completed command.  The frame
//! says which opcode it answers and whether the band accepted the command;
//! on success it carries the response payload.
//!
//! Wire format:
//! ```text
//! [version:1][opcode:1][status:1][reserved:1][payload_len:4][payload:N]
//! ```
//! Total header size: 8 bytes. All multi-byte integers are big-endian.
//! `status` is `0x00` for success, otherwise the wire value of an
//! [`ErrorCode`]; failed frames carry no payload.

use thiserror::Error;

use crate::error::ErrorCode;
use crate::protocol::command::Opcode;

/// Current frame version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Errors that can occur while encoding or decoding frames and payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the layout requires.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("unknown completion status: 0x{0:02X}")]
    UnknownStatus(u8),

    /// A field value is out of range.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The header declares more payload than the frame holds.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The payload is longer than the fixed layout of its opcode.
    #[error("trailing bytes: layout ends at {expected}, payload is {actual} bytes")]
    TrailingBytes { expected: usize, actual: usize },
}

/// One decoded completion frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub opcode: Opcode,
    /// Response payload on success, the band's error code on failure.
    pub outcome: Result<Vec<u8>, ErrorCode>,
}

impl ResponseFrame {
    pub fn success(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            outcome: Ok(payload),
        }
    }

    pub fn failure(opcode: Opcode, code: ErrorCode) -> Self {
        Self {
            opcode,
            outcome: Err(code),
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`ResponseFrame`] including its 8-byte header.
///
/// # Examples
///
/// ```rust
/// use ncl_core::protocol::{decode_frame, encode_frame, Opcode, ResponseFrame};
///
/// let frame = ResponseFrame::success(Opcode::Prg, vec![7; 16]);
/// let bytes = encode_frame(&frame);
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &ResponseFrame) -> Vec<u8> {
    let empty: &[u8] = &[];
    let (status, payload) = match &frame.outcome {
        Ok(payload) => (0x00, payload.as_slice()),
        // A failure with `ErrorCode::None` would read back as success.
        Err(ErrorCode::None) => (ErrorCode::NymiFailed as u8, empty),
        Err(code) => (*code as u8, empty),
    };

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(frame.opcode as u8);
    buf.push(status);
    buf.push(0x00); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed so a stream reader can
/// advance its cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the header is malformed, the status is not a
/// known error code, or a failed frame carries a payload.
pub fn decode_frame(bytes: &[u8]) -> Result<(ResponseFrame, usize), ProtocolError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let opcode_byte = bytes[1];
    let opcode = Opcode::try_from(opcode_byte).map_err(|_| ProtocolError::UnknownOpcode(opcode_byte))?;

    let status_byte = bytes[2];
    let status = ErrorCode::try_from(status_byte).map_err(|_| ProtocolError::UnknownStatus(status_byte))?;

    // bytes[3] is reserved – ignored on decode

    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let total = FRAME_HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: payload_len,
            available: bytes.len() - FRAME_HEADER_SIZE,
        });
    }
    let payload = &bytes[FRAME_HEADER_SIZE..total];

    let outcome = if status.is_error() {
        if !payload.is_empty() {
            return Err(ProtocolError::MalformedPayload(format!(
                "failed {opcode:?} frame carries {payload_len} payload bytes"
            )));
        }
        Err(status)
    } else {
        Ok(payload.to_vec())
    };

    Ok((ResponseFrame { opcode, outcome }, total))
}
