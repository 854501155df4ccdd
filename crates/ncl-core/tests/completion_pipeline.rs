//! Integration tests for the completion path through the public API.
//!
//! A transport delivers raw frames; the session decodes the frame, checks it
//! answers the command in flight, and decodes the response payload.  These
//! tests walk that path with the codec, command set, and ticket counter
//! together.

use ncl_core::domain::keys::{LEDS, MESSAGE_SIZE};
use ncl_core::protocol::codec::FRAME_HEADER_SIZE;
use ncl_core::{
    decode_frame, encode_frame, Command, CommandResponse, ErrorCode, Opcode, ProtocolError,
    Provision, ResponseFrame, SignatureScheme, TicketCounter,
};

/// Decodes a frame and, when it succeeded, its response for `expected`.
fn complete(expected: &Command, bytes: &[u8]) -> Result<Result<CommandResponse, ErrorCode>, ProtocolError> {
    let (frame, consumed) = decode_frame(bytes)?;
    assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
    assert_eq!(frame.opcode, expected.opcode(), "frame answers a different command");
    match frame.outcome {
        Ok(payload) => CommandResponse::decode(frame.opcode, &payload).map(Ok),
        Err(code) => Ok(Err(code)),
    }
}

#[test]
fn test_agreement_completion_yields_led_pattern() {
    // Arrange
    let command = Command::Agree;
    let leds = [[true, false, true, false, true]];
    let bytes = encode_frame(&ResponseFrame::success(
        Opcode::Agree,
        CommandResponse::Agreed { leds }.encode_payload(),
    ));

    // Act
    let result = complete(&command, &bytes).expect("well-formed");

    // Assert
    assert_eq!(result, Ok(CommandResponse::Agreed { leds }));
    assert_eq!(bytes.len(), FRAME_HEADER_SIZE + LEDS);
}

#[test]
fn test_rejected_sign_surfaces_band_error_code() {
    // Arrange
    let command = Command::Sign {
        vk_id: [1; 16],
        message: [2; MESSAGE_SIZE],
    };
    let bytes = encode_frame(&ResponseFrame::failure(Opcode::Sign, ErrorCode::BadValue));

    // Act
    let result = complete(&command, &bytes).expect("well-formed");

    // Assert
    assert_eq!(result, Err(ErrorCode::BadValue));
}

#[test]
fn test_short_vk_payload_is_a_protocol_error() {
    // Arrange – a Vk response missing the last byte of the key
    let command = Command::CreateSigKeyPair {
        scheme: SignatureScheme::NistP256,
    };
    let bytes = encode_frame(&ResponseFrame::success(Opcode::CreateSigKeyPair, vec![0; 16 + 63]));

    // Act
    let result = complete(&command, &bytes);

    // Assert
    assert!(matches!(result, Err(ProtocolError::InsufficientData { .. })));
}

#[test]
fn test_validate_request_carries_stored_provision() {
    // Arrange
    let provision = Provision {
        key: [0x0F; 16],
        id: [0xF0; 16],
        strong: true,
    };
    let command = Command::Validate {
        provision: provision.clone(),
    };

    // Act
    let payload = command.encode_payload();
    let decoded = Command::decode(command.opcode(), &payload).expect("decode");

    // Assert – the strong flag is local policy and does not travel
    assert_eq!(payload.len(), 32);
    match decoded {
        Command::Validate { provision: sent } => {
            assert_eq!(sent.key, provision.key);
            assert_eq!(sent.id, provision.id);
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn test_tickets_distinguish_consecutive_claims() {
    // Arrange
    let tickets = TicketCounter::new();

    // Act
    let first = tickets.next();
    let second = tickets.next();

    // Assert
    assert_ne!(first, second);
    assert!(second > first);
}
