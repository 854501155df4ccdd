//! Privileged commands and their responses.
//!
//! A [`Command`] is what the library asks a band to do; it travels to the
//! transport as an [`Opcode`] plus a fixed-layout payload.  A
//! [`CommandResponse`] is the successful answer, decoded against the opcode of
//! the command that is in flight.
//!
//! Payload layouts (all fields fixed width unless noted):
//!
//! ```text
//! Agree                    (empty)
//! Validate                 [key:16][id:16]
//! Provision                [strong:1][name_len:1][name:name_len]
//! Notify                   [good:1]
//! StartEcg / StopEcg       (empty)
//! CreateSigKeyPair         [scheme:1]
//! Sign                     [vk_id:16][message:16]
//! CreateGlobalSigKeyPair   [partner_public_key:64][vendor_signature:64]
//! GlobalSign               [adv_sig:64][partner_public_key:64][message:16]
//! CreateSk / Prg / Firmware (empty)
//! GetSk                    [sk_id:16]
//! ```

use crate::domain::keys::{
    FirmwareVersion, LedPatterns, Message, PartnerPublicKey, Prg, ProvisionId, ProvisionKey,
    SignatureScheme, Sig, Sk, SkId, Vk, VkId, AGREEMENT_PATTERNS, LEDS,
};
use crate::domain::provision::Provision;
use crate::protocol::codec::ProtocolError;

/// Longest application name a band accepts during provisioning.
pub const MAX_NEA_NAME_LEN: usize = 18;

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// Wire identifier of a privileged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Negotiation (0x01–0x0F)
    Agree = 0x01,
    Validate = 0x02,
    Provision = 0x03,
    // Band feedback and streaming (0x10–0x1F)
    Notify = 0x10,
    StartEcg = 0x11,
    StopEcg = 0x12,
    // Keys and randomness (0x20–0x2F)
    CreateSigKeyPair = 0x20,
    Sign = 0x21,
    CreateGlobalSigKeyPair = 0x22,
    GlobalSign = 0x23,
    CreateSk = 0x24,
    GetSk = 0x25,
    Prg = 0x26,
    // Diagnostics (0x30–0x3F)
    FirmwareVersion = 0x30,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(Opcode::Agree),
            0x02 => Ok(Opcode::Validate),
            0x03 => Ok(Opcode::Provision),
            0x10 => Ok(Opcode::Notify),
            0x11 => Ok(Opcode::StartEcg),
            0x12 => Ok(Opcode::StopEcg),
            0x20 => Ok(Opcode::CreateSigKeyPair),
            0x21 => Ok(Opcode::Sign),
            0x22 => Ok(Opcode::CreateGlobalSigKeyPair),
            0x23 => Ok(Opcode::GlobalSign),
            0x24 => Ok(Opcode::CreateSk),
            0x25 => Ok(Opcode::GetSk),
            0x26 => Ok(Opcode::Prg),
            0x30 => Ok(Opcode::FirmwareVersion),
            _ => Err(()),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// A request for a band, held in the band's command slot until it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Agree,
    /// Re-authenticates a found band with the provision it advertised.
    Validate { provision: Provision },
    Provision { strong: bool, nea_name: String },
    Notify { good: bool },
    StartEcgStream,
    StopEcgStream,
    CreateSigKeyPair { scheme: SignatureScheme },
    Sign { vk_id: VkId, message: Message },
    CreateGlobalSigKeyPair {
        partner_public_key: PartnerPublicKey,
        vendor_signature: Sig,
    },
    GlobalSign {
        adv_sig: Sig,
        partner_public_key: PartnerPublicKey,
        message: Message,
    },
    CreateSk,
    GetSk { id: SkId },
    Prg,
    FirmwareVersion,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Agree => Opcode::Agree,
            Command::Validate { .. } => Opcode::Validate,
            Command::Provision { .. } => Opcode::Provision,
            Command::Notify { .. } => Opcode::Notify,
            Command::StartEcgStream => Opcode::StartEcg,
            Command::StopEcgStream => Opcode::StopEcg,
            Command::CreateSigKeyPair { .. } => Opcode::CreateSigKeyPair,
            Command::Sign { .. } => Opcode::Sign,
            Command::CreateGlobalSigKeyPair { .. } => Opcode::CreateGlobalSigKeyPair,
            Command::GlobalSign { .. } => Opcode::GlobalSign,
            Command::CreateSk => Opcode::CreateSk,
            Command::GetSk { .. } => Opcode::GetSk,
            Command::Prg => Opcode::Prg,
            Command::FirmwareVersion => Opcode::FirmwareVersion,
        }
    }

    /// Operation name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Agree => "agree",
            Command::Validate { .. } => "validate",
            Command::Provision { .. } => "provision",
            Command::Notify { .. } => "notify",
            Command::StartEcgStream => "start_ecg_stream",
            Command::StopEcgStream => "stop_ecg_stream",
            Command::CreateSigKeyPair { .. } => "create_sig_key_pair",
            Command::Sign { .. } => "sign",
            Command::CreateGlobalSigKeyPair { .. } => "create_global_sig_key_pair",
            Command::GlobalSign { .. } => "global_sign",
            Command::CreateSk => "create_sk",
            Command::GetSk { .. } => "get_sk",
            Command::Prg => "prg",
            Command::FirmwareVersion => "firmware_version",
        }
    }

    /// Encodes the payload that accompanies [`Command::opcode`] on the wire.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Command::Agree
            | Command::StartEcgStream
            | Command::StopEcgStream
            | Command::CreateSk
            | Command::Prg
            | Command::FirmwareVersion => {}
            Command::Validate { provision } => {
                buf.extend_from_slice(&provision.key);
                buf.extend_from_slice(&provision.id);
            }
            Command::Provision { strong, nea_name } => {
                buf.push(u8::from(*strong));
                // Names are validated to MAX_NEA_NAME_LEN before a command is built.
                let name = &nea_name.as_bytes()[..nea_name.len().min(u8::MAX as usize)];
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
            }
            Command::Notify { good } => buf.push(u8::from(*good)),
            Command::CreateSigKeyPair { scheme } => buf.push(*scheme as u8),
            Command::Sign { vk_id, message } => {
                buf.extend_from_slice(vk_id);
                buf.extend_from_slice(message);
            }
            Command::CreateGlobalSigKeyPair {
                partner_public_key,
                vendor_signature,
            } => {
                buf.extend_from_slice(partner_public_key);
                buf.extend_from_slice(vendor_signature);
            }
            Command::GlobalSign {
                adv_sig,
                partner_public_key,
                message,
            } => {
                buf.extend_from_slice(adv_sig);
                buf.extend_from_slice(partner_public_key);
                buf.extend_from_slice(message);
            }
            Command::GetSk { id } => buf.extend_from_slice(id),
        }
        buf
    }

    /// Decodes a command from its opcode and payload.
    ///
    /// Used by transports that need to interpret what they forward, such as
    /// the simulated band.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the payload does not have the exact layout
    /// of `opcode`.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload, opcode);
        let command = match opcode {
            Opcode::Agree => Command::Agree,
            Opcode::Validate => {
                let key: ProvisionKey = r.array()?;
                let id: ProvisionId = r.array()?;
                Command::Validate {
                    provision: Provision {
                        key,
                        id,
                        strong: false,
                    },
                }
            }
            Opcode::Provision => {
                let strong = r.flag()?;
                let len = usize::from(r.byte()?);
                let raw = r.bytes(len)?;
                let nea_name = String::from_utf8(raw.to_vec())
                    .map_err(|e| ProtocolError::MalformedPayload(format!("provision name: {e}")))?;
                Command::Provision { strong, nea_name }
            }
            Opcode::Notify => Command::Notify { good: r.flag()? },
            Opcode::StartEcg => Command::StartEcgStream,
            Opcode::StopEcg => Command::StopEcgStream,
            Opcode::CreateSigKeyPair => {
                let raw = r.byte()?;
                let scheme = SignatureScheme::try_from(raw).map_err(|_| {
                    ProtocolError::MalformedPayload(format!("unknown signature scheme: {raw}"))
                })?;
                Command::CreateSigKeyPair { scheme }
            }
            Opcode::Sign => Command::Sign {
                vk_id: r.array()?,
                message: r.array()?,
            },
            Opcode::CreateGlobalSigKeyPair => Command::CreateGlobalSigKeyPair {
                partner_public_key: r.array()?,
                vendor_signature: r.array()?,
            },
            Opcode::GlobalSign => Command::GlobalSign {
                adv_sig: r.array()?,
                partner_public_key: r.array()?,
                message: r.array()?,
            },
            Opcode::CreateSk => Command::CreateSk,
            Opcode::GetSk => Command::GetSk { id: r.array()? },
            Opcode::Prg => Command::Prg,
            Opcode::FirmwareVersion => Command::FirmwareVersion,
        };
        r.finish()?;
        Ok(command)
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Successful answer to a [`Command`].
///
/// Response layouts mirror the event payloads:
///
/// ```text
/// Agreed        [leds:AGREEMENT_PATTERNS*LEDS, one 0/1 byte per LED]
/// Provisioned   [key:16][id:16]
/// Vk / GlobalVk [vk_id:16][vk:64]
/// Sig           [sig:64]
/// GlobalSig     [vk_id:16][sig:64]
/// CreatedSk     [sk_id:16][sk:16]
/// GotSk         [sk:16]
/// Prg           [value:16]
/// Firmware      [version:20]
/// others        (empty)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Agreed { leds: LedPatterns },
    Validated,
    Provisioned { key: ProvisionKey, id: ProvisionId },
    Notified,
    EcgStarted,
    EcgStopped,
    Vk { id: VkId, vk: Vk },
    Sig { sig: Sig },
    GlobalVk { id: VkId, vk: Vk },
    GlobalSig { vk_id: VkId, sig: Sig },
    CreatedSk { id: SkId, sk: Sk },
    GotSk { sk: Sk },
    Prg { value: Prg },
    FirmwareVersion { version: FirmwareVersion },
}

impl CommandResponse {
    /// Opcode of the command this response answers.
    pub fn opcode(&self) -> Opcode {
        match self {
            CommandResponse::Agreed { .. } => Opcode::Agree,
            CommandResponse::Validated => Opcode::Validate,
            CommandResponse::Provisioned { .. } => Opcode::Provision,
            CommandResponse::Notified => Opcode::Notify,
            CommandResponse::EcgStarted => Opcode::StartEcg,
            CommandResponse::EcgStopped => Opcode::StopEcg,
            CommandResponse::Vk { .. } => Opcode::CreateSigKeyPair,
            CommandResponse::Sig { .. } => Opcode::Sign,
            CommandResponse::GlobalVk { .. } => Opcode::CreateGlobalSigKeyPair,
            CommandResponse::GlobalSig { .. } => Opcode::GlobalSign,
            CommandResponse::CreatedSk { .. } => Opcode::CreateSk,
            CommandResponse::GotSk { .. } => Opcode::GetSk,
            CommandResponse::Prg { .. } => Opcode::Prg,
            CommandResponse::FirmwareVersion { .. } => Opcode::FirmwareVersion,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            CommandResponse::Agreed { leds } => {
                for pattern in leds {
                    buf.extend(pattern.iter().map(|lit| u8::from(*lit)));
                }
            }
            CommandResponse::Validated
            | CommandResponse::Notified
            | CommandResponse::EcgStarted
            | CommandResponse::EcgStopped => {}
            CommandResponse::Provisioned { key, id } => {
                buf.extend_from_slice(key);
                buf.extend_from_slice(id);
            }
            CommandResponse::Vk { id, vk } | CommandResponse::GlobalVk { id, vk } => {
                buf.extend_from_slice(id);
                buf.extend_from_slice(vk);
            }
            CommandResponse::Sig { sig } => buf.extend_from_slice(sig),
            CommandResponse::GlobalSig { vk_id, sig } => {
                buf.extend_from_slice(vk_id);
                buf.extend_from_slice(sig);
            }
            CommandResponse::CreatedSk { id, sk } => {
                buf.extend_from_slice(id);
                buf.extend_from_slice(sk);
            }
            CommandResponse::GotSk { sk } => buf.extend_from_slice(sk),
            CommandResponse::Prg { value } => buf.extend_from_slice(value),
            CommandResponse::FirmwareVersion { version } => buf.extend_from_slice(version),
        }
        buf
    }

    /// Decodes the successful answer to a command with `opcode`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] unless `payload` has exactly the layout of
    /// the response to `opcode`.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload, opcode);
        let response = match opcode {
            Opcode::Agree => {
                let mut leds = [[false; LEDS]; AGREEMENT_PATTERNS];
                for pattern in leds.iter_mut() {
                    for lit in pattern.iter_mut() {
                        *lit = r.flag()?;
                    }
                }
                CommandResponse::Agreed { leds }
            }
            Opcode::Validate => CommandResponse::Validated,
            Opcode::Provision => CommandResponse::Provisioned {
                key: r.array()?,
                id: r.array()?,
            },
            Opcode::Notify => CommandResponse::Notified,
            Opcode::StartEcg => CommandResponse::EcgStarted,
            Opcode::StopEcg => CommandResponse::EcgStopped,
            Opcode::CreateSigKeyPair => CommandResponse::Vk {
                id: r.array()?,
                vk: r.array()?,
            },
            Opcode::Sign => CommandResponse::Sig { sig: r.array()? },
            Opcode::CreateGlobalSigKeyPair => CommandResponse::GlobalVk {
                id: r.array()?,
                vk: r.array()?,
            },
            Opcode::GlobalSign => CommandResponse::GlobalSig {
                vk_id: r.array()?,
                sig: r.array()?,
            },
            Opcode::CreateSk => CommandResponse::CreatedSk {
                id: r.array()?,
                sk: r.array()?,
            },
            Opcode::GetSk => CommandResponse::GotSk { sk: r.array()? },
            Opcode::Prg => CommandResponse::Prg { value: r.array()? },
            Opcode::FirmwareVersion => CommandResponse::FirmwareVersion {
                version: r.array()?,
            },
        };
        r.finish()?;
        Ok(response)
    }
}

// ── Payload cursor ────────────────────────────────────────────────────────────

/// Forward-only reader over a payload that insists on exact lengths.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
    opcode: Opcode,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8], opcode: Opcode) -> Self {
        Self {
            buf,
            pos: 0,
            opcode,
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + len;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(ProtocolError::InsufficientData {
                needed: end,
                available: self.buf.len(),
            })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.bytes(1)?[0])
    }

    fn flag(&mut self) -> Result<bool, ProtocolError> {
        match self.byte()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(ProtocolError::MalformedPayload(format!(
                "{:?}: expected a 0/1 flag, got 0x{other:02X}",
                self.opcode
            ))),
        }
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes {
                expected: self.pos,
                actual: self.buf.len(),
            })
        }
    }
}
