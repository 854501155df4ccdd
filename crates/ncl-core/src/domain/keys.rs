//! Sizes of the key material exchanged with a band, plus the signature schemes.
//!
//! Every size is fixed by the band firmware.  Buffers are plain byte arrays so
//! a wrong-length value cannot be constructed in the first place.

use serde::{Deserialize, Serialize};

/// Number of LEDs on a band.
pub const LEDS: usize = 5;
/// Number of LED patterns offered during agreement.
pub const AGREEMENT_PATTERNS: usize = 1;
/// Number of ECG samples carried by one ECG event.
pub const ECG_SAMPLES_PER_EVENT: usize = 5;

pub const PROVISION_ID_SIZE: usize = 16;
pub const PROVISION_KEY_SIZE: usize = 16;
pub const PARTNER_PUBLIC_KEY_SIZE: usize = 64;
pub const PARTNER_PRIVATE_KEY_SIZE: usize = 32;
pub const VK_ID_SIZE: usize = 16;
pub const VK_SIZE: usize = 64;
pub const MESSAGE_SIZE: usize = 16;
pub const SIG_SIZE: usize = 64;
pub const ADV_SIZE: usize = 16;
pub const SK_ID_SIZE: usize = 16;
pub const SK_SIZE: usize = 16;
pub const PRG_SIZE: usize = 16;
pub const FIRMWARE_VERSION_SIZE: usize = 20;

pub type ProvisionId = [u8; PROVISION_ID_SIZE];
pub type ProvisionKey = [u8; PROVISION_KEY_SIZE];
/// Uncompressed curve point without the SEC1 `0x04` prefix (X || Y).
pub type PartnerPublicKey = [u8; PARTNER_PUBLIC_KEY_SIZE];
pub type PartnerPrivateKey = [u8; PARTNER_PRIVATE_KEY_SIZE];
pub type VkId = [u8; VK_ID_SIZE];
/// Uncompressed verification key without the SEC1 `0x04` prefix (X || Y).
pub type Vk = [u8; VK_SIZE];
pub type Message = [u8; MESSAGE_SIZE];
/// Fixed-width ECDSA signature (r || s).
pub type Sig = [u8; SIG_SIZE];
pub type Adv = [u8; ADV_SIZE];
pub type SkId = [u8; SK_ID_SIZE];
pub type Sk = [u8; SK_SIZE];
pub type Prg = [u8; PRG_SIZE];
pub type FirmwareVersion = [u8; FIRMWARE_VERSION_SIZE];
pub type EcgSamples = [i32; ECG_SAMPLES_PER_EVENT];

/// LED patterns shown during agreement, `true` meaning lit.
pub type LedPatterns = [[bool; LEDS]; AGREEMENT_PATTERNS];

/// ECDSA curve a band key pair is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SignatureScheme {
    /// NIST P-256 (secp256r1).
    NistP256 = 0x01,
    /// secp256k1.
    Secp256k1 = 0x02,
}

impl TryFrom<u8> for SignatureScheme {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(SignatureScheme::NistP256),
            0x02 => Ok(SignatureScheme::Secp256k1),
            _ => Err(()),
        }
    }
}
