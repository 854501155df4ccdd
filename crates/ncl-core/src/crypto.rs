//! Local ECDSA helpers.
//!
//! Bands sign on-device; the library only needs to check those signatures and
//! to produce the advertisement signature a partner presents for a global
//! signature.  Keys and signatures use the band's fixed-width encodings:
//! public keys are the 64-byte `X || Y` of an uncompressed point (no SEC1
//! prefix) and signatures are the 64-byte `r || s`.  Messages are hashed with
//! SHA-256 for both curves.

use k256::ecdsa::{Signature as K256Signature, VerifyingKey as K256VerifyingKey};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{
    Signature as P256Signature, SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey,
};
use tracing::debug;

use crate::domain::keys::{
    Adv, Message, PartnerPrivateKey, PartnerPublicKey, SignatureScheme, Sig, Vk, ADV_SIZE,
    MESSAGE_SIZE, SIG_SIZE, VK_SIZE,
};
use crate::error::NclError;

/// SEC1 tag of an uncompressed point.
const SEC1_UNCOMPRESSED: u8 = 0x04;

/// Checks `sig` over `message` against the verification key `vk`.
///
/// Returns `false` for a wrong signature and for any key or signature that
/// is not a valid encoding on the chosen curve.
pub fn verify(vk: &Vk, message: &Message, sig: &Sig, scheme: SignatureScheme) -> bool {
    let sec1 = uncompressed_point(vk);
    let verified = match scheme {
        SignatureScheme::NistP256 => {
            let Ok(key) = P256VerifyingKey::from_sec1_bytes(&sec1) else {
                return false;
            };
            let Ok(signature) = P256Signature::from_slice(sig) else {
                return false;
            };
            key.verify(message, &signature).is_ok()
        }
        SignatureScheme::Secp256k1 => {
            let Ok(key) = K256VerifyingKey::from_sec1_bytes(&sec1) else {
                return false;
            };
            let Ok(signature) = K256Signature::from_slice(sig) else {
                return false;
            };
            k256::ecdsa::signature::Verifier::verify(&key, message, &signature).is_ok()
        }
    };
    debug!(?scheme, verified, "signature checked");
    verified
}

/// Signs `adv || message` with a partner's P-256 private key.
///
/// The result is the `adv_sig` argument of a global signature request.
///
/// # Errors
///
/// Returns [`NclError::BadPartnerKey`] if `partner_private_key` is not a valid
/// P-256 scalar (zero or not below the curve order).
pub fn sign_advertisement(
    adv: &Adv,
    message: &Message,
    partner_private_key: &PartnerPrivateKey,
) -> Result<Sig, NclError> {
    let key = P256SigningKey::from_slice(partner_private_key).map_err(|_| NclError::BadPartnerKey)?;

    let mut signed = [0u8; ADV_SIZE + MESSAGE_SIZE];
    signed[..ADV_SIZE].copy_from_slice(adv);
    signed[ADV_SIZE..].copy_from_slice(message);

    let signature: P256Signature = key.sign(&signed);
    let bytes = signature.to_bytes();
    let mut out = [0u8; SIG_SIZE];
    out.copy_from_slice(bytes.as_slice());
    Ok(out)
}

/// Derives the 64-byte public key matching a partner's P-256 private key.
///
/// # Errors
///
/// Returns [`NclError::BadPartnerKey`] for an invalid scalar.
pub fn partner_public_key(partner_private_key: &PartnerPrivateKey) -> Result<PartnerPublicKey, NclError> {
    let key = P256SigningKey::from_slice(partner_private_key).map_err(|_| NclError::BadPartnerKey)?;
    let point = key.verifying_key().to_encoded_point(false);
    let mut out = [0u8; VK_SIZE];
    // Skip the SEC1 tag byte.
    out.copy_from_slice(&point.as_bytes()[1..]);
    Ok(out)
}

fn uncompressed_point(vk: &Vk) -> [u8; VK_SIZE + 1] {
    let mut sec1 = [0u8; VK_SIZE + 1];
    sec1[0] = SEC1_UNCOMPRESSED;
    sec1[1..].copy_from_slice(vk);
    sec1
}
