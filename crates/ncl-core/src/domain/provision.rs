//! The persistent trust relationship between a band and an application.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::keys::{ProvisionId, ProvisionKey};

/// Record produced by a successful provisioning.
///
/// The application owns persistence.  Handing the provision back to the
/// library is what allows a later find and validate of the same band.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provision {
    /// Shared secret.  Never logged.
    #[serde(with = "hex_array")]
    pub key: ProvisionKey,
    /// Public identifier the band advertises while in range.
    #[serde(with = "hex_array")]
    pub id: ProvisionId,
    /// Whether the band may report strong finds for this provision.
    #[serde(default)]
    pub strong: bool,
}

impl fmt::Debug for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provision")
            .field("id", &hex::encode(self.id))
            .field("key", &"<redacted>")
            .field("strong", &self.strong)
            .finish()
    }
}

/// Serde adapter storing fixed-size byte arrays as lowercase hex strings.
pub(crate) mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let mut out = [0u8; N];
        hex::decode_to_slice(text.trim(), &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}
