use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::ProtocolError;

/// Length of every identifier and key in bytes.
pub const ID_LEN: usize = 32;

/// Domain tag mixed into every fingerprint derivation.
const FINGERPRINT_TAG: &[u8] = b"sluice fingerprint";

/// Declares a fixed-length byte identifier serialised as base64 in JSON.
macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            pub const fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Builds the value from a slice, rejecting anything not exactly
            /// [`ID_LEN`] bytes long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
                let arr: [u8; ID_LEN] =
                    bytes.try_into().map_err(|_| ProtocolError::InvalidLength {
                        kind: $kind,
                        expected: ID_LEN,
                        got: bytes.len(),
                    })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                STANDARD.encode(self.0).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
                Self::from_slice(&bytes).map_err(serde::de::Error::custom)
            }
        }
    };
}

byte_id!(
    /// Identifies a transfer. The sender derives it from the file contents.
    TransferId,
    "transfer ID"
);

byte_id!(
    /// Substrate identity that every part of one transfer is addressed to.
    RecipientId,
    "recipient ID"
);

byte_id!(
    /// Symmetric key shared through the handshake. Seeds every fingerprint
    /// of the transfer and keys the whole-file MAC.
    TransferKey,
    "transfer key"
);

byte_id!(
    /// Single-use tag the substrate routes an encrypted part by.
    Fingerprint,
    "fingerprint"
);

impl TransferId {
    /// SHA-256 of the file contents.
    pub fn from_file(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl Fingerprint {
    /// Deterministically derives fingerprint number `fp_num` of `key`.
    ///
    /// Both ends compute the same value, which is what lets the receiver
    /// register for parts before any of them is sent.
    pub fn derive(key: &TransferKey, fp_num: u16) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_TAG);
        hasher.update(key.as_bytes());
        hasher.update(fp_num.to_le_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self.to_hex())
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientId({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell fingerprints apart in logs.
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferKey(<redacted>)")
    }
}
