//! Wire types shared by both ends of a sluice transfer.
//!
//! Everything here is pure data: identifiers and key material, the
//! handshake message a sender hands to its peer out of band, and the
//! fixed-size part payload carried by the substrate.

pub mod constants;
pub mod messages;
pub mod part;
pub mod types;

pub use messages::{FileInfo, FileLink};
pub use part::{PART_NUM_LEN, PartMessage, num_fingerprints};
pub use types::{Fingerprint, RecipientId, TransferId, TransferKey};

/// Errors produced while encoding or decoding wire types.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes cannot hold the 2-byte part header")]
    PayloadTooSmall(usize),

    #[error("invalid {kind} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
