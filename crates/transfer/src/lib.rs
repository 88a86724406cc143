//! Per-transfer state for sluice file transfers.
//!
//! A transfer is a file split into fixed-size parts, each encrypted under a
//! fingerprint that may be used exactly once. This crate owns everything
//! that tracks that state: the fingerprint allocator, the sent and received
//! state machines, the stores that persist them and the rate-limited
//! progress callbacks.

mod callbacks;
mod crypto;
mod cypher;
mod partition;
mod received;
mod sent;
mod state_vector;
mod store;
mod types;
mod validation;

use sluice_protocol::{ProtocolError, TransferId};
use sluice_storage::StorageError;

pub use callbacks::{
    CallAction, CallbackManager, CallbackTracker, Clock, TokioClock, TrackedCallback,
    TrackerState, decide,
};
pub use crypto::{CryptoError, MAC_LEN, transfer_mac, verify_transfer_mac};
pub use cypher::{Cypher, CypherManager, EncryptedPart};
pub use partition::partition_file;
pub use received::ReceivedTransfer;
pub use sent::{Part, SentTransfer};
pub use state_vector::StateVector;
pub use store::{ReceivedStore, SentStore};
pub use types::{ReceivedProgress, SentPartStatus, SentProgress, TransferStatus};
pub use validation::{validate_file_info, validate_handshake, validate_handshake_len};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid file: {0}")]
    Validation(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("part {part_num} out of range for a transfer of {num_parts} parts")]
    PartOutOfRange { part_num: u16, num_parts: u16 },

    #[error("fingerprints exhausted")]
    FingerprintsExhausted,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("transfer already exists: {0}")]
    Exists(TransferId),

    #[error("transfer {0} has not finished")]
    NotFinished(TransferId),

    #[error("transfer incomplete: received {received} of {total} parts")]
    Incomplete { received: u16, total: u16 },

    #[error("file does not match the transfer MAC")]
    FileMacMismatch,
}
