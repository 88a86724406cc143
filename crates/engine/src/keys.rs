//! Fresh key material for new transfers.

use rand::Rng;
use sluice_protocol::types::ID_LEN;
use sluice_protocol::{RecipientId, TransferKey};

fn random_bytes() -> [u8; ID_LEN] {
    let mut bytes = [0u8; ID_LEN];
    rand::thread_rng().fill(&mut bytes);
    bytes
}

/// Generates a CSPRNG transfer key.
pub fn generate_transfer_key() -> TransferKey {
    TransferKey::new(random_bytes())
}

/// Generates a recipient identity for one transfer.
pub fn generate_recipient_id() -> RecipientId {
    RecipientId::new(random_bytes())
}
