//! Received-side transfer state machine.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sluice_protocol::{RecipientId, TransferId, TransferKey};
use sluice_storage::{Kv, StorageError};
use tracing::{debug, trace};

use crate::TransferError;
use crate::crypto::verify_transfer_mac;
use crate::cypher::{Cypher, CypherManager};
use crate::state_vector::StateVector;
use crate::types::{CallbackDedup, ReceivedProgress};

const INFO_KEY: &str = "info";
const PART_STATUS_KEY: &str = "partStatus";

fn part_key(part_num: u16) -> String {
    format!("part#{part_num}")
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedInfo {
    recipient: RecipientId,
    transfer_mac: String,
    file_size: u32,
    num_parts: u16,
}

/// State of one incoming transfer.
pub struct ReceivedTransfer {
    file_id: TransferId,
    recipient: RecipientId,
    transfer_mac: Vec<u8>,
    file_size: u32,
    num_parts: u16,
    cyphers: CypherManager,
    state: Mutex<ReceivedState>,
    kv: Kv,
}

struct ReceivedState {
    parts: Vec<Option<Vec<u8>>>,
    received: StateVector,
    callbacks: CallbackDedup,
}

impl ReceivedTransfer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file_id: TransferId,
        recipient: RecipientId,
        key: TransferKey,
        transfer_mac: Vec<u8>,
        file_size: u32,
        num_parts: u16,
        num_fps: u16,
        kv: Kv,
    ) -> Result<Self, TransferError> {
        if num_parts == 0 || num_fps < num_parts {
            return Err(TransferError::Validation(format!(
                "{num_parts} parts with {num_fps} fingerprints is not a valid transfer"
            )));
        }

        let cyphers = CypherManager::new(key, num_fps, &kv)?;
        let received = StateVector::new(num_parts);
        kv.set_json(
            INFO_KEY,
            &ReceivedInfo {
                recipient,
                transfer_mac: hex::encode(&transfer_mac),
                file_size,
                num_parts,
            },
        )?;
        received.save(&kv, PART_STATUS_KEY)?;

        debug!(%file_id, parts = num_parts, fingerprints = num_fps, "received transfer created");
        Ok(Self {
            file_id,
            recipient,
            transfer_mac,
            file_size,
            num_parts,
            cyphers,
            state: Mutex::new(ReceivedState {
                parts: vec![None; num_parts as usize],
                received,
                callbacks: CallbackDedup::default(),
            }),
            kv,
        })
    }

    /// Reloads a transfer and every part stored so far.
    pub(crate) fn load(file_id: TransferId, kv: Kv) -> Result<Self, TransferError> {
        let info: ReceivedInfo = kv.get_json(INFO_KEY)?;
        let transfer_mac =
            hex::decode(&info.transfer_mac).map_err(|_| StorageError::Corrupt {
                key: format!("{}{INFO_KEY}", kv.prefix()),
                reason: "transfer MAC is not hex".into(),
            })?;
        let received = StateVector::load(&kv, PART_STATUS_KEY)?;
        if received.num_keys() != info.num_parts {
            return Err(StorageError::Corrupt {
                key: format!("{}{PART_STATUS_KEY}", kv.prefix()),
                reason: "part status does not match part count".into(),
            }
            .into());
        }

        let mut parts = vec![None; info.num_parts as usize];
        for part_num in received.used_keys() {
            parts[part_num as usize] = Some(kv.get(&part_key(part_num))?);
        }

        let cyphers = CypherManager::load(&kv)?;
        Ok(Self {
            file_id,
            recipient: info.recipient,
            transfer_mac,
            file_size: info.file_size,
            num_parts: info.num_parts,
            cyphers,
            state: Mutex::new(ReceivedState {
                parts,
                received,
                callbacks: CallbackDedup::default(),
            }),
            kv,
        })
    }

    pub fn file_id(&self) -> TransferId {
        self.file_id
    }

    pub fn recipient(&self) -> RecipientId {
        self.recipient
    }

    pub fn key(&self) -> &TransferKey {
        self.cyphers.key()
    }

    pub fn transfer_mac(&self) -> &[u8] {
        &self.transfer_mac
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn num_parts(&self) -> u16 {
        self.num_parts
    }

    pub fn num_received(&self) -> u16 {
        self.state.lock().unwrap().received.num_used()
    }

    pub fn is_complete(&self) -> bool {
        self.num_received() == self.num_parts
    }

    pub fn part_statuses(&self) -> Vec<bool> {
        let state = self.state.lock().unwrap();
        (0..self.num_parts)
            .map(|n| state.received.is_used(n))
            .collect()
    }

    /// Stores part `part_num`. Re-adding a part overwrites it.
    ///
    /// Returns `true` if this part completed the transfer.
    pub fn add_part(&self, part: Vec<u8>, part_num: u16) -> Result<bool, TransferError> {
        if part_num >= self.num_parts {
            return Err(TransferError::PartOutOfRange {
                part_num,
                num_parts: self.num_parts,
            });
        }

        let mut state = self.state.lock().unwrap();
        self.kv.set(&part_key(part_num), &part)?;
        state.parts[part_num as usize] = Some(part);
        if !state.received.use_key(part_num) {
            trace!(file_id = %self.file_id, part_num, "duplicate part overwritten");
            return Ok(false);
        }
        state.received.save(&self.kv, PART_STATUS_KEY)?;
        trace!(
            file_id = %self.file_id,
            part_num,
            received = state.received.num_used(),
            "part stored"
        );
        Ok(state.received.num_used() == self.num_parts)
    }

    /// Concatenates the stored parts and trims to the declared size.
    /// Missing parts contribute nothing.
    pub fn get_file(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let mut file: Vec<u8> = state.parts.iter().flatten().flatten().copied().collect();
        file.truncate(self.file_size as usize);
        file
    }

    /// Checks a reconstructed file against the transfer MAC.
    pub fn verify_file(&self, file: &[u8]) -> Result<(), TransferError> {
        verify_transfer_mac(self.key(), file, &self.transfer_mac)
            .map_err(|_| TransferError::FileMacMismatch)
    }

    /// Cyphers for every fingerprint that has not delivered a part yet.
    pub fn unused_cyphers(&self) -> Vec<Cypher> {
        self.cyphers.unused_cyphers()
    }

    /// Retires a fingerprint once its part arrived.
    pub fn mark_fingerprint_used(&self, fp_num: u16) -> Result<bool, TransferError> {
        self.cyphers.mark_used(fp_num)
    }

    pub fn progress(&self, err: Option<&TransferError>) -> ReceivedProgress {
        let part_statuses = self.part_statuses();
        let received = part_statuses.iter().filter(|&&r| r).count() as u16;
        ReceivedProgress {
            completed: received == self.num_parts,
            received,
            total: self.num_parts,
            error: err.map(ToString::to_string),
            part_statuses,
        }
    }

    pub fn new_callback_id(&self) -> u64 {
        self.state.lock().unwrap().callbacks.new_id()
    }

    /// Returns `false` if `progress` matches what callback `id` last saw.
    pub fn compare_and_swap_callback_fp(&self, id: u64, progress: &ReceivedProgress) -> bool {
        self.state
            .lock()
            .unwrap()
            .callbacks
            .compare_and_swap(id, progress.fingerprint())
    }

    pub(crate) fn delete(&self) -> Result<(), TransferError> {
        self.kv.delete_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for ReceivedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedTransfer")
            .field("file_id", &self.file_id)
            .field("num_parts", &self.num_parts)
            .field("num_received", &self.num_received())
            .finish_non_exhaustive()
    }
}
