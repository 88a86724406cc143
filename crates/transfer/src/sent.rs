//! Sent-side transfer state machine.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_protocol::{
    FileLink, PartMessage, ProtocolError, RecipientId, TransferId, TransferKey,
    num_fingerprints,
};
use sluice_storage::{Kv, StorageError};
use tracing::{debug, warn};

use crate::TransferError;
use crate::cypher::{CypherManager, EncryptedPart};
use crate::types::{CallbackDedup, SentPartStatus, SentProgress, TransferStatus};

const INFO_KEY: &str = "info";
const PARTS_KEY: &str = "parts";
const PART_STATUS_KEY: &str = "partStatus";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentInfo {
    recipient: RecipientId,
    sent_timestamp: DateTime<Utc>,
    mac: String,
    retry: f32,
    status: TransferStatus,
    file_size: u32,
    part_size: usize,
    num_parts: u16,
}

/// State of one outgoing transfer.
///
/// Parts, metadata and per-part status are persisted on every change, so a
/// transfer can be reloaded after a restart and resumed where it stopped.
pub struct SentTransfer {
    file_id: TransferId,
    recipient: RecipientId,
    sent_timestamp: DateTime<Utc>,
    mac: Vec<u8>,
    retry: f32,
    file_size: u32,
    parts: Vec<Vec<u8>>,
    cyphers: CypherManager,
    state: Mutex<SentState>,
    kv: Kv,
}

struct SentState {
    status: TransferStatus,
    part_status: Vec<SentPartStatus>,
    num_sent: u16,
    num_received: u16,
    callbacks: CallbackDedup,
}

impl SentState {
    fn from_statuses(status: TransferStatus, part_status: Vec<SentPartStatus>) -> Self {
        let count = |s| part_status.iter().filter(|&&p| p == s).count() as u16;
        Self {
            status,
            num_sent: count(SentPartStatus::Sent),
            num_received: count(SentPartStatus::Received),
            part_status,
            callbacks: CallbackDedup::default(),
        }
    }
}

impl SentTransfer {
    /// Creates and persists a new transfer. All parts must be the same size.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file_id: TransferId,
        recipient: RecipientId,
        key: TransferKey,
        mac: Vec<u8>,
        file_size: u32,
        parts: Vec<Vec<u8>>,
        retry: f32,
        kv: Kv,
    ) -> Result<Self, TransferError> {
        if parts.is_empty() || parts.len() > u16::MAX as usize {
            return Err(TransferError::Validation(format!(
                "cannot send a transfer of {} parts",
                parts.len()
            )));
        }
        let part_size = parts[0].len();
        if parts.iter().any(|p| p.len() != part_size) {
            return Err(TransferError::Validation("parts differ in size".into()));
        }

        let num_parts = parts.len() as u16;
        let cyphers = CypherManager::new(key, num_fingerprints(num_parts, retry), &kv)?;
        let transfer = Self {
            file_id,
            recipient,
            sent_timestamp: Utc::now(),
            mac,
            retry,
            file_size,
            parts,
            cyphers,
            state: Mutex::new(SentState::from_statuses(
                TransferStatus::Running,
                vec![SentPartStatus::Unsent; num_parts as usize],
            )),
            kv,
        };

        let state = transfer.state.lock().unwrap();
        transfer.save_info(state.status)?;
        transfer.kv.set(PARTS_KEY, &transfer.parts.concat())?;
        transfer.kv.set_json(PART_STATUS_KEY, &state.part_status)?;
        drop(state);

        debug!(
            file_id = %transfer.file_id,
            parts = num_parts,
            fingerprints = transfer.cyphers.num_fps(),
            "sent transfer created"
        );
        Ok(transfer)
    }

    /// Reloads a transfer written by [`new`](Self::new).
    pub(crate) fn load(file_id: TransferId, kv: Kv) -> Result<Self, TransferError> {
        let info: SentInfo = kv.get_json(INFO_KEY)?;
        let corrupt = |reason: &str| {
            TransferError::Storage(StorageError::Corrupt {
                key: format!("{}{INFO_KEY}", kv.prefix()),
                reason: reason.to_string(),
            })
        };

        let mac = hex::decode(&info.mac).map_err(|_| corrupt("mac is not hex"))?;
        let blob = kv.get(PARTS_KEY)?;
        if info.part_size == 0 || blob.len() != info.part_size * info.num_parts as usize {
            return Err(corrupt("part data does not match part count"));
        }
        let parts = blob.chunks(info.part_size).map(<[u8]>::to_vec).collect();

        let part_status: Vec<SentPartStatus> = kv.get_json(PART_STATUS_KEY)?;
        if part_status.len() != info.num_parts as usize {
            return Err(corrupt("part status does not match part count"));
        }

        let cyphers = CypherManager::load(&kv)?;
        Ok(Self {
            file_id,
            recipient: info.recipient,
            sent_timestamp: info.sent_timestamp,
            mac,
            retry: info.retry,
            file_size: info.file_size,
            parts,
            cyphers,
            state: Mutex::new(SentState::from_statuses(info.status, part_status)),
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

    pub fn mac(&self) -> &[u8] {
        &self.mac
    }

    pub fn sent_timestamp(&self) -> DateTime<Utc> {
        self.sent_timestamp
    }

    pub fn retry(&self) -> f32 {
        self.retry
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn num_parts(&self) -> u16 {
        self.parts.len() as u16
    }

    /// Reassembles the original file from the stored parts.
    pub fn file_data(&self) -> Vec<u8> {
        let mut data = self.parts.concat();
        data.truncate(self.file_size as usize);
        data
    }

    pub fn num_fps(&self) -> u16 {
        self.cyphers.num_fps()
    }

    pub fn num_available_fps(&self) -> u16 {
        self.cyphers.num_available()
    }

    pub fn status(&self) -> TransferStatus {
        self.state.lock().unwrap().status
    }

    pub fn num_sent(&self) -> u16 {
        self.state.lock().unwrap().num_sent
    }

    pub fn num_received(&self) -> u16 {
        self.state.lock().unwrap().num_received
    }

    pub fn part_statuses(&self) -> Vec<SentPartStatus> {
        self.state.lock().unwrap().part_status.clone()
    }

    pub fn part_status(&self, part_num: u16) -> Option<SentPartStatus> {
        self.state
            .lock()
            .unwrap()
            .part_status
            .get(part_num as usize)
            .copied()
    }

    /// The handshake link describing this transfer.
    pub fn file_link(&self) -> FileLink {
        FileLink {
            file_id: self.file_id,
            recipient_id: self.recipient,
            sent_timestamp: self.sent_timestamp,
            key: *self.key(),
            mac: self.mac.clone(),
            size: self.file_size,
            num_parts: self.num_parts(),
            retry: self.retry,
        }
    }

    /// Parts not yet transmitted.
    pub fn unsent_parts(self: &Arc<Self>) -> Vec<Part> {
        self.parts_with(SentPartStatus::Unsent)
    }

    /// Parts transmitted but not yet confirmed.
    pub fn sent_parts(self: &Arc<Self>) -> Vec<Part> {
        self.parts_with(SentPartStatus::Sent)
    }

    fn parts_with(self: &Arc<Self>, status: SentPartStatus) -> Vec<Part> {
        let state = self.state.lock().unwrap();
        state
            .part_status
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == status)
            .map(|(n, _)| Part {
                transfer: Arc::clone(self),
                part_num: n as u16,
            })
            .collect()
    }

    /// Encodes part `part_num` into a payload of `payload_len` bytes and
    /// seals it under a fresh fingerprint.
    ///
    /// Running out of fingerprints fails the transfer.
    pub fn encrypt_part(
        &self,
        part_num: u16,
        payload_len: usize,
    ) -> Result<EncryptedPart, TransferError> {
        let part = self.part_bytes(part_num)?;
        let mut msg = PartMessage::new(payload_len)?;
        if part.len() > msg.part_size() {
            return Err(ProtocolError::PayloadTooSmall(payload_len).into());
        }
        msg.set_part_num(part_num);
        msg.set_part(part);

        let cypher = match self.cyphers.pop_cypher() {
            Ok(c) => c,
            Err(TransferError::FingerprintsExhausted) => {
                warn!(file_id = %self.file_id, part_num, "fingerprints exhausted");
                self.mark_failed()?;
                return Err(TransferError::FingerprintsExhausted);
            }
            Err(e) => return Err(e),
        };
        Ok(cypher.encrypt(msg.marshal())?)
    }

    /// `Unsent -> Sent`. Returns whether the status changed.
    pub fn mark_sent(&self, part_num: u16) -> Result<bool, TransferError> {
        self.transition(part_num, |s, p| {
            if p != SentPartStatus::Unsent {
                return None;
            }
            s.num_sent += 1;
            Some(SentPartStatus::Sent)
        })
    }

    /// `Sent -> Unsent`. Returns whether the status changed.
    pub fn mark_for_resend(&self, part_num: u16) -> Result<bool, TransferError> {
        self.transition(part_num, |s, p| {
            if p != SentPartStatus::Sent {
                return None;
            }
            s.num_sent -= 1;
            Some(SentPartStatus::Unsent)
        })
    }

    /// Records confirmed arrival. A confirmation may overtake a resend
    /// reset, so `Unsent` parts move straight to `Received` as well.
    ///
    /// Returns `true` if this arrival completed the transfer.
    pub fn mark_received(&self, part_num: u16) -> Result<bool, TransferError> {
        let mut state = self.state.lock().unwrap();
        let prev = *self.status_slot(&state, part_num)?;
        if prev == SentPartStatus::Received {
            return Ok(false);
        }
        if prev == SentPartStatus::Sent {
            state.num_sent -= 1;
        }
        state.num_received += 1;
        state.part_status[part_num as usize] = SentPartStatus::Received;
        self.kv.set_json(PART_STATUS_KEY, &state.part_status)?;

        if state.status == TransferStatus::Running && state.num_received == self.num_parts() {
            state.status = TransferStatus::Completed;
            self.save_info(state.status)?;
            debug!(file_id = %self.file_id, "sent transfer completed");
            return Ok(true);
        }
        Ok(false)
    }

    /// Moves a running transfer to `Failed`.
    pub fn mark_failed(&self) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.status != TransferStatus::Running {
            return Ok(());
        }
        state.status = TransferStatus::Failed;
        self.save_info(state.status)
    }

    /// Snapshot for progress callbacks.
    pub fn progress(&self, err: Option<&TransferError>) -> SentProgress {
        let state = self.state.lock().unwrap();
        SentProgress {
            completed: state.status == TransferStatus::Completed,
            sent: state.num_sent,
            received: state.num_received,
            total: self.num_parts(),
            error: err.map(ToString::to_string),
            part_statuses: state.part_status.clone(),
        }
    }

    pub fn new_callback_id(&self) -> u64 {
        self.state.lock().unwrap().callbacks.new_id()
    }

    /// Returns `false` if `progress` matches what callback `id` last saw.
    pub fn compare_and_swap_callback_fp(&self, id: u64, progress: &SentProgress) -> bool {
        self.state
            .lock()
            .unwrap()
            .callbacks
            .compare_and_swap(id, progress.fingerprint())
    }

    /// Removes everything this transfer persisted.
    pub(crate) fn delete(&self) -> Result<(), TransferError> {
        self.kv.delete_all()?;
        Ok(())
    }

    fn part_bytes(&self, part_num: u16) -> Result<&[u8], TransferError> {
        self.parts
            .get(part_num as usize)
            .map(Vec::as_slice)
            .ok_or(TransferError::PartOutOfRange {
                part_num,
                num_parts: self.num_parts(),
            })
    }

    fn status_slot<'a>(
        &self,
        state: &'a SentState,
        part_num: u16,
    ) -> Result<&'a SentPartStatus, TransferError> {
        state
            .part_status
            .get(part_num as usize)
            .ok_or(TransferError::PartOutOfRange {
                part_num,
                num_parts: self.num_parts(),
            })
    }

    fn transition(
        &self,
        part_num: u16,
        apply: impl FnOnce(&mut SentState, SentPartStatus) -> Option<SentPartStatus>,
    ) -> Result<bool, TransferError> {
        let mut state = self.state.lock().unwrap();
        let prev = *self.status_slot(&state, part_num)?;
        let Some(next) = apply(&mut state, prev) else {
            return Ok(false);
        };
        state.part_status[part_num as usize] = next;
        self.kv.set_json(PART_STATUS_KEY, &state.part_status)?;
        Ok(true)
    }

    fn save_info(&self, status: TransferStatus) -> Result<(), TransferError> {
        let info = SentInfo {
            recipient: self.recipient,
            sent_timestamp: self.sent_timestamp,
            mac: hex::encode(&self.mac),
            retry: self.retry,
            status,
            file_size: self.file_size,
            part_size: self.parts.first().map_or(0, Vec::len),
            num_parts: self.num_parts(),
        };
        self.kv.set_json(INFO_KEY, &info)?;
        Ok(())
    }
}

/// Handle to one part of a [`SentTransfer`], as queued by the send
/// pipeline.
#[derive(Clone)]
pub struct Part {
    transfer: Arc<SentTransfer>,
    part_num: u16,
}

impl Part {
    pub fn transfer(&self) -> &Arc<SentTransfer> {
        &self.transfer
    }

    pub fn file_id(&self) -> TransferId {
        self.transfer.file_id
    }

    pub fn recipient(&self) -> RecipientId {
        self.transfer.recipient
    }

    pub fn part_num(&self) -> u16 {
        self.part_num
    }

    pub fn status(&self) -> SentPartStatus {
        // A Part is only ever built for an in-range number.
        self.transfer
            .part_status(self.part_num)
            .unwrap_or(SentPartStatus::Unsent)
    }

    pub fn encrypted(&self, payload_len: usize) -> Result<EncryptedPart, TransferError> {
        self.transfer.encrypt_part(self.part_num, payload_len)
    }

    pub fn mark_sent(&self) -> Result<bool, TransferError> {
        self.transfer.mark_sent(self.part_num)
    }

    pub fn mark_received(&self) -> Result<bool, TransferError> {
        self.transfer.mark_received(self.part_num)
    }

    pub fn mark_for_resend(&self) -> Result<bool, TransferError> {
        self.transfer.mark_for_resend(self.part_num)
    }
}

impl std::fmt::Debug for SentTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SentTransfer")
            .field("file_id", &self.file_id)
            .field("status", &state.status)
            .field("num_parts", &self.parts.len())
            .field("num_sent", &state.num_sent)
            .field("num_received", &state.num_received)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Part")
            .field("file_id", &self.transfer.file_id)
            .field("part_num", &self.part_num)
            .finish()
    }
}
