//! Durable maps from transfer ID to transfer state.
//!
//! Each store keeps its live transfers behind one coarse mutex that guards
//! only the map and the persisted index of IDs. Work on an individual
//! transfer always happens after that lock is released; the transfer's own
//! mutex covers its state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use sluice_protocol::{RecipientId, TransferId, TransferKey};
use sluice_storage::Kv;
use tracing::{debug, warn};

use crate::TransferError;
use crate::received::ReceivedTransfer;
use crate::sent::SentTransfer;

const SENT_STORE_SCOPE: &str = "SentFileTransferStore";
const RECEIVED_STORE_SCOPE: &str = "ReceivedFileTransferStore";
const INDEX_KEY: &str = "transfers";
const TRANSFER_SCOPE: &str = "transfer";

struct Entries<T> {
    transfers: HashMap<TransferId, Arc<T>>,
    /// IDs being created; reserved so concurrent adds cannot collide.
    reserved: HashSet<TransferId>,
}

impl<T> Entries<T> {
    fn new(transfers: HashMap<TransferId, Arc<T>>) -> Self {
        Self {
            transfers,
            reserved: HashSet::new(),
        }
    }

    fn reserve(&mut self, file_id: TransferId) -> Result<(), TransferError> {
        if self.transfers.contains_key(&file_id) || !self.reserved.insert(file_id) {
            return Err(TransferError::Exists(file_id));
        }
        Ok(())
    }

    fn index(&self) -> Vec<TransferId> {
        let mut ids: Vec<_> = self.transfers.keys().copied().collect();
        ids.sort();
        ids
    }
}

fn transfer_kv(store_kv: &Kv, file_id: &TransferId) -> Kv {
    store_kv.scope(TRANSFER_SCOPE).scope(&file_id.to_hex())
}

/// Loads every transfer named in the index, skipping (and purging) entries
/// that fail to load.
fn load_all<T>(
    kv: &Kv,
    load: impl Fn(TransferId, Kv) -> Result<T, TransferError>,
) -> Result<HashMap<TransferId, Arc<T>>, TransferError> {
    let ids: Vec<TransferId> = match kv.get_json(INDEX_KEY) {
        Ok(ids) => ids,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut transfers = HashMap::with_capacity(ids.len());
    for file_id in ids {
        let scope = transfer_kv(kv, &file_id);
        match load(file_id, scope.clone()) {
            Ok(t) => {
                transfers.insert(file_id, Arc::new(t));
            }
            Err(e) => {
                warn!(%file_id, error = %e, "dropping transfer that failed to load");
                scope.delete_all()?;
            }
        }
    }
    Ok(transfers)
}

// ---------------------------------------------------------------------------
// SentStore
// ---------------------------------------------------------------------------

/// Every outgoing transfer of one manager.
pub struct SentStore {
    entries: Mutex<Entries<SentTransfer>>,
    kv: Kv,
}

impl SentStore {
    /// Opens the store, reloading any transfers persisted under `kv`.
    pub fn new_or_load(kv: &Kv) -> Result<Self, TransferError> {
        let kv = kv.scope(SENT_STORE_SCOPE);
        let transfers = load_all(&kv, SentTransfer::load)?;
        debug!(count = transfers.len(), "sent store loaded");
        let store = Self {
            entries: Mutex::new(Entries::new(transfers)),
            kv,
        };
        store.save_index(&store.entries.lock().unwrap())?;
        Ok(store)
    }

    /// Creates, persists and registers a new transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn add_transfer(
        &self,
        file_id: TransferId,
        recipient: RecipientId,
        key: TransferKey,
        mac: Vec<u8>,
        file_size: u32,
        parts: Vec<Vec<u8>>,
        retry: f32,
    ) -> Result<Arc<SentTransfer>, TransferError> {
        self.entries.lock().unwrap().reserve(file_id)?;

        let scope = transfer_kv(&self.kv, &file_id);
        let created = SentTransfer::new(
            file_id,
            recipient,
            key,
            mac,
            file_size,
            parts,
            retry,
            scope.clone(),
        );

        let mut entries = self.entries.lock().unwrap();
        entries.reserved.remove(&file_id);
        let transfer = match created {
            Ok(t) => Arc::new(t),
            Err(e) => {
                drop(entries);
                scope.delete_all()?;
                return Err(e);
            }
        };
        entries.transfers.insert(file_id, Arc::clone(&transfer));
        self.save_index(&entries)?;
        Ok(transfer)
    }

    pub fn get_transfer(&self, file_id: &TransferId) -> Result<Arc<SentTransfer>, TransferError> {
        self.entries
            .lock()
            .unwrap()
            .transfers
            .get(file_id)
            .cloned()
            .ok_or(TransferError::NotFound(*file_id))
    }

    /// Unregisters a transfer and deletes everything it persisted.
    pub fn remove_transfer(&self, file_id: &TransferId) -> Result<(), TransferError> {
        let transfer = {
            let mut entries = self.entries.lock().unwrap();
            let transfer = entries
                .transfers
                .remove(file_id)
                .ok_or(TransferError::NotFound(*file_id))?;
            self.save_index(&entries)?;
            transfer
        };
        transfer.delete()?;
        debug!(%file_id, "sent transfer removed");
        Ok(())
    }

    pub fn transfers(&self) -> Vec<Arc<SentTransfer>> {
        self.entries
            .lock()
            .unwrap()
            .transfers
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save_index(&self, entries: &Entries<SentTransfer>) -> Result<(), TransferError> {
        self.kv.set_json(INDEX_KEY, &entries.index())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReceivedStore
// ---------------------------------------------------------------------------

/// Every incoming transfer of one manager.
pub struct ReceivedStore {
    entries: Mutex<Entries<ReceivedTransfer>>,
    kv: Kv,
}

impl ReceivedStore {
    /// Opens the store, reloading any transfers persisted under `kv`.
    pub fn new_or_load(kv: &Kv) -> Result<Self, TransferError> {
        let kv = kv.scope(RECEIVED_STORE_SCOPE);
        let transfers = load_all(&kv, ReceivedTransfer::load)?;
        debug!(count = transfers.len(), "received store loaded");
        let store = Self {
            entries: Mutex::new(Entries::new(transfers)),
            kv,
        };
        store.save_index(&store.entries.lock().unwrap())?;
        Ok(store)
    }

    /// Creates, persists and registers a new transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn add_transfer(
        &self,
        file_id: TransferId,
        recipient: RecipientId,
        key: TransferKey,
        transfer_mac: Vec<u8>,
        file_size: u32,
        num_parts: u16,
        num_fps: u16,
    ) -> Result<Arc<ReceivedTransfer>, TransferError> {
        self.entries.lock().unwrap().reserve(file_id)?;

        let scope = transfer_kv(&self.kv, &file_id);
        let created = ReceivedTransfer::new(
            file_id,
            recipient,
            key,
            transfer_mac,
            file_size,
            num_parts,
            num_fps,
            scope.clone(),
        );

        let mut entries = self.entries.lock().unwrap();
        entries.reserved.remove(&file_id);
        let transfer = match created {
            Ok(t) => Arc::new(t),
            Err(e) => {
                drop(entries);
                scope.delete_all()?;
                return Err(e);
            }
        };
        entries.transfers.insert(file_id, Arc::clone(&transfer));
        self.save_index(&entries)?;
        Ok(transfer)
    }

    pub fn get_transfer(
        &self,
        file_id: &TransferId,
    ) -> Result<Arc<ReceivedTransfer>, TransferError> {
        self.entries
            .lock()
            .unwrap()
            .transfers
            .get(file_id)
            .cloned()
            .ok_or(TransferError::NotFound(*file_id))
    }

    /// Unregisters a transfer and deletes everything it persisted.
    pub fn remove_transfer(&self, file_id: &TransferId) -> Result<(), TransferError> {
        let transfer = {
            let mut entries = self.entries.lock().unwrap();
            let transfer = entries
                .transfers
                .remove(file_id)
                .ok_or(TransferError::NotFound(*file_id))?;
            self.save_index(&entries)?;
            transfer
        };
        transfer.delete()?;
        debug!(%file_id, "received transfer removed");
        Ok(())
    }

    pub fn transfers(&self) -> Vec<Arc<ReceivedTransfer>> {
        self.entries
            .lock()
            .unwrap()
            .transfers
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save_index(&self, entries: &Entries<ReceivedTransfer>) -> Result<(), TransferError> {
        self.kv.set_json(INDEX_KEY, &entries.index())?;
        Ok(())
    }
}
