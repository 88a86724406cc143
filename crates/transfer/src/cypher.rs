//! Single-use fingerprint allocation.
//!
//! A [`CypherManager`] owns a transfer key and a budget of fingerprint
//! numbers. Every number yields exactly one [`Cypher`]; once popped it is
//! recorded as used before the cypher is handed out, so a crash can waste a
//! fingerprint but never reuse one.

use std::sync::Mutex;

use sluice_protocol::{Fingerprint, TransferKey};
use sluice_storage::Kv;
use tracing::trace;

use crate::TransferError;
use crate::crypto::{self, CryptoError};
use crate::state_vector::StateVector;

const CYPHER_SCOPE: &str = "cypher";
const KEY_KEY: &str = "key";
const FP_VECTOR_KEY: &str = "fpVector";

/// Hands out cyphers bound to unused fingerprints.
pub struct CypherManager {
    key: TransferKey,
    fp_vector: Mutex<StateVector>,
    kv: Kv,
}

impl CypherManager {
    /// Creates a manager with `num_fps` fresh fingerprints and persists the
    /// key and usage vector under `kv`.
    pub fn new(key: TransferKey, num_fps: u16, kv: &Kv) -> Result<Self, TransferError> {
        let kv = kv.scope(CYPHER_SCOPE);
        let fp_vector = StateVector::new(num_fps);
        kv.set(KEY_KEY, key.as_bytes())?;
        fp_vector.save(&kv, FP_VECTOR_KEY)?;
        Ok(Self {
            key,
            fp_vector: Mutex::new(fp_vector),
            kv,
        })
    }

    /// Restores a manager written by [`new`](Self::new).
    pub fn load(kv: &Kv) -> Result<Self, TransferError> {
        let kv = kv.scope(CYPHER_SCOPE);
        let key = TransferKey::from_slice(&kv.get(KEY_KEY)?)?;
        let fp_vector = StateVector::load(&kv, FP_VECTOR_KEY)?;
        Ok(Self {
            key,
            fp_vector: Mutex::new(fp_vector),
            kv,
        })
    }

    /// Claims the lowest unused fingerprint.
    pub fn pop_cypher(&self) -> Result<Cypher, TransferError> {
        let mut vector = self.fp_vector.lock().unwrap();
        let fp_num = vector
            .next_available()
            .ok_or(TransferError::FingerprintsExhausted)?;
        vector.save(&self.kv, FP_VECTOR_KEY)?;
        trace!(fp_num, remaining = vector.num_available(), "fingerprint claimed");
        Ok(Cypher::new(self.key, fp_num))
    }

    /// One cypher per fingerprint not yet used.
    pub fn unused_cyphers(&self) -> Vec<Cypher> {
        let vector = self.fp_vector.lock().unwrap();
        vector
            .unused_keys()
            .into_iter()
            .map(|fp_num| Cypher::new(self.key, fp_num))
            .collect()
    }

    /// Retires a fingerprint without encrypting with it. Returns `false` if
    /// it was already used.
    pub fn mark_used(&self, fp_num: u16) -> Result<bool, TransferError> {
        let mut vector = self.fp_vector.lock().unwrap();
        if !vector.use_key(fp_num) {
            return Ok(false);
        }
        vector.save(&self.kv, FP_VECTOR_KEY)?;
        Ok(true)
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub fn num_fps(&self) -> u16 {
        self.fp_vector.lock().unwrap().num_keys()
    }

    pub fn num_available(&self) -> u16 {
        self.fp_vector.lock().unwrap().num_available()
    }

    /// Removes the key and usage vector from storage.
    pub fn delete(&self) -> Result<(), TransferError> {
        self.kv.delete_all()?;
        Ok(())
    }
}

/// One part sealed under one fingerprint.
#[derive(Debug, Clone)]
pub struct EncryptedPart {
    pub ciphertext: Vec<u8>,
    pub mac: Vec<u8>,
    pub fingerprint: Fingerprint,
}

/// A transfer key bound to a single fingerprint number.
#[derive(Debug, Clone)]
pub struct Cypher {
    key: TransferKey,
    fp_num: u16,
    fingerprint: Fingerprint,
}

impl Cypher {
    /// Builds the cypher for `fp_num` directly. Both sides derive the same
    /// fingerprint from the same key and number.
    pub fn new(key: TransferKey, fp_num: u16) -> Self {
        Self {
            fingerprint: Fingerprint::derive(&key, fp_num),
            key,
            fp_num,
        }
    }

    pub fn fp_num(&self) -> u16 {
        self.fp_num
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPart, CryptoError> {
        let (ciphertext, mac) = crypto::encrypt_part(&self.key, &self.fingerprint, plaintext)?;
        Ok(EncryptedPart {
            ciphertext,
            mac,
            fingerprint: self.fingerprint,
        })
    }

    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        mac: &[u8],
        fingerprint: &Fingerprint,
    ) -> Result<Vec<u8>, CryptoError> {
        if *fingerprint != self.fingerprint {
            return Err(CryptoError::FingerprintMismatch);
        }
        crypto::decrypt_part(&self.key, &self.fingerprint, ciphertext, mac)
    }
}
