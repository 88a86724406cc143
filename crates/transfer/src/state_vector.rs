use serde::{Deserialize, Serialize};
use sluice_storage::{Kv, StorageError};

const WORD_BITS: usize = 64;

/// Fixed-size bitset tracking which keys of a range have been used.
///
/// Backs both the fingerprint allocator (used fingerprint numbers) and the
/// received side (parts that have arrived).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateVector {
    words: Vec<u64>,
    num_keys: u16,
    num_used: u16,
}

impl StateVector {
    /// A vector of `num_keys` unused keys.
    pub fn new(num_keys: u16) -> Self {
        Self {
            words: vec![0; (num_keys as usize).div_ceil(WORD_BITS)],
            num_keys,
            num_used: 0,
        }
    }

    pub fn num_keys(&self) -> u16 {
        self.num_keys
    }

    pub fn num_used(&self) -> u16 {
        self.num_used
    }

    pub fn num_available(&self) -> u16 {
        self.num_keys - self.num_used
    }

    /// Whether `key` is used. Out-of-range keys report unused.
    pub fn is_used(&self, key: u16) -> bool {
        if key >= self.num_keys {
            return false;
        }
        let (word, bit) = Self::locate(key);
        self.words[word] & (1 << bit) != 0
    }

    /// Marks `key` used. Returns `false` if it already was or is out of
    /// range.
    pub fn use_key(&mut self, key: u16) -> bool {
        if key >= self.num_keys || self.is_used(key) {
            return false;
        }
        let (word, bit) = Self::locate(key);
        self.words[word] |= 1 << bit;
        self.num_used += 1;
        true
    }

    /// Claims and returns the lowest unused key.
    pub fn next_available(&mut self) -> Option<u16> {
        let key = (0..self.num_keys).find(|&k| !self.is_used(k))?;
        self.use_key(key);
        Some(key)
    }

    pub fn unused_keys(&self) -> Vec<u16> {
        (0..self.num_keys).filter(|&k| !self.is_used(k)).collect()
    }

    pub fn used_keys(&self) -> Vec<u16> {
        (0..self.num_keys).filter(|&k| self.is_used(k)).collect()
    }

    pub fn save(&self, kv: &Kv, key: &str) -> Result<(), StorageError> {
        kv.set_json(key, self)
    }

    /// Loads a vector and checks it is internally consistent.
    pub fn load(kv: &Kv, key: &str) -> Result<Self, StorageError> {
        let vector: Self = kv.get_json(key)?;
        let counted: u32 = vector.words.iter().map(|w| w.count_ones()).sum();
        if vector.words.len() != (vector.num_keys as usize).div_ceil(WORD_BITS)
            || counted != vector.num_used as u32
        {
            return Err(StorageError::Corrupt {
                key: format!("{}{key}", kv.prefix()),
                reason: "state vector does not match its own counts".into(),
            });
        }
        Ok(vector)
    }

    fn locate(key: u16) -> (usize, usize) {
        let key = key as usize;
        (key / WORD_BITS, key % WORD_BITS)
    }
}
