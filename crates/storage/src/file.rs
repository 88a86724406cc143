//! Directory-backed store.
//!
//! Each key maps to one file named by the hex SHA-256 of the key, so file
//! names have a fixed length however deeply a key is scoped, and keys may
//! contain separators without creating nested directories or escaping the
//! root. The key itself is stored at the head of the file:
//!
//! ```text
//! [key length: u32 LE][key bytes][value]
//! ```
//!
//! Writes go to a temporary file that is synced before being renamed into
//! place.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::StorageError;
use crate::kv::KvBackend;

const TMP_SUFFIX: &str = ".tmp";
const KEY_LEN_SIZE: usize = 4;

/// Persists entries as individual files under a root directory.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(key.as_bytes())))
    }
}

/// Splits a file into its stored key and value.
fn decode_entry<'a>(name: &str, data: &'a [u8]) -> Result<(&'a str, &'a [u8]), StorageError> {
    let corrupt = |reason: &str| StorageError::Corrupt {
        key: name.to_string(),
        reason: reason.to_string(),
    };
    let (len, rest) = data
        .split_first_chunk::<KEY_LEN_SIZE>()
        .ok_or_else(|| corrupt("entry is shorter than its header"))?;
    let len = u32::from_le_bytes(*len) as usize;
    if rest.len() < len {
        return Err(corrupt("entry is shorter than its key"));
    }
    let (key, value) = rest.split_at(len);
    let key = std::str::from_utf8(key).map_err(|_| corrupt("stored key is not UTF-8"))?;
    Ok((key, value))
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let (stored, value) = decode_entry(key, &data)?;
        if stored != key {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("file holds key {stored}"),
            });
        }
        Ok(value.to_vec())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let key_len = u32::try_from(key.len()).map_err(|_| StorageError::Corrupt {
            key: key.to_string(),
            reason: "key is too long".into(),
        })?;
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&key_len.to_le_bytes())?;
            file.write_all(key.as_bytes())?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            error!(key, error = %e, "failed to write entry");
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let data = match fs::read(entry.path()) {
                Ok(data) => data,
                // Deleted since the directory was listed.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let (key, _) = decode_entry(name, &data)?;
            if key.starts_with(prefix) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Kv;

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = Kv::new(Arc::new(FileBackend::open(dir.path()).unwrap()));
            kv.scope("transfers").set("abc/info", b"hello").unwrap();
        }

        let kv = Kv::new(Arc::new(FileBackend::open(dir.path()).unwrap()));
        let scope = kv.scope("transfers");
        assert_eq!(scope.get("abc/info").unwrap(), b"hello");
        assert_eq!(scope.keys().unwrap(), vec!["abc/info".to_string()]);
    }

    #[test]
    fn keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("store")).unwrap();
        backend.set("../../escape", b"x").unwrap();

        assert!(!dir.path().join("escape").exists());
        assert_eq!(backend.get("../../escape").unwrap(), b"x");
    }

    #[test]
    fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.delete("never-written").unwrap();
        assert!(backend.get("never-written").unwrap_err().is_not_found());
    }

    #[test]
    fn deeply_scoped_keys_fit_in_a_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Kv::new(Arc::new(FileBackend::open(dir.path()).unwrap()));
        let scope = kv
            .scope(&"receiver-node".repeat(10))
            .scope("ReceivedFileTransferStore")
            .scope(&"ab".repeat(32));
        scope.set("cypher/fpVector", b"bits").unwrap();

        assert_eq!(scope.get("cypher/fpVector").unwrap(), b"bits");
        assert_eq!(scope.keys().unwrap(), vec!["cypher/fpVector".to_string()]);
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            assert_eq!(entry.unwrap().file_name().len(), 64);
        }
    }

    #[test]
    fn truncated_entry_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.set("k", b"value").unwrap();
        std::fs::write(backend.path_for("k"), [9, 0]).unwrap();

        assert!(matches!(
            backend.get("k"),
            Err(StorageError::Corrupt { .. })
        ));
        assert!(backend.keys_with_prefix("").is_err());
    }

    #[test]
    fn no_temp_file_is_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.set("k", b"v").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(TMP_SUFFIX));
    }

    #[test]
    fn overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.set("k", b"first").unwrap();
        backend.set("k", b"second").unwrap();
        assert_eq!(backend.get("k").unwrap(), b"second");
        assert_eq!(backend.keys_with_prefix("").unwrap().len(), 1);
    }
}
