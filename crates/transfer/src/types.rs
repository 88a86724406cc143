use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a whole transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Delivery state of one sent part.
///
/// Ordered: a part only moves forward, except that a `Sent` part may be
/// reset to `Unsent` for resending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SentPartStatus {
    Unsent,
    Sent,
    Received,
}

/// Snapshot handed to sent-side progress callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct SentProgress {
    pub completed: bool,
    pub sent: u16,
    pub received: u16,
    pub total: u16,
    pub error: Option<String>,
    pub part_statuses: Vec<SentPartStatus>,
}

/// Snapshot handed to received-side progress callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedProgress {
    pub completed: bool,
    pub received: u16,
    pub total: u16,
    pub error: Option<String>,
    pub part_statuses: Vec<bool>,
}

impl SentProgress {
    pub(crate) fn fingerprint(&self) -> String {
        progress_fingerprint(
            self.completed,
            self.sent,
            self.received,
            self.total,
            self.error.as_deref(),
        )
    }
}

impl ReceivedProgress {
    pub(crate) fn fingerprint(&self) -> String {
        progress_fingerprint(
            self.completed,
            0,
            self.received,
            self.total,
            self.error.as_deref(),
        )
    }
}

fn progress_fingerprint(
    completed: bool,
    sent: u16,
    received: u16,
    total: u16,
    error: Option<&str>,
) -> String {
    format!("{completed}/{sent}/{received}/{total}/{}", error.unwrap_or(""))
}

/// Remembers the last progress reported to each registered callback so
/// identical snapshots are not delivered twice.
#[derive(Debug, Default)]
pub(crate) struct CallbackDedup {
    next_id: u64,
    last: HashMap<u64, String>,
}

impl CallbackDedup {
    pub(crate) fn new_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Stores `fingerprint` for `id`. Returns `false` if it equals the one
    /// already stored.
    pub(crate) fn compare_and_swap(&mut self, id: u64, fingerprint: String) -> bool {
        if self.last.get(&id) == Some(&fingerprint) {
            return false;
        }
        self.last.insert(id, fingerprint);
        true
    }
}
