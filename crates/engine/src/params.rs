//! Tunable pipeline parameters.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::EngineError;

/// Default throughput cap in bytes per second.
pub const DEFAULT_MAX_THROUGHPUT: usize = 150_000;

/// Default time allowed for one batch send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Default time to wait for a confirmation before resending.
pub const DEFAULT_RESEND_WAIT: Duration = Duration::from_secs(30);

/// Default number of sending workers.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default time the batch builder waits to fill a batch.
pub const DEFAULT_BATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pipeline configuration. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Params {
    /// Bytes per second the batch builder may hand to workers. 0 disables
    /// the cap.
    pub max_throughput: usize,

    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub resend_wait: Duration,

    pub worker_pool_size: usize,

    #[serde(with = "duration_ms")]
    pub batch_poll_interval: Duration,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_throughput: DEFAULT_MAX_THROUGHPUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            resend_wait: DEFAULT_RESEND_WAIT,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            batch_poll_interval: DEFAULT_BATCH_POLL_INTERVAL,
        }
    }
}

impl Params {
    /// Reads params from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            debug!(path = %path.display(), "no params file, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Durations travel as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let p = Params::default();
        assert_eq!(p.max_throughput, 150_000);
        assert_eq!(p.send_timeout, Duration::from_millis(500));
        assert_eq!(p.resend_wait, Duration::from_secs(30));
        assert_eq!(p.worker_pool_size, 4);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let p: Params = serde_json::from_str(r#"{"resendWait": 250}"#).unwrap();
        assert_eq!(p.resend_wait, Duration::from_millis(250));
        assert_eq!(p.max_throughput, DEFAULT_MAX_THROUGHPUT);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = Params::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(p, Params::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("params.json");
        let p = Params {
            max_throughput: 0,
            send_timeout: Duration::from_millis(20),
            ..Params::default()
        };
        p.save(&path).unwrap();
        assert_eq!(Params::load(&path).unwrap(), p);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(Params::load(&path), Err(EngineError::Json(_))));
    }
}
