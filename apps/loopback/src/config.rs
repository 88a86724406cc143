//! Loopback demo configuration, read from an optional JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_engine::Params;
use sluice_engine::params::duration_ms;

/// Demo settings. Every field may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopbackConfig {
    pub params: Params,

    /// Size of every substrate payload in bytes.
    pub payload_len: usize,

    /// Most payloads per substrate round.
    pub batch_len: usize,

    /// Chance in `[0, 1]` that any payload is lost.
    pub loss_rate: f64,

    /// Extra fingerprint budget as a fraction of the part count.
    pub retry: f32,

    #[serde(with = "duration_ms")]
    pub progress_period: Duration,

    /// Persist transfer state here instead of in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            params: Params::default(),
            payload_len: 512,
            batch_len: 11,
            loss_rate: 0.0,
            retry: 0.5,
            progress_period: Duration::from_millis(250),
            data_dir: None,
        }
    }
}

impl LoopbackConfig {
    /// Reads the config at `path`, or returns the defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config: Self = match path {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.loss_rate),
            "lossRate must be within [0, 1], got {}",
            self.loss_rate
        );
        anyhow::ensure!(
            self.payload_len > sluice_protocol::PART_NUM_LEN,
            "payloadLen of {} leaves no room for part data",
            self.payload_len
        );
        anyhow::ensure!(self.batch_len > 0, "batchLen must be positive");
        Ok(())
    }
}
