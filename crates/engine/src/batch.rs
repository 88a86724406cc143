//! Groups queued parts into batches for the sending workers.

use std::time::Duration;

use rand::Rng;
use sluice_protocol::constants::{MAX_PARTS_PER_BATCH, MIN_PARTS_PER_BATCH};
use sluice_transfer::Part;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Settings the batch builder runs with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchConfig {
    pub max_batch_len: usize,
    pub payload_len: usize,
    pub poll_interval: Duration,
    /// Bytes per second. 0 means unlimited.
    pub max_throughput: usize,
}

/// Draws a batch size uniformly from `[MIN_PARTS_PER_BATCH, cap]` where the
/// cap is the substrate's batch length bounded by [`MAX_PARTS_PER_BATCH`].
pub(crate) fn random_batch_size(max_batch_len: usize) -> usize {
    let cap = max_batch_len.clamp(MIN_PARTS_PER_BATCH, MAX_PARTS_PER_BATCH);
    rand::thread_rng().gen_range(MIN_PARTS_PER_BATCH..=cap)
}

/// Time to wait after handing off `bytes` so the average rate stays at or
/// below `max_throughput` bytes per second.
pub(crate) fn throughput_delay(bytes: usize, max_throughput: usize) -> Duration {
    if max_throughput == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(bytes as f64 / max_throughput as f64)
}

/// Pulls parts off `parts_rx` and forwards them to `batch_tx` in batches.
///
/// A batch is flushed once it reaches its drawn size or `poll_interval`
/// after its first part arrived, whichever comes first.
pub(crate) async fn batch_builder(
    mut parts_rx: mpsc::Receiver<Part>,
    batch_tx: mpsc::Sender<Vec<Part>>,
    config: BatchConfig,
    cancel: CancellationToken,
) {
    debug!(?config, "batch builder started");
    loop {
        let target = random_batch_size(config.max_batch_len);
        let mut batch = Vec::with_capacity(target);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            part = parts_rx.recv() => match part {
                Some(part) => batch.push(part),
                None => break,
            },
        }

        let deadline = Instant::now() + config.poll_interval;
        while batch.len() < target {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                part = parts_rx.recv() => match part {
                    Some(part) => batch.push(part),
                    None => break,
                },
                _ = sleep_until(deadline) => break,
            }
        }

        let bytes = batch.len() * config.payload_len;
        trace!(parts = batch.len(), target, "batch built");
        if batch_tx.send(batch).await.is_err() {
            break;
        }

        let delay = throughput_delay(bytes, config.max_throughput);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
    }
    debug!("batch builder stopped");
}
