//! Tracks sent batches and requeues parts whose arrival was never seen.

use std::time::Duration;

use sluice_transfer::{Part, SentPartStatus, TransferStatus};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// A batch handed to the substrate at `sent_at`.
#[derive(Debug)]
pub(crate) struct SentPacket {
    pub parts: Vec<Part>,
    pub sent_at: Instant,
}

/// Sleeps until the oldest packet's deadline, then moves every part of it
/// still waiting for confirmation back to `Unsent` and onto `parts_tx`.
pub(crate) async fn resend_checker(
    mut sent_rx: mpsc::Receiver<SentPacket>,
    parts_tx: mpsc::Sender<Part>,
    resend_wait: Duration,
    cancel: CancellationToken,
) {
    debug!(?resend_wait, "resend checker started");
    let mut pending: Vec<SentPacket> = Vec::new();

    loop {
        let next_deadline = pending.iter().map(|p| p.sent_at + resend_wait).min();
        let wait = async {
            match next_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = sent_rx.recv() => match packet {
                Some(packet) => pending.push(packet),
                None => break,
            },
            _ = wait => {
                let now = Instant::now();
                let (due, waiting): (Vec<_>, Vec<_>) = pending
                    .into_iter()
                    .partition(|p| p.sent_at + resend_wait <= now);
                pending = waiting;

                for packet in due {
                    if !requeue_unconfirmed(packet, &parts_tx).await {
                        debug!("resend checker stopped");
                        return;
                    }
                }
            }
        }
    }
    debug!("resend checker stopped");
}

/// Returns `false` once the batch queue is closed.
async fn requeue_unconfirmed(packet: SentPacket, parts_tx: &mpsc::Sender<Part>) -> bool {
    for part in packet.parts {
        if part.transfer().status() != TransferStatus::Running
            || part.status() != SentPartStatus::Sent
        {
            continue;
        }
        match part.mark_for_resend() {
            Ok(true) => {
                trace!(?part, "part timed out, resending");
                if parts_tx.send(part).await.is_err() {
                    return false;
                }
            }
            Ok(false) => {}
            Err(e) => error!(?part, "failed to reset part: {e}"),
        }
    }
    true
}
