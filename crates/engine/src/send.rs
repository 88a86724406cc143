//! Sending workers: encrypt a batch of parts and hand it to the substrate.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use sluice_protocol::TransferId;
use sluice_transfer::{CallbackManager, Part, SentPartStatus, TransferError, TransferStatus};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::resend::SentPacket;
use crate::substrate::{Payload, Substrate, SubstrateError};

/// Everything a worker needs besides its queue.
pub(crate) struct PipelineCtx {
    pub substrate: Arc<dyn Substrate>,
    pub send_timeout: Duration,
    pub sent_callbacks: Arc<CallbackManager>,
    /// Requeue path for batches the substrate rejected.
    pub parts_tx: mpsc::Sender<Part>,
    pub sent_tx: mpsc::Sender<SentPacket>,
}

/// Runs until cancelled or the batch queue closes. Workers share one
/// receiver.
pub(crate) async fn sending_worker(
    id: usize,
    batches: Arc<Mutex<mpsc::Receiver<Vec<Part>>>>,
    ctx: Arc<PipelineCtx>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "sending worker started");
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            batch = async { batches.lock().await.recv().await } => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        ctx.send_batch(batch, &cancel).await;
    }
    debug!(worker = id, "sending worker stopped");
}

impl PipelineCtx {
    pub(crate) async fn send_batch(&self, batch: Vec<Part>, cancel: &CancellationToken) {
        let (payloads, parts) = self.encrypt_batch(batch);
        if payloads.is_empty() {
            return;
        }

        let count = payloads.len();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(
                self.send_timeout,
                self.substrate.send_batch(payloads, self.send_timeout),
            ) => result.unwrap_or(Err(SubstrateError::Timeout)),
        };

        match result {
            Ok(report) => {
                debug!(round = report.round_id, parts = count, "batch sent");
                self.on_sent(parts).await;
            }
            Err(e) => {
                warn!(parts = count, "batch send failed: {e}");
                self.requeue(parts).await;
            }
        }
    }

    /// Seals every part that still needs sending. Parts of transfers that
    /// are no longer running, or that are no longer unsent, are dropped.
    fn encrypt_batch(&self, batch: Vec<Part>) -> (Vec<Payload>, Vec<Part>) {
        let payload_len = self.substrate.max_payload_len();
        let mut payloads = Vec::with_capacity(batch.len());
        let mut parts = Vec::with_capacity(batch.len());

        for part in batch {
            if part.transfer().status() != TransferStatus::Running
                || part.status() != SentPartStatus::Unsent
            {
                trace!(?part, "skipping part");
                continue;
            }

            match part.encrypted(payload_len) {
                Ok(sealed) => {
                    payloads.push(Payload {
                        recipient: part.recipient(),
                        fingerprint: sealed.fingerprint,
                        payload: sealed.ciphertext,
                        mac: sealed.mac,
                    });
                    parts.push(part);
                }
                Err(TransferError::FingerprintsExhausted) => {
                    self.sent_callbacks.call(
                        &part.file_id(),
                        Some(Arc::new(TransferError::FingerprintsExhausted)),
                    );
                }
                Err(e) => {
                    error!(file_id = %part.file_id(), part_num = part.part_num(), "failed to encrypt part: {e}");
                }
            }
        }
        (payloads, parts)
    }

    async fn on_sent(&self, parts: Vec<Part>) {
        let mut files: BTreeSet<TransferId> = BTreeSet::new();
        for part in &parts {
            if let Err(e) = part.mark_sent() {
                error!(?part, "failed to mark part sent: {e}");
            }
            files.insert(part.file_id());
        }
        for file_id in &files {
            self.sent_callbacks.call(file_id, None);
        }

        let packet = SentPacket {
            parts,
            sent_at: Instant::now(),
        };
        if self.sent_tx.send(packet).await.is_err() {
            debug!("sent queue closed");
        }
    }

    async fn requeue(&self, parts: Vec<Part>) {
        for part in parts {
            if let Err(e) = part.mark_for_resend() {
                error!(?part, "failed to reset part: {e}");
            }
            if self.parts_tx.send(part).await.is_err() {
                debug!("batch queue closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use sluice_protocol::types::ID_LEN;
    use sluice_protocol::{RecipientId, TransferId, TransferKey};
    use sluice_storage::Kv;
    use sluice_transfer::{SentStore, SentTransfer};

    use super::*;
    use crate::loopback::LoopbackNetwork;

    struct Harness {
        network: LoopbackNetwork,
        ctx: PipelineCtx,
        parts_rx: mpsc::Receiver<Part>,
        sent_rx: mpsc::Receiver<SentPacket>,
        transfer: Arc<SentTransfer>,
    }

    fn harness(num_parts: usize, retry: f32) -> Harness {
        let network = LoopbackNetwork::new(34, 11);
        let store = SentStore::new_or_load(&Kv::memory()).unwrap();
        let data: Vec<Vec<u8>> = (0..num_parts).map(|i| vec![i as u8; 32]).collect();
        let transfer = store
            .add_transfer(
                TransferId::from_file(b"worker"),
                RecipientId::new([1; ID_LEN]),
                TransferKey::new([2; ID_LEN]),
                vec![0; 32],
                (num_parts * 32) as u32,
                data,
                retry,
            )
            .unwrap();

        let (parts_tx, parts_rx) = mpsc::channel(64);
        let (sent_tx, sent_rx) = mpsc::channel(64);
        Harness {
            ctx: PipelineCtx {
                substrate: Arc::new(network.node()),
                send_timeout: Duration::from_millis(500),
                sent_callbacks: Arc::new(CallbackManager::new()),
                parts_tx,
                sent_tx,
            },
            network,
            parts_rx,
            sent_rx,
            transfer,
        }
    }

    #[tokio::test]
    async fn successful_batch_marks_parts_sent() {
        let mut h = harness(3, 0.0);
        let cancel = CancellationToken::new();

        h.ctx.send_batch(h.transfer.unsent_parts(), &cancel).await;

        assert_eq!(h.transfer.num_sent(), 3);
        assert_eq!(h.network.payloads_sent(), 3);
        let packet = h.sent_rx.try_recv().unwrap();
        assert_eq!(packet.parts.len(), 3);
    }

    #[tokio::test]
    async fn failed_batch_requeues_parts() {
        let mut h = harness(2, 1.0);
        let cancel = CancellationToken::new();
        h.network.fail_next_rounds(1);

        h.ctx.send_batch(h.transfer.unsent_parts(), &cancel).await;

        assert_eq!(h.transfer.num_sent(), 0);
        assert!(h.sent_rx.try_recv().is_err());
        let mut requeued = Vec::new();
        while let Ok(part) = h.parts_rx.try_recv() {
            requeued.push(part.part_num());
        }
        assert_eq!(requeued, vec![0, 1]);
        // The failed round still spent two fingerprints.
        assert_eq!(h.transfer.num_available_fps(), 2);
    }

    #[tokio::test]
    async fn received_parts_are_skipped() {
        let mut h = harness(2, 0.0);
        let cancel = CancellationToken::new();
        h.transfer.mark_received(0).unwrap();

        h.ctx.send_batch(h.transfer.unsent_parts(), &cancel).await;
        h.ctx
            .send_batch(vec![h.transfer.sent_parts().remove(0)], &cancel)
            .await;

        assert_eq!(h.network.payloads_sent(), 1);
        assert_eq!(h.sent_rx.try_recv().unwrap().parts.len(), 1);
        assert!(h.sent_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_fails_transfer_and_reports_once() {
        let h = harness(1, 0.0);
        let cancel = CancellationToken::new();
        let errors = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&errors);
        h.ctx.sent_callbacks.add_callback(
            h.transfer.file_id(),
            Arc::new(move |err: Option<&TransferError>| {
                if err.is_some() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Duration::ZERO,
        );

        let part = h.transfer.unsent_parts().remove(0);
        h.ctx.send_batch(vec![part.clone()], &cancel).await;
        part.mark_for_resend().unwrap();
        h.ctx.send_batch(vec![part.clone(), part], &cancel).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(h.transfer.status(), TransferStatus::Failed);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
