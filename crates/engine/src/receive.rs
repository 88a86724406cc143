//! Inbound part handling.

use std::sync::{Arc, Weak};

use sluice_protocol::PartMessage;
use sluice_transfer::{CallbackManager, Cypher, ReceivedTransfer};
use tracing::{error, trace, warn};

use crate::substrate::{Payload, PayloadProcessor, Substrate};

/// Bound to one fingerprint of one incoming transfer. Unregisters itself
/// from the substrate once its part is stored.
pub(crate) struct PartProcessor {
    pub cypher: Cypher,
    pub transfer: Arc<ReceivedTransfer>,
    pub callbacks: Arc<CallbackManager>,
    pub substrate: Weak<dyn Substrate>,
}

impl PayloadProcessor for PartProcessor {
    fn process(&self, payload: &Payload) {
        let file_id = self.transfer.file_id();
        let fp_num = self.cypher.fp_num();

        let plaintext = match self
            .cypher
            .decrypt(&payload.payload, &payload.mac, &payload.fingerprint)
        {
            Ok(p) => p,
            Err(e) => {
                warn!(%file_id, fp_num, "dropping undecryptable part: {e}");
                return;
            }
        };

        let msg = match PartMessage::unmarshal(&plaintext) {
            Ok(m) => m,
            Err(e) => {
                warn!(%file_id, fp_num, "dropping malformed part: {e}");
                return;
            }
        };

        let part_num = msg.part_num();
        if let Err(e) = self.transfer.add_part(msg.part().to_vec(), part_num) {
            warn!(%file_id, part_num, "failed to add part: {e}");
            return;
        }
        if let Err(e) = self.transfer.mark_fingerprint_used(fp_num) {
            error!(%file_id, fp_num, "failed to retire fingerprint: {e}");
        }
        if let Some(substrate) = self.substrate.upgrade() {
            substrate.delete_fingerprint(&self.transfer.recipient(), &self.cypher.fingerprint());
        }

        trace!(%file_id, part_num, fp_num, "part received");
        self.callbacks.call(&file_id, None);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use sluice_protocol::types::ID_LEN;
    use sluice_protocol::{RecipientId, TransferId, TransferKey};
    use sluice_storage::Kv;
    use sluice_transfer::ReceivedStore;

    use super::*;
    use crate::loopback::{LoopbackNetwork, LoopbackSubstrate};

    const KEY: TransferKey = TransferKey::new([5; ID_LEN]);

    fn received() -> Arc<ReceivedTransfer> {
        let store = ReceivedStore::new_or_load(&Kv::memory()).unwrap();
        store
            .add_transfer(
                TransferId::from_file(b"inbound"),
                RecipientId::new([1; ID_LEN]),
                KEY,
                vec![0; 32],
                6,
                2,
                3,
            )
            .unwrap()
    }

    fn sealed(cypher: &Cypher, part_num: u16, part: &[u8]) -> Payload {
        let mut msg = PartMessage::new(5).unwrap();
        msg.set_part_num(part_num);
        msg.set_part(part);
        let sealed = cypher.encrypt(msg.marshal()).unwrap();
        Payload {
            recipient: RecipientId::new([1; ID_LEN]),
            fingerprint: sealed.fingerprint,
            payload: sealed.ciphertext,
            mac: sealed.mac,
        }
    }

    fn processor(transfer: &Arc<ReceivedTransfer>, fp_num: u16) -> (PartProcessor, Arc<AtomicU32>) {
        let substrate: Weak<LoopbackSubstrate> = Weak::new();
        bound_processor(transfer, fp_num, substrate)
    }

    fn bound_processor(
        transfer: &Arc<ReceivedTransfer>,
        fp_num: u16,
        substrate: Weak<dyn Substrate>,
    ) -> (PartProcessor, Arc<AtomicU32>) {
        let callbacks = Arc::new(CallbackManager::new());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        callbacks.add_callback(
            transfer.file_id(),
            Arc::new(move |_: Option<&sluice_transfer::TransferError>| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::ZERO,
        );
        let p = PartProcessor {
            cypher: Cypher::new(KEY, fp_num),
            transfer: Arc::clone(transfer),
            callbacks,
            substrate,
        };
        (p, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn valid_part_is_stored_and_reported() {
        let transfer = received();
        let (p, calls) = processor(&transfer, 2);

        p.process(&sealed(&Cypher::new(KEY, 2), 1, b"def"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transfer.part_statuses(), vec![false, true]);
        assert_eq!(transfer.unused_cyphers().len(), 2);
        // Registration call plus the arrival.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tampered_part_is_dropped() {
        let transfer = received();
        let (p, calls) = processor(&transfer, 0);

        let mut payload = sealed(&Cypher::new(KEY, 0), 0, b"abc");
        payload.mac[0] ^= 0xff;
        p.process(&payload);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transfer.num_received(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_fingerprint_is_dropped() {
        let transfer = received();
        let (p, _) = processor(&transfer, 0);

        p.process(&sealed(&Cypher::new(KEY, 1), 0, b"abc"));

        assert_eq!(transfer.num_received(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_part_is_dropped() {
        let transfer = received();
        let (p, _) = processor(&transfer, 0);

        p.process(&sealed(&Cypher::new(KEY, 0), 7, b"abc"));

        assert_eq!(transfer.num_received(), 0);
        assert_eq!(transfer.unused_cyphers().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_part_unregisters_its_fingerprint() {
        let transfer = received();
        let network = LoopbackNetwork::new(34, 4);
        let node: Arc<dyn Substrate> = Arc::new(network.node());
        let (p, _) = bound_processor(&transfer, 1, Arc::downgrade(&node));
        let p = Arc::new(p);
        let fingerprint = p.cypher.fingerprint();
        node.add_identity(transfer.recipient());
        node.add_fingerprint(transfer.recipient(), fingerprint, p.clone())
            .unwrap();

        p.process(&sealed(&Cypher::new(KEY, 1), 0, b"abc"));

        assert_eq!(transfer.part_statuses(), vec![true, false]);
        // A second registration only succeeds once the first is gone.
        assert!(
            node.add_fingerprint(transfer.recipient(), fingerprint, p.clone())
                .is_ok()
        );
    }
}
