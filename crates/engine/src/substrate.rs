//! The messaging substrate the engine transmits through.
//!
//! A substrate delivers small fixed-size payloads addressed to a recipient
//! identity and tagged with a fingerprint. Receivers register a processor
//! per expected fingerprint; the substrate hands each arriving payload to
//! the processor registered for its fingerprint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_protocol::{Fingerprint, RecipientId};

/// One encrypted part on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub recipient: RecipientId,
    pub fingerprint: Fingerprint,
    pub payload: Vec<u8>,
    pub mac: Vec<u8>,
}

/// Outcome of a successful batch send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub round_id: u64,
}

/// Errors reported by a substrate.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("network is not healthy")]
    Unhealthy,

    #[error("round {0} failed")]
    RoundFailed(u64),

    #[error("batch of {got} payloads exceeds capacity of {max}")]
    BatchTooLarge { got: usize, max: usize },

    #[error("fingerprint {0} is already registered")]
    FingerprintInUse(Fingerprint),

    #[error("send timed out")]
    Timeout,
}

/// Handles payloads arriving on one registered fingerprint.
pub trait PayloadProcessor: Send + Sync {
    fn process(&self, payload: &Payload);
}

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Size of every payload in bytes.
    fn max_payload_len(&self) -> usize;

    /// Most payloads one send may carry.
    fn max_batch_len(&self) -> usize;

    fn is_healthy(&self) -> bool;

    /// Transmits a batch. Success means the substrate accepted it, not that
    /// anything arrived.
    async fn send_batch(
        &self,
        payloads: Vec<Payload>,
        timeout: Duration,
    ) -> Result<SendReport, SubstrateError>;

    /// Starts listening on `recipient`.
    fn add_identity(&self, recipient: RecipientId);

    fn remove_identity(&self, recipient: &RecipientId);

    fn add_fingerprint(
        &self,
        recipient: RecipientId,
        fingerprint: Fingerprint,
        processor: Arc<dyn PayloadProcessor>,
    ) -> Result<(), SubstrateError>;

    fn delete_fingerprint(&self, recipient: &RecipientId, fingerprint: &Fingerprint);

    /// Removes every fingerprint registered for `recipient`.
    fn delete_client_fingerprints(&self, recipient: &RecipientId);
}
