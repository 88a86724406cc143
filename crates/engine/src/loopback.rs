//! In-process substrate for tests and the demo binary.
//!
//! A [`LoopbackNetwork`] connects any number of [`LoopbackSubstrate`]
//! nodes. Every payload that survives the drop filter is delivered to every
//! node listening on its recipient and fingerprint, and is also kept in a
//! mailbox so a node that registers the fingerprint later still picks it
//! up. The mailbox holds the most recent [`DEFAULT_MAILBOX_LEN`] payloads
//! unless configured otherwise; older ones are evicted first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use sluice_protocol::{Fingerprint, RecipientId};
use tracing::trace;

use crate::substrate::{Payload, PayloadProcessor, SendReport, Substrate, SubstrateError};

/// Decides whether the payload with the given network-wide index is lost.
pub type DropFilter = Box<dyn FnMut(u64, &Payload) -> bool + Send>;

type Route = (RecipientId, Fingerprint);

/// Payloads the mailbox retains by default.
pub const DEFAULT_MAILBOX_LEN: usize = 1 << 16;

/// Stored payloads in arrival order.
struct Mailbox {
    capacity: usize,
    payloads: HashMap<Route, Payload>,
    order: VecDeque<Route>,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            payloads: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, route: Route, payload: Payload) {
        if self.payloads.insert(route, payload).is_some() {
            return;
        }
        self.order.push_back(route);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.payloads.remove(&oldest);
            }
        }
    }

    fn get(&self, route: &Route) -> Option<Payload> {
        self.payloads.get(route).cloned()
    }
}

/// Shared medium between loopback nodes.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    payload_len: usize,
    batch_len: usize,
    healthy: AtomicBool,
    next_round: AtomicU64,
    next_payload: AtomicU64,
    failing_rounds: AtomicUsize,
    drop_filter: Mutex<Option<DropFilter>>,
    mailbox: Mutex<Mailbox>,
    nodes: Mutex<Vec<Weak<NodeInner>>>,
}

impl LoopbackNetwork {
    pub fn new(payload_len: usize, batch_len: usize) -> Self {
        Self::with_mailbox_len(payload_len, batch_len, DEFAULT_MAILBOX_LEN)
    }

    /// Creates a network whose mailbox keeps at most `mailbox_len` payloads.
    pub fn with_mailbox_len(payload_len: usize, batch_len: usize, mailbox_len: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                payload_len,
                batch_len,
                healthy: AtomicBool::new(true),
                next_round: AtomicU64::new(0),
                next_payload: AtomicU64::new(0),
                failing_rounds: AtomicUsize::new(0),
                drop_filter: Mutex::new(None),
                mailbox: Mutex::new(Mailbox::new(mailbox_len)),
                nodes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attaches a new node to the network.
    pub fn node(&self) -> LoopbackSubstrate {
        let node = Arc::new(NodeInner::default());
        let mut nodes = self.inner.nodes.lock().unwrap();
        nodes.retain(|n| n.strong_count() > 0);
        nodes.push(Arc::downgrade(&node));
        LoopbackSubstrate {
            network: Arc::clone(&self.inner),
            node,
        }
    }

    pub fn set_drop_filter(&self, filter: impl FnMut(u64, &Payload) -> bool + Send + 'static) {
        *self.inner.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.inner.drop_filter.lock().unwrap() = None;
    }

    /// Makes the next `rounds` batch sends fail.
    pub fn fail_next_rounds(&self, rounds: usize) {
        self.inner.failing_rounds.store(rounds, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Payloads accepted so far, dropped ones included.
    pub fn payloads_sent(&self) -> u64 {
        self.inner.next_payload.load(Ordering::SeqCst)
    }

    /// Payloads currently held for late registrations.
    pub fn mailbox_len(&self) -> usize {
        self.inner.mailbox.lock().unwrap().payloads.len()
    }
}

impl NetworkInner {
    fn take_failing_round(&self) -> bool {
        self.failing_rounds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn is_dropped(&self, index: u64, payload: &Payload) -> bool {
        match self.drop_filter.lock().unwrap().as_mut() {
            Some(filter) => filter(index, payload),
            None => false,
        }
    }

    fn listeners(&self, route: &Route) -> Vec<Arc<dyn PayloadProcessor>> {
        let nodes: Vec<Arc<NodeInner>> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        nodes.iter().filter_map(|n| n.processor(route)).collect()
    }
}

#[derive(Default)]
struct NodeInner {
    identities: Mutex<HashSet<RecipientId>>,
    processors: Mutex<HashMap<Route, Arc<dyn PayloadProcessor>>>,
}

impl NodeInner {
    fn processor(&self, route: &Route) -> Option<Arc<dyn PayloadProcessor>> {
        if !self.identities.lock().unwrap().contains(&route.0) {
            return None;
        }
        self.processors.lock().unwrap().get(route).cloned()
    }
}

/// One participant on a [`LoopbackNetwork`].
pub struct LoopbackSubstrate {
    network: Arc<NetworkInner>,
    node: Arc<NodeInner>,
}

impl LoopbackSubstrate {
    /// Fingerprints currently registered on this node.
    pub fn num_fingerprints(&self) -> usize {
        self.node.processors.lock().unwrap().len()
    }
}

fn deliver(processor: Arc<dyn PayloadProcessor>, payload: Payload) {
    tokio::spawn(async move { processor.process(&payload) });
}

#[async_trait]
impl Substrate for LoopbackSubstrate {
    fn max_payload_len(&self) -> usize {
        self.network.payload_len
    }

    fn max_batch_len(&self) -> usize {
        self.network.batch_len
    }

    fn is_healthy(&self) -> bool {
        self.network.healthy.load(Ordering::SeqCst)
    }

    async fn send_batch(
        &self,
        payloads: Vec<Payload>,
        _timeout: Duration,
    ) -> Result<SendReport, SubstrateError> {
        if !self.is_healthy() {
            return Err(SubstrateError::Unhealthy);
        }
        if payloads.len() > self.network.batch_len {
            return Err(SubstrateError::BatchTooLarge {
                got: payloads.len(),
                max: self.network.batch_len,
            });
        }

        let round_id = self.network.next_round.fetch_add(1, Ordering::SeqCst);
        if self.network.take_failing_round() {
            return Err(SubstrateError::RoundFailed(round_id));
        }

        for payload in payloads {
            let index = self.network.next_payload.fetch_add(1, Ordering::SeqCst);
            if self.network.is_dropped(index, &payload) {
                trace!(index, fingerprint = %payload.fingerprint, "payload dropped");
                continue;
            }

            let route = (payload.recipient, payload.fingerprint);
            self.network
                .mailbox
                .lock()
                .unwrap()
                .insert(route, payload.clone());
            for processor in self.network.listeners(&route) {
                deliver(processor, payload.clone());
            }
        }
        Ok(SendReport { round_id })
    }

    fn add_identity(&self, recipient: RecipientId) {
        self.node.identities.lock().unwrap().insert(recipient);
    }

    fn remove_identity(&self, recipient: &RecipientId) {
        self.node.identities.lock().unwrap().remove(recipient);
    }

    fn add_fingerprint(
        &self,
        recipient: RecipientId,
        fingerprint: Fingerprint,
        processor: Arc<dyn PayloadProcessor>,
    ) -> Result<(), SubstrateError> {
        let route = (recipient, fingerprint);
        {
            let mut processors = self.node.processors.lock().unwrap();
            if processors.contains_key(&route) {
                return Err(SubstrateError::FingerprintInUse(fingerprint));
            }
            processors.insert(route, Arc::clone(&processor));
        }

        let stored = self.network.mailbox.lock().unwrap().get(&route);
        if let Some(payload) = stored {
            if self.node.identities.lock().unwrap().contains(&recipient) {
                deliver(processor, payload);
            }
        }
        Ok(())
    }

    fn delete_fingerprint(&self, recipient: &RecipientId, fingerprint: &Fingerprint) {
        self.node
            .processors
            .lock()
            .unwrap()
            .remove(&(*recipient, *fingerprint));
    }

    fn delete_client_fingerprints(&self, recipient: &RecipientId) {
        self.node
            .processors
            .lock()
            .unwrap()
            .retain(|(r, _), _| r != recipient);
    }
}
