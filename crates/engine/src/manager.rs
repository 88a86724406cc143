//! The transfer manager: public entry point for sending and receiving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use sluice_protocol::constants::{BATCH_QUEUE_LEN, SEND_QUEUE_LEN, SENT_QUEUE_LEN};
use sluice_protocol::{FileInfo, FileLink, PART_NUM_LEN, TransferId};
use sluice_storage::Kv;
use sluice_transfer::{
    CallbackManager, Part, ReceivedProgress, ReceivedStore, ReceivedTransfer, SentPartStatus,
    SentProgress, SentStore, SentTransfer, TrackedCallback, TransferError, TransferStatus,
    partition_file, transfer_mac, validate_file_info, validate_handshake, validate_handshake_len,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::EngineError;
use crate::batch::{BatchConfig, batch_builder};
use crate::keys::{generate_recipient_id, generate_transfer_key};
use crate::params::Params;
use crate::receive::PartProcessor;
use crate::resend::{SentPacket, resend_checker};
use crate::send::{PipelineCtx, sending_worker};
use crate::substrate::Substrate;

/// Receives sent-side progress.
pub type SentProgressCallback = Arc<dyn Fn(&SentProgress) + Send + Sync>;

/// Receives received-side progress.
pub type ReceivedProgressCallback = Arc<dyn Fn(&ReceivedProgress) + Send + Sync>;

/// Called once when every part of a send has been seen arriving.
pub type SendCompleteCallback = Box<dyn FnOnce(FileLink) + Send>;

/// A file to send.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub file_name: String,
    pub file_type: String,
    pub file_data: Vec<u8>,
    pub preview: Vec<u8>,
    /// Extra fingerprints to budget, as a fraction of the part count.
    pub retry: f32,
}

/// Sends and receives files over a [`Substrate`].
///
/// Outgoing parts flow through three tasks started by [`start`](Self::start):
/// a batch builder, a pool of sending workers and a resend checker. State is
/// persisted under the `Kv` passed to [`new`](Self::new), so a manager
/// created over the same storage after a restart picks up where the
/// previous one stopped.
pub struct Manager {
    shared: Arc<Shared>,
    pipeline: Mutex<PipelineState>,
}

struct Shared {
    params: Params,
    substrate: Arc<dyn Substrate>,
    sent: SentStore,
    received: ReceivedStore,
    sent_callbacks: Arc<CallbackManager>,
    received_callbacks: Arc<CallbackManager>,
    on_complete: Mutex<HashMap<TransferId, SendCompleteCallback>>,
    parts_tx: mpsc::Sender<Part>,
    sent_tx: mpsc::Sender<SentPacket>,
}

enum PipelineState {
    Idle(Queues),
    Running(Tasks),
    Stopped,
}

struct Queues {
    parts_rx: mpsc::Receiver<Part>,
    sent_rx: mpsc::Receiver<SentPacket>,
}

struct Tasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Manager {
    /// Opens the transfer stores under `kv`. Nothing is sent until
    /// [`start`](Self::start) is called.
    pub fn new(
        params: Params,
        substrate: Arc<dyn Substrate>,
        kv: &Kv,
    ) -> Result<Self, EngineError> {
        let sent = SentStore::new_or_load(kv)?;
        let received = ReceivedStore::new_or_load(kv)?;
        let (parts_tx, parts_rx) = mpsc::channel(BATCH_QUEUE_LEN);
        let (sent_tx, sent_rx) = mpsc::channel(SENT_QUEUE_LEN);

        debug!(
            sent = sent.len(),
            received = received.len(),
            "transfer manager created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                params,
                substrate,
                sent,
                received,
                sent_callbacks: Arc::new(CallbackManager::new()),
                received_callbacks: Arc::new(CallbackManager::new()),
                on_complete: Mutex::new(HashMap::new()),
                parts_tx,
                sent_tx,
            }),
            pipeline: Mutex::new(PipelineState::Idle(Queues { parts_rx, sent_rx })),
        })
    }

    /// Spawns the send pipeline and resumes every transfer loaded from
    /// storage.
    pub async fn start(&self) -> Result<(), EngineError> {
        let queues = {
            let mut pipeline = self.pipeline.lock().unwrap();
            match std::mem::replace(&mut *pipeline, PipelineState::Stopped) {
                PipelineState::Idle(queues) => queues,
                other => {
                    *pipeline = other;
                    return Err(EngineError::AlreadyStarted);
                }
            }
        };

        let tasks = self.spawn_pipeline(queues);
        *self.pipeline.lock().unwrap() = PipelineState::Running(tasks);

        self.shared.resume().await;
        info!(
            workers = self.shared.params.worker_pool_size,
            "transfer manager started"
        );
        Ok(())
    }

    fn spawn_pipeline(&self, queues: Queues) -> Tasks {
        let shared = &self.shared;
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let (batch_tx, batch_rx) = mpsc::channel(SEND_QUEUE_LEN);
        let config = BatchConfig {
            max_batch_len: shared.substrate.max_batch_len(),
            payload_len: shared.substrate.max_payload_len(),
            poll_interval: shared.params.batch_poll_interval,
            max_throughput: shared.params.max_throughput,
        };
        handles.push(tokio::spawn(batch_builder(
            queues.parts_rx,
            batch_tx,
            config,
            cancel.child_token(),
        )));

        let ctx = Arc::new(PipelineCtx {
            substrate: Arc::clone(&shared.substrate),
            send_timeout: shared.params.send_timeout,
            sent_callbacks: Arc::clone(&shared.sent_callbacks),
            parts_tx: shared.parts_tx.clone(),
            sent_tx: shared.sent_tx.clone(),
        });
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
        let workers = cancel.child_token();
        for id in 0..shared.params.worker_pool_size.max(1) {
            handles.push(tokio::spawn(sending_worker(
                id,
                Arc::clone(&batch_rx),
                Arc::clone(&ctx),
                workers.clone(),
            )));
        }

        handles.push(tokio::spawn(resend_checker(
            queues.sent_rx,
            shared.parts_tx.clone(),
            shared.params.resend_wait,
            cancel.child_token(),
        )));

        Tasks { cancel, handles }
    }

    /// Cancels the pipeline, waits for its tasks and flushes every pending
    /// progress callback. In-flight batches are abandoned; their parts are
    /// resumed from storage by the next manager.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let tasks = {
            let mut pipeline = self.pipeline.lock().unwrap();
            match std::mem::replace(&mut *pipeline, PipelineState::Stopped) {
                PipelineState::Running(tasks) => tasks,
                other => {
                    *pipeline = other;
                    return Err(EngineError::NotStarted);
                }
            }
        };

        tasks.cancel.cancel();
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                error!("pipeline task panicked: {e}");
            }
        }

        for transfer in self.shared.sent.transfers() {
            self.shared.sent_callbacks.delete(&transfer.file_id());
        }
        for transfer in self.shared.received.transfers() {
            self.shared.received_callbacks.delete(&transfer.file_id());
        }
        info!("transfer manager stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Starts sending a file and returns the handshake the receiver needs.
    ///
    /// `progress` is called at most once per `period`. `on_complete` fires
    /// once every part has been seen arriving.
    pub async fn send(
        &self,
        request: SendRequest,
        progress: SentProgressCallback,
        period: Duration,
        on_complete: Option<SendCompleteCallback>,
    ) -> Result<FileInfo, EngineError> {
        validate_file_info(
            &request.file_name,
            &request.file_type,
            &request.file_data,
            &request.preview,
        )?;
        if !self.shared.substrate.is_healthy() {
            return Err(EngineError::NetworkUnhealthy);
        }

        let key = generate_transfer_key();
        let recipient = generate_recipient_id();
        let file_id = TransferId::from_file(&request.file_data);
        let mac = transfer_mac(&key, &request.file_data).map_err(TransferError::from)?;
        let part_size = self
            .shared
            .substrate
            .max_payload_len()
            .saturating_sub(PART_NUM_LEN);
        let parts = partition_file(&request.file_data, part_size)?;

        let mut info = FileInfo {
            file_name: request.file_name,
            file_type: request.file_type,
            preview: request.preview,
            file_link: FileLink {
                file_id,
                recipient_id: recipient,
                sent_timestamp: Utc::now(),
                key,
                mac: mac.clone(),
                size: request.file_data.len() as u32,
                num_parts: parts.len() as u16,
                retry: request.retry,
            },
        };
        validate_handshake_len(&info)?;

        let transfer = self.shared.sent.add_transfer(
            file_id,
            recipient,
            key,
            mac,
            request.file_data.len() as u32,
            parts,
            request.retry,
        )?;

        if let Err(e) = self.shared.track_arrivals(&transfer) {
            if let Err(e) = self.shared.sent.remove_transfer(&file_id) {
                error!(%file_id, "failed to roll back transfer: {e}");
            }
            return Err(e);
        }

        if let Some(cb) = on_complete {
            self.shared.on_complete.lock().unwrap().insert(file_id, cb);
        }
        self.shared.add_sent_callback(&transfer, progress, period);
        self.shared.enqueue(transfer.unsent_parts()).await;

        info!(
            %file_id,
            name = %info.file_name,
            size = request.file_data.len(),
            parts = transfer.num_parts(),
            fingerprints = transfer.num_fps(),
            "send started"
        );
        info.file_link = transfer.file_link();
        Ok(info)
    }

    /// Attaches another progress callback to an existing send, for example
    /// after a restart.
    pub fn register_sent_progress_callback(
        &self,
        file_id: &TransferId,
        progress: SentProgressCallback,
        period: Duration,
    ) -> Result<(), EngineError> {
        let transfer = self.shared.sent.get_transfer(file_id)?;
        self.shared.add_sent_callback(&transfer, progress, period);
        Ok(())
    }

    /// Forgets a completed or failed send and deletes its state.
    pub fn close_send(&self, file_id: &TransferId) -> Result<(), EngineError> {
        let transfer = self.shared.sent.get_transfer(file_id)?;
        if transfer.status() == TransferStatus::Running {
            return Err(TransferError::NotFinished(*file_id).into());
        }

        self.shared.stop_tracking(&transfer);
        self.shared.sent_callbacks.delete(file_id);
        self.shared.on_complete.lock().unwrap().remove(file_id);
        self.shared.sent.remove_transfer(file_id)?;
        info!(%file_id, status = %transfer.status(), "send closed");
        Ok(())
    }

    /// Sends a failed file again from its stored parts with a fresh key,
    /// recipient and fingerprint budget. Name, type and preview come from
    /// `file_info`.
    pub async fn retry_failed_send(
        &self,
        file_info: &FileInfo,
        progress: SentProgressCallback,
        period: Duration,
        on_complete: Option<SendCompleteCallback>,
    ) -> Result<FileInfo, EngineError> {
        let file_id = file_info.file_link.file_id;
        let transfer = self.shared.sent.get_transfer(&file_id)?;
        if transfer.status() != TransferStatus::Failed {
            return Err(EngineError::NotFailed(file_id));
        }

        let request = SendRequest {
            file_name: file_info.file_name.clone(),
            file_type: file_info.file_type.clone(),
            file_data: transfer.file_data(),
            preview: file_info.preview.clone(),
            retry: transfer.retry(),
        };
        self.close_send(&file_id)?;
        debug!(%file_id, "retrying failed send");
        self.send(request, progress, period, on_complete).await
    }

    pub fn sent_transfer(&self, file_id: &TransferId) -> Result<Arc<SentTransfer>, EngineError> {
        Ok(self.shared.sent.get_transfer(file_id)?)
    }

    /// Sends that have not been closed.
    pub fn in_progress_sends(&self) -> Vec<TransferId> {
        self.shared
            .sent
            .transfers()
            .iter()
            .map(|t| t.file_id())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Registers for the parts of the transfer described by a marshalled
    /// [`FileInfo`].
    pub fn handle_incoming_transfer(
        &self,
        file_info: &[u8],
        progress: ReceivedProgressCallback,
        period: Duration,
    ) -> Result<TransferId, EngineError> {
        let info = FileInfo::unmarshal(file_info)?;
        validate_handshake(&info)?;

        let link = &info.file_link;
        let file_id = link.file_id;
        let transfer = self.shared.received.add_transfer(
            file_id,
            link.recipient_id,
            link.key,
            link.mac.clone(),
            link.size,
            link.num_parts,
            link.num_fingerprints(),
        )?;

        self.shared.add_received_callback(&transfer, progress, period);
        if let Err(e) = self.shared.listen(&transfer) {
            self.shared.forget_received(&transfer);
            return Err(e);
        }

        info!(
            %file_id,
            name = %info.file_name,
            size = link.size,
            parts = link.num_parts,
            "receive started"
        );
        Ok(file_id)
    }

    /// Attaches another progress callback to an incoming transfer.
    pub fn register_received_progress_callback(
        &self,
        file_id: &TransferId,
        progress: ReceivedProgressCallback,
        period: Duration,
    ) -> Result<(), EngineError> {
        let transfer = self.shared.received.get_transfer(file_id)?;
        self.shared.add_received_callback(&transfer, progress, period);
        Ok(())
    }

    /// Returns a completed file and deletes its transfer state.
    pub fn receive(&self, file_id: &TransferId) -> Result<Vec<u8>, EngineError> {
        let transfer = self.shared.received.get_transfer(file_id)?;
        if !transfer.is_complete() {
            return Err(TransferError::Incomplete {
                received: transfer.num_received(),
                total: transfer.num_parts(),
            }
            .into());
        }

        let file = transfer.get_file();
        transfer.verify_file(&file)?;

        self.shared.forget_received(&transfer);
        info!(%file_id, size = file.len(), "file received");
        Ok(file)
    }

    pub fn received_transfer(
        &self,
        file_id: &TransferId,
    ) -> Result<Arc<ReceivedTransfer>, EngineError> {
        Ok(self.shared.received.get_transfer(file_id)?)
    }

    /// Incoming transfers not yet collected with [`receive`](Self::receive).
    pub fn in_progress_receives(&self) -> Vec<TransferId> {
        self.shared
            .received
            .transfers()
            .iter()
            .map(|t| t.file_id())
            .filter(|id| self.shared.sent.get_transfer(id).is_err())
            .collect()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Ok(PipelineState::Running(tasks)) = self.pipeline.get_mut() {
            tasks.cancel.cancel();
        }
    }
}

impl Shared {
    async fn enqueue(&self, parts: Vec<Part>) {
        for part in parts {
            if self.parts_tx.send(part).await.is_err() {
                warn!("batch queue closed");
                return;
            }
        }
    }

    /// Re-registers everything loaded from storage.
    async fn resume(self: &Arc<Self>) {
        for transfer in self.sent.transfers() {
            let file_id = transfer.file_id();
            match transfer.status() {
                TransferStatus::Completed => {
                    self.finish_send(&transfer);
                    continue;
                }
                TransferStatus::Failed => continue,
                TransferStatus::Running => {}
            }

            let tracking = match self.received.get_transfer(&file_id) {
                Ok(tracker) => self.listen(&tracker).map(|()| self.add_arrival_callback(file_id)),
                Err(_) => self.track_arrivals(&transfer),
            };
            if let Err(e) = tracking {
                error!(%file_id, "failed to resume arrival tracking: {e}");
                continue;
            }

            self.enqueue(transfer.unsent_parts()).await;
            let waiting = transfer.sent_parts();
            if !waiting.is_empty() {
                let packet = SentPacket {
                    parts: waiting,
                    sent_at: Instant::now(),
                };
                if self.sent_tx.send(packet).await.is_err() {
                    warn!("sent queue closed");
                }
            }
            self.check_arrivals(&file_id);
            debug!(%file_id, "send resumed");
        }

        for transfer in self.received.transfers() {
            let file_id = transfer.file_id();
            if self.sent.get_transfer(&file_id).is_ok() || transfer.is_complete() {
                continue;
            }
            if let Err(e) = self.listen(&transfer) {
                error!(%file_id, "failed to resume receive: {e}");
                continue;
            }
            debug!(%file_id, "receive resumed");
        }
    }

    // -----------------------------------------------------------------------
    // Arrival tracking
    // -----------------------------------------------------------------------

    /// Listens on the send's own recipient so arriving parts can be
    /// confirmed.
    fn track_arrivals(self: &Arc<Self>, transfer: &SentTransfer) -> Result<(), EngineError> {
        let file_id = transfer.file_id();
        let tracker = self.received.add_transfer(
            file_id,
            transfer.recipient(),
            *transfer.key(),
            transfer.mac().to_vec(),
            transfer.file_size(),
            transfer.num_parts(),
            transfer.num_fps(),
        )?;
        if let Err(e) = self.listen(&tracker) {
            self.forget_received(&tracker);
            return Err(e);
        }
        self.add_arrival_callback(file_id);
        Ok(())
    }

    fn add_arrival_callback(self: &Arc<Self>, file_id: TransferId) {
        let shared: Weak<Shared> = Arc::downgrade(self);
        let cb: TrackedCallback = Arc::new(move |_: Option<&TransferError>| {
            if let Some(shared) = shared.upgrade() {
                shared.check_arrivals(&file_id);
            }
        });
        self.received_callbacks
            .add_callback(file_id, cb, Duration::ZERO);
    }

    /// Marks every part the arrival tracker has seen as received.
    fn check_arrivals(&self, file_id: &TransferId) {
        let (Ok(tracker), Ok(transfer)) = (
            self.received.get_transfer(file_id),
            self.sent.get_transfer(file_id),
        ) else {
            return;
        };

        let mut changed = false;
        let mut completed = false;
        for (part_num, arrived) in tracker.part_statuses().into_iter().enumerate() {
            let part_num = part_num as u16;
            if !arrived || transfer.part_status(part_num) == Some(SentPartStatus::Received) {
                continue;
            }
            match transfer.mark_received(part_num) {
                Ok(done) => {
                    changed = true;
                    completed |= done;
                }
                Err(e) => error!(%file_id, part_num, "failed to confirm part: {e}"),
            }
        }

        if completed {
            self.finish_send(&transfer);
        } else if changed {
            self.sent_callbacks.call(file_id, None);
        }
    }

    /// Tears down arrival tracking of a completed send, reports the final
    /// progress and fires its completion callback.
    fn finish_send(&self, transfer: &SentTransfer) {
        let file_id = transfer.file_id();
        match self.received.get_transfer(&file_id) {
            Ok(tracker) => self.forget_received(&tracker),
            Err(_) => return,
        }

        self.sent_callbacks.call(&file_id, None);
        let on_complete = self.on_complete.lock().unwrap().remove(&file_id);
        if let Some(cb) = on_complete {
            cb(transfer.file_link());
        }
        info!(%file_id, "send completed");
    }

    fn stop_tracking(&self, transfer: &SentTransfer) {
        if let Ok(tracker) = self.received.get_transfer(&transfer.file_id()) {
            self.forget_received(&tracker);
        }
    }

    // -----------------------------------------------------------------------
    // Registration helpers
    // -----------------------------------------------------------------------

    /// Registers a processor for every fingerprint not yet seen.
    fn listen(&self, transfer: &Arc<ReceivedTransfer>) -> Result<(), EngineError> {
        let recipient = transfer.recipient();
        self.substrate.add_identity(recipient);
        for cypher in transfer.unused_cyphers() {
            let fingerprint = cypher.fingerprint();
            let processor = Arc::new(PartProcessor {
                cypher,
                transfer: Arc::clone(transfer),
                callbacks: Arc::clone(&self.received_callbacks),
                substrate: Arc::downgrade(&self.substrate),
            });
            self.substrate
                .add_fingerprint(recipient, fingerprint, processor)?;
        }
        Ok(())
    }

    /// Removes an incoming transfer from the store, the substrate and the
    /// callback manager. The store entry goes first so callbacks flushed
    /// during teardown no longer find it.
    fn forget_received(&self, transfer: &ReceivedTransfer) {
        let file_id = transfer.file_id();
        let recipient = transfer.recipient();
        if let Err(e) = self.received.remove_transfer(&file_id) {
            error!(%file_id, "failed to remove received transfer: {e}");
        }
        self.received_callbacks.delete(&file_id);
        self.substrate.delete_client_fingerprints(&recipient);
        self.substrate.remove_identity(&recipient);
    }

    fn add_sent_callback(
        &self,
        transfer: &Arc<SentTransfer>,
        progress: SentProgressCallback,
        period: Duration,
    ) {
        let id = transfer.new_callback_id();
        let t = Arc::clone(transfer);
        let cb: TrackedCallback = Arc::new(move |err: Option<&TransferError>| {
            let p = t.progress(err);
            if t.compare_and_swap_callback_fp(id, &p) {
                progress(&p);
            }
        });
        self.sent_callbacks
            .add_callback(transfer.file_id(), cb, period);
    }

    fn add_received_callback(
        &self,
        transfer: &Arc<ReceivedTransfer>,
        progress: ReceivedProgressCallback,
        period: Duration,
    ) {
        let id = transfer.new_callback_id();
        let t = Arc::clone(transfer);
        let cb: TrackedCallback = Arc::new(move |err: Option<&TransferError>| {
            let p = t.progress(err);
            if t.compare_and_swap_callback_fp(id, &p) {
                progress(&p);
            }
        });
        self.received_callbacks
            .add_callback(transfer.file_id(), cb, period);
    }
}
