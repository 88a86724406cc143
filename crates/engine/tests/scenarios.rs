//! End-to-end transfers between managers on a loopback network.

use std::sync::Arc;
use std::time::Duration;

use sluice_engine::loopback::LoopbackNetwork;
use sluice_engine::{
    EngineError, FileLink, Manager, Params, ReceivedProgress, ReceivedProgressCallback,
    SendCompleteCallback, SendRequest, SentProgress, SentProgressCallback, TransferStatus,
};
use sluice_storage::{FileBackend, Kv};
use sluice_transfer::TransferError;
use tokio::sync::{mpsc, oneshot};

/// 32-byte parts after the 2-byte part number.
const PAYLOAD_LEN: usize = 34;
const PERIOD: Duration = Duration::from_millis(50);

fn params() -> Params {
    Params {
        max_throughput: 0,
        send_timeout: Duration::from_millis(500),
        resend_wait: Duration::from_secs(1),
        worker_pool_size: 2,
        batch_poll_interval: Duration::from_millis(10),
    }
}

fn manager(network: &LoopbackNetwork, kv: &Kv) -> Manager {
    Manager::new(params(), Arc::new(network.node()), kv).unwrap()
}

fn file(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn request(data: Vec<u8>, retry: f32) -> SendRequest {
    SendRequest {
        file_name: "notes".into(),
        file_type: "txt".into(),
        file_data: data,
        preview: b"first line".to_vec(),
        retry,
    }
}

fn sent_watch() -> (SentProgressCallback, mpsc::UnboundedReceiver<SentProgress>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cb: SentProgressCallback = Arc::new(move |p: &SentProgress| {
        let _ = tx.send(p.clone());
    });
    (cb, rx)
}

fn received_watch() -> (ReceivedProgressCallback, mpsc::UnboundedReceiver<ReceivedProgress>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cb: ReceivedProgressCallback = Arc::new(move |p: &ReceivedProgress| {
        let _ = tx.send(p.clone());
    });
    (cb, rx)
}

fn on_complete() -> (SendCompleteCallback, oneshot::Receiver<FileLink>) {
    let (tx, rx) = oneshot::channel();
    let cb: SendCompleteCallback = Box::new(move |link: FileLink| {
        let _ = tx.send(link);
    });
    (cb, rx)
}

async fn wait_for<T>(rx: &mut mpsc::UnboundedReceiver<T>, done: impl Fn(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            let p = rx.recv().await.expect("progress channel closed");
            if done(&p) {
                return p;
            }
        }
    })
    .await
    .expect("timed out waiting for progress")
}

async fn started(network: &LoopbackNetwork, kv: &Kv) -> Manager {
    let m = manager(network, kv);
    m.start().await.unwrap();
    m
}

#[tokio::test(start_paused = true)]
async fn happy_path_delivers_file() {
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);
    let kv = Kv::memory();
    let sender = started(&network, &kv.scope("sender")).await;
    let receiver = started(&network, &kv.scope("receiver")).await;

    let data = file(300);
    let (progress, _sent_rx) = sent_watch();
    let (done, done_rx) = on_complete();
    let info = sender
        .send(request(data.clone(), 0.0), progress, PERIOD, Some(done))
        .await
        .unwrap();
    assert_eq!(info.file_link.num_parts, 10);
    assert_eq!(info.file_link.num_fingerprints(), 10);

    let (progress, mut rx) = received_watch();
    let file_id = receiver
        .handle_incoming_transfer(&info.marshal().unwrap(), progress, PERIOD)
        .unwrap();
    let last = wait_for(&mut rx, |p| p.completed).await;
    assert_eq!(last.received, 10);
    assert_eq!(receiver.receive(&file_id).unwrap(), data);
    assert!(receiver.in_progress_receives().is_empty());

    let link = tokio::time::timeout(Duration::from_secs(60), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.file_id, file_id);

    let transfer = sender.sent_transfer(&file_id).unwrap();
    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(transfer.num_received(), 10);
    assert_eq!(transfer.num_available_fps(), 0);
    assert_eq!(network.payloads_sent(), 10);

    sender.close_send(&file_id).unwrap();
    assert!(sender.sent_transfer(&file_id).is_err());
    assert!(sender.in_progress_sends().is_empty());

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_parts_are_resent_within_budget() {
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);
    network.set_drop_filter(|index, _| index == 2 || index == 6);
    let kv = Kv::memory();
    let sender = started(&network, &kv.scope("sender")).await;
    let receiver = started(&network, &kv.scope("receiver")).await;

    let data = file(300);
    let (progress, _sent_rx) = sent_watch();
    let (done, done_rx) = on_complete();
    let info = sender
        .send(request(data.clone(), 0.5), progress, PERIOD, Some(done))
        .await
        .unwrap();
    assert_eq!(info.file_link.num_fingerprints(), 15);

    let (progress, mut rx) = received_watch();
    let file_id = receiver
        .handle_incoming_transfer(&info.marshal().unwrap(), progress, PERIOD)
        .unwrap();
    wait_for(&mut rx, |p| p.completed).await;
    assert_eq!(receiver.receive(&file_id).unwrap(), data);

    tokio::time::timeout(Duration::from_secs(60), done_rx)
        .await
        .unwrap()
        .unwrap();
    let transfer = sender.sent_transfer(&file_id).unwrap();
    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(transfer.num_fps() - transfer.num_available_fps(), 12);
    assert_eq!(network.payloads_sent(), 12);

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_round_is_retried_with_new_fingerprints() {
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);
    network.fail_next_rounds(1);
    let kv = Kv::memory();
    let sender = started(&network, &kv.scope("sender")).await;
    let receiver = started(&network, &kv.scope("receiver")).await;

    let data = file(300);
    let (progress, mut sent_rx) = sent_watch();
    let info = sender
        .send(request(data.clone(), 1.0), progress, PERIOD, None)
        .await
        .unwrap();

    let (progress, mut rx) = received_watch();
    let file_id = receiver
        .handle_incoming_transfer(&info.marshal().unwrap(), progress, PERIOD)
        .unwrap();
    wait_for(&mut rx, |p| p.completed).await;
    assert_eq!(receiver.receive(&file_id).unwrap(), data);

    wait_for(&mut sent_rx, |p| p.completed).await;
    let transfer = sender.sent_transfer(&file_id).unwrap();
    assert!(transfer.num_fps() - transfer.num_available_fps() > 10);

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhaustion_fails_transfer_once_and_retry_recovers() {
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);
    network.set_drop_filter(|_, _| true);
    let kv = Kv::memory();
    let sender = started(&network, &kv.scope("sender")).await;
    let receiver = started(&network, &kv.scope("receiver")).await;

    let data = file(160);
    let (progress, mut sent_rx) = sent_watch();
    let info = sender
        .send(request(data.clone(), 0.0), progress, PERIOD, None)
        .await
        .unwrap();
    assert_eq!(info.file_link.num_parts, 5);

    let failed = wait_for(&mut sent_rx, |p| p.error.is_some()).await;
    assert_eq!(failed.error.as_deref(), Some("fingerprints exhausted"));
    assert!(!failed.completed);

    let file_id = info.file_link.file_id;
    let transfer = sender.sent_transfer(&file_id).unwrap();
    assert_eq!(transfer.status(), TransferStatus::Failed);
    assert_eq!(transfer.num_available_fps(), 0);
    assert_eq!(network.payloads_sent(), 5);

    // Nothing more is reported or sent once the transfer has failed.
    tokio::time::sleep(Duration::from_secs(10)).await;
    while let Ok(p) = sent_rx.try_recv() {
        assert!(p.error.is_none());
    }
    assert_eq!(network.payloads_sent(), 5);

    network.clear_drop_filter();
    let (progress, _sent_rx) = sent_watch();
    let (done, done_rx) = on_complete();
    let retried = sender
        .retry_failed_send(&info, progress, PERIOD, Some(done))
        .await
        .unwrap();
    assert_eq!(retried.file_link.file_id, file_id);
    assert_ne!(retried.file_link.key, info.file_link.key);
    assert_eq!(retried.file_name, info.file_name);

    let (progress, mut rx) = received_watch();
    receiver
        .handle_incoming_transfer(&retried.marshal().unwrap(), progress, PERIOD)
        .unwrap();
    wait_for(&mut rx, |p| p.completed).await;
    assert_eq!(receiver.receive(&file_id).unwrap(), data);
    tokio::time::timeout(Duration::from_secs(60), done_rx)
        .await
        .unwrap()
        .unwrap();

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sender_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let kv = Kv::new(Arc::new(FileBackend::open(dir.path()).unwrap()));
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);
    network.set_drop_filter(|_, _| true);

    let data = file(200);
    let sender = started(&network, &kv.scope("sender")).await;
    let receiver = started(&network, &kv.scope("receiver")).await;
    let (progress, mut sent_rx) = sent_watch();
    let info = sender
        .send(request(data.clone(), 1.0), progress, PERIOD, None)
        .await
        .unwrap();
    let file_id = info.file_link.file_id;
    assert_eq!(info.file_link.num_parts, 7);

    let (progress, mut rx) = received_watch();
    receiver
        .handle_incoming_transfer(&info.marshal().unwrap(), progress, PERIOD)
        .unwrap();

    wait_for(&mut sent_rx, |p| p.sent == p.total).await;
    sender.stop().await.unwrap();
    drop(sender);
    network.clear_drop_filter();

    let sender = manager(&network, &kv.scope("sender"));
    assert_eq!(sender.in_progress_sends(), vec![file_id]);
    let transfer = sender.sent_transfer(&file_id).unwrap();
    assert_eq!(transfer.num_sent(), 7);
    assert_eq!(transfer.num_available_fps(), 7);

    let (progress, mut sent_rx) = sent_watch();
    sender
        .register_sent_progress_callback(&file_id, progress, PERIOD)
        .unwrap();
    sender.start().await.unwrap();

    wait_for(&mut rx, |p| p.completed).await;
    assert_eq!(receiver.receive(&file_id).unwrap(), data);
    wait_for(&mut sent_rx, |p| p.completed).await;
    assert_eq!(
        sender.sent_transfer(&file_id).unwrap().status(),
        TransferStatus::Completed
    );

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn receiver_reloads_parts_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let kv = Kv::new(Arc::new(FileBackend::open(dir.path()).unwrap()));
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);

    let data = file(100);
    let sender = started(&network, &kv.scope("sender")).await;
    let (progress, mut sent_rx) = sent_watch();
    let info = sender
        .send(request(data.clone(), 0.0), progress, PERIOD, None)
        .await
        .unwrap();
    // The sender sees its own parts arrive without any receiver present.
    wait_for(&mut sent_rx, |p| p.completed).await;

    let receiver = started(&network, &kv.scope("receiver")).await;
    let (progress, mut rx) = received_watch();
    let file_id = receiver
        .handle_incoming_transfer(&info.marshal().unwrap(), progress, PERIOD)
        .unwrap();
    wait_for(&mut rx, |p| p.completed).await;
    receiver.stop().await.unwrap();
    drop(receiver);

    let receiver = manager(&network, &kv.scope("receiver"));
    assert_eq!(receiver.in_progress_receives(), vec![file_id]);
    assert!(receiver.received_transfer(&file_id).unwrap().is_complete());

    let (progress, mut rx) = received_watch();
    receiver
        .register_received_progress_callback(&file_id, progress, PERIOD)
        .unwrap();
    let seen = rx.try_recv().unwrap();
    assert!(seen.completed);
    assert_eq!(seen.received, seen.total);
    assert_eq!(receiver.receive(&file_id).unwrap(), data);

    sender.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lifecycle_errors() {
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);
    network.set_drop_filter(|_, _| true);
    let kv = Kv::memory();

    let idle = manager(&network, &kv.scope("idle"));
    assert!(matches!(idle.stop().await, Err(EngineError::NotStarted)));

    let sender = started(&network, &kv.scope("sender")).await;
    let receiver = started(&network, &kv.scope("receiver")).await;
    assert!(matches!(
        sender.start().await,
        Err(EngineError::AlreadyStarted)
    ));

    let (progress, _sent_rx) = sent_watch();
    let info = sender
        .send(request(file(64), 0.0), progress, PERIOD, None)
        .await
        .unwrap();
    let file_id = info.file_link.file_id;

    assert!(matches!(
        sender.close_send(&file_id),
        Err(EngineError::Transfer(TransferError::NotFinished(_)))
    ));
    assert!(matches!(
        sender.retry_failed_send(&info, sent_watch().0, PERIOD, None).await,
        Err(EngineError::NotFailed(_))
    ));

    let (progress, _rx) = received_watch();
    receiver
        .handle_incoming_transfer(&info.marshal().unwrap(), progress.clone(), PERIOD)
        .unwrap();
    assert!(matches!(
        receiver.receive(&file_id),
        Err(EngineError::Transfer(TransferError::Incomplete {
            received: 0,
            total: 2
        }))
    ));
    assert!(matches!(
        receiver.handle_incoming_transfer(&info.marshal().unwrap(), progress.clone(), PERIOD),
        Err(EngineError::Transfer(TransferError::Exists(_)))
    ));
    assert!(matches!(
        receiver.handle_incoming_transfer(b"not json", progress, PERIOD),
        Err(EngineError::Protocol(_))
    ));

    let unknown = sluice_engine::TransferId::from_file(b"unknown");
    assert!(matches!(
        receiver.receive(&unknown),
        Err(EngineError::Transfer(TransferError::NotFound(_)))
    ));

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn send_rejects_invalid_files_and_unhealthy_network() {
    let network = LoopbackNetwork::new(PAYLOAD_LEN, 11);
    let kv = Kv::memory();
    let sender = started(&network, &kv.scope("sender")).await;

    let mut long_name = request(file(10), 0.0);
    long_name.file_name = "n".repeat(49);
    assert!(matches!(
        sender.send(long_name, sent_watch().0, PERIOD, None).await,
        Err(EngineError::Transfer(TransferError::Validation(_)))
    ));
    assert!(matches!(
        sender.send(request(Vec::new(), 0.0), sent_watch().0, PERIOD, None).await,
        Err(EngineError::Transfer(TransferError::Validation(_)))
    ));

    let mut oversized = request(file(10), 0.0);
    oversized.file_name = "n".repeat(48);
    oversized.file_type = "t".repeat(8);
    oversized.preview = vec![7; 590];
    assert!(matches!(
        sender.send(oversized, sent_watch().0, PERIOD, None).await,
        Err(EngineError::Transfer(TransferError::Validation(_)))
    ));
    assert!(sender.in_progress_sends().is_empty());

    network.set_healthy(false);
    assert!(matches!(
        sender.send(request(file(10), 0.0), sent_watch().0, PERIOD, None).await,
        Err(EngineError::NetworkUnhealthy)
    ));
    network.set_healthy(true);

    network.set_drop_filter(|_, _| true);
    sender
        .send(request(file(10), 0.0), sent_watch().0, PERIOD, None)
        .await
        .unwrap();
    assert!(matches!(
        sender.send(request(file(10), 0.0), sent_watch().0, PERIOD, None).await,
        Err(EngineError::Transfer(TransferError::Exists(_)))
    ));
    assert!(sender.in_progress_sends().len() == 1);

    sender.stop().await.unwrap();
}
