//! Wires a sender and a receiver onto one loopback network.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rand::Rng;
use sluice_engine::loopback::LoopbackNetwork;
use sluice_engine::{
    FileLink, Manager, ReceivedProgress, ReceivedProgressCallback, SendRequest, SentProgress,
    SentProgressCallback,
};
use sluice_storage::{FileBackend, Kv};
use tokio::sync::mpsc;

use crate::config::LoopbackConfig;

/// Sends `input` from one manager to the other and waits for it to arrive.
pub async fn run(
    config: LoopbackConfig,
    input: PathBuf,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;

    let network = LoopbackNetwork::new(config.payload_len, config.batch_len);
    if config.loss_rate > 0.0 {
        let loss = config.loss_rate;
        network.set_drop_filter(move |_, _| rand::thread_rng().gen_bool(loss));
    }

    let kv = match &config.data_dir {
        Some(dir) => Kv::new(Arc::new(FileBackend::open(dir)?)),
        None => Kv::memory(),
    };
    let sender = Manager::new(
        config.params.clone(),
        Arc::new(network.node()),
        &kv.scope("sender"),
    )?;
    let receiver = Manager::new(
        config.params.clone(),
        Arc::new(network.node()),
        &kv.scope("receiver"),
    )?;
    sender.start().await?;
    receiver.start().await?;

    let on_sent: SentProgressCallback = Arc::new(|p: &SentProgress| {
        tracing::info!(
            sent = p.sent,
            received = p.received,
            total = p.total,
            completed = p.completed,
            error = p.error.as_deref().unwrap_or(""),
            "send progress"
        );
    });
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_type = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let info = sender
        .send(
            SendRequest {
                file_name,
                file_type,
                file_data: data.clone(),
                preview: Vec::new(),
                retry: config.retry,
            },
            on_sent,
            config.progress_period,
            Some(Box::new(|link: FileLink| {
                tracing::info!(file_id = %link.file_id, "sender saw every part arrive");
            })),
        )
        .await?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let on_received: ReceivedProgressCallback = Arc::new(move |p: &ReceivedProgress| {
        tracing::info!(received = p.received, total = p.total, "receive progress");
        if p.completed || p.error.is_some() {
            let _ = done_tx.send(p.clone());
        }
    });
    let file_id =
        receiver.handle_incoming_transfer(&info.marshal()?, on_received, config.progress_period)?;

    let last = done_rx.recv().await.context("receiver went away")?;
    if let Some(err) = last.error {
        anyhow::bail!("receive failed: {err}");
    }

    let file = receiver.receive(&file_id)?;
    anyhow::ensure!(file == data, "received file differs from input");
    tracing::info!(%file_id, size = file.len(), "transfer verified");

    if let Some(path) = output {
        std::fs::write(&path, &file).with_context(|| format!("writing {}", path.display()))?;
    }

    sender.stop().await?;
    receiver.stop().await?;
    Ok(())
}
