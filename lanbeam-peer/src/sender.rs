//! Paced chunk streaming for one accepted outbound transfer.

use std::sync::Arc;

use bytes::Bytes;
use lanbeam_core::config::{
    BUFFERED_AMOUNT_HIGH, BUFFERED_AMOUNT_LOW, RELAY_BUFFER_POLL, RELAY_MAX_IN_FLIGHT,
};
use lanbeam_core::{
    CryptoError, Direction, Event, OutboundPlan, ThroughputMeter, TransferError, TransferKey,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::crypto_worker::{CryptoWorker, Job, Op};
use crate::transport::{Backpressure, Transport, TransportError};

/// Chunks encrypted ahead of the one being sent.
const ENCRYPT_AHEAD: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("encryption worker stopped before chunk {index}")]
    WorkerGone { index: u32 },
}

impl SendError {
    /// What the collaborator is told about the aborted transfer.
    pub fn transfer_error(&self) -> TransferError {
        match self {
            SendError::Transport(_) => TransferError::TransportClosed,
            SendError::Crypto(e) => TransferError::Crypto(e.clone()),
            SendError::WorkerGone { index } => {
                TransferError::Crypto(CryptoError::Encrypt { index: *index })
            }
        }
    }
}

/// Stream every chunk of `payload` to `transport`, pausing whenever its
/// buffer is above the high-water mark. Progress goes to `events`.
pub async fn send_chunks(
    transport: Arc<dyn Transport>,
    key: &TransferKey,
    outbound: OutboundPlan,
    payload: Bytes,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(), SendError> {
    let OutboundPlan { cipher, plan } = outbound;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let worker = CryptoWorker::spawn(cipher, Op::Encrypt, (), out_tx, ENCRYPT_AHEAD);

    let jobs = worker.jobs();
    let feeder = tokio::spawn(async move {
        for (index, range) in plan.ranges() {
            let data = payload.slice(range.start as usize..range.end as usize);
            if jobs.send(Job { index, data }).await.is_err() {
                break;
            }
        }
    });
    drop(worker);

    let mut meter = ThroughputMeter::new(plan.total_chunks, plan.file_size, now());
    let mut in_flight = 0usize;
    let result = async {
        for index in 0..plan.total_chunks {
            let out = out_rx.recv().await.ok_or(SendError::WorkerGone { index })?;
            let ciphertext = out.result?;
            wait_for_room(&*transport, &mut in_flight).await?;
            transport.send_chunk(out.index, &ciphertext).await?;
            in_flight += 1;
            let plain = plan.range(out.index);
            if let Some(progress) = meter.record(plain.end - plain.start, now()) {
                let _ = events.send(Event::Progress {
                    key: key.clone(),
                    direction: Direction::Outbound,
                    progress,
                });
            }
        }
        Ok::<(), SendError>(())
    }
    .await;
    feeder.abort();
    result?;

    let done = meter.finish(now());
    info!(
        event = "chunks_sent",
        peer = %key.peer_id,
        file = %key.file_name,
        chunks = plan.total_chunks,
        speed = %done.speed(),
        "All chunks handed to transport"
    );
    let _ = events.send(Event::Progress {
        key: key.clone(),
        direction: Direction::Outbound,
        progress: done,
    });
    Ok(())
}

/// Block until the transport can take another chunk.
async fn wait_for_room(transport: &dyn Transport, in_flight: &mut usize) -> Result<(), SendError> {
    if !transport.is_open() {
        return Err(TransportError::Closed.into());
    }
    match transport.backpressure() {
        Backpressure::Event => {
            while transport.buffered_amount().await > BUFFERED_AMOUNT_HIGH {
                debug!(event = "backpressure", peer = %transport.peer_id(), "Waiting for buffer to drain");
                tokio::select! {
                    _ = transport.buffer_low() => {}
                    _ = transport.closed() => return Err(TransportError::Closed.into()),
                }
            }
        }
        Backpressure::Polling => {
            // Every RELAY_MAX_IN_FLIGHT chunks, let the socket drain to the
            // low-water mark before enqueuing more.
            let floor = if *in_flight >= RELAY_MAX_IN_FLIGHT {
                *in_flight = 0;
                BUFFERED_AMOUNT_LOW
            } else {
                BUFFERED_AMOUNT_HIGH
            };
            while transport.buffered_amount().await > floor {
                if !transport.is_open() {
                    return Err(TransportError::Closed.into());
                }
                tokio::time::sleep(RELAY_BUFFER_POLL).await;
            }
        }
    }
    Ok(())
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
