//! Job queue: single downloads, sequential batches and retries.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xdcc_data_channel::StreamEvent;
use xdcc_protocol::PacketSpecifier;

use crate::engine::Shared;
use crate::error::TransferError;
use crate::transfer::{Failure, Transfer};
use crate::types::{Completion, JobId, TransferEvent};

/// One requested packet.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: JobId,
    pub bot: String,
    pub packet: PacketSpecifier,
    pub retry_count: u32,
}

impl Job {
    pub(crate) fn new(bot: &str, packet: PacketSpecifier) -> Self {
        Self {
            id: JobId::new(),
            bot: bot.to_owned(),
            packet,
            retry_count: 0,
        }
    }
}

/// Handle to a running download.
pub struct JobHandle {
    id: JobId,
    cancel: CancellationToken,
    stream: Option<mpsc::Receiver<StreamEvent>>,
    task: JoinHandle<Result<Completion, TransferError>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Aborts the download. The bot is sent `XDCC CANCEL`, the partial
    /// file is kept and the job fails with [`TransferError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Receiver for streamed chunks; `Some` once, and only for a stream
    /// destination.
    pub fn take_stream(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.stream.take()
    }

    /// Waits for the job to reach a terminal state.
    pub async fn wait(self) -> Result<Completion, TransferError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Transport(format!("job task failed: {e}"))),
        }
    }
}

/// Outcome of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<(PacketSpecifier, Completion)>,
    pub failed: Vec<(PacketSpecifier, TransferError)>,
    /// Packets never requested because the batch was cancelled.
    pub skipped: Vec<PacketSpecifier>,
}

/// Handle to a running batch.
pub struct BatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<BatchReport>,
}

impl BatchHandle {
    /// Cancels the current packet and skips the rest.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<BatchReport, TransferError> {
        self.task
            .await
            .map_err(|e| TransferError::Transport(format!("batch task failed: {e}")))
    }
}

pub(crate) fn spawn_job(
    shared: Arc<Shared>,
    job: Job,
    stream: Option<(mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>)>,
) -> JobHandle {
    let id = job.id;
    let cancel = CancellationToken::new();
    let (stream_tx, stream_rx) = stream.unzip();
    let task = tokio::spawn(run_job(shared, job, cancel.clone(), stream_tx));
    JobHandle {
        id,
        cancel,
        stream: stream_rx,
        task,
    }
}

pub(crate) fn spawn_batch(shared: Arc<Shared>, bot: String, packets: Vec<PacketSpecifier>) -> BatchHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_batch(shared, bot, packets, cancel.clone()));
    BatchHandle { cancel, task }
}

/// Runs attempts for `job` until one completes or a failure is final.
///
/// Retries only apply to file destinations: streamed bytes cannot be
/// taken back.
async fn run_job(
    shared: Arc<Shared>,
    mut job: Job,
    cancel: CancellationToken,
    stream: Option<mpsc::Sender<StreamEvent>>,
) -> Result<Completion, TransferError> {
    loop {
        let attempt = Transfer::new(Arc::clone(&shared), &job, cancel.child_token(), stream.clone());
        match attempt.run().await {
            Ok(done) => {
                shared.emit(TransferEvent::Completed {
                    job: job.id,
                    offer: Arc::clone(&done.offer),
                    received: done.received,
                });
                return Ok(done);
            }
            Err(Failure { error, offer }) => {
                let may_retry = error.is_retryable()
                    && stream.is_none()
                    && job.retry_count < shared.config.retries
                    && !cancel.is_cancelled();
                if may_retry {
                    job.retry_count += 1;
                    warn!(job = %job.id, attempt = job.retry_count, %error, "retrying");
                    shared.emit(TransferEvent::Retrying {
                        job: job.id,
                        attempt: job.retry_count,
                        error,
                    });
                    continue;
                }
                shared.emit(TransferEvent::Failed {
                    job: job.id,
                    error: error.clone(),
                    offer,
                });
                return Err(error);
            }
        }
    }
}

/// Downloads `packets` one after another from `bot`.
///
/// The next packet starts once the previous one completed or failed.
async fn run_batch(
    shared: Arc<Shared>,
    bot: String,
    packets: Vec<PacketSpecifier>,
    cancel: CancellationToken,
) -> BatchReport {
    let mut report = BatchReport::default();
    info!(%bot, count = packets.len(), "starting batch");

    for (i, packet) in packets.iter().enumerate() {
        if cancel.is_cancelled() {
            report.skipped.extend_from_slice(&packets[i..]);
            break;
        }
        let job = Job::new(&bot, *packet);
        match run_job(Arc::clone(&shared), job, cancel.child_token(), None).await {
            Ok(done) => report.completed.push((*packet, done)),
            Err(error) => report.failed.push((*packet, error)),
        }
    }

    if cancel.is_cancelled() {
        info!(%bot, skipped = report.skipped.len(), "batch cancelled");
    } else {
        info!(
            %bot,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "batch finished"
        );
        shared.emit(TransferEvent::BatchCompleted { bot, packets });
    }
    report
}
