//! Wires the IRC session to the engine and drives the downloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use xdcc_engine::{Destination, Engine, JobId, StreamEvent, TransferEvent};
use xdcc_protocol::PacketSpecifier;

use crate::Args;
use crate::config::Config;
use crate::irc::{IrcClient, IrcEvent};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Runs until every requested packet finished, the server hung up or
/// Ctrl-C.
pub async fn run(config: Config, request: Args) -> anyhow::Result<()> {
    let nick = config.effective_nick();
    let client = IrcClient::connect(&config.host, config.port, &nick, config.external_ip).await?;
    let mut irc_events = client
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("IRC events already taken"))?;
    let irc = client.sender();

    let engine = Engine::new(config.engine_config(), irc.clone())?;
    tokio::spawn(log_events(engine.subscribe()));

    let (done_tx, mut done_rx) = oneshot::channel::<anyhow::Result<()>>();
    let mut done_tx = Some(done_tx);

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break Ok(());
            }
            result = &mut done_rx => {
                break result.unwrap_or_else(|_| Err(anyhow::anyhow!("download task ended early")));
            }
            event = irc_events.recv() => match event {
                Some(IrcEvent::Registered { nick }) => {
                    tracing::info!(%nick, "ready");
                    for channel in config.channel_names() {
                        irc.join(&channel)?;
                    }
                    if let Some(done) = done_tx.take() {
                        let engine = engine.clone();
                        let request = request.clone();
                        let wait = Duration::from_secs(config.join_wait_secs);
                        tokio::spawn(async move {
                            if !wait.is_zero() {
                                tracing::info!(secs = wait.as_secs(), "waiting in channels");
                                tokio::time::sleep(wait).await;
                            }
                            let _ = done.send(download(&engine, request).await);
                        });
                    }
                }
                Some(IrcEvent::Ctcp { from, text }) => {
                    if let Err(e) = engine.handle_ctcp(&from, &text).await {
                        tracing::warn!(%from, error = %e, "rejected DCC message");
                    }
                }
                Some(IrcEvent::Message { from, text }) => {
                    tracing::info!(%from, "{text}");
                }
                Some(IrcEvent::Closed) | None => {
                    break Err(anyhow::anyhow!("IRC connection closed"));
                }
            },
        }
    };

    let _ = irc.quit("xdcc-get");
    // Let the writer flush QUIT.
    tokio::time::sleep(Duration::from_millis(200)).await;
    outcome
}

/// Requests every packet. Ranges are split into single packets.
async fn download(engine: &Engine, request: Args) -> anyhow::Result<()> {
    let packets = expand(&request.packets);

    if engine.config().destination == Destination::Stream {
        let [packet] = packets.as_slice() else {
            anyhow::bail!("streaming to stdout takes exactly one packet");
        };
        return stream_to_stdout(engine, &request.bot, *packet).await;
    }

    let batch = engine.download_batch(&request.bot, packets)?;
    let report = batch.wait().await?;
    for (packet, completion) in &report.completed {
        tracing::info!(
            %packet,
            file = %completion.offer.file_name,
            bytes = completion.received,
            "downloaded"
        );
    }
    for (packet, error) in &report.failed {
        tracing::error!(%packet, %error, "failed");
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        let total = report.failed.len() + report.completed.len();
        anyhow::bail!("{} of {total} packets failed", report.failed.len())
    }
}

async fn stream_to_stdout(engine: &Engine, bot: &str, packet: PacketSpecifier) -> anyhow::Result<()> {
    let mut job = engine.download(bot, packet)?;
    let mut stream = job
        .take_stream()
        .ok_or_else(|| anyhow::anyhow!("no stream for job"))?;
    let mut stdout = tokio::io::stdout();

    while let Some(event) = stream.recv().await {
        match event {
            StreamEvent::Data { chunk, .. } => stdout.write_all(&chunk).await?,
            StreamEvent::Finished { received } => {
                tracing::debug!(received, "stream finished");
            }
            StreamEvent::Failed(reason) => tracing::warn!(%reason, "stream failed"),
        }
    }
    stdout.flush().await?;
    job.wait().await?;
    Ok(())
}

fn expand(packets: &[PacketSpecifier]) -> Vec<PacketSpecifier> {
    packets
        .iter()
        .flat_map(|p| {
            let last = p.last.unwrap_or(p.first).max(p.first);
            (p.first..=last).map(PacketSpecifier::single)
        })
        .collect()
}

/// Logs engine events; progress at most every few seconds per job.
async fn log_events(mut events: broadcast::Receiver<TransferEvent>) {
    let mut last_progress: HashMap<JobId, Instant> = HashMap::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "event log lagging");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            TransferEvent::Started { job, offer } => {
                tracing::info!(%job, file = %offer.file_name, size = offer.length, "downloading");
            }
            TransferEvent::Progress {
                job,
                offer,
                received,
                bytes_per_second,
                eta,
            } => {
                let now = Instant::now();
                let due = last_progress
                    .get(&job)
                    .is_none_or(|at| now.duration_since(*at) >= PROGRESS_LOG_INTERVAL);
                if due {
                    last_progress.insert(job, now);
                    let done = offer.position + received;
                    let percent = if offer.length == 0 {
                        100.0
                    } else {
                        done as f64 * 100.0 / offer.length as f64
                    };
                    tracing::info!(
                        %job,
                        percent = %format!("{percent:.1}"),
                        kib_per_second = %format!("{:.1}", bytes_per_second / 1024.0),
                        eta_secs = eta.map(|d| d.as_secs()),
                        "progress"
                    );
                }
            }
            TransferEvent::Completed { job, offer, .. } => {
                last_progress.remove(&job);
                tracing::info!(%job, file = %offer.file_name, "completed");
            }
            TransferEvent::Failed { job, error, .. } => {
                last_progress.remove(&job);
                tracing::warn!(%job, %error, "failed");
            }
            TransferEvent::Retrying { job, attempt, error } => {
                tracing::warn!(%job, attempt, %error, "retrying");
            }
            TransferEvent::BatchCompleted { bot, packets } => {
                tracing::info!(%bot, count = packets.len(), "batch completed");
            }
            TransferEvent::Requested { .. } | TransferEvent::StateChanged { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_expand_to_single_packets() {
        let packets = vec![
            PacketSpecifier::single(1),
            "#4-6".parse().unwrap(),
        ];
        let expanded: Vec<u32> = expand(&packets).iter().map(|p| p.first).collect();
        assert_eq!(expanded, vec![1, 4, 5, 6]);
        assert!(expand(&packets).iter().all(|p| p.last.is_none()));
    }
}
