//! One attempt at downloading one packet.
//!
//! ```text
//! Requested -> AwaitingOffer -> [ResumeRequested] -> Connecting | Listening
//!           -> Transferring -> Completed
//! any non-terminal state -> Failed
//! ```
//!
//! The attempt runs as a single task. Inbound offers arrive on its inbox;
//! timeouts come from its [`Watchdog`], which sends `XDCC CANCEL` and
//! trips the attempt's cancellation token. Whatever ends the attempt, the
//! task itself releases the port, closes the sink and reports the result.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xdcc_data_channel::{
    DataChannelError, FileSink, PassiveListener, ReceiveOptions, ReceiveStep, Sink, StreamEvent,
    StreamSink, client,
};
use xdcc_protocol::constants::RESUME_BACKOFF;
use xdcc_protocol::{FileTarget, ProtocolError, TransferOffer, messages};

use crate::engine::Shared;
use crate::error::{Stage, TransferError};
use crate::progress::SpeedCalculator;
use crate::queue::Job;
use crate::types::{Completion, JobId, TransferEvent, TransferState};
use crate::watchdog::Watchdog;

const INBOX_CAPACITY: usize = 16;

/// Messages delivered to a running attempt.
#[derive(Debug)]
pub(crate) enum JobInput {
    /// `DCC SEND` from `nick`.
    Offer { nick: String, offer: TransferOffer },
    /// `DCC ACCEPT` merged with our pending resume.
    Accept { offer: TransferOffer },
    /// Undecodable DCC text from the bot.
    Malformed(ProtocolError),
    /// The bot never answered our `DCC RESUME`.
    ResumeExpired,
}

/// How an attempt ended when it did not complete.
#[derive(Debug)]
pub(crate) struct Failure {
    pub error: TransferError,
    pub offer: Option<Arc<TransferOffer>>,
}

/// Cancellation token plus the reason it was tripped.
#[derive(Debug)]
struct Interrupt {
    token: CancellationToken,
    reason: Mutex<Option<TransferError>>,
}

impl Interrupt {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Mutex::new(None),
        }
    }

    /// First reason wins.
    fn trip(&self, reason: TransferError) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    /// A cancelled parent token (caller cancel) leaves no reason.
    fn reason(&self) -> TransferError {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(TransferError::Cancelled)
    }

    fn classify(&self, e: DataChannelError) -> TransferError {
        match e {
            DataChannelError::Cancelled => self.reason(),
            other => other.into(),
        }
    }
}

/// Offset to request when `existing` bytes are already on disk.
///
/// A complete file backs off by [`RESUME_BACKOFF`] so the bot still has
/// something to send.
pub(crate) fn resume_position(existing: u64, length: u64) -> u64 {
    if existing >= length {
        length.saturating_sub(RESUME_BACKOFF)
    } else {
        existing
    }
}

pub(crate) struct Transfer {
    job: JobId,
    bot: String,
    packet: xdcc_protocol::PacketSpecifier,
    attempt: u32,
    shared: Arc<Shared>,
    inbox: mpsc::Receiver<JobInput>,
    inbox_tx: mpsc::WeakSender<JobInput>,
    interrupt: Arc<Interrupt>,
    watchdog: Watchdog,
    /// Nick that made the current offer; receives cancel and resume.
    cancel_nick: String,
    offer: Option<Arc<TransferOffer>>,
    stream: Option<mpsc::Sender<StreamEvent>>,
    state: TransferState,
}

impl Transfer {
    /// Registers the attempt for offer routing.
    pub(crate) fn new(
        shared: Arc<Shared>,
        job: &Job,
        cancel: CancellationToken,
        stream: Option<mpsc::Sender<StreamEvent>>,
    ) -> Self {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let inbox_tx = tx.downgrade();
        shared.routes.register(job.id, &job.bot, tx);

        Self {
            job: job.id,
            bot: job.bot.clone(),
            packet: job.packet,
            attempt: job.retry_count,
            shared,
            inbox,
            inbox_tx,
            interrupt: Arc::new(Interrupt::new(cancel)),
            watchdog: Watchdog::new(),
            cancel_nick: job.bot.clone(),
            offer: None,
            stream,
            state: TransferState::Requested,
        }
    }

    pub(crate) async fn run(mut self) -> Result<Completion, Failure> {
        let result = self.drive().await;

        self.watchdog.disarm();
        self.shared.routes.remove(self.job);
        self.shared.resumes.discard(self.job);

        match result {
            Ok(done) => {
                self.set_state(TransferState::Completed);
                Ok(done)
            }
            Err(error) => {
                if error.needs_cancel_message() {
                    self.send_cancel().await;
                }
                warn!(job = %self.job, bot = %self.bot, packet = %self.packet, %error, "transfer failed");
                self.set_state(TransferState::Failed);
                Err(Failure {
                    error,
                    offer: self.offer.clone(),
                })
            }
        }
    }

    async fn drive(&mut self) -> Result<Completion, TransferError> {
        info!(
            job = %self.job,
            bot = %self.bot,
            packet = %self.packet,
            attempt = self.attempt,
            "requesting packet"
        );
        self.arm_timeout(Stage::BotReply, self.shared.config.timeouts.bot_reply);
        let request = messages::xdcc_send_request(&self.packet);
        self.shared.irc.privmsg(&self.bot, &request).await?;
        self.shared.emit(TransferEvent::Requested {
            job: self.job,
            bot: self.bot.clone(),
            packet: self.packet,
        });
        self.set_state(TransferState::AwaitingOffer);

        let offer = loop {
            match self.next_input().await? {
                JobInput::Offer { nick, offer } => {
                    self.cancel_nick = nick;
                    break offer;
                }
                JobInput::Malformed(e) => return Err(e.into()),
                other => debug!(job = %self.job, ?other, "ignored while awaiting offer"),
            }
        };
        self.watchdog.disarm();
        info!(
            job = %self.job,
            file = %offer.file_name,
            length = offer.length,
            passive = offer.is_passive(),
            "offer received"
        );
        self.offer = Some(Arc::new(offer.clone()));

        let (offer, sink) = self.prepare(offer).await?;
        self.run_connection(offer, sink).await
    }

    /// Opens the sink, negotiating a resume when the file already exists.
    async fn prepare(&mut self, offer: TransferOffer) -> Result<(TransferOffer, Sink), TransferError> {
        let path = match &offer.file_path {
            FileTarget::Stream => {
                let tx = self
                    .stream
                    .clone()
                    .ok_or_else(|| TransferError::Transport("no stream consumer".into()))?;
                return Ok((offer, Sink::Stream(StreamSink::new(tx))));
            }
            FileTarget::Path(path) => path.clone(),
        };

        let existing = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };
        if existing == 0 {
            let sink = FileSink::create(&path).await?;
            return Ok((offer, Sink::File(sink)));
        }
        self.negotiate_resume(offer, path, existing).await
    }

    async fn negotiate_resume(
        &mut self,
        offer: TransferOffer,
        path: PathBuf,
        existing: u64,
    ) -> Result<(TransferOffer, Sink), TransferError> {
        let position = resume_position(existing, offer.length);
        info!(job = %self.job, file = %offer.file_name, existing, position, "requesting resume");
        self.set_state(TransferState::ResumeRequested);

        self.shared
            .resumes
            .enqueue(&self.cancel_nick, self.job, offer.clone());
        self.shared.routes.expect_accept(self.job, true);
        let token = if offer.is_passive() {
            offer.token.as_deref()
        } else {
            None
        };
        let request = messages::dcc_resume(&offer.file_name, offer.port, position, token);
        self.arm_resume_timeout(self.shared.config.timeouts.resume_accept);
        self.shared.irc.privmsg(&self.cancel_nick, &request).await?;

        loop {
            match self.next_input().await? {
                JobInput::Accept { offer: accepted } => {
                    self.watchdog.disarm();
                    self.shared.routes.expect_accept(self.job, false);
                    info!(
                        job = %self.job,
                        position = accepted.position,
                        remaining = accepted.remaining(),
                        "resume accepted"
                    );
                    let sink = FileSink::open_at(&path, accepted.position).await?;
                    self.offer = Some(Arc::new(accepted.clone()));
                    return Ok((accepted, Sink::File(sink)));
                }
                JobInput::ResumeExpired => {
                    warn!(job = %self.job, file = %offer.file_name, "resume not accepted, restarting from zero");
                    self.shared.resumes.discard(self.job);
                    self.shared.routes.expect_accept(self.job, false);
                    let sink = restart_file(&path).await?;
                    return Ok((offer, Sink::File(sink)));
                }
                JobInput::Malformed(e) => return Err(e.into()),
                other => debug!(job = %self.job, ?other, "ignored while awaiting ACCEPT"),
            }
        }
    }

    async fn run_connection(
        &mut self,
        offer: TransferOffer,
        mut sink: Sink,
    ) -> Result<Completion, TransferError> {
        let offer = Arc::new(offer);
        self.offer = Some(Arc::clone(&offer));

        let result = if offer.is_passive() {
            self.passive(&offer, &mut sink).await
        } else {
            self.active(&offer, &mut sink).await
        };
        self.watchdog.disarm();

        match result {
            Ok(received) => {
                // Delivering the end of a stream waits on its consumer.
                let token = self.interrupt.token.clone();
                tokio::select! {
                    biased;
                    closed = sink.close() => closed?,
                    _ = token.cancelled() => return Err(self.interrupt.reason()),
                }
                if received < offer.remaining() {
                    warn!(
                        job = %self.job,
                        received,
                        expected = offer.remaining(),
                        "peer closed before declared length"
                    );
                }
                info!(job = %self.job, file = %offer.file_name, received, "transfer complete");
                Ok(Completion { offer, received })
            }
            Err(error) => {
                sink.error_close(&error.to_string()).await;
                Err(error)
            }
        }
    }

    async fn active(&mut self, offer: &Arc<TransferOffer>, sink: &mut Sink) -> Result<u64, TransferError> {
        self.set_state(TransferState::Connecting);
        self.arm_timeout(Stage::Connect, self.shared.config.timeouts.connect);

        let token = self.interrupt.token.clone();
        let stream = client::connect(offer.peer_socket(), &token)
            .await
            .map_err(|e| self.interrupt.classify(e))?;
        self.watchdog.disarm();

        self.receive(stream, offer, sink, true).await
    }

    async fn passive(&mut self, offer: &Arc<TransferOffer>, sink: &mut Sink) -> Result<u64, TransferError> {
        self.set_state(TransferState::Listening);

        let lease = self.shared.ports.lease().map_err(|e| {
            warn!(job = %self.job, ports = ?self.shared.ports.configured(), "no passive port free");
            TransferError::from(e)
        })?;
        let address = self
            .shared
            .config
            .external_ip
            .or_else(|| self.shared.irc.external_ip())
            .ok_or_else(|| TransferError::Transport("external address unknown".into()))?;

        let listener = PassiveListener::bind(lease)
            .await
            .map_err(|e| self.interrupt.classify(e))?;
        let reply = messages::dcc_send(
            &offer.file_name,
            address,
            listener.port(),
            offer.remaining(),
            offer.token.as_deref(),
        );
        self.arm_timeout(Stage::PassiveConnect, self.shared.config.timeouts.connect);
        self.shared.irc.privmsg(&self.cancel_nick, &reply).await?;

        let token = self.interrupt.token.clone();
        let (stream, _lease) = listener
            .accept(&token)
            .await
            .map_err(|e| self.interrupt.classify(e))?;
        self.watchdog.disarm();

        self.receive(stream, offer, sink, false).await
    }

    async fn receive(
        &mut self,
        stream: TcpStream,
        offer: &Arc<TransferOffer>,
        sink: &mut Sink,
        close_when_complete: bool,
    ) -> Result<u64, TransferError> {
        self.set_state(TransferState::Transferring);
        self.shared.emit(TransferEvent::Started {
            job: self.job,
            offer: Arc::clone(offer),
        });
        self.arm_timeout(Stage::Idle, self.shared.config.timeouts.idle);

        let expected = offer.remaining();
        let options = ReceiveOptions {
            expected,
            close_when_complete,
        };
        let token = self.interrupt.token.clone();
        let job = self.job;
        let shared = &self.shared;
        let watchdog = &mut self.watchdog;
        let mut speed = SpeedCalculator::default();
        speed.record(0);

        let received = xdcc_data_channel::receive(stream, sink, options, &token, |step| {
            let ReceiveStep::Delivered(received) = step else {
                // The peer is not silent while our sink is still busy.
                watchdog.hold();
                return;
            };
            if close_when_complete && received >= expected {
                watchdog.disarm();
            } else {
                watchdog.kick();
            }
            speed.record(received);
            let bytes_per_second = speed.bytes_per_second();
            if speed.should_log() {
                debug!(%job, received, expected, bytes_per_second, "progress");
            }
            shared.emit(TransferEvent::Progress {
                job,
                offer: Arc::clone(offer),
                received,
                bytes_per_second,
                eta: speed.eta(expected.saturating_sub(received)),
            });
        })
        .await
        .map_err(|e| self.interrupt.classify(e))?;

        Ok(received)
    }

    async fn next_input(&mut self) -> Result<JobInput, TransferError> {
        tokio::select! {
            biased;
            _ = self.interrupt.token.cancelled() => Err(self.interrupt.reason()),
            input = self.inbox.recv() => input.ok_or(TransferError::Cancelled),
        }
    }

    /// Arms a watchdog that cancels the bot's send and fails the attempt.
    fn arm_timeout(&mut self, stage: Stage, after: Duration) {
        let irc = Arc::clone(&self.shared.irc);
        let interrupt = Arc::clone(&self.interrupt);
        let cancel_nick = self
            .shared
            .config
            .cancel_on_timeout
            .then(|| self.cancel_nick.clone());
        let job = self.job;

        self.watchdog.arm(stage, after, move |stage| async move {
            warn!(%job, %stage, "watchdog expired");
            if let Some(nick) = cancel_nick
                && let Err(e) = irc.privmsg(&nick, messages::xdcc_cancel()).await
            {
                warn!(%job, error = %e, "could not send XDCC CANCEL");
            }
            interrupt.trip(TransferError::PeerUnresponsive(stage));
        });
    }

    /// Arms a watchdog that falls back to a full download.
    fn arm_resume_timeout(&mut self, after: Duration) {
        let inbox = self.inbox_tx.clone();
        self.watchdog.arm(Stage::ResumeAccept, after, move |_| async move {
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(JobInput::ResumeExpired).await;
            }
        });
    }

    async fn send_cancel(&self) {
        if let Err(e) = self
            .shared
            .irc
            .privmsg(&self.cancel_nick, messages::xdcc_cancel())
            .await
        {
            warn!(job = %self.job, error = %e, "could not send XDCC CANCEL");
        }
    }

    /// Terminal states absorb further transitions.
    fn set_state(&mut self, state: TransferState) {
        if self.state.is_terminal() || self.state == state {
            return;
        }
        debug!(job = %self.job, from = ?self.state, to = ?state, "state change");
        self.state = state;
        self.shared.emit(TransferEvent::StateChanged {
            job: self.job,
            state,
        });
    }
}

/// Discards a partial file the bot would not resume.
async fn restart_file(path: &Path) -> Result<FileSink, TransferError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(TransferError::Transport(e.to_string())),
    }
    Ok(FileSink::create(path).await?)
}
