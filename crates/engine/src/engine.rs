//! Engine facade and inbound CTCP routing.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use xdcc_data_channel::PortPool;
use xdcc_protocol::PacketSpecifier;

use crate::error::EngineError;
use crate::irc::IrcLink;
use crate::parser::OfferParser;
use crate::queue::{self, BatchHandle, Job, JobHandle};
use crate::resume::ResumeQueue;
use crate::transfer::JobInput;
use crate::types::{Destination, EngineConfig, JobId, TransferEvent};

const EVENT_CAPACITY: usize = 1024;

/// State shared by the engine handle and every running job.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub irc: Arc<dyn IrcLink>,
    pub ports: Arc<PortPool>,
    pub resumes: Arc<ResumeQueue>,
    pub parser: OfferParser,
    pub events: broadcast::Sender<TransferEvent>,
    pub routes: Routes,
}

impl Shared {
    /// Fire-and-forget; no subscribers is fine.
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

/// What a running attempt is listening for on its inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingOffer,
    AwaitingAccept,
    /// Connecting or transferring; the inbox is not read.
    Busy,
}

struct Route {
    job: JobId,
    bot: String,
    phase: Phase,
    inbox: mpsc::Sender<JobInput>,
}

/// Running attempts, in the order they were started.
#[derive(Default)]
pub(crate) struct Routes {
    routes: Mutex<Vec<Route>>,
}

impl Routes {
    pub fn register(&self, job: JobId, bot: &str, inbox: mpsc::Sender<JobInput>) {
        let mut routes = self.lock();
        routes.retain(|r| r.job != job);
        routes.push(Route {
            job,
            bot: bot.to_owned(),
            phase: Phase::AwaitingOffer,
            inbox,
        });
    }

    pub fn remove(&self, job: JobId) {
        self.lock().retain(|r| r.job != job);
    }

    /// Marks `job` as waiting for the bot's `DCC ACCEPT`, or done waiting.
    pub fn expect_accept(&self, job: JobId, expecting: bool) {
        if let Some(route) = self.lock().iter_mut().find(|r| r.job == job) {
            route.phase = if expecting {
                Phase::AwaitingAccept
            } else {
                Phase::Busy
            };
        }
    }

    /// Inbox of `job` if it is still waiting for an ACCEPT.
    pub fn accept_sender(&self, job: JobId) -> Option<mpsc::Sender<JobInput>> {
        self.lock()
            .iter()
            .find(|r| r.job == job && r.phase == Phase::AwaitingAccept)
            .map(|r| r.inbox.clone())
    }

    /// Picks the job a `DCC SEND` from `nick` belongs to and marks it as
    /// served.
    ///
    /// The oldest waiting job requested from `nick` wins. Without
    /// `bot_name_match`, a sole waiting job also takes offers from any
    /// nick.
    pub fn claim_offer(
        &self,
        nick: &str,
        bot_name_match: bool,
    ) -> Option<(JobId, mpsc::Sender<JobInput>)> {
        let mut routes = self.lock();
        let waiting = |r: &Route| r.phase == Phase::AwaitingOffer;
        let idx = routes
            .iter()
            .position(|r| waiting(r) && r.bot.eq_ignore_ascii_case(nick))
            .or_else(|| {
                if bot_name_match {
                    return None;
                }
                sole(routes.iter().enumerate().filter(|(_, r)| waiting(r)))
            })?;
        let route = &mut routes[idx];
        route.phase = Phase::Busy;
        Some((route.job, route.inbox.clone()))
    }

    /// Job that should hear about undecodable DCC text from `nick`.
    ///
    /// Only jobs still negotiating read their inbox; a transfer in
    /// progress is left alone.
    pub fn for_malformed(
        &self,
        nick: &str,
        bot_name_match: bool,
    ) -> Option<(JobId, mpsc::Sender<JobInput>)> {
        let routes = self.lock();
        let negotiating = |r: &Route| r.phase != Phase::Busy;
        let idx = routes
            .iter()
            .position(|r| negotiating(r) && r.bot.eq_ignore_ascii_case(nick))
            .or_else(|| {
                if bot_name_match {
                    return None;
                }
                sole(routes.iter().enumerate().filter(|(_, r)| negotiating(r)))
            })?;
        Some((routes[idx].job, routes[idx].inbox.clone()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hands `input` to a job without waiting on a full inbox.
fn deliver(job: JobId, inbox: &mpsc::Sender<JobInput>, input: JobInput) {
    match inbox.try_send(input) {
        Ok(()) => {}
        Err(TrySendError::Full(input)) => warn!(%job, ?input, "job inbox full, message dropped"),
        Err(TrySendError::Closed(_)) => debug!(%job, "job finished before its message arrived"),
    }
}

fn sole<'a>(mut iter: impl Iterator<Item = (usize, &'a Route)>) -> Option<usize> {
    match (iter.next(), iter.next()) {
        (Some((i, _)), None) => Some(i),
        _ => None,
    }
}

/// XDCC download engine.
///
/// Cheap to clone; clones share jobs, ports and subscribers.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Validates `config` and builds an engine that talks through `irc`.
    pub fn new(config: EngineConfig, irc: Arc<dyn IrcLink>) -> Result<Self, EngineError> {
        let config = config.validate()?;
        let resumes = Arc::new(ResumeQueue::new());
        let parser = OfferParser::new(config.destination.clone(), Arc::clone(&resumes));
        let ports = Arc::new(PortPool::new(config.passive_ports.iter().copied()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            destination = ?config.destination,
            ports = ?config.passive_ports,
            retries = config.retries,
            "XDCC engine ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                irc,
                ports,
                resumes,
                parser,
                events,
                routes: Routes::default(),
            }),
        })
    }

    /// Subscribes to lifecycle events of every job.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn port_pool(&self) -> &Arc<PortPool> {
        &self.shared.ports
    }

    pub fn resume_queue(&self) -> &Arc<ResumeQueue> {
        &self.shared.resumes
    }

    /// Number of attempts currently in flight.
    pub fn active_jobs(&self) -> usize {
        self.shared.routes.len()
    }

    /// Requests `packet` from `bot` and starts the job.
    pub fn download(
        &self,
        bot: &str,
        packet: impl Into<PacketSpecifier>,
    ) -> Result<JobHandle, EngineError> {
        let bot = checked_bot(bot)?;
        let stream = match self.shared.config.destination {
            Destination::Stream => Some(mpsc::channel(self.shared.config.stream_buffer)),
            Destination::Directory(_) => None,
        };
        Ok(queue::spawn_job(
            Arc::clone(&self.shared),
            Job::new(bot, packet.into()),
            stream,
        ))
    }

    /// Downloads `packets` from `bot` one at a time.
    ///
    /// Needs a directory destination.
    pub fn download_batch(
        &self,
        bot: &str,
        packets: impl IntoIterator<Item = PacketSpecifier>,
    ) -> Result<BatchHandle, EngineError> {
        let bot = checked_bot(bot)?;
        if self.shared.config.destination == Destination::Stream {
            return Err(EngineError::BatchRequiresFile);
        }
        let packets: Vec<_> = packets.into_iter().collect();
        if packets.is_empty() {
            return Err(EngineError::InvalidRequest("empty batch".into()));
        }
        Ok(queue::spawn_batch(
            Arc::clone(&self.shared),
            bot.to_owned(),
            packets,
        ))
    }

    /// Feeds CTCP text received from `nick` into the engine.
    ///
    /// Non-DCC text is ignored. A malformed DCC message fails the job
    /// still negotiating with `nick` and is returned as an error. Never
    /// waits on a job, so a caller's IRC loop keeps running.
    pub async fn handle_ctcp(&self, nick: &str, text: &str) -> Result<(), EngineError> {
        let bot_name_match = self.shared.config.bot_name_match;

        let parsed = match self.shared.parser.parse(nick, text) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(nick, error = %e, "malformed DCC message");
                if let Some((job, inbox)) = self.shared.routes.for_malformed(nick, bot_name_match) {
                    deliver(job, &inbox, JobInput::Malformed(e.clone()));
                }
                return Err(e.into());
            }
        };

        let offer = parsed.offer;
        match parsed.resuming {
            Some(job) => match self.shared.routes.accept_sender(job) {
                Some(inbox) => deliver(job, &inbox, JobInput::Accept { offer }),
                None => debug!(%job, "ACCEPT for a job no longer waiting for it"),
            },
            None => match self.shared.routes.claim_offer(nick, bot_name_match) {
                Some((job, inbox)) => {
                    debug!(%job, nick, file = %offer.file_name, "offer routed");
                    let input = JobInput::Offer {
                        nick: nick.to_owned(),
                        offer,
                    };
                    deliver(job, &inbox, input);
                }
                None => debug!(nick, file = %offer.file_name, "unsolicited DCC SEND ignored"),
            },
        }
        Ok(())
    }
}

fn checked_bot(bot: &str) -> Result<&str, EngineError> {
    let bot = bot.trim();
    if bot.is_empty() || bot.contains(char::is_whitespace) {
        return Err(EngineError::InvalidRequest(format!("invalid bot nick: {bot:?}")));
    }
    Ok(bot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox() -> mpsc::Sender<JobInput> {
        mpsc::channel(1).0
    }

    #[test]
    fn offer_goes_to_matching_bot() {
        let routes = Routes::default();
        let a = JobId::new();
        let b = JobId::new();
        routes.register(a, "BotA", inbox());
        routes.register(b, "BotB", inbox());

        let (job, _) = routes.claim_offer("botb", true).unwrap();
        assert_eq!(job, b);
        // Already served.
        assert!(routes.claim_offer("BotB", true).is_none());
        assert!(routes.claim_offer("Stranger", true).is_none());
    }

    #[test]
    fn sole_waiting_job_takes_any_nick_without_name_match() {
        let routes = Routes::default();
        let a = JobId::new();
        routes.register(a, "Bot", inbox());
        assert!(routes.claim_offer("Relay", true).is_none());
        assert_eq!(routes.claim_offer("Relay", false).unwrap().0, a);
    }

    #[test]
    fn ambiguous_offer_not_routed() {
        let routes = Routes::default();
        routes.register(JobId::new(), "A", inbox());
        routes.register(JobId::new(), "B", inbox());
        assert!(routes.claim_offer("Relay", false).is_none());
    }

    #[test]
    fn remove_forgets_job() {
        let routes = Routes::default();
        let a = JobId::new();
        routes.register(a, "Bot", inbox());
        assert!(routes.for_malformed("Bot", true).is_some());
        routes.remove(a);
        assert!(routes.for_malformed("Bot", true).is_none());
        assert_eq!(routes.len(), 0);
    }

    #[test]
    fn accept_only_reaches_job_waiting_for_it() {
        let routes = Routes::default();
        let a = JobId::new();
        routes.register(a, "Bot", inbox());
        assert!(routes.accept_sender(a).is_none());

        routes.claim_offer("Bot", true).unwrap();
        routes.expect_accept(a, true);
        assert!(routes.accept_sender(a).is_some());

        routes.expect_accept(a, false);
        assert!(routes.accept_sender(a).is_none());
    }

    #[test]
    fn malformed_text_skips_running_transfer() {
        let routes = Routes::default();
        let a = JobId::new();
        routes.register(a, "Bot", inbox());
        assert_eq!(routes.for_malformed("bot", true).unwrap().0, a);

        routes.claim_offer("Bot", true).unwrap();
        assert!(routes.for_malformed("Bot", true).is_none());
        assert!(routes.for_malformed("Bot", false).is_none());

        routes.expect_accept(a, true);
        assert_eq!(routes.for_malformed("Bot", true).unwrap().0, a);
    }

    #[test]
    fn full_inbox_does_not_block() {
        let (tx, mut rx) = mpsc::channel(1);
        let job = JobId::new();
        deliver(job, &tx, JobInput::ResumeExpired);
        deliver(job, &tx, JobInput::ResumeExpired);
        assert!(matches!(rx.try_recv(), Ok(JobInput::ResumeExpired)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn bot_nick_checked() {
        assert!(checked_bot("").is_err());
        assert!(checked_bot("two words").is_err());
        assert_eq!(checked_bot(" Bot ").unwrap(), "Bot");
    }
}
