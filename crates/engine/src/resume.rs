//! Pending resume requests.
//!
//! `DCC ACCEPT` carries only file name, port and position. The address,
//! length and token of the original offer are recovered from here.

use std::sync::{Mutex, PoisonError};

use tracing::debug;
use xdcc_protocol::TransferOffer;

use crate::types::JobId;

/// One outstanding `DCC RESUME`.
#[derive(Debug, Clone)]
pub struct ResumeEntry {
    pub nick: String,
    pub job: JobId,
    /// The offer the resume was requested for.
    pub offer: TransferOffer,
}

/// Outstanding resume requests keyed by (nick, file name).
#[derive(Debug, Default)]
pub struct ResumeQueue {
    entries: Mutex<Vec<ResumeEntry>>,
}

impl ResumeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resume request, replacing any previous one for the same
    /// nick and file.
    pub fn enqueue(&self, nick: &str, job: JobId, offer: TransferOffer) {
        let mut entries = self.lock();
        entries.retain(|e| !(same_nick(&e.nick, nick) && e.offer.file_name == offer.file_name));
        debug!(%job, nick, file = %offer.file_name, "resume request queued");
        entries.push(ResumeEntry {
            nick: nick.to_owned(),
            job,
            offer,
        });
    }

    /// Removes and returns the entry an `ACCEPT` from `nick` refers to.
    ///
    /// Exact file name first; if the bot rewrote the name, the sole entry
    /// for that nick is taken.
    pub fn resolve(&self, nick: &str, file_name: &str) -> Option<ResumeEntry> {
        let mut entries = self.lock();
        let idx = entries
            .iter()
            .position(|e| same_nick(&e.nick, nick) && e.offer.file_name == file_name)
            .or_else(|| {
                let mut from_nick = entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| same_nick(&e.nick, nick));
                match (from_nick.next(), from_nick.next()) {
                    (Some((i, _)), None) => Some(i),
                    _ => None,
                }
            })?;
        Some(entries.remove(idx))
    }

    /// Drops every entry of `job`. Returns whether one existed.
    pub fn discard(&self, job: JobId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.job != job);
        before != entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ResumeEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn same_nick(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use xdcc_protocol::{FileTarget, OfferKind};

    fn offer(name: &str) -> TransferOffer {
        TransferOffer {
            kind: OfferKind::Send,
            file_name: name.into(),
            file_path: FileTarget::Stream,
            peer_address: Ipv4Addr::new(10, 0, 0, 1),
            port: 5000,
            length: 100_000,
            token: Some("7".into()),
            position: 0,
        }
    }

    #[test]
    fn resolve_exact_match_removes_entry() {
        let q = ResumeQueue::new();
        let job = JobId::new();
        q.enqueue("Bot", job, offer("a.bin"));

        let entry = q.resolve("bot", "a.bin").unwrap();
        assert_eq!(entry.job, job);
        assert_eq!(entry.offer.token.as_deref(), Some("7"));
        assert!(q.is_empty());
        assert!(q.resolve("bot", "a.bin").is_none());
    }

    #[test]
    fn resolve_falls_back_to_sole_entry_for_nick() {
        let q = ResumeQueue::new();
        q.enqueue("bot", JobId::new(), offer("Some File.mkv"));
        assert!(q.resolve("bot", "Some_File.mkv").is_some());
    }

    #[test]
    fn no_fallback_when_ambiguous() {
        let q = ResumeQueue::new();
        q.enqueue("bot", JobId::new(), offer("a.bin"));
        q.enqueue("bot", JobId::new(), offer("b.bin"));
        assert!(q.resolve("bot", "c.bin").is_none());
        assert!(q.resolve("other", "a.bin").is_none());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn enqueue_replaces_same_key() {
        let q = ResumeQueue::new();
        let second = JobId::new();
        q.enqueue("bot", JobId::new(), offer("a.bin"));
        q.enqueue("bot", second, offer("a.bin"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.resolve("bot", "a.bin").unwrap().job, second);
    }

    #[test]
    fn discard_by_job() {
        let q = ResumeQueue::new();
        let job = JobId::new();
        q.enqueue("bot", job, offer("a.bin"));
        assert!(q.discard(job));
        assert!(!q.discard(job));
        assert!(q.is_empty());
    }
}
