//! Turns inbound CTCP text into transfer offers.

use std::path::{Component, Path};
use std::sync::Arc;

use tracing::debug;
use xdcc_protocol::ctcp::{self, DccMessage};
use xdcc_protocol::{FileTarget, OfferKind, ProtocolError, TransferOffer};

use crate::resume::ResumeQueue;
use crate::types::{Destination, JobId};

/// A decoded offer and, for `DCC ACCEPT`, the job that asked to resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOffer {
    pub offer: TransferOffer,
    pub resuming: Option<JobId>,
}

/// Decodes `DCC SEND` / `DCC ACCEPT` and resolves destination paths.
#[derive(Debug, Clone)]
pub struct OfferParser {
    destination: Destination,
    resumes: Arc<ResumeQueue>,
}

impl OfferParser {
    pub fn new(destination: Destination, resumes: Arc<ResumeQueue>) -> Self {
        Self {
            destination,
            resumes,
        }
    }

    /// Parses CTCP text received from `nick`.
    ///
    /// `Ok(None)` for anything that is not a SEND or ACCEPT, and for an
    /// ACCEPT no pending resume matches.
    pub fn parse(&self, nick: &str, text: &str) -> Result<Option<ParsedOffer>, ProtocolError> {
        let Some(message) = ctcp::parse(text)? else {
            return Ok(None);
        };

        match message {
            DccMessage::Send {
                file_name,
                address,
                port,
                length,
                token,
            } => {
                let file_path = self.target_for(&file_name)?;
                Ok(Some(ParsedOffer {
                    offer: TransferOffer {
                        kind: OfferKind::Send,
                        file_name,
                        file_path,
                        peer_address: address,
                        port,
                        length,
                        token,
                        position: 0,
                    },
                    resuming: None,
                }))
            }
            DccMessage::Accept {
                file_name,
                port,
                position,
            } => {
                let Some(entry) = self.resumes.resolve(nick, &file_name) else {
                    debug!(nick, file = %file_name, "ACCEPT without pending resume, ignored");
                    return Ok(None);
                };
                if position > entry.offer.length {
                    return Err(ProtocolError::Malformed(format!(
                        "resume position {position} beyond length {}",
                        entry.offer.length
                    )));
                }
                Ok(Some(ParsedOffer {
                    offer: TransferOffer {
                        kind: OfferKind::Accept,
                        port,
                        position,
                        ..entry.offer
                    },
                    resuming: Some(entry.job),
                }))
            }
        }
    }

    fn target_for(&self, file_name: &str) -> Result<FileTarget, ProtocolError> {
        match &self.destination {
            Destination::Stream => Ok(FileTarget::Stream),
            Destination::Directory(dir) => Ok(FileTarget::Path(dir.join(safe_file_name(file_name)?))),
        }
    }
}

/// Rejects names that would escape the download directory.
fn safe_file_name(name: &str) -> Result<&str, ProtocolError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('\\') => Ok(name),
        _ => Err(ProtocolError::Malformed(format!("unsafe file name: {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn parser(dest: Destination) -> (OfferParser, Arc<ResumeQueue>) {
        let resumes = Arc::new(ResumeQueue::new());
        (OfferParser::new(dest, Arc::clone(&resumes)), resumes)
    }

    #[test]
    fn send_resolves_path() {
        let (p, _) = parser(Destination::Directory(PathBuf::from("/dl")));
        let parsed = p
            .parse("bot", "\x01DCC SEND \"my file.bin\" 3232235777 5000 1000000\x01")
            .unwrap()
            .unwrap();
        let offer = parsed.offer;
        assert_eq!(offer.kind, OfferKind::Send);
        assert_eq!(offer.file_name, "my file.bin");
        assert_eq!(offer.file_path, FileTarget::Path(PathBuf::from("/dl/my file.bin")));
        assert_eq!(offer.peer_address, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(offer.port, 5000);
        assert_eq!(offer.length, 1_000_000);
        assert_eq!(offer.position, 0);
        assert!(parsed.resuming.is_none());
    }

    #[test]
    fn send_in_stream_mode() {
        let (p, _) = parser(Destination::Stream);
        let parsed = p.parse("bot", "DCC SEND a.bin 16777343 0 42 99").unwrap().unwrap();
        assert_eq!(parsed.offer.file_path, FileTarget::Stream);
        assert!(parsed.offer.is_passive());
        assert_eq!(parsed.offer.token.as_deref(), Some("99"));
    }

    #[test]
    fn traversal_names_rejected() {
        let (p, _) = parser(Destination::Directory(PathBuf::from("/dl")));
        for name in ["../etc/passwd", "/etc/passwd", "a/b.bin", ".."] {
            let text = format!("DCC SEND {name} 16777343 5000 10");
            assert!(p.parse("bot", &text).is_err(), "{name} accepted");
        }
    }

    #[test]
    fn accept_merges_pending_resume() {
        let (p, resumes) = parser(Destination::Directory(PathBuf::from("/dl")));
        let sent = p
            .parse("bot", "DCC SEND a.bin 3232235777 0 100000 abc")
            .unwrap()
            .unwrap()
            .offer;
        let job = JobId::new();
        resumes.enqueue("bot", job, sent.clone());

        let parsed = p
            .parse("bot", "\x01DCC ACCEPT a.bin 0 4096 abc\x01")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.resuming, Some(job));
        let offer = parsed.offer;
        assert_eq!(offer.kind, OfferKind::Accept);
        assert_eq!(offer.peer_address, sent.peer_address);
        assert_eq!(offer.length, 100_000);
        assert_eq!(offer.token.as_deref(), Some("abc"));
        assert_eq!(offer.position, 4096);
        assert_eq!(offer.remaining(), 95_904);
        assert!(resumes.is_empty());
    }

    #[test]
    fn accept_without_resume_ignored() {
        let (p, _) = parser(Destination::Stream);
        assert!(p.parse("bot", "DCC ACCEPT a.bin 5000 10").unwrap().is_none());
    }

    #[test]
    fn accept_past_end_is_malformed() {
        let (p, resumes) = parser(Destination::Stream);
        let sent = p.parse("bot", "DCC SEND a.bin 1 5000 10").unwrap().unwrap().offer;
        resumes.enqueue("bot", JobId::new(), sent);
        assert!(p.parse("bot", "DCC ACCEPT a.bin 5000 11").is_err());
    }

    #[test]
    fn other_ctcp_ignored() {
        let (p, _) = parser(Destination::Stream);
        assert!(p.parse("bot", "\x01VERSION\x01").unwrap().is_none());
        assert!(p.parse("bot", "DCC CHAT chat 1 2").unwrap().is_none());
    }

    #[test]
    fn truncated_send_is_malformed() {
        let (p, _) = parser(Destination::Stream);
        assert!(p.parse("bot", "DCC SEND a.bin 1 5000").is_err());
    }
}
