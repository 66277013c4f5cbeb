//! Minimal IRC client: registration, PING, JOIN, PRIVMSG and CTCP.
//!
//! Only what a downloader needs. Incoming lines are turned into
//! [`IrcEvent`]s; outgoing lines go through a writer task.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xdcc_engine::{EngineError, IrcLink, SendFuture};
use xdcc_protocol::constants::CTCP_DELIM;

/// Something the application should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcEvent {
    /// Server accepted our registration (numeric 001).
    Registered { nick: String },
    /// CTCP PRIVMSG addressed to us. `text` keeps its delimiters.
    Ctcp { from: String, text: String },
    /// NOTICE or plain PRIVMSG addressed to us.
    Message { from: String, text: String },
    /// Server closed the connection.
    Closed,
}

/// A parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line<'a> {
    /// Nick part of the prefix, if any.
    pub source: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
}

/// Splits `[:prefix] COMMAND params... [:trailing]`.
pub fn parse_line(raw: &str) -> Option<Line<'_>> {
    let mut rest = raw.trim_end_matches(['\r', '\n']);
    let mut source = None;
    if let Some(stripped) = rest.strip_prefix(':') {
        let (prefix, tail) = stripped.split_once(' ')?;
        source = Some(prefix.split('!').next().unwrap_or(prefix));
        rest = tail;
    }
    let rest = rest.trim_start();
    let (head, trailing) = match rest.split_once(" :") {
        Some((head, trailing)) => (head, Some(trailing)),
        None => (rest, None),
    };
    let mut words = head.split_whitespace();
    let command = words.next()?;
    let mut params: Vec<&str> = words.collect();
    params.extend(trailing);
    Some(Line {
        source,
        command,
        params,
    })
}

/// Writes lines to the IRC socket; implements the engine's [`IrcLink`].
#[derive(Debug)]
pub struct IrcSender {
    outbound: mpsc::UnboundedSender<String>,
    external_ip: Option<Ipv4Addr>,
}

impl IrcSender {
    pub fn send_line(&self, line: String) -> Result<(), EngineError> {
        self.outbound
            .send(line)
            .map_err(|_| EngineError::Irc("connection closed".into()))
    }

    pub fn join(&self, channel: &str) -> Result<(), EngineError> {
        info!(channel, "joining");
        self.send_line(format!("JOIN {channel}"))
    }

    pub fn quit(&self, reason: &str) -> Result<(), EngineError> {
        self.send_line(format!("QUIT :{reason}"))
    }
}

impl IrcLink for IrcSender {
    fn privmsg<'a>(&'a self, target: &'a str, text: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            debug!(target, text = %text.trim_matches(CTCP_DELIM), "PRIVMSG");
            self.send_line(format!("PRIVMSG {target} :{text}"))
        })
    }

    fn external_ip(&self) -> Option<Ipv4Addr> {
        self.external_ip
    }
}

/// A connected IRC session.
pub struct IrcClient {
    sender: std::sync::Arc<IrcSender>,
    events: Mutex<Option<mpsc::Receiver<IrcEvent>>>,
}

impl IrcClient {
    /// Connects and registers as `nick`.
    ///
    /// `external_ip` overrides the local address of the IRC socket as
    /// the address advertised for passive transfers.
    pub async fn connect(
        host: &str,
        port: u16,
        nick: &str,
        external_ip: Option<Ipv4Addr>,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let local_ip = match stream.local_addr()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        };
        info!(host, port, nick, "connected to IRC server");

        let (reader, mut writer) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::channel(256);

        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                let data = format!("{line}\r\n");
                if let Err(e) = writer.write_all(data.as_bytes()).await {
                    warn!(error = %e, "IRC write failed");
                    break;
                }
            }
        });

        let pong_tx = outbound_tx.clone();
        let own_nick = nick.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut nick = own_nick;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "IRC read failed");
                        break;
                    }
                };
                let Some(parsed) = parse_line(&line) else {
                    continue;
                };
                if let Some(event) = handle_line(&parsed, &mut nick, &pong_tx)
                    && events_tx.send(event).await.is_err()
                {
                    break;
                }
            }
            let _ = events_tx.send(IrcEvent::Closed).await;
        });

        let sender = IrcSender {
            outbound: outbound_tx,
            external_ip: external_ip.or(local_ip),
        };
        sender.send_line(format!("NICK {nick}"))?;
        sender.send_line(format!("USER {nick} 0 * :{nick}"))?;

        Ok(Self {
            sender: std::sync::Arc::new(sender),
            events: Mutex::new(Some(events_rx)),
        })
    }

    pub fn sender(&self) -> std::sync::Arc<IrcSender> {
        std::sync::Arc::clone(&self.sender)
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<IrcEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

/// Reacts to one server line; returns the event to surface, if any.
fn handle_line(
    line: &Line<'_>,
    nick: &mut String,
    outbound: &mpsc::UnboundedSender<String>,
) -> Option<IrcEvent> {
    match line.command {
        "PING" => {
            let token = line.params.first().copied().unwrap_or_default();
            let _ = outbound.send(format!("PONG :{token}"));
            None
        }
        "001" => {
            if let Some(confirmed) = line.params.first() {
                *nick = (*confirmed).to_string();
            }
            info!(nick = %nick, "registered");
            Some(IrcEvent::Registered { nick: nick.clone() })
        }
        // Nick in use: try another.
        "433" => {
            let replacement = crate::config::randomize_nick(nick);
            warn!(taken = %nick, %replacement, "nick in use");
            *nick = replacement;
            let _ = outbound.send(format!("NICK {nick}"));
            None
        }
        "PRIVMSG" | "NOTICE" => {
            let from = line.source?.to_string();
            let target = line.params.first()?;
            if !target.eq_ignore_ascii_case(nick) {
                return None;
            }
            let text = line.params.get(1).copied().unwrap_or_default().to_string();
            if line.command == "PRIVMSG" && text.starts_with(CTCP_DELIM) {
                Some(IrcEvent::Ctcp { from, text })
            } else {
                Some(IrcEvent::Message { from, text })
            }
        }
        "ERROR" => {
            warn!(reason = ?line.params.first(), "server error");
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefixed_privmsg() {
        let line = parse_line(":Bot!bot@host PRIVMSG me :\x01DCC SEND a.bin 1 2 3\x01\r\n").unwrap();
        assert_eq!(line.source, Some("Bot"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["me", "\x01DCC SEND a.bin 1 2 3\x01"]);
    }

    #[test]
    fn parse_without_prefix() {
        let line = parse_line("PING :irc.example.net").unwrap();
        assert_eq!(line.source, None);
        assert_eq!(line.command, "PING");
        assert_eq!(line.params, vec!["irc.example.net"]);
    }

    #[test]
    fn parse_numeric_with_middle_params() {
        let line = parse_line(":srv 433 * xdccget :Nickname is already in use").unwrap();
        assert_eq!(line.command, "433");
        assert_eq!(line.params, vec!["*", "xdccget", "Nickname is already in use"]);
    }

    #[test]
    fn empty_line_ignored() {
        assert!(parse_line("").is_none());
        assert!(parse_line(":prefixonly").is_none());
    }

    #[test]
    fn ping_is_answered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut nick = "me".to_string();
        let line = parse_line("PING :abc").unwrap();
        assert!(handle_line(&line, &mut nick, &tx).is_none());
        assert_eq!(rx.try_recv().unwrap(), "PONG :abc");
    }

    #[test]
    fn ctcp_to_us_becomes_event() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut nick = "Me".to_string();
        let line = parse_line(":Bot!b@h PRIVMSG me :\x01DCC ACCEPT a.bin 0 10\x01").unwrap();
        assert_eq!(
            handle_line(&line, &mut nick, &tx),
            Some(IrcEvent::Ctcp {
                from: "Bot".into(),
                text: "\x01DCC ACCEPT a.bin 0 10\x01".into(),
            })
        );

        let channel = parse_line(":Bot!b@h PRIVMSG #chan :hello").unwrap();
        assert!(handle_line(&channel, &mut nick, &tx).is_none());
    }

    #[test]
    fn nick_collision_picks_new_nick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut nick = "xdccget".to_string();
        let line = parse_line(":srv 433 * xdccget :in use").unwrap();
        handle_line(&line, &mut nick, &tx);
        assert!(nick.starts_with("xdccge"));
        assert_eq!(rx.try_recv().unwrap(), format!("NICK {nick}"));
    }

    #[test]
    fn welcome_confirms_nick() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut nick = "asked".to_string();
        let line = parse_line(":srv 001 given :Welcome").unwrap();
        assert_eq!(
            handle_line(&line, &mut nick, &tx),
            Some(IrcEvent::Registered {
                nick: "given".into()
            })
        );
        assert_eq!(nick, "given");
    }

    #[tokio::test]
    async fn link_frames_privmsg() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = IrcSender {
            outbound: tx,
            external_ip: Some(Ipv4Addr::LOCALHOST),
        };
        sender.privmsg("Bot", "xdcc send #3").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "PRIVMSG Bot :xdcc send #3");
        assert_eq!(sender.external_ip(), Some(Ipv4Addr::LOCALHOST));
    }
}
