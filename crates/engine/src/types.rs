//! Engine configuration and lifecycle events.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xdcc_protocol::{PacketSpecifier, TransferOffer};

use crate::error::{EngineError, TransferError};

/// Identifies one requested download across its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell jobs apart in logs.
        let full = self.0.simple().to_string();
        f.write_str(&full[..8])
    }
}

/// Where downloaded bytes go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// Write `<dir>/<file name>` on disk.
    Directory(PathBuf),
    /// Push chunks to the job's stream receiver.
    Stream,
}

/// Watchdog durations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for the bot's `DCC SEND` after `xdcc send`.
    pub bot_reply: Duration,
    /// Active connect, or passive wait for the bot to connect.
    pub connect: Duration,
    /// Silence allowed between two chunks.
    pub idle: Duration,
    /// Wait for `DCC ACCEPT` before restarting from zero.
    pub resume_accept: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            bot_reply: Duration::from_secs(15),
            connect: Duration::from_secs(10),
            idle: Duration::from_secs(2),
            resume_accept: Duration::from_secs(10),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub destination: Destination,
    /// Ports we may listen on for passive transfers.
    pub passive_ports: Vec<u16>,
    /// Only accept offers from the nick the packet was requested from.
    pub bot_name_match: bool,
    /// Extra attempts for retryable failures (file destination only).
    pub retries: u32,
    /// Send `XDCC CANCEL` to the bot when a watchdog fires.
    pub cancel_on_timeout: bool,
    pub timeouts: TimeoutConfig,
    /// Address advertised in passive mode; overrides the IRC link's.
    pub external_ip: Option<Ipv4Addr>,
    /// Chunks buffered per stream receiver.
    pub stream_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            destination: Destination::Directory(PathBuf::from("downloads")),
            passive_ports: vec![5001],
            bot_name_match: true,
            retries: 0,
            cancel_on_timeout: true,
            timeouts: TimeoutConfig::default(),
            external_ip: None,
            stream_buffer: 64,
        }
    }
}

impl EngineConfig {
    /// Checks the configuration and resolves the download directory.
    ///
    /// A relative directory is made absolute against the working
    /// directory and created if missing.
    pub fn validate(mut self) -> Result<Self, EngineError> {
        if self.passive_ports.is_empty() {
            return Err(EngineError::InvalidConfig(
                "passive_ports must not be empty".into(),
            ));
        }
        if self.passive_ports.contains(&0) {
            return Err(EngineError::InvalidConfig(
                "passive_ports must not contain port 0".into(),
            ));
        }
        let t = &self.timeouts;
        if [t.bot_reply, t.connect, t.idle, t.resume_accept]
            .iter()
            .any(Duration::is_zero)
        {
            return Err(EngineError::InvalidConfig(
                "timeouts must be non-zero".into(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(EngineError::InvalidConfig(
                "stream_buffer must be non-zero".into(),
            ));
        }

        if let Destination::Directory(dir) = &self.destination {
            let dir = if dir.is_absolute() {
                dir.clone()
            } else {
                std::env::current_dir()?.join(dir)
            };
            std::fs::create_dir_all(&dir)?;
            self.destination = Destination::Directory(dir);
        }
        Ok(self)
    }
}

/// Lifecycle state of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Requested,
    AwaitingOffer,
    ResumeRequested,
    Connecting,
    Listening,
    Transferring,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Result of a finished transfer.
#[derive(Debug, Clone)]
pub struct Completion {
    pub offer: Arc<TransferOffer>,
    /// Bytes received on the final data connection.
    pub received: u64,
}

/// Broadcast to every [`Engine::subscribe`](crate::Engine::subscribe)r.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// `xdcc send` went out to the bot.
    Requested {
        job: JobId,
        bot: String,
        packet: PacketSpecifier,
    },
    StateChanged {
        job: JobId,
        state: TransferState,
    },
    /// Data connection established.
    Started {
        job: JobId,
        offer: Arc<TransferOffer>,
    },
    /// A chunk arrived; `received` counts this connection only.
    Progress {
        job: JobId,
        offer: Arc<TransferOffer>,
        received: u64,
        bytes_per_second: f64,
        eta: Option<Duration>,
    },
    Completed {
        job: JobId,
        offer: Arc<TransferOffer>,
        received: u64,
    },
    Failed {
        job: JobId,
        error: TransferError,
        offer: Option<Arc<TransferOffer>>,
    },
    /// A retryable failure; another attempt follows.
    Retrying {
        job: JobId,
        attempt: u32,
        error: TransferError,
    },
    /// Every packet of a batch reached a terminal state.
    BatchCompleted {
        bot: String,
        packets: Vec<PacketSpecifier>,
    },
}

impl TransferEvent {
    /// Job the event belongs to, if any.
    pub fn job(&self) -> Option<JobId> {
        match self {
            Self::Requested { job, .. }
            | Self::StateChanged { job, .. }
            | Self::Started { job, .. }
            | Self::Progress { job, .. }
            | Self::Completed { job, .. }
            | Self::Failed { job, .. }
            | Self::Retrying { job, .. } => Some(*job),
            Self::BatchCompleted { .. } => None,
        }
    }
}
