//! Engine error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use xdcc_data_channel::DataChannelError;
use xdcc_protocol::ProtocolError;

/// A wait guarded by a watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Waiting for the bot to answer `xdcc send`.
    BotReply,
    /// Active mode: connecting to the bot.
    Connect,
    /// Passive mode: waiting for the bot to connect to us.
    PassiveConnect,
    /// Waiting for the next chunk of data.
    Idle,
    /// Waiting for `DCC ACCEPT` after a `DCC RESUME`.
    ResumeAccept,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BotReply => "no response from bot",
            Self::Connect => "couldn't connect to bot",
            Self::PassiveConnect => "no initial connection",
            Self::Idle => "not receiving data",
            Self::ResumeAccept => "resume not accepted",
        };
        f.write_str(text)
    }
}

/// Errors returned by the engine API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("batch downloads need a file destination")]
    BatchRequiresFile,

    #[error("IRC error: {0}")]
    Irc(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a transfer ended in the `Failed` state.
///
/// Cloneable so it can travel on broadcast events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// The peer sent DCC text we could not decode.
    #[error(transparent)]
    Malformed(#[from] ProtocolError),

    /// Every configured passive port is in use.
    #[error("all passive ports are currently used")]
    CapacityExhausted,

    /// A watchdog fired.
    #[error("timeout: {0}")]
    PeerUnresponsive(Stage),

    /// Socket, file or IRC failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether repeating the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PeerUnresponsive(_) | Self::Transport(_))
    }

    /// Whether the peer should be told to stop sending.
    ///
    /// Watchdogs send their own cancel before tripping, so timeouts are
    /// excluded here.
    pub(crate) fn needs_cancel_message(&self) -> bool {
        matches!(
            self,
            Self::CapacityExhausted | Self::Transport(_) | Self::Cancelled
        )
    }
}

impl From<EngineError> for TransferError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Protocol(p) => Self::Malformed(p),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<DataChannelError> for TransferError {
    fn from(e: DataChannelError) -> Self {
        match e {
            DataChannelError::PortsExhausted => Self::CapacityExhausted,
            DataChannelError::Cancelled => Self::Cancelled,
            other => Self::Transport(other.to_string()),
        }
    }
}
