//! XDCC transfer engine.
//!
//! The host application owns the IRC connection. It hands the engine an
//! [`IrcLink`] for outgoing PRIVMSGs and forwards every CTCP message it
//! receives to [`Engine::handle_ctcp`]. The engine requests packets,
//! matches the bots' `DCC SEND` offers to jobs, negotiates resumes, runs
//! the DCC data connection and reports progress as [`TransferEvent`]s.

mod engine;
pub mod error;
pub mod irc;
pub mod parser;
pub mod progress;
mod queue;
pub mod resume;
mod transfer;
pub mod types;
pub mod watchdog;

pub use engine::Engine;
pub use error::{EngineError, Stage, TransferError};
pub use irc::{IrcLink, SendFuture};
pub use queue::{BatchHandle, BatchReport, JobHandle};
pub use resume::ResumeQueue;
pub use types::{Completion, Destination, EngineConfig, JobId, TimeoutConfig, TransferEvent, TransferState};

pub use xdcc_data_channel::StreamEvent;
pub use xdcc_protocol::{PacketSpecifier, TransferOffer};
