//! DCC data connection for XDCC downloads.
//!
//! One TCP connection per transfer. Bytes flow from the bot to us; after
//! every chunk we write back a 4-byte big-endian running byte count.
//!
//! Two topologies:
//! - **active**: we connect to the address/port the bot advertised ([`client`]);
//! - **passive**: we listen on a port drawn from a [`PortPool`] and the bot
//!   connects to us ([`server`]).
//!
//! Timeouts are not handled here: every blocking call takes a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) that the
//! caller's watchdog trips.

pub mod client;
pub mod error;
pub mod port_pool;
pub mod receive;
pub mod server;
pub mod sink;
pub mod wire;

pub use error::DataChannelError;
pub use port_pool::{PortLease, PortPool};
pub use receive::{ReceiveOptions, ReceiveStep, receive};
pub use server::PassiveListener;
pub use sink::{FileSink, Sink, StreamEvent, StreamSink};

/// Read buffer size for the data socket (64 KB).
pub const TCP_BUFFER_SIZE: usize = 64 * 1024;
