//! CTCP/DCC wire text for XDCC downloads.
//!
//! Pure decoding and encoding: no sockets, no IRC session. The engine
//! crate feeds inbound CTCP text through [`ctcp::parse`] and sends the
//! strings built by [`messages`].

pub mod constants;
pub mod ctcp;
pub mod error;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use ctcp::DccMessage;
pub use error::ProtocolError;
pub use types::{
    FileTarget, OfferKind, PacketSpecifier, TransferOffer, ip_from_u32, ip_to_u32, parse_address,
};
