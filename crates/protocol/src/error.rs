//! Error types for CTCP/DCC text handling.

/// Errors produced while decoding or building DCC wire text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The CTCP text could not be tokenized or a DCC field failed to decode.
    #[error("malformed CTCP message: {0}")]
    Malformed(String),

    /// A packet specifier is not `N`, `#N`, `N-M` or `#N-M`.
    #[error("invalid packet specifier: {0}")]
    InvalidPacket(String),
}
