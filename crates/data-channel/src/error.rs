//! Error types for the data channel.

/// Errors produced by the DCC data connection.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("all passive ports are currently used")]
    PortsExhausted,

    #[error("cancelled")]
    Cancelled,

    #[error("stream consumer went away")]
    SinkClosed,
}
