//! The receive loop shared by active and passive transfers.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::TCP_BUFFER_SIZE;
use crate::error::DataChannelError;
use crate::sink::Sink;
use crate::wire::write_ack;

/// Parameters of one receive loop.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    /// Bytes the peer is expected to send on this connection.
    pub expected: u64,
    /// Shut down our write side once `expected` bytes arrived
    /// (active mode).
    pub close_when_complete: bool,
}

/// Progress of the receive loop, reported through its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStep {
    /// A chunk arrived and is being handed to the sink. Time spent in a
    /// slow sink is not peer silence.
    Read,
    /// The chunk reached the sink and was acknowledged; running total.
    Delivered(u64),
}

/// Pumps the data socket into `sink` until the peer closes it.
///
/// For every chunk: write it to the sink, write back the 4-byte running
/// total, then report [`ReceiveStep::Delivered`]. Both the socket read and
/// the sink write give way to `cancel`. Returns the total number of bytes
/// received on this connection. The sink is not closed here.
pub async fn receive<S, F>(
    stream: S,
    sink: &mut Sink,
    options: ReceiveOptions,
    cancel: &CancellationToken,
    mut on_step: F,
) -> Result<u64, DataChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(ReceiveStep),
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; TCP_BUFFER_SIZE];
    let mut received: u64 = 0;
    let mut write_open = true;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = reader.read(&mut buf) => result?,
        };
        if n == 0 {
            break;
        }

        on_step(ReceiveStep::Read);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(received, "cancelled while the sink was busy");
                return Err(DataChannelError::Cancelled);
            }
            result = sink.write(&buf[..n]) => result?,
        }
        received += n as u64;

        if write_open && let Err(e) = write_ack(&mut writer, received).await {
            // Some bots hang up right after the last byte.
            if received < options.expected {
                return Err(e);
            }
            debug!(received, error = %e, "final ack not delivered");
            write_open = false;
        }

        on_step(ReceiveStep::Delivered(received));

        if options.close_when_complete && write_open && received >= options.expected {
            debug!(received, "all bytes received, closing write side");
            writer.shutdown().await?;
            write_open = false;
        }
    }

    info!(received, expected = options.expected, "DCC peer closed connection");
    Ok(received)
}
