//! Active-mode connection: we dial the address the bot advertised.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DataChannelError;

/// Connects to the bot's DCC socket.
///
/// Returns [`DataChannelError::Cancelled`] as soon as `cancel` trips; the
/// caller's watchdog decides when that happens.
pub async fn connect(
    addr: SocketAddr,
    cancel: &CancellationToken,
) -> Result<TcpStream, DataChannelError> {
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(DataChannelError::Cancelled);
        }
        result = TcpStream::connect(addr) => result?,
    };
    // Acks are tiny; don't let Nagle hold them back.
    stream.set_nodelay(true)?;
    info!(%addr, "DCC connection opened");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let cancel = CancellationToken::new();
        let stream = connect(addr, &cancel).await.unwrap();
        let (_, peer) = accept.await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn cancelled_before_connect() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Non-routable address: the connect would otherwise hang.
        let addr: SocketAddr = "10.255.255.1:9".parse().unwrap();
        let result = connect(addr, &cancel).await;
        assert!(matches!(result, Err(DataChannelError::Cancelled)));
    }

    #[tokio::test]
    async fn refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let result = connect(addr, &cancel).await;
        assert!(matches!(result, Err(DataChannelError::Io(_))));
    }
}
