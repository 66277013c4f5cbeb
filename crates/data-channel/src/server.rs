//! Passive-mode listener: the bot connects to us.
//!
//! Binds a port leased from the [`PortPool`](crate::PortPool), accepts a
//! single connection and drops the listener. The lease travels with the
//! accepted stream so the port stays reserved until the transfer ends.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DataChannelError;
use crate::port_pool::PortLease;

/// A bound passive listener holding its port lease.
#[derive(Debug)]
pub struct PassiveListener {
    listener: TcpListener,
    lease: PortLease,
}

impl PassiveListener {
    /// Binds `0.0.0.0:<leased port>`.
    ///
    /// On failure the lease is dropped, which returns the port to the pool.
    pub async fn bind(lease: PortLease) -> Result<Self, DataChannelError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, lease.port()));
        let listener = TcpListener::bind(addr).await?;
        info!(port = lease.port(), "passive DCC listener bound");
        Ok(Self { listener, lease })
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Waits for the bot's connection.
    ///
    /// Only one connection is accepted; the listener is closed afterwards.
    pub async fn accept(
        self,
        cancel: &CancellationToken,
    ) -> Result<(TcpStream, PortLease), DataChannelError> {
        let Self { listener, lease } = self;
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = listener.accept() => {
                let (stream, addr) = result?;
                info!(%addr, port = lease.port(), "passive DCC connection accepted");
                stream
            }
        };
        drop(listener);
        stream.set_nodelay(true)?;
        Ok((stream, lease))
    }
}
