//! The engine's view of the IRC session.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;

use crate::error::EngineError;

/// Future returned by [`IrcLink::privmsg`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>>;

/// Outbound half of an IRC client.
///
/// The host application owns the IRC connection. It forwards incoming
/// CTCP text to [`Engine::handle_ctcp`](crate::Engine::handle_ctcp) and
/// lends the engine this handle for outgoing messages.
pub trait IrcLink: Send + Sync {
    /// Sends `text` as a PRIVMSG. CTCP bodies arrive already framed.
    fn privmsg<'a>(&'a self, target: &'a str, text: &'a str) -> SendFuture<'a>;

    /// Our address as seen by other IRC users, if known.
    fn external_ip(&self) -> Option<Ipv4Addr>;
}
