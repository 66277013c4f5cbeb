/// Delimiter wrapped around every CTCP message body.
pub const CTCP_DELIM: char = '\x01';

/// First token of every DCC message.
pub const DCC: &str = "DCC";

/// Offer verb: the peer wants to send us a file.
pub const SEND: &str = "SEND";

/// Reply verb: the peer agreed to resume at a position.
pub const ACCEPT: &str = "ACCEPT";

/// Request verb: we ask the peer to resume at a position.
pub const RESUME: &str = "RESUME";

/// Plain PRIVMSG asking an XDCC bot to abort the current transfer.
pub const XDCC_CANCEL: &str = "XDCC CANCEL";

/// Bytes re-requested when a local file already has the full declared length.
///
/// The tail is downloaded again so a stale file whose size matches by
/// coincidence still gets its last block verified by the bot.
pub const RESUME_BACKOFF: u64 = 8192;
