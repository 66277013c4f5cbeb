//! Outgoing text sent to XDCC bots.

use std::net::Ipv4Addr;

use crate::constants::{DCC, RESUME, SEND, XDCC_CANCEL};
use crate::ctcp::{frame, quote_file_name};
use crate::types::{PacketSpecifier, ip_to_u32};

/// Plain PRIVMSG asking the bot for a packet: `xdcc send #5`.
pub fn xdcc_send_request(packet: &PacketSpecifier) -> String {
    format!("xdcc send {packet}")
}

/// Plain PRIVMSG aborting the current transfer.
pub fn xdcc_cancel() -> &'static str {
    XDCC_CANCEL
}

/// CTCP-framed `DCC RESUME <file> <port> <position> [token]`.
///
/// The token is only sent back for passive offers.
pub fn dcc_resume(file_name: &str, port: u16, position: u64, token: Option<&str>) -> String {
    let file = quote_file_name(file_name);
    let body = match token {
        Some(token) => format!("{DCC} {RESUME} {file} {port} {position} {token}"),
        None => format!("{DCC} {RESUME} {file} {port} {position}"),
    };
    frame(&body)
}

/// CTCP-framed reciprocal `DCC SEND <file> <ip-as-u32> <port> <length> [token]`
/// advertising our own listening socket for a passive transfer.
pub fn dcc_send(
    file_name: &str,
    address: Ipv4Addr,
    port: u16,
    length: u64,
    token: Option<&str>,
) -> String {
    let file = quote_file_name(file_name);
    let ip = ip_to_u32(address);
    let body = match token {
        Some(token) => format!("{DCC} {SEND} {file} {ip} {port} {length} {token}"),
        None => format!("{DCC} {SEND} {file} {ip} {port} {length}"),
    };
    frame(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctcp::{DccMessage, parse, tokenize, unframe};

    #[test]
    fn request_uses_normalized_packet() {
        assert_eq!(
            xdcc_send_request(&"12".parse().unwrap()),
            "xdcc send #12"
        );
        assert_eq!(
            xdcc_send_request(&"3-4".parse().unwrap()),
            "xdcc send #3-4"
        );
    }

    #[test]
    fn resume_quotes_spaces() {
        let text = dcc_resume("my file.mkv", 5000, 4096, None);
        assert_eq!(text, "\x01DCC RESUME \"my file.mkv\" 5000 4096\x01");
    }

    #[test]
    fn resume_passive_carries_token() {
        let text = dcc_resume("a.bin", 0, 10, Some("42"));
        assert_eq!(unframe(&text), "DCC RESUME a.bin 0 10 42");
    }

    #[test]
    fn quoted_name_survives_resume_roundtrip() {
        let name = "Some Show - 01 [720p].mkv";
        let text = dcc_resume(name, 0, 1, Some("9"));
        let tokens = tokenize(unframe(&text)).unwrap();
        assert_eq!(tokens[2], name);
    }

    #[test]
    fn reciprocal_send_parses_back() {
        let ip = Ipv4Addr::new(203, 0, 113, 9);
        let text = dcc_send("space name.zip", ip, 5001, 123_456, Some("17"));
        assert_eq!(
            parse(&text).unwrap(),
            Some(DccMessage::Send {
                file_name: "space name.zip".into(),
                address: ip,
                port: 5001,
                length: 123_456,
                token: Some("17".into()),
            })
        );
    }
}
