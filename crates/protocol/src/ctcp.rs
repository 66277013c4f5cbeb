//! CTCP framing and DCC message decoding.
//!
//! Inbound DCC text looks like
//!
//! ```text
//! DCC SEND <file> <ip-as-u32> <port> <length> [token]
//! DCC ACCEPT <file> <port> <position> [token]
//! ```
//!
//! where `<file>` is wrapped in double quotes when it contains whitespace.

use std::borrow::Cow;
use std::net::Ipv4Addr;

use crate::constants::{ACCEPT, CTCP_DELIM, DCC, SEND};
use crate::error::ProtocolError;
use crate::types::parse_address;

/// A DCC message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMessage {
    Send {
        file_name: String,
        address: Ipv4Addr,
        port: u16,
        length: u64,
        token: Option<String>,
    },
    Accept {
        file_name: String,
        port: u16,
        position: u64,
    },
}

/// Wraps a message body in CTCP delimiters.
pub fn frame(body: &str) -> String {
    format!("{CTCP_DELIM}{body}{CTCP_DELIM}")
}

/// Strips CTCP delimiters, if present.
pub fn unframe(text: &str) -> &str {
    text.trim_matches(CTCP_DELIM)
}

/// Quotes a file name when it contains whitespace.
pub fn quote_file_name(name: &str) -> Cow<'_, str> {
    if name.chars().any(char::is_whitespace) {
        Cow::Owned(format!("\"{name}\""))
    } else {
        Cow::Borrowed(name)
    }
}

/// Splits CTCP text on whitespace, keeping double-quoted segments together.
///
/// Quotes are removed from the returned tokens. A token may mix quoted and
/// bare segments (`a"b c"d` yields `ab cd`).
pub fn tokenize(text: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;

    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_quotes {
        return Err(ProtocolError::Malformed(format!(
            "unterminated quote in: {text}"
        )));
    }
    if in_token {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "received unexpected msg: {text:?}"
        )));
    }
    Ok(tokens)
}

/// Decodes a CTCP message into a DCC message.
///
/// Returns `Ok(None)` for anything that is not `DCC SEND` or `DCC ACCEPT`
/// (the verb match is case-sensitive).
pub fn parse(text: &str) -> Result<Option<DccMessage>, ProtocolError> {
    let tokens = tokenize(unframe(text))?;
    if tokens.len() < 2 || tokens[0] != DCC {
        return Ok(None);
    }

    match tokens[1].as_str() {
        SEND => parse_send(&tokens).map(Some),
        ACCEPT => parse_accept(&tokens).map(Some),
        _ => Ok(None),
    }
}

fn parse_send(tokens: &[String]) -> Result<DccMessage, ProtocolError> {
    if tokens.len() < 6 {
        return Err(ProtocolError::Malformed(format!(
            "DCC SEND needs file, address, port and length, got {} fields",
            tokens.len() - 2
        )));
    }
    Ok(DccMessage::Send {
        file_name: tokens[2].clone(),
        address: parse_address(&tokens[3])?,
        port: number(&tokens[4], "port")?,
        length: number(&tokens[5], "length")?,
        token: tokens.get(6).cloned(),
    })
}

fn parse_accept(tokens: &[String]) -> Result<DccMessage, ProtocolError> {
    if tokens.len() < 5 {
        return Err(ProtocolError::Malformed(format!(
            "DCC ACCEPT needs file, port and position, got {} fields",
            tokens.len() - 2
        )));
    }
    Ok(DccMessage::Accept {
        file_name: tokens[2].clone(),
        port: number(&tokens[3], "port")?,
        position: number(&tokens[4], "position")?,
    })
}

fn number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, ProtocolError> {
    field
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("invalid {what}: {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_plain() {
        assert_eq!(
            tokenize("DCC SEND file.txt 1 2 3").unwrap(),
            vec!["DCC", "SEND", "file.txt", "1", "2", "3"]
        );
    }

    #[test]
    fn tokenize_quoted_segment() {
        let tokens = tokenize(r#"DCC SEND "my file  v2.mkv" 1 2 3"#).unwrap();
        assert_eq!(tokens[2], "my file  v2.mkv");
        assert_eq!(tokens.len(), 6);
    }

    #[test]
    fn tokenize_mixed_segment() {
        assert_eq!(tokenize(r#"a"b c"d e"#).unwrap(), vec!["ab cd", "e"]);
    }

    #[test]
    fn tokenize_rejects_empty_and_unterminated() {
        assert!(tokenize("").is_err());
        assert!(tokenize("   ").is_err());
        assert!(tokenize(r#"DCC SEND "open 1 2 3"#).is_err());
    }

    #[test]
    fn parse_send_fields() {
        let msg = parse("DCC SEND file.bin 3232235796 5000 1048576 77").unwrap();
        assert_eq!(
            msg,
            Some(DccMessage::Send {
                file_name: "file.bin".into(),
                address: Ipv4Addr::new(192, 168, 1, 20),
                port: 5000,
                length: 1_048_576,
                token: Some("77".into()),
            })
        );
    }

    #[test]
    fn parse_send_without_token() {
        match parse("\x01DCC SEND a.txt 16777343 4000 10\x01").unwrap() {
            Some(DccMessage::Send {
                address, token, ..
            }) => {
                assert_eq!(address, Ipv4Addr::new(1, 0, 0, 127));
                assert!(token.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_accept_fields() {
        let msg = parse(r#"DCC ACCEPT "two words.iso" 0 4096"#).unwrap();
        assert_eq!(
            msg,
            Some(DccMessage::Accept {
                file_name: "two words.iso".into(),
                port: 0,
                position: 4096,
            })
        );
    }

    #[test]
    fn parse_ignores_other_messages() {
        assert_eq!(parse("VERSION").unwrap(), None);
        assert_eq!(parse("DCC CHAT chat 1 2").unwrap(), None);
        assert_eq!(parse("dcc send a 1 2 3").unwrap(), None);
        assert_eq!(parse("PING 12345").unwrap(), None);
    }

    #[test]
    fn parse_rejects_bad_numbers() {
        assert!(parse("DCC SEND a.txt 1 notaport 3").is_err());
        assert!(parse("DCC SEND a.txt 1 70000 3").is_err());
        assert!(parse("DCC SEND a.txt 1 2").is_err());
        assert!(parse("DCC ACCEPT a.txt 0").is_err());
    }

    #[test]
    fn quoting_only_when_needed() {
        assert_eq!(quote_file_name("plain.txt"), "plain.txt");
        assert_eq!(quote_file_name("with space.txt"), "\"with space.txt\"");
    }

    #[test]
    fn frame_and_unframe() {
        let framed = frame("DCC SEND a 1 2 3");
        assert!(framed.starts_with('\x01') && framed.ends_with('\x01'));
        assert_eq!(unframe(&framed), "DCC SEND a 1 2 3");
        assert_eq!(unframe("no delimiters"), "no delimiters");
    }
}
