use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Which DCC message produced an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    /// `DCC SEND`: a fresh offer from the bot.
    Send,
    /// `DCC ACCEPT`: the bot agreed to resume a previous offer.
    Accept,
}

/// Where the bytes of an offer end up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTarget {
    /// Resolved destination path on disk.
    Path(PathBuf),
    /// Bytes are pushed to a stream consumer instead of a file.
    Stream,
}

/// A transfer offer decoded from a `DCC SEND` or merged from a `DCC ACCEPT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub kind: OfferKind,
    /// File name as announced by the peer (quotes removed).
    pub file_name: String,
    pub file_path: FileTarget,
    pub peer_address: Ipv4Addr,
    /// `0` means passive mode: we listen and the peer connects to us.
    pub port: u16,
    /// Declared total size of the file in bytes.
    pub length: u64,
    /// Passive-mode correlation id, opaque to us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Resume offset; `0` unless the offer was accepted for resume.
    #[serde(default)]
    pub position: u64,
}

impl TransferOffer {
    /// True when the peer expects us to listen.
    pub fn is_passive(&self) -> bool {
        self.port == 0
    }

    /// Bytes still expected on the data connection.
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.position)
    }

    /// Address to connect to in active mode.
    pub fn peer_socket(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.peer_address, self.port))
    }
}

/// Unpacks the DCC address field (decimal u32, network order).
pub fn ip_from_u32(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Packs a dotted-quad address into the DCC address field.
///
/// Equal to `((b0*256+b1)*256+b2)*256+b3`.
pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// Decodes the address field of a `DCC SEND`.
///
/// The field is normally a decimal u32; some bots send a dotted literal,
/// which is accepted as-is.
pub fn parse_address(field: &str) -> Result<Ipv4Addr, ProtocolError> {
    if let Ok(n) = field.parse::<u32>() {
        return Ok(ip_from_u32(n));
    }
    field
        .parse::<Ipv4Addr>()
        .map_err(|_| ProtocolError::Malformed(format!("invalid address field: {field}")))
}

/// A packet (or packet range) requested from an XDCC bot.
///
/// Always rendered as `#N` or `#N-M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketSpecifier {
    pub first: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<u32>,
}

impl PacketSpecifier {
    pub fn single(number: u32) -> Self {
        Self {
            first: number,
            last: None,
        }
    }
}

impl From<u32> for PacketSpecifier {
    fn from(number: u32) -> Self {
        Self::single(number)
    }
}

impl FromStr for PacketSpecifier {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidPacket(s.to_string());
        let body = s.trim();
        let body = body.strip_prefix('#').unwrap_or(body);
        let number = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u32>().map_err(|_| invalid())
        };

        match body.split_once('-') {
            Some((first, last)) => Ok(Self {
                first: number(first)?,
                last: Some(number(last)?),
            }),
            None => Ok(Self::single(number(body)?)),
        }
    }
}

impl fmt::Display for PacketSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last {
            Some(last) => write!(f, "#{}-{last}", self.first),
            None => write!(f, "#{}", self.first),
        }
    }
}
