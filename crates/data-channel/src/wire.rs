//! DCC acknowledgment framing.
//!
//! ```text
//! DATA (bot -> us): raw file bytes, no framing
//! ACK  (us -> bot): [4 bytes BE: bytes received so far, mod 2^32]
//! ```

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::DataChannelError;

/// Acknowledgment value for a running byte count.
///
/// The field is 32 bits wide; counts past 4 GiB wrap.
pub fn ack_value(received: u64) -> u32 {
    (received & u64::from(u32::MAX)) as u32
}

/// Writes the acknowledgment for `received` bytes.
pub async fn write_ack<W: AsyncWrite + Unpin>(
    writer: &mut W,
    received: u64,
) -> Result<(), DataChannelError> {
    writer.write_u32(ack_value(received)).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one acknowledgment (sender side).
#[cfg(test)]
pub(crate) async fn read_ack<R>(reader: &mut R) -> Result<u32, DataChannelError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    Ok(reader.read_u32().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_is_big_endian() {
        let mut buf = Vec::new();
        write_ack(&mut buf, 0x0102_0304).await.unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04]);
    }

    #[tokio::test]
    async fn ack_roundtrip() {
        let mut buf = Vec::new();
        write_ack(&mut buf, 1_000_000).await.unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_ack(&mut cursor).await.unwrap(), 1_000_000);
    }

    #[test]
    fn ack_wraps_past_four_gib() {
        assert_eq!(ack_value(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(ack_value(u64::from(u32::MAX) + 1), 0);
        assert_eq!(ack_value(5 * 1024 * 1024 * 1024 + 7), 1024 * 1024 * 1024 + 7);
    }
}
