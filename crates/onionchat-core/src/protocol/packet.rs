//! Stream framing.
//!
//! Every frame is a 6-byte header (version, type, big-endian length)
//! followed by the payload. A bad header ends the stream; nothing is sent
//! back to the peer.

use super::types::PacketType;
use super::PROTOCOL_VERSION;
use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload size (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Header size: version (1) + type (1) + length (4) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// One framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    /// Bincode payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Frame a payload, refusing anything over [`MAX_PAYLOAD_SIZE`].
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Result<Self> {
        check_length(payload.len())?;
        Ok(Self {
            packet_type,
            payload,
        })
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    fn header(&self) -> [u8; HEADER_SIZE] {
        let mut header = [PROTOCOL_VERSION, self.packet_type.to_byte(), 0, 0, 0, 0];
        // new() caps the payload well below u32::MAX.
        header[2..].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        header
    }
}

fn check_length(length: usize) -> Result<()> {
    if length > MAX_PAYLOAD_SIZE {
        return Err(Error::Protocol(format!("payload of {} bytes too large", length)));
    }
    Ok(())
}

/// Validate a raw header, returning the packet type and payload length.
fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(PacketType, usize)> {
    super::validate_version(header[0])?;
    let packet_type = PacketType::from_byte(header[1])?;
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    check_length(length)?;
    Ok((packet_type, length))
}

/// Read one packet from a stream.
///
/// The header is checked before the payload buffer is allocated.
pub async fn read_packet<R>(stream: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Tor(format!("read header failed: {}", e)))?;
    let (packet_type, length) = parse_header(&header)?;

    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Tor(format!("read payload failed: {}", e)))?;

    Ok(Packet {
        packet_type,
        payload,
    })
}

/// Write one packet to a stream and flush it.
pub async fn write_packet<W>(stream: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let io = |e: std::io::Error| Error::Tor(format!("write failed: {}", e));
    stream.write_all(&packet.header()).await.map_err(io)?;
    stream.write_all(&packet.payload).await.map_err(io)?;
    stream.flush().await.map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(PacketType::Message, vec![0; 1234]).expect("should frame");
        let header = packet.header();

        assert_eq!(header[0], PROTOCOL_VERSION);
        assert_eq!(header[1], PacketType::Message.to_byte());
        assert_eq!(&header[2..], &1234u32.to_be_bytes());
        assert_eq!(parse_header(&header).expect("should parse"), (PacketType::Message, 1234));
    }

    #[test]
    fn test_payload_too_large() {
        assert!(Packet::new(PacketType::Message, vec![0u8; MAX_PAYLOAD_SIZE + 1]).is_err());

        let mut header = Packet::new(PacketType::Message, Vec::new()).expect("frame").header();
        header[2..].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());
        assert!(parse_header(&header).is_err());
    }

    #[test]
    fn test_invalid_header_fields() {
        let valid = Packet::new(PacketType::Message, Vec::new()).expect("frame").header();

        let mut bad_type = valid;
        bad_type[1] = 0xFF;
        assert!(parse_header(&bad_type).is_err());

        let mut bad_version = valid;
        bad_version[0] = 0xFF;
        assert!(parse_header(&bad_version).is_err());
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let first = Packet::new(PacketType::Status, vec![1]).expect("should create");
        let second = Packet::new(PacketType::Typing, Vec::new()).expect("should create");

        write_packet(&mut client, &first).await.expect("write");
        write_packet(&mut client, &second).await.expect("write");
        assert_eq!(read_packet(&mut server).await.expect("read"), first);
        assert_eq!(read_packet(&mut server).await.expect("read"), second);
    }

    #[tokio::test]
    async fn test_truncated_stream_errors() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let packet = Packet::new(PacketType::Status, vec![1, 2, 3]).expect("should create");
        client.write_all(&packet.header()).await.expect("write");
        client.write_all(&[1]).await.expect("write");
        drop(client);

        assert!(read_packet(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_header_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0xFF; HEADER_SIZE]).await.expect("write");

        assert!(matches!(read_packet(&mut server).await, Err(Error::Protocol(_))));
    }
}
