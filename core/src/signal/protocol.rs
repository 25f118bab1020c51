//! Relay wire protocol — frames and length-prefixed framing
//!
//! Everything the relay ever sees. `Forward` payloads are opaque bytes;
//! the relay moves them between the two bridged peers without looking
//! inside.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relay protocol version. Register is rejected on mismatch.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame. Tunnel messages are tiny; anything close
/// to this is a bug or an attack.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// A frame on the client↔relay connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Claim an endpoint name on the relay.
    Register { version: u32, endpoint: String },
    /// Registration accepted.
    Registered,
    /// Ask to be bridged to whoever holds `endpoint`.
    Dial { endpoint: String },
    /// The bridge is up; `endpoint` is the remote end's name.
    PeerJoined { endpoint: String },
    /// Opaque payload for the bridged peer.
    Forward { data: Vec<u8> },
    /// The bridged peer went away.
    PeerLeft,
    /// Relay-side rejection.
    Error { reason: String },
    /// Graceful teardown.
    Close,
}

impl RelayFrame {
    /// Frame name for logs and error messages.
    pub fn frame_type(&self) -> &'static str {
        match self {
            RelayFrame::Register { .. } => "register",
            RelayFrame::Registered => "registered",
            RelayFrame::Dial { .. } => "dial",
            RelayFrame::PeerJoined { .. } => "peer-joined",
            RelayFrame::Forward { .. } => "forward",
            RelayFrame::PeerLeft => "peer-left",
            RelayFrame::Error { .. } => "error",
            RelayFrame::Close => "close",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &RelayFrame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = frame
        .to_bytes()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame, rejecting bad lengths outright.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<RelayFrame>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid frame length",
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    RelayFrame::from_bytes(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frames = vec![
            RelayFrame::Register {
                version: PROTOCOL_VERSION,
                endpoint: "tether-abcd2345-c".to_string(),
            },
            RelayFrame::Registered,
            RelayFrame::Dial {
                endpoint: "tether-abcd2345-c".to_string(),
            },
            RelayFrame::PeerJoined {
                endpoint: "tether-abcd2345-j".to_string(),
            },
            RelayFrame::Forward {
                data: vec![1, 2, 3],
            },
            RelayFrame::PeerLeft,
            RelayFrame::Error {
                reason: "nope".to_string(),
            },
            RelayFrame::Close,
        ];

        for frame in frames {
            let bytes = frame.to_bytes().unwrap();
            let restored = RelayFrame::from_bytes(&bytes).unwrap();
            assert_eq!(frame.frame_type(), restored.frame_type());
        }
    }

    #[tokio::test]
    async fn test_framed_io_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = RelayFrame::Forward {
            data: b"sealed bytes".to_vec(),
        };
        write_frame(&mut client, &frame).await.unwrap();

        match read_frame(&mut server).await.unwrap() {
            RelayFrame::Forward { data } => assert_eq!(data, b"sealed bytes"),
            other => panic!("wrong frame: {}", other.frame_type()),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        // Hand-write a frame header claiming an absurd length.
        tokio::io::AsyncWriteExt::write_u32(&mut client, (MAX_FRAME_BYTES + 1) as u32)
            .await
            .unwrap();

        let result = read_frame(&mut server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_u32(&mut client, 0).await.unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }
}
