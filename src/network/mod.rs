//! Network Module
//!
//! Bus traffic between nodes: the frame codec, the join handshake and the
//! bus listener.

pub mod protocol;
mod join;
mod server;

pub use protocol::{encode_frame, FrameHeader, Message, MAX_FRAME_SIZE};
pub use join::{accept_join, Dialer, Joiner, PeerLink, TcpDialer};
pub use server::BusServer;

use crate::error::Result;

/// Read one frame and decode its message
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    header.check_length()?;

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    header.verify(&body)?;

    Message::deserialize(&body)
}

/// Encode a message and write it as a single frame
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = Message::Hello {
            name: "A".into(),
            address: "127.0.0.1".into(),
            client_port: 6379,
        };

        write_message(&mut a, &hello).await.unwrap();
        let received = read_message(&mut b).await.unwrap();
        assert_eq!(received, hello);
    }

    #[tokio::test]
    async fn test_corrupted_body_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Message::Reject { reason: "x".into() }.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(64);
        let header = FrameHeader {
            length: MAX_FRAME_SIZE + 1,
            checksum: 0,
        };
        a.write_all(&header.to_bytes()).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
