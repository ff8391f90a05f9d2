//! Bus Protocol
//!
//! Messages exchanged on the bus port while forming the cluster.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Sent by the dialing node to identify itself
    Hello {
        name: String,
        address: String,
        client_port: u16,
    },

    /// Accepting node's identity, completes the join
    Welcome {
        name: String,
        address: String,
        client_port: u16,
    },

    /// Join refused
    Reject {
        reason: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::Welcome { .. } => "Welcome",
            Message::Reject { .. } => "Reject",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let [l0, l1, l2, l3] = self.length.to_le_bytes();
        let [c0, c1, c2, c3] = self.checksum.to_le_bytes();
        [l0, l1, l2, l3, c0, c1, c2, c3]
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Reject bodies larger than `MAX_FRAME_SIZE` before allocating for them
    pub fn check_length(&self) -> Result<()> {
        if self.length > MAX_FRAME_SIZE {
            return Err(Error::Network(format!(
                "Frame of {} bytes exceeds limit of {}",
                self.length, MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }

    /// Compare the body against the header's checksum
    pub fn verify(&self, body: &[u8]) -> Result<()> {
        if crc32fast::hash(body) != self.checksum {
            return Err(Error::Network("Message checksum mismatch".into()));
        }
        Ok(())
    }
}

/// Encode a message as one header-prefixed frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = message.serialize()?;
    let header = FrameHeader::new(&body);
    header.check_length()?;

    let mut frame = Vec::with_capacity(FrameHeader::SIZE + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_serialization() {
        let msg = Message::Welcome {
            name: "B".to_string(),
            address: "10.0.0.2".to_string(),
            client_port: 6380,
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Welcome { name, address, client_port } => {
                assert_eq!(name, "B");
                assert_eq!(address, "10.0.0.2");
                assert_eq!(client_port, 6380);
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(restored.length, data.len() as u32);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_header_checks() {
        let body = b"hello";
        let header = FrameHeader::new(body);
        assert!(header.check_length().is_ok());
        assert!(header.verify(body).is_ok());
        assert!(header.verify(b"hellO").is_err());

        let oversized = FrameHeader { length: MAX_FRAME_SIZE + 1, checksum: 0 };
        assert!(matches!(oversized.check_length(), Err(Error::Network(_))));
    }

    #[test]
    fn test_encode_frame_layout() {
        let msg = Message::Reject { reason: "full".into() };
        let frame = encode_frame(&msg).unwrap();
        let (head, body) = frame.split_at(FrameHeader::SIZE);
        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(head);

        let header = FrameHeader::from_bytes(&header_bytes);
        assert_eq!(header.length as usize, body.len());
        header.verify(body).unwrap();
        assert_eq!(Message::deserialize(body).unwrap(), msg);
    }

    #[test]
    fn test_encode_frame_rejects_oversized_message() {
        let msg = Message::Reject { reason: "x".repeat(MAX_FRAME_SIZE as usize) };
        assert!(matches!(encode_frame(&msg), Err(Error::Network(_))));
    }

    #[test]
    fn test_garbage_does_not_deserialize() {
        assert!(Message::deserialize(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
