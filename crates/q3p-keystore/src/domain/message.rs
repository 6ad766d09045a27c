//! # Q3P Message
//!
//! Fixed wire header (network byte order), followed by the payload and, for
//! authentic messages, the trailing authentication tag:
//!
//! | Off | Len | Field                              |
//! |-----|-----|------------------------------------|
//! | 0   | 4   | total length (including tag)       |
//! | 4   | 4   | message id                         |
//! | 8   | 2   | channel id                         |
//! | 10  | 1   | protocol id                        |
//! | 11  | 1   | flags + version                    |
//! | 12  | 4   | encryption-key id                  |
//! | 16  | 4   | authentication-key id              |
//!
//! Flag bits 0..2 carry encrypted / authentic / zipped, bits 5..7 the
//! protocol version (currently 2).

use crate::domain::errors::ProtocolError;

/// Size of the fixed header in octets.
pub const HEADER_SIZE: usize = 20;

/// Maximum size of a single Q3P packet including all meta data.
pub const PACKET_MAX_SIZE: usize = 16 * 1024 * 1024;

/// Protocol version carried in the flags field.
pub const VERSION: u8 = 2;

const FLAG_ENCRYPTED: u8 = 0x01;
const FLAG_AUTHENTIC: u8 = 0x02;
const FLAG_ZIPPED: u8 = 0x04;
const VERSION_SHIFT: u8 = 5;
const VERSION_MASK: u8 = 0xE0;

/// A Q3P message: header fields, payload and optional trailing tag.
///
/// Created on send, consumed on receive. Message ids are assigned
/// monotonically per channel at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    channel_id: u16,
    protocol_id: u8,
    flags: u8,
    encryption_key_id: u32,
    authentication_key_id: u32,
    payload: Vec<u8>,
    tag: Vec<u8>,
}

impl Message {
    /// A fresh message with the given security flags and empty payload.
    pub fn new(authentic: bool, encrypted: bool) -> Self {
        let mut message = Self {
            id: 0,
            channel_id: 0,
            protocol_id: 0,
            flags: (VERSION << VERSION_SHIFT),
            encryption_key_id: 0,
            authentication_key_id: 0,
            payload: Vec::new(),
            tag: Vec::new(),
        };
        message.set_authentic(authentic);
        message.set_encrypted(encrypted);
        message
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub fn set_channel_id(&mut self, id: u16) {
        self.channel_id = id;
    }

    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    pub fn set_protocol_id(&mut self, id: u8) {
        self.protocol_id = id;
    }

    pub fn version(&self) -> u8 {
        (self.flags & VERSION_MASK) >> VERSION_SHIFT
    }

    pub fn authentic(&self) -> bool {
        self.flags & FLAG_AUTHENTIC != 0
    }

    pub fn set_authentic(&mut self, authentic: bool) {
        if authentic {
            self.flags |= FLAG_AUTHENTIC;
        } else {
            self.flags &= !FLAG_AUTHENTIC;
        }
    }

    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn set_encrypted(&mut self, encrypted: bool) {
        if encrypted {
            self.flags |= FLAG_ENCRYPTED;
        } else {
            self.flags &= !FLAG_ENCRYPTED;
        }
    }

    pub fn zipped(&self) -> bool {
        self.flags & FLAG_ZIPPED != 0
    }

    pub fn set_zipped(&mut self, zipped: bool) {
        if zipped {
            self.flags |= FLAG_ZIPPED;
        } else {
            self.flags &= !FLAG_ZIPPED;
        }
    }

    pub fn encryption_key_id(&self) -> u32 {
        self.encryption_key_id
    }

    pub fn set_encryption_key_id(&mut self, id: u32) {
        self.encryption_key_id = id;
    }

    pub fn authentication_key_id(&self) -> u32 {
        self.authentication_key_id
    }

    pub fn set_authentication_key_id(&mut self, id: u32) {
        self.authentication_key_id = id;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    pub fn set_tag(&mut self, tag: Vec<u8>) {
        self.tag = tag;
    }

    /// Total wire length: header, payload and tag.
    pub fn length(&self) -> usize {
        HEADER_SIZE + self.payload.len() + self.tag.len()
    }

    /// The 20 header octets in network byte order.
    ///
    /// The length field always counts the tag, so the header is stable from
    /// the moment the tag size is known; authentication runs over exactly
    /// these octets plus the payload.
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&(self.length() as u32).to_be_bytes());
        header[4..8].copy_from_slice(&self.id.to_be_bytes());
        header[8..10].copy_from_slice(&self.channel_id.to_be_bytes());
        header[10] = self.protocol_id;
        header[11] = self.flags;
        header[12..16].copy_from_slice(&self.encryption_key_id.to_be_bytes());
        header[16..20].copy_from_slice(&self.authentication_key_id.to_be_bytes());
        header
    }

    /// Serialize to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length());
        bytes.extend_from_slice(&self.header_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.tag);
        bytes
    }

    /// Parse a complete wire frame.
    ///
    /// Everything after the header lands in the payload; the channel splits
    /// the tag off once the authentication scheme's tag size is known.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Message(format!(
                "frame of {} bytes cannot hold a header",
                bytes.len()
            )));
        }
        if bytes.len() > PACKET_MAX_SIZE {
            return Err(ProtocolError::PacketSize {
                got: bytes.len(),
                limit: PACKET_MAX_SIZE,
            });
        }

        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if length != bytes.len() {
            return Err(ProtocolError::Message(format!(
                "header claims {length} bytes but frame has {}",
                bytes.len()
            )));
        }

        let message = Self {
            id: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            channel_id: u16::from_be_bytes([bytes[8], bytes[9]]),
            protocol_id: bytes[10],
            flags: bytes[11],
            encryption_key_id: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            authentication_key_id: u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            payload: bytes[HEADER_SIZE..].to_vec(),
            tag: Vec::new(),
        };

        if message.version() != VERSION {
            return Err(ProtocolError::Answer(format!(
                "Q3P version mismatch: got {}, expected {VERSION}",
                message.version()
            )));
        }
        Ok(message)
    }

    /// Move the last `tag_len` payload octets into the tag field.
    pub fn split_tag(&mut self, tag_len: usize) -> Result<(), ProtocolError> {
        if self.payload.len() < tag_len {
            return Err(ProtocolError::Message(format!(
                "payload of {} bytes too short for a {tag_len} byte tag",
                self.payload.len()
            )));
        }
        self.tag = self.payload.split_off(self.payload.len() - tag_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_version() {
        let mut message = Message::new(true, false);
        assert!(message.authentic());
        assert!(!message.encrypted());
        assert!(!message.zipped());
        assert_eq!(message.version(), 2);

        message.set_zipped(true);
        message.set_authentic(false);
        assert!(message.zipped());
        assert!(!message.authentic());
        assert_eq!(message.version(), 2);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut message = Message::new(true, true);
        message.set_id(77);
        message.set_channel_id(3);
        message.set_protocol_id(4);
        message.set_encryption_key_id(1000);
        message.set_authentication_key_id(2000);
        message.set_payload(b"payload bytes".to_vec());
        message.set_tag(vec![0xAB; 16]);

        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 13 + 16);

        let mut parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id(), 77);
        assert_eq!(parsed.channel_id(), 3);
        assert_eq!(parsed.protocol_id(), 4);
        assert_eq!(parsed.encryption_key_id(), 1000);
        assert_eq!(parsed.authentication_key_id(), 2000);

        parsed.split_tag(16).unwrap();
        assert_eq!(parsed.payload(), b"payload bytes");
        assert_eq!(parsed.tag(), &[0xAB; 16][..]);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            Message::from_bytes(&[0u8; 10]),
            Err(ProtocolError::Message(_))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let message = Message::new(false, false);
        let mut bytes = message.to_bytes();
        bytes.push(0); // frame longer than the header claims
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(ProtocolError::Message(_))
        ));
    }

    #[test]
    fn test_version_gate() {
        let message = Message::new(false, false);
        let mut bytes = message.to_bytes();
        bytes[11] &= 0x1F; // clear the version bits
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(ProtocolError::Answer(_))
        ));
    }
}
