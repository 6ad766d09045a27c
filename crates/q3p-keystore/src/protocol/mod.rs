//! # Q3P Protocols
//!
//! Fixed-role finite state exchanges over the reliable channel:
//!
//! | id | protocol     | direction                |
//! |----|--------------|--------------------------|
//! | 0  | HANDSHAKE    | both, before the channel |
//! | 1  | LOAD         | master -> slave          |
//! | 2  | LOAD-REQUEST | slave -> master          |
//! | 3  | STORE        | master -> slave          |
//! | 4  | DATA         | both                     |
//!
//! Each module adds its handlers onto [`crate::engine::Engine`]; the
//! engine owns all pending-request state and the outbox.

use crate::domain::errors::ProtocolError;
use crate::domain::message::PACKET_MAX_SIZE;

pub mod data;
pub mod handshake;
pub mod key_move;
pub mod load_request;
pub mod store;

/// Largest authentication tag any registered scheme produces.
const MAX_AUTH_TAG: usize = 256 / 8;

/// The protocol family of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Handshake = 0,
    Load = 1,
    LoadRequest = 2,
    Store = 3,
    Data = 4,
}

impl ProtocolId {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolId::Handshake => "HANDSHAKE",
            ProtocolId::Load => "LOAD",
            ProtocolId::LoadRequest => "LOAD-REQUEST",
            ProtocolId::Store => "STORE",
            ProtocolId::Data => "DATA",
        }
    }
}

impl TryFrom<u8> for ProtocolId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtocolId::Handshake),
            1 => Ok(ProtocolId::Load),
            2 => Ok(ProtocolId::LoadRequest),
            3 => Ok(ProtocolId::Store),
            4 => Ok(ProtocolId::Data),
            other => Err(ProtocolError::Answer(format!("unknown protocol id {other}"))),
        }
    }
}

/// Maximum size of a message body: a packet minus the largest trailer.
pub fn max_size() -> usize {
    PACKET_MAX_SIZE - MAX_AUTH_TAG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_id_roundtrip() {
        for id in [
            ProtocolId::Handshake,
            ProtocolId::Load,
            ProtocolId::LoadRequest,
            ProtocolId::Store,
            ProtocolId::Data,
        ] {
            assert_eq!(ProtocolId::try_from(id as u8).unwrap(), id);
        }
        assert!(ProtocolId::try_from(9).is_err());
    }
}
