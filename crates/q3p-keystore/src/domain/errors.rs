//! # Error Taxonomy
//!
//! Three layers of failure:
//!
//! - `KeyDbError`: the slot container refused an operation
//! - `ChannelError`: the encode/decode pipeline failed
//! - `ProtocolError`: a protocol exchange failed
//!
//! `Auth` is special everywhere it appears: a tag mismatch is treated as
//! possibly hostile, tears the link down and is never silently accepted or
//! retried.

use shared_crypto::CryptoError;
use shared_types::{KeyError, WireError};
use thiserror::Error;

/// Key database failures.
#[derive(Debug, Error)]
pub enum KeyDbError {
    /// The key's payload length does not equal the store quantum.
    #[error("key of {got} octets does not match quantum of {quantum} octets")]
    QuantumMismatch { got: usize, quantum: usize },

    /// No free slot left inside the id window.
    #[error("id window [{min_id}, {max_id}] exhausted")]
    WindowExhausted { min_id: u64, max_id: u64 },

    /// The id lies outside the configured window.
    #[error("key id {id} outside window [{min_id}, {max_id}]")]
    OutOfWindow { id: u64, min_id: u64, max_id: u64 },

    /// Unknown storage URL scheme.
    #[error("unknown key-db url scheme in {0:?} (expected ram:// or file://)")]
    UnknownScheme(String),

    /// Another process holds the database file.
    #[error("database file {0:?} is locked")]
    Locked(String),

    /// Persisted state failed its integrity check.
    #[error("database corrupt: {0}")]
    Corrupt(String),

    /// Backing storage I/O failed.
    #[error("database i/o failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for KeyDbError {
    fn from(e: std::io::Error) -> Self {
        KeyDbError::Io(e.to_string())
    }
}

/// Channel pipeline failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The message object is malformed.
    #[error("malformed message: {0}")]
    Message(String),

    /// Not enough key material in the buffers to perform the action.
    #[error("insufficient key material: {0}")]
    Keys(String),

    /// Authentication failed. This might be an attack.
    #[error("authentication failed on message #{message_id}: POSSIBLE ATTACK")]
    Auth { message_id: u32 },

    /// A crypto primitive failed internally.
    #[error("crypto context failed: {0}")]
    Context(String),
}

impl From<CryptoError> for ChannelError {
    fn from(e: CryptoError) -> Self {
        ChannelError::Context(e.to_string())
    }
}

/// Protocol exchange failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed header or impossible length.
    #[error("malformed message: {0}")]
    Message(String),

    /// Insufficient buffer bytes for a requested operation.
    #[error("insufficient key material: {0}")]
    Keys(String),

    /// Tag mismatch; the link is torn down and not retried.
    #[error("authentication failed: POSSIBLE ATTACK ({0})")]
    Auth(String),

    /// Crypto primitive internal failure.
    #[error("crypto context failed: {0}")]
    Context(String),

    /// No engine wired to handle protocol data.
    #[error("no engine present: {0}")]
    Engine(String),

    /// Socket error, including a lost connection.
    #[error("transport failed: {0}")]
    Transport(String),

    /// A response did not arrive within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The peer sent a malformed or unexpected payload.
    #[error("unexpected peer answer: {0}")]
    Answer(String),

    /// Local and peer configurations are incompatible.
    #[error("configuration mismatch: {0}")]
    Config(String),

    /// The message is inappropriate for the local master/slave role.
    #[error("wrong role for this message: {0}")]
    Role(String),

    /// A frame exceeds the maximum packet size.
    #[error("packet of {got} bytes exceeds limit of {limit} bytes")]
    PacketSize { got: usize, limit: usize },
}

impl From<ChannelError> for ProtocolError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Message(m) => ProtocolError::Message(m),
            ChannelError::Keys(m) => ProtocolError::Keys(m),
            ChannelError::Auth { message_id } => {
                ProtocolError::Auth(format!("message #{message_id}"))
            }
            ChannelError::Context(m) => ProtocolError::Context(m),
        }
    }
}

impl From<WireError> for ProtocolError {
    fn from(e: WireError) -> Self {
        ProtocolError::Answer(e.to_string())
    }
}

impl From<KeyError> for ProtocolError {
    fn from(e: KeyError) -> Self {
        ProtocolError::Message(e.to_string())
    }
}

impl From<KeyDbError> for ProtocolError {
    fn from(e: KeyDbError) -> Self {
        ProtocolError::Keys(e.to_string())
    }
}

impl ProtocolError {
    /// True if this failure must tear the link down without reconnecting.
    pub fn is_hostile(&self) -> bool {
        matches!(self, ProtocolError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_maps_onto_protocol_error() {
        let e: ProtocolError = ChannelError::Auth { message_id: 9 }.into();
        assert!(e.is_hostile());

        let e: ProtocolError = ChannelError::Keys("outgoing dry".to_string()).into();
        assert!(matches!(e, ProtocolError::Keys(_)));
        assert!(!e.is_hostile());
    }
}
