//! Error types shared across the workspace.

use thiserror::Error;

/// Errors raised by key and bit-buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Bit or octet position outside the buffer.
    #[error("position {pos} out of range for buffer of {len} bits")]
    OutOfRange { pos: u64, len: u64 },

    /// XOR partners must have identical lengths.
    #[error("buffer length mismatch: {left} octets vs {right} octets")]
    LengthMismatch { left: usize, right: usize },

    /// Key-state lattice violation.
    #[error("illegal key state transition: {from:?} -> {to:?}")]
    StateTransition {
        from: crate::key::KeyState,
        to: crate::key::KeyState,
    },

    /// The key has been disclosed and may not serve any cryptographic purpose.
    #[error("key {0} is disclosed and unusable")]
    Disclosed(crate::key::KeyId),
}

/// Errors raised by the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// A value could not be encoded.
    #[error("wire encode failed: {0}")]
    Encode(String),

    /// The buffer ended before the expected value was complete.
    #[error("wire decode failed: {0}")]
    Decode(String),

    /// A protocol tag string did not match the expected one.
    #[error("unexpected wire tag: expected {expected:?}, found {found:?}")]
    Tag { expected: String, found: String },
}
