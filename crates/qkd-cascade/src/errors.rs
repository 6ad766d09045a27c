//! Cascade error conditions.
//!
//! Any failure aborts the running pass; corrections already applied to the
//! frame remain (they are provably correct) but no partially reconciled key
//! is ever published.

use shared_types::KeyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CascadeError {
    /// The peer channel failed or timed out.
    #[error("cascade transport failed: {0}")]
    Transport(String),

    /// The peer answered out of protocol (length mismatch, bad seed frame).
    #[error("cascade protocol violation: {0}")]
    Protocol(String),

    /// A parity block lies outside the frame.
    #[error("parity block [{offset}, {offset}+{size}) out of range for {bits} bits")]
    BlockOutOfRange { offset: u64, size: u64, bits: u64 },

    /// Key or bit-buffer operation failed.
    #[error(transparent)]
    Key(#[from] KeyError),
}
