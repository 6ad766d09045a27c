//! Crypto scheme errors.

use thiserror::Error;

/// Errors raised by scheme construction and application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The scheme name is not registered.
    #[error("unknown crypto scheme {0:?}")]
    UnknownScheme(String),

    /// A key of the wrong length was supplied.
    #[error("{scheme}: bad key length, expected {expected} octets, got {got}")]
    KeyLength {
        scheme: &'static str,
        expected: usize,
        got: usize,
    },

    /// A scheme failed internally.
    #[error("crypto operation failed: {0}")]
    Internal(String),
}
