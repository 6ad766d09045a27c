//! One-time-pad encryption: XOR against drawn key material.
//!
//! The key must cover the whole payload; surplus key octets (the tail of the
//! last buffer quantum) are ignored. Applying the scheme twice with the same
//! key restores the plaintext, so a single implementation serves both
//! directions.

use crate::context::CipherScheme;
use crate::errors::CryptoError;

/// The `xor` one-time-pad cipher.
#[derive(Debug, Default, Clone, Copy)]
pub struct XorCipher;

impl CipherScheme for XorCipher {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn key_len(&self, payload_len: usize) -> usize {
        payload_len
    }

    fn apply(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if key.len() < payload.len() {
            return Err(CryptoError::KeyLength {
                scheme: self.name(),
                expected: payload.len(),
                got: key.len(),
            });
        }
        Ok(payload.iter().zip(key.iter()).map(|(p, k)| p ^ k).collect())
    }
}
