//! HMAC-SHA256 authentication with the tag truncated to 16 octets.
//!
//! Unlike `evhash-128` the whole strength sits in the init key, so the init
//! key is drawn fresh per message and there is no final key. Kept as the
//! computational alternative where evaluation hashing is not wanted.

use crate::context::AuthScheme;
use crate::errors::CryptoError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Init-key size in octets.
pub const HMAC_KEY_LEN: usize = 32;

/// Truncated tag size in octets.
pub const HMAC_TAG_LEN: usize = 16;

/// The `hmac-sha256` authentication scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha256Auth;

impl AuthScheme for HmacSha256Auth {
    fn name(&self) -> &'static str {
        "hmac-sha256"
    }

    fn tag_len(&self) -> usize {
        HMAC_TAG_LEN
    }

    fn init_key_len(&self) -> usize {
        HMAC_KEY_LEN
    }

    fn init_key_reusable(&self) -> bool {
        false
    }

    fn final_key_len(&self) -> usize {
        0
    }

    fn final_key_reusable(&self) -> bool {
        true
    }

    fn tag(
        &self,
        init_key: &[u8],
        _final_key: &[u8],
        message: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if init_key.len() != HMAC_KEY_LEN {
            return Err(CryptoError::KeyLength {
                scheme: self.name(),
                expected: HMAC_KEY_LEN,
                got: init_key.len(),
            });
        }

        let mut mac = HmacSha256::new_from_slice(init_key)
            .map_err(|e| CryptoError::Internal(e.to_string()))?;
        mac.update(message);
        let full = mac.finalize().into_bytes();
        Ok(full[..HMAC_TAG_LEN].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_len_and_determinism() {
        let scheme = HmacSha256Auth;
        let key = [0x11u8; 32];
        let t1 = scheme.tag(&key, &[], b"payload").unwrap();
        let t2 = scheme.tag(&key, &[], b"payload").unwrap();
        assert_eq!(t1.len(), HMAC_TAG_LEN);
        assert_eq!(t1, t2);
    }

    #[test]
    fn test_different_key_different_tag() {
        let scheme = HmacSha256Auth;
        let t1 = scheme.tag(&[0x11u8; 32], &[], b"payload").unwrap();
        let t2 = scheme.tag(&[0x22u8; 32], &[], b"payload").unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_short_key_rejected() {
        let scheme = HmacSha256Auth;
        assert!(scheme.tag(&[0u8; 16], &[], b"payload").is_err());
    }
}
