//! # Evaluation Hash
//!
//! Universal-hash authentication by polynomial evaluation over GF(2^128).
//! The message is split into 128-bit blocks m_1..m_n and folded as
//!
//! ```text
//! h_0 = 0,   h_i = (h_{i-1} xor m_i) * alpha
//! ```
//!
//! with field multiplication modulo x^128 + x^7 + x^2 + x + 1. The init key
//! is the evaluation point `alpha` and survives across messages; the final
//! key is a fresh 16-octet pad XORed onto the running hash, which is what
//! makes the tag information-theoretically unforgeable. The final key MUST
//! never be reused.

use crate::context::AuthScheme;
use crate::errors::CryptoError;

/// Tag, init-key and final-key size in octets.
pub const EVHASH_BLOCK: usize = 16;

/// Reduction term for x^128 + x^7 + x^2 + x + 1, bit-reflected.
const R: u128 = 0xE100_0000_0000_0000_0000_0000_0000_0000;

/// Carry-less multiply in GF(2^128).
fn gf128_mul(x: u128, y: u128) -> u128 {
    let mut z = 0u128;
    let mut v = x;
    for i in 0..128 {
        if (y >> (127 - i)) & 1 == 1 {
            z ^= v;
        }
        let carry = v & 1;
        v >>= 1;
        if carry == 1 {
            v ^= R;
        }
    }
    z
}

/// The `evhash-128` authentication scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvHash128;

impl AuthScheme for EvHash128 {
    fn name(&self) -> &'static str {
        "evhash-128"
    }

    fn tag_len(&self) -> usize {
        EVHASH_BLOCK
    }

    fn init_key_len(&self) -> usize {
        EVHASH_BLOCK
    }

    fn init_key_reusable(&self) -> bool {
        true
    }

    fn final_key_len(&self) -> usize {
        EVHASH_BLOCK
    }

    fn final_key_reusable(&self) -> bool {
        false
    }

    fn tag(
        &self,
        init_key: &[u8],
        final_key: &[u8],
        message: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if init_key.len() != EVHASH_BLOCK {
            return Err(CryptoError::KeyLength {
                scheme: self.name(),
                expected: EVHASH_BLOCK,
                got: init_key.len(),
            });
        }
        if final_key.len() != EVHASH_BLOCK {
            return Err(CryptoError::KeyLength {
                scheme: self.name(),
                expected: EVHASH_BLOCK,
                got: final_key.len(),
            });
        }

        let alpha = u128::from_be_bytes(init_key.try_into().map_err(|_| CryptoError::KeyLength {
            scheme: self.name(),
            expected: EVHASH_BLOCK,
            got: init_key.len(),
        })?);

        let mut h = 0u128;
        for chunk in message.chunks(EVHASH_BLOCK) {
            let mut block = [0u8; EVHASH_BLOCK];
            block[..chunk.len()].copy_from_slice(chunk);
            h = gf128_mul(h ^ u128::from_be_bytes(block), alpha);
        }

        let pad = u128::from_be_bytes(final_key.try_into().map_err(|_| CryptoError::KeyLength {
            scheme: self.name(),
            expected: EVHASH_BLOCK,
            got: final_key.len(),
        })?);

        Ok((h ^ pad).to_be_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_identity_and_commutativity() {
        // the multiplicative identity in the reflected representation is
        // x^0 = 0x8000...0
        let one = 1u128 << 127;
        let a = 0x0123_4567_89ab_cdef_0123_4567_89ab_cdef;
        let b = 0xfeed_face_dead_beef_feed_face_dead_beef;

        assert_eq!(gf128_mul(a, one), a);
        assert_eq!(gf128_mul(a, b), gf128_mul(b, a));
    }

    #[test]
    fn test_tag_is_deterministic_and_key_sensitive() {
        let scheme = EvHash128;
        let init = [0x42u8; 16];
        let fin = [0x07u8; 16];
        let msg = b"authentic message body";

        let t1 = scheme.tag(&init, &fin, msg).unwrap();
        let t2 = scheme.tag(&init, &fin, msg).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t1.len(), 16);

        let mut other_init = init;
        other_init[3] ^= 1;
        assert_ne!(scheme.tag(&other_init, &fin, msg).unwrap(), t1);

        let mut other_fin = fin;
        other_fin[9] ^= 0x80;
        assert_ne!(scheme.tag(&init, &other_fin, msg).unwrap(), t1);
    }

    #[test]
    fn test_tag_detects_single_bit_flip() {
        let scheme = EvHash128;
        let init = [0xA5u8; 16];
        let fin = [0x5Au8; 16];
        let mut msg = vec![0u8; 100];
        msg[57] = 0x10;

        let good = scheme.tag(&init, &fin, &msg).unwrap();
        msg[57] ^= 0x01;
        assert_ne!(scheme.tag(&init, &fin, &msg).unwrap(), good);
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let scheme = EvHash128;
        assert!(matches!(
            scheme.tag(&[0u8; 15], &[0u8; 16], b"x"),
            Err(CryptoError::KeyLength { .. })
        ));
        assert!(scheme.tag(&[0u8; 16], &[0u8; 8], b"x").is_err());
    }
}
