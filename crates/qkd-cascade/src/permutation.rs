//! Bit-position permutations for the cascade passes.
//!
//! Both endpoints seed the same deterministic generator from the exchanged
//! seed and draw permutations in lockstep, so the Fisher-Yates stream must
//! be identical on both sides. `ChaCha12Rng` is used directly because the
//! default `StdRng` makes no cross-version reproducibility promise.

use rand::Rng;
use rand_chacha::ChaCha12Rng;

/// The identity permutation and its (identical) inverse.
pub fn identity_permutation(n: u64) -> (Vec<u64>, Vec<u64>) {
    let perm: Vec<u64> = (0..n).collect();
    (perm.clone(), perm)
}

/// A Fisher-Yates shuffle drawn from `rng`, plus its inverse.
pub fn random_permutation(rng: &mut ChaCha12Rng, n: u64) -> (Vec<u64>, Vec<u64>) {
    let mut perm: Vec<u64> = (0..n).collect();
    let len = perm.len();
    for i in 0..len {
        let r = rng.gen_range(i..len);
        perm.swap(i, r);
    }

    let mut inv_perm = vec![0u64; len];
    for (i, &p) in perm.iter().enumerate() {
        inv_perm[p as usize] = i as u64;
    }
    (perm, inv_perm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn is_permutation(perm: &[u64]) -> bool {
        let mut seen = vec![false; perm.len()];
        for &p in perm {
            if seen[p as usize] {
                return false;
            }
            seen[p as usize] = true;
        }
        true
    }

    #[test]
    fn test_identity() {
        let (perm, inv_perm) = identity_permutation(8);
        assert_eq!(perm, (0..8).collect::<Vec<_>>());
        assert_eq!(perm, inv_perm);
    }

    #[test]
    fn test_random_is_valid_and_inverse_holds() {
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let (perm, inv_perm) = random_permutation(&mut rng, 257);
        assert!(is_permutation(&perm));
        for i in 0..257u64 {
            assert_eq!(inv_perm[perm[i as usize] as usize], i);
        }
    }

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = ChaCha12Rng::seed_from_u64(99);
        let mut b = ChaCha12Rng::seed_from_u64(99);
        assert_eq!(random_permutation(&mut a, 64), random_permutation(&mut b, 64));
        // the second draw continues the stream identically
        assert_eq!(random_permutation(&mut a, 64), random_permutation(&mut b, 64));
    }
}
