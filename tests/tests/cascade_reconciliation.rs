//! Cascade reconciliation scenarios: error-free, single flip, 1% error.

use qkd_cascade::{CascadeConfig, SeedPolicy};
use qkd_link_tests::{binary_entropy, init_tracing, key_material, reconcile_pair};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared_types::{Key, KeyState};

/// n = 1024 bits, no errors: nothing is flipped, every pass still
/// discloses at least one parity, both keys end up Reconciled.
#[test]
fn test_error_free_reconciliation() {
    init_tracing();
    let key = Key::new(1, key_material(128, 1));

    let (alice, bob) = reconcile_pair(key.clone(), key.clone(), CascadeConfig::default());

    assert_eq!(alice.corrected_bits, 0);
    assert_eq!(bob.corrected_bits, 0);
    assert_eq!(alice.key.data.as_octets(), key.data.as_octets());
    assert_eq!(bob.key.data.as_octets(), key.data.as_octets());
    assert!(alice.disclosed_bits >= 14, "one parity per pass at least");
    assert_eq!(alice.key.meta.state, KeyState::Reconciled);
    assert_eq!(bob.key.meta.state, KeyState::Reconciled);
    assert_eq!(alice.error_rate, 0.0);
    assert_eq!(bob.error_rate, 0.0);
}

/// n = 1024 bits, Bob's bit 37 flipped: exactly that bit is corrected on
/// Bob's side and recorded as remotely corrected on Alice's.
#[test]
fn test_single_bit_flip() {
    init_tracing();
    let alice_key = Key::new(1, key_material(128, 2));
    let mut bob_key = alice_key.clone();
    bob_key.data.flip_bit(37).unwrap();

    let (alice, bob) = reconcile_pair(alice_key.clone(), bob_key, CascadeConfig::default());

    assert_eq!(bob.key.data.as_octets(), alice_key.data.as_octets());
    assert_eq!(alice.key.data.as_octets(), alice_key.data.as_octets());
    assert_eq!(bob.corrected_bits, 1);
    assert_eq!(alice.corrected_bits, 1);
    assert!(alice.disclosed_bits > 0);
    assert_eq!(alice.disclosed_bits, bob.disclosed_bits);
}

/// n = 10 000 bits with 100 random flips: the keys converge, the count of
/// flipped positions equals the initial Hamming distance, and the parity
/// disclosure stays within sanity bounds of the Shannon limit.
#[test]
fn test_one_percent_error_rate() {
    init_tracing();
    let bits: u64 = 10_000;
    let alice_key = Key::new(1, key_material(1250, 3));
    let mut bob_key = alice_key.clone();

    let mut rng = rand_chacha(11);
    let mut positions: Vec<u64> = (0..bits).collect();
    positions.shuffle(&mut rng);
    for &pos in positions.iter().take(100) {
        bob_key.data.flip_bit(pos).unwrap();
    }
    assert_eq!(alice_key.data.hamming_distance(&bob_key.data).unwrap(), 100);

    let config = CascadeConfig {
        seed: SeedPolicy::Fixed(7),
        ..Default::default()
    };
    let (alice, bob) = reconcile_pair(alice_key.clone(), bob_key, config);

    assert_eq!(bob.key.data.as_octets(), alice_key.data.as_octets());
    assert_eq!(bob.corrected_bits, 100);
    assert_eq!(alice.corrected_bits, 100);
    assert!((bob.error_rate - 0.01).abs() < 1e-9);

    // the cold prior makes the first passes coarse, so stay an order of
    // magnitude above the Shannon floor but well below the frame size
    let shannon_floor = bits as f64 * binary_entropy(0.01);
    assert!(alice.disclosed_bits as f64 > shannon_floor);
    assert!(
        alice.disclosed_bits < bits / 4,
        "disclosed {} parities for {} bits",
        alice.disclosed_bits,
        bits
    );
}

/// Corrections found in a late pass re-open earlier passes: a dense error
/// pattern forces the cascade to actually cascade.
#[test]
fn test_dense_error_pattern_converges() {
    init_tracing();
    let alice_key = Key::new(1, key_material(256, 4));
    let mut bob_key = alice_key.clone();
    // adjacent flips cancel in wide parity blocks and only surface once
    // later permuted passes separate them
    for pos in [100u64, 101, 102, 103, 500, 501, 1000, 1001, 1500, 1501] {
        bob_key.data.flip_bit(pos).unwrap();
    }

    let (alice, bob) = reconcile_pair(alice_key.clone(), bob_key, CascadeConfig::default());

    assert_eq!(bob.key.data.as_octets(), alice_key.data.as_octets());
    assert_eq!(bob.corrected_bits, 10);
    assert_eq!(alice.corrected_bits, 10);
}

fn rand_chacha(seed: u64) -> rand_chacha::ChaCha12Rng {
    rand_chacha::ChaCha12Rng::seed_from_u64(seed)
}
