//! Shared helpers for the qkd-link test suite.

use qkd_cascade::{CascadeConfig, CascadeDriver, CascadeOutcome, MemoryChannel, Role};
use shared_types::Key;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a tracing subscriber once, honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic pseudo-random key material.
pub fn key_material(len: usize, salt: u8) -> Vec<u8> {
    let mut state = 0x9E37u16 ^ u16::from(salt);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(25173).wrapping_add(13849);
            (state >> 8) as u8
        })
        .collect()
}

/// Run Cascade on both sides of an in-process channel pair.
pub fn reconcile_pair(
    alice_key: Key,
    bob_key: Key,
    config: CascadeConfig,
) -> (CascadeOutcome, CascadeOutcome) {
    let (mut chan_a, mut chan_b) = MemoryChannel::pair();
    let config_b = config.clone();
    let alice = std::thread::spawn(move || {
        CascadeDriver::new(config)
            .reconcile(alice_key, Role::Alice, &mut chan_a)
            .expect("alice reconciliation failed")
    });
    let bob = std::thread::spawn(move || {
        CascadeDriver::new(config_b)
            .reconcile(bob_key, Role::Bob, &mut chan_b)
            .expect("bob reconciliation failed")
    });
    (alice.join().unwrap(), bob.join().unwrap())
}

/// Binary entropy in bits.
pub fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -p * p.log2() - (1.0 - p) * (1.0 - p).log2()
}
