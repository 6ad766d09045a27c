//! # Cascade Driver
//!
//! Runs the fixed pass sequence over one frame: estimates block sizes from
//! the smoothed prior error rate, exchanges the permutation seed, adds one
//! parity checker per pass and keeps correcting until no pass holds an odd
//! block. Afterwards the key's meta record receives the disclosed-bit
//! count, the observed error rate and the `Reconciled` state.
//!
//! Block sizes follow opt. (8) in Martinez-Mateo, Pacher, Peev, Ciurana,
//! Martin, "Demystifying the Information Reconciliation Protocol Cascade".

use crate::category::Category;
use crate::errors::CascadeError;
use crate::frame::Frame;
use crate::permutation::{identity_permutation, random_permutation};
use crate::transport::CascadeChannel;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use shared_types::{Key, KeyState};
use tracing::{debug, warn};

/// Which side of the link this driver plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Picks and sends the permutation seed; never flips bits.
    Alice,
    /// Receives the seed; flips the bits located by the binary search.
    Bob,
}

impl Role {
    pub fn is_bob(self) -> bool {
        matches!(self, Role::Bob)
    }
}

/// Where the shared permutation seed comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Alice draws a fresh random seed per frame.
    Fresh,
    /// A fixed seed, for reproducible runs.
    Fixed(u64),
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    /// Number of passes; pass 1 runs unpermuted.
    pub passes: u64,
    pub seed: SeedPolicy,
    /// Whether the seed exchange counts against the frame's
    /// transmitted-message statistic.
    pub count_seed_message: bool,
    /// EWMA smoothing factor for the prior error rate.
    pub smoothing: f64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            passes: 14,
            seed: SeedPolicy::Fresh,
            count_seed_message: false,
            smoothing: 0.3,
        }
    }
}

/// Result of one reconciliation run.
#[derive(Debug)]
pub struct CascadeOutcome {
    /// The reconciled key, meta updated.
    pub key: Key,
    /// Positions flipped at least once (equals the initial Hamming
    /// distance on success).
    pub corrected_bits: u64,
    /// Parity bits revealed on the classical channel.
    pub disclosed_bits: u64,
    /// Messages exchanged with the peer.
    pub transmitted_messages: u64,
    /// corrected / key length.
    pub error_rate: f64,
}

/// Runs Cascade frames, carrying the smoothed error prior across frames.
pub struct CascadeDriver {
    config: CascadeConfig,
    avg_error: f64,
}

impl CascadeDriver {
    pub fn new(config: CascadeConfig) -> Self {
        Self {
            config,
            avg_error: 0.0,
        }
    }

    /// The smoothed prior error rate feeding the block-size estimate.
    pub fn average_error(&self) -> f64 {
        self.avg_error
    }

    /// The four block sizes k1..k4 for a frame of `bits` bits.
    fn block_sizes(&self, bits: u64) -> [u64; 4] {
        let half = (bits + 1) / 2;
        let rho = self.avg_error;

        let pow2_capped = |exp: i64| -> u64 {
            if exp >= 63 {
                u64::MAX
            } else {
                1u64 << exp.max(0)
            }
        };

        let (k1, k2) = if rho > 0.0 {
            let alpha = ((1.0 / rho).log2() - 0.5).ceil() as i64;
            let k1 = if rho <= 0.25 {
                pow2_capped(alpha).min(half)
            } else {
                // half-sized first blocks behave better for high error rates
                pow2_capped(alpha - 1).min(half)
            };
            let k2 = pow2_capped(((alpha as f64 + 12.0) / 2.0).ceil() as i64).min(half);
            (k1, k2)
        } else {
            (half, half)
        };

        [k1, k2, 4096.min(half), half]
    }

    /// Reconcile one key with the peer instance on the other end of `chan`.
    pub fn reconcile<C: CascadeChannel>(
        &mut self,
        key: Key,
        role: Role,
        chan: &mut C,
    ) -> Result<CascadeOutcome, CascadeError> {
        let bits = key.data.len_bits();
        if bits == 0 {
            return Err(CascadeError::Protocol("cannot reconcile an empty key".to_string()));
        }

        let block_sizes = self.block_sizes(bits);
        let mut frame = Frame::new(key);

        // seed exchange: alice picks, bob adopts
        let seed = match role {
            Role::Alice => {
                let seed = match self.config.seed {
                    SeedPolicy::Fresh => rand::random::<u64>(),
                    SeedPolicy::Fixed(value) => value,
                };
                chan.send(seed.to_le_bytes().to_vec())?;
                seed
            }
            Role::Bob => {
                let frame_bytes = chan.recv()?;
                let raw: [u8; 8] = frame_bytes.as_slice().try_into().map_err(|_| {
                    CascadeError::Protocol(format!(
                        "seed frame has {} bytes, expected 8",
                        frame_bytes.len()
                    ))
                })?;
                u64::from_le_bytes(raw)
            }
        };
        if self.config.count_seed_message {
            frame.add_transmitted_messages(1);
        }
        let mut rng = ChaCha12Rng::seed_from_u64(seed);

        for step in 1..=self.config.passes {
            let k = match step {
                1 => block_sizes[0],
                2 => block_sizes[1],
                3 => block_sizes[2],
                _ => block_sizes[3],
            };

            let (perm, inv_perm, even) = if step == 1 {
                let (perm, inv_perm) = identity_permutation(bits);
                (perm, inv_perm, false)
            } else {
                let (perm, inv_perm) = random_permutation(&mut rng, bits);
                (perm, inv_perm, true)
            };
            let category = Category::new(bits, k, even);

            frame.add_checker(perm, inv_perm, &[category], chan)?;

            if step == 1 {
                // clear everything the very first comparison surfaced
                frame.correct_blocks(0, role.is_bob(), chan)?;
            } else {
                // corrections ripple backwards: always resume at the
                // lowest-indexed pass that still holds an odd block
                loop {
                    let Some(idx) =
                        (0..frame.checker_count()).find(|&i| frame.checker(i).has_odd_blocks())
                    else {
                        break;
                    };
                    frame.correct_blocks(idx, role.is_bob(), chan)?;
                }
            }
        }

        let corrected_bits = frame.corrected_bits().len() as u64;
        let disclosed_bits = frame.transmitted_parities();
        let transmitted_messages = frame.transmitted_messages();
        let error_rate = corrected_bits as f64 / bits as f64;

        let mut key = frame.into_key();
        key.meta.disclosed_bits = disclosed_bits;
        key.meta.error_rate = error_rate;
        key.meta.advance(KeyState::Reconciled).map_err(|e| {
            warn!(error = %e, "reconciled key refused its state transition");
            CascadeError::Key(e)
        })?;

        self.avg_error =
            (1.0 - self.config.smoothing) * self.avg_error + self.config.smoothing * error_rate;

        debug!(
            errors = corrected_bits,
            bits,
            error_rate,
            disclosed = disclosed_bits,
            "cascade done"
        );

        Ok(CascadeOutcome {
            key,
            corrected_bits,
            disclosed_bits,
            transmitted_messages,
            error_rate,
        })
    }
}
