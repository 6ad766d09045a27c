//! # Cascade Error Reconciliation
//!
//! After raw key exchange and sifting, the two endpoints hold keys that
//! differ at a small error rate. Cascade reconciles them over the public
//! authenticated channel:
//!
//! 1. Each pass permutes the key, partitions it into parity blocks and
//!    compares block parities with the peer.
//! 2. Every odd (mismatching) block is binary-searched down to the single
//!    erroneous bit, which Bob flips.
//! 3. Every correction is propagated back into all earlier passes, exposing
//!    further odd blocks there (the "cascade").
//!
//! The driver runs a fixed pass sequence with block sizes estimated from a
//! smoothed prior error rate, then writes disclosed-bit count, observed
//! error rate and the `Reconciled` state into the key's meta record.
//!
//! Parity exchanges are synchronous blocking calls against the
//! [`transport::CascadeChannel`] port; a frame must never be shared across
//! tasks.

pub mod category;
pub mod checker;
pub mod driver;
pub mod errors;
pub mod frame;
pub mod permutation;
pub mod transport;

pub use category::Category;
pub use driver::{CascadeConfig, CascadeDriver, CascadeOutcome, Role, SeedPolicy};
pub use errors::CascadeError;
pub use frame::Frame;
pub use transport::{CascadeChannel, MemoryChannel};
