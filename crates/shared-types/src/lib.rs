//! # Shared Types
//!
//! Foundation types for the qkd-link workspace:
//!
//! - `BitBuffer`: fixed-length octet blob with bitwise access, XOR and
//!   word-level popcount
//! - `Key` / `KeyMeta` / `KeyState`: a piece of key material with its
//!   processing-state lattice
//! - `KeyRing`: re-slices arbitrary octet streams into fixed-quantum keys
//! - `wire`: sequential reader/writer used for all protocol payload bodies
//!
//! Everything else in the workspace builds on these; this crate has no view
//! of Cascade or Q3P semantics.

pub mod bitbuffer;
pub mod errors;
pub mod key;
pub mod wire;

pub use bitbuffer::BitBuffer;
pub use errors::{KeyError, WireError};
pub use key::{Key, KeyId, KeyMeta, KeyRing, KeyState, KeyVec};
