//! # Shared Crypto
//!
//! The cryptographic schemes the Q3P channel draws key material for:
//!
//! - `evhash-128`: polynomial evaluation hash over GF(2^128); the init key is
//!   the (reusable) evaluation point, the final key a fresh one-time pad on
//!   the tag
//! - `hmac-sha256`: truncated HMAC with an ephemeral init key
//! - `xor`: one-time-pad encryption
//! - `null`: pass-through for either role
//!
//! Contexts pair a scheme with its stored init key; an association bundles
//! the four contexts (auth in/out, encryption in/out) of one channel.

pub mod context;
pub mod errors;
pub mod evhash;
pub mod hmac_sha256;
pub mod otp;

pub use context::{
    AssociationProfile, AuthContext, AuthScheme, CipherContext, CipherScheme, CryptoAssociation,
};
pub use errors::CryptoError;
