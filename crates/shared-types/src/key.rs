//! # Key Material
//!
//! A `Key` is an identified octet payload plus a meta record tracking its
//! position in the processing lattice:
//!
//! ```text
//! Raw -> Sifted -> Reconciled -> Confirmed -> Authenticated -> (Disclosed)
//! ```
//!
//! Once a key is `Authenticated` the only transition left is `Disclosed`,
//! and a disclosed key is never again consumed for any cryptographic
//! purpose.

use crate::bitbuffer::BitBuffer;
use crate::errors::KeyError;
use serde::{Deserialize, Serialize};

/// 64-bit key identifier.
pub type KeyId = u64;

/// A vector of key identifiers, as carried in protocol bodies.
pub type KeyVec = Vec<KeyId>;

/// Processing state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    /// Fresh from the quantum channel, bases not yet reconciled.
    Raw,
    /// Basis-sifted, still error laden.
    Sifted,
    /// Error corrected; equal on both endpoints.
    Reconciled,
    /// Confirmed equal beyond the reconciliation residual.
    Confirmed,
    /// Authenticity of the generating exchange verified.
    Authenticated,
    /// Revealed (in part or whole); dead for cryptographic use.
    Disclosed,
}

impl KeyState {
    fn rank(self) -> u8 {
        match self {
            KeyState::Raw => 0,
            KeyState::Sifted => 1,
            KeyState::Reconciled => 2,
            KeyState::Confirmed => 3,
            KeyState::Authenticated => 4,
            KeyState::Disclosed => 5,
        }
    }

    /// True if a key in this state may feed a cryptographic operation.
    pub fn usable(self) -> bool {
        self != KeyState::Disclosed
    }
}

/// Meta record attached to every key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMeta {
    pub state: KeyState,
    /// Parity bits revealed on the classical channel while producing this key.
    pub disclosed_bits: u64,
    /// Error rate observed during reconciliation.
    pub error_rate: f64,
}

impl Default for KeyMeta {
    fn default() -> Self {
        Self {
            state: KeyState::Raw,
            disclosed_bits: 0,
            error_rate: 0.0,
        }
    }
}

impl KeyMeta {
    /// Advance the state along the lattice.
    ///
    /// Transitions must move forward; from `Authenticated` only `Disclosed`
    /// is admissible and `Disclosed` is terminal.
    pub fn advance(&mut self, to: KeyState) -> Result<(), KeyError> {
        let from = self.state;
        let legal = match from {
            KeyState::Disclosed => false,
            KeyState::Authenticated => to == KeyState::Disclosed,
            _ => to.rank() > from.rank(),
        };
        if !legal {
            return Err(KeyError::StateTransition { from, to });
        }
        self.state = to;
        Ok(())
    }
}

/// An identified piece of key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    pub data: BitBuffer,
    pub meta: KeyMeta,
}

impl Key {
    /// A key with the given id and payload, meta at lattice origin.
    pub fn new(id: KeyId, data: Vec<u8>) -> Self {
        Self {
            id,
            data: BitBuffer::from_octets(data),
            meta: KeyMeta::default(),
        }
    }

    /// The null key: id 0, empty payload. Returned by lookups that miss.
    pub fn null() -> Self {
        Self::new(0, Vec::new())
    }

    /// True for the null key.
    pub fn is_null(&self) -> bool {
        self.id == 0 && self.data.is_empty()
    }

    /// Payload length in octets.
    pub fn len_octets(&self) -> usize {
        self.data.len_octets()
    }
}

/// Re-slices arbitrary-length octet pushes into fixed-quantum keys.
///
/// Pushed material is concatenated and cut into `quantum`-sized chunks; a
/// trailing partial chunk stays in the ring as remainder until further
/// pushes complete it. Callers that cannot use the remainder drop it
/// explicitly.
#[derive(Debug)]
pub struct KeyRing {
    quantum: usize,
    keys: Vec<Key>,
    remainder: Vec<u8>,
}

impl KeyRing {
    /// An empty ring cutting keys of `quantum` octets.
    pub fn new(quantum: usize) -> Self {
        assert!(quantum > 0, "key ring quantum must be positive");
        Self {
            quantum,
            keys: Vec::new(),
            remainder: Vec::new(),
        }
    }

    /// The ring's quantum in octets.
    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Append octets, cutting full-quantum keys as they complete.
    pub fn push(&mut self, octets: &[u8]) {
        self.remainder.extend_from_slice(octets);
        while self.remainder.len() >= self.quantum {
            let chunk: Vec<u8> = self.remainder.drain(..self.quantum).collect();
            self.keys.push(Key::new(0, chunk));
        }
    }

    /// Append a whole key's payload.
    pub fn push_key(&mut self, key: &Key) {
        self.push(key.data.as_octets());
    }

    /// Completed full-quantum keys.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Number of completed keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if no key has completed yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Octets pushed but not yet forming a full quantum.
    pub fn remainder(&self) -> &[u8] {
        &self.remainder
    }

    /// Consume the ring, yielding the completed keys.
    pub fn into_keys(self) -> Vec<Key> {
        self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_lattice_forward_only() {
        let mut meta = KeyMeta::default();
        meta.advance(KeyState::Sifted).unwrap();
        meta.advance(KeyState::Reconciled).unwrap();
        assert!(meta.advance(KeyState::Raw).is_err());
        assert_eq!(meta.state, KeyState::Reconciled);
    }

    #[test]
    fn test_authenticated_admits_only_disclosed() {
        let mut meta = KeyMeta {
            state: KeyState::Authenticated,
            ..Default::default()
        };
        assert!(meta.advance(KeyState::Confirmed).is_err());
        meta.advance(KeyState::Disclosed).unwrap();
        assert!(!meta.state.usable());
    }

    #[test]
    fn test_disclosed_is_terminal() {
        let mut meta = KeyMeta {
            state: KeyState::Disclosed,
            ..Default::default()
        };
        assert!(meta.advance(KeyState::Authenticated).is_err());
        assert!(meta.advance(KeyState::Disclosed).is_err());
    }

    #[test]
    fn test_ring_slices_to_quantum() {
        let mut ring = KeyRing::new(4);
        ring.push(&[1, 2, 3]);
        assert!(ring.is_empty());
        assert_eq!(ring.remainder(), &[1, 2, 3]);

        ring.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.keys()[0].data.as_octets(), &[1, 2, 3, 4]);
        assert_eq!(ring.keys()[1].data.as_octets(), &[5, 6, 7, 8]);
        assert_eq!(ring.remainder(), &[9]);
    }

    #[test]
    fn test_null_key() {
        assert!(Key::null().is_null());
        assert!(!Key::new(3, vec![0]).is_null());
    }
}
