//! # Crypto Contexts & Association
//!
//! A context pairs a scheme with its stored init key. An association bundles
//! the four contexts of a channel: authentication incoming/outgoing and
//! encryption incoming/outgoing.
//!
//! ## Key-draw discipline
//!
//! Each scheme declares whether its init and final keys are *reusable*
//! (seeded once from the shared initial secret, kept across messages) or
//! *ephemeral* (drawn fresh from the relevant buffer for every message).
//! The channel consults these flags to size its draws; contexts never pull
//! key material themselves.

use crate::errors::CryptoError;
use crate::evhash::EvHash128;
use crate::hmac_sha256::HmacSha256Auth;
use crate::otp::XorCipher;
use std::sync::Arc;
use zeroize::Zeroizing;

/// An authentication scheme producing a trailing message tag.
pub trait AuthScheme: Send + Sync {
    fn name(&self) -> &'static str;
    /// Tag size in octets.
    fn tag_len(&self) -> usize;
    /// Init key size in octets (0 = scheme needs none).
    fn init_key_len(&self) -> usize;
    /// True if one init key serves all messages.
    fn init_key_reusable(&self) -> bool;
    /// Final key size in octets (0 = scheme needs none).
    fn final_key_len(&self) -> usize;
    /// True if the final key survives across messages.
    fn final_key_reusable(&self) -> bool;
    /// Compute the tag over `message`.
    fn tag(&self, init_key: &[u8], final_key: &[u8], message: &[u8])
        -> Result<Vec<u8>, CryptoError>;
}

/// Authentication disabled; zero-length tag.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuth;

impl AuthScheme for NullAuth {
    fn name(&self) -> &'static str {
        "null"
    }
    fn tag_len(&self) -> usize {
        0
    }
    fn init_key_len(&self) -> usize {
        0
    }
    fn init_key_reusable(&self) -> bool {
        true
    }
    fn final_key_len(&self) -> usize {
        0
    }
    fn final_key_reusable(&self) -> bool {
        true
    }
    fn tag(&self, _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(Vec::new())
    }
}

/// An encryption scheme transforming a payload against drawn key material.
pub trait CipherScheme: Send + Sync {
    fn name(&self) -> &'static str;
    /// Key octets needed for a payload of `payload_len` octets.
    fn key_len(&self, payload_len: usize) -> usize;
    /// Transform the payload. XOR-style schemes are their own inverse.
    fn apply(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Encryption disabled; payload passes through.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl CipherScheme for NullCipher {
    fn name(&self) -> &'static str {
        "null"
    }
    fn key_len(&self, _: usize) -> usize {
        0
    }
    fn apply(&self, _: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(payload.to_vec())
    }
}

/// Look up an authentication scheme by name.
pub fn auth_scheme(name: &str) -> Result<Arc<dyn AuthScheme>, CryptoError> {
    match name {
        "evhash-128" => Ok(Arc::new(EvHash128)),
        "hmac-sha256" => Ok(Arc::new(HmacSha256Auth)),
        "null" => Ok(Arc::new(NullAuth)),
        _ => Err(CryptoError::UnknownScheme(name.to_string())),
    }
}

/// Look up a cipher scheme by name.
pub fn cipher_scheme(name: &str) -> Result<Arc<dyn CipherScheme>, CryptoError> {
    match name {
        "xor" => Ok(Arc::new(XorCipher)),
        "null" => Ok(Arc::new(NullCipher)),
        _ => Err(CryptoError::UnknownScheme(name.to_string())),
    }
}

/// An authentication scheme plus its stored init key.
#[derive(Clone)]
pub struct AuthContext {
    scheme: Arc<dyn AuthScheme>,
    init_key: Option<Zeroizing<Vec<u8>>>,
}

impl AuthContext {
    pub fn new(name: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            scheme: auth_scheme(name)?,
            init_key: None,
        })
    }

    pub fn scheme(&self) -> &dyn AuthScheme {
        self.scheme.as_ref()
    }

    /// Install the long-lived init key (reusable schemes only).
    pub fn set_init_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        if key.len() != self.scheme.init_key_len() {
            return Err(CryptoError::KeyLength {
                scheme: self.scheme.name(),
                expected: self.scheme.init_key_len(),
                got: key.len(),
            });
        }
        self.init_key = Some(Zeroizing::new(key.to_vec()));
        Ok(())
    }

    /// The stored init key, if one was seeded.
    pub fn init_key(&self) -> Option<&[u8]> {
        self.init_key.as_deref().map(|k| k.as_slice())
    }

    /// Octets the channel must draw per message for this context.
    pub fn ephemeral_key_len(&self) -> usize {
        let mut needed = 0;
        if self.scheme.init_key_len() > 0 && !self.scheme.init_key_reusable() {
            needed += self.scheme.init_key_len();
        }
        if self.scheme.final_key_len() > 0 && !self.scheme.final_key_reusable() {
            needed += self.scheme.final_key_len();
        }
        needed
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AuthContext({}, init key {})",
            self.scheme.name(),
            if self.init_key.is_some() { "set" } else { "unset" }
        )
    }
}

/// A cipher scheme plus its stored init key.
#[derive(Clone)]
pub struct CipherContext {
    scheme: Arc<dyn CipherScheme>,
}

impl CipherContext {
    pub fn new(name: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            scheme: cipher_scheme(name)?,
        })
    }

    pub fn scheme(&self) -> &dyn CipherScheme {
        self.scheme.as_ref()
    }
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherContext({})", self.scheme.name())
    }
}

/// The four scheme names a channel is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationProfile {
    pub authentication_incoming: String,
    pub authentication_outgoing: String,
    pub encryption_incoming: String,
    pub encryption_outgoing: String,
}

impl Default for AssociationProfile {
    fn default() -> Self {
        Self {
            authentication_incoming: "evhash-128".to_string(),
            authentication_outgoing: "evhash-128".to_string(),
            encryption_incoming: "xor".to_string(),
            encryption_outgoing: "xor".to_string(),
        }
    }
}

impl AssociationProfile {
    /// Initial-secret octets the four contexts consume when seeded.
    pub fn key_consumption(&self) -> Result<usize, CryptoError> {
        let auth_in = auth_scheme(&self.authentication_incoming)?;
        let auth_out = auth_scheme(&self.authentication_outgoing)?;
        // xor draws everything per message; only auth schemes hold init keys
        cipher_scheme(&self.encryption_incoming)?;
        cipher_scheme(&self.encryption_outgoing)?;
        Ok(auth_in.init_key_len() + auth_out.init_key_len())
    }
}

/// The four crypto contexts of one channel.
#[derive(Debug, Clone)]
pub struct CryptoAssociation {
    pub authentication_incoming: AuthContext,
    pub authentication_outgoing: AuthContext,
    pub encryption_incoming: CipherContext,
    pub encryption_outgoing: CipherContext,
}

impl CryptoAssociation {
    /// Build unseeded contexts from a profile.
    pub fn from_profile(profile: &AssociationProfile) -> Result<Self, CryptoError> {
        Ok(Self {
            authentication_incoming: AuthContext::new(&profile.authentication_incoming)?,
            authentication_outgoing: AuthContext::new(&profile.authentication_outgoing)?,
            encryption_incoming: CipherContext::new(&profile.encryption_incoming)?,
            encryption_outgoing: CipherContext::new(&profile.encryption_outgoing)?,
        })
    }

    /// Seed init keys from the shared initial secret.
    ///
    /// Slices run in the fixed order auth-in, auth-out, enc-in, enc-out so
    /// both endpoints cut identical boundaries; `swap_directions` is set on
    /// the slave so its incoming contexts take the octets the master assigned
    /// to outgoing and vice versa. Returns the number of octets consumed.
    pub fn seed(&mut self, secret: &[u8], swap_directions: bool) -> Result<usize, CryptoError> {
        let in_len = self.authentication_incoming.scheme().init_key_len();
        let out_len = self.authentication_outgoing.scheme().init_key_len();
        let needed = in_len + out_len;
        if secret.len() < needed {
            return Err(CryptoError::KeyLength {
                scheme: "association",
                expected: needed,
                got: secret.len(),
            });
        }

        // the slave's outgoing scheme is the master's incoming one, so when
        // swapping the first cut is the local outgoing length
        let (incoming_slice, outgoing_slice) = if swap_directions {
            (&secret[out_len..out_len + in_len], &secret[..out_len])
        } else {
            (&secret[..in_len], &secret[in_len..in_len + out_len])
        };

        if in_len > 0 {
            self.authentication_incoming.set_init_key(incoming_slice)?;
        }
        if out_len > 0 {
            self.authentication_outgoing.set_init_key(outgoing_slice)?;
        }
        Ok(needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_lookup() {
        assert!(auth_scheme("evhash-128").is_ok());
        assert!(auth_scheme("hmac-sha256").is_ok());
        assert!(cipher_scheme("xor").is_ok());
        assert!(matches!(
            auth_scheme("md5"),
            Err(CryptoError::UnknownScheme(_))
        ));
    }

    #[test]
    fn test_evhash_ephemeral_need_is_final_key_only() {
        let context = AuthContext::new("evhash-128").unwrap();
        // init key reusable, final key ephemeral
        assert_eq!(context.ephemeral_key_len(), 16);
    }

    #[test]
    fn test_hmac_ephemeral_need_is_init_key() {
        let context = AuthContext::new("hmac-sha256").unwrap();
        assert_eq!(context.ephemeral_key_len(), 32);
    }

    #[test]
    fn test_association_seed_and_swap() {
        let profile = AssociationProfile::default();
        assert_eq!(profile.key_consumption().unwrap(), 32);

        let secret: Vec<u8> = (0u8..64).collect();

        let mut master = CryptoAssociation::from_profile(&profile).unwrap();
        let used = master.seed(&secret, false).unwrap();
        assert_eq!(used, 32);

        let mut slave = CryptoAssociation::from_profile(&profile).unwrap();
        slave.seed(&secret, true).unwrap();

        // master's outgoing tag key must be the slave's incoming tag key
        assert_eq!(
            master.authentication_outgoing.init_key(),
            slave.authentication_incoming.init_key()
        );
        assert_eq!(
            master.authentication_incoming.init_key(),
            slave.authentication_outgoing.init_key()
        );
    }

    #[test]
    fn test_seed_rejects_short_secret() {
        let mut association =
            CryptoAssociation::from_profile(&AssociationProfile::default()).unwrap();
        assert!(association.seed(&[0u8; 8], false).is_err());
    }
}
