//! # Channel
//!
//! A channel pairs an id with a full crypto association and carries every
//! message of the link. The pipelines are fixed:
//!
//! - encode (send): fix length/channel/id, compress if worthwhile, encrypt
//!   against Outgoing-Buffer keys, authenticate against Outgoing-Buffer
//!   keys, append the tag
//! - decode (receive): verify the tag against Incoming-Buffer keys named by
//!   the header, decrypt via the header's encryption-key id, decompress
//!
//! A tag mismatch is a hard failure and surfaced as a possible attack; it
//! never consumes keys. Successfully used key material is deleted from its
//! buffer immediately, failed draws are rolled back by resetting counters.

use crate::domain::errors::ChannelError;
use crate::domain::key_db::KeyDb;
use crate::ports::KeyStoreBackend;
use shared_crypto::CryptoAssociation;
use shared_types::KeyVec;
use tracing::{debug, warn};

use super::message::Message;

/// Payloads at least this large are compressed even when unencrypted.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;

/// Channel: id, association and the outgoing message counter.
pub struct Channel {
    id: u16,
    association: CryptoAssociation,
    message_id: u32,
    compression_threshold: usize,
}

impl Channel {
    pub fn new(id: u16, association: CryptoAssociation) -> Self {
        Self {
            id,
            association,
            message_id: 1,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn association(&self) -> &CryptoAssociation {
        &self.association
    }

    /// The id the next encoded message will get.
    pub fn next_message_id(&self) -> u32 {
        self.message_id
    }

    /// Octets one authenticated round costs on the outgoing buffer.
    pub fn authentication_cost(&self) -> usize {
        self.association.authentication_outgoing.scheme().tag_len()
    }

    /// Prepare a message for the wire.
    ///
    /// The message counter advances on every successful encode, whether or
    /// not the transport later delivers the frame.
    pub fn encode(&mut self, message: &mut Message, outgoing: &mut KeyDb) -> Result<(), ChannelError> {
        message.set_channel_id(self.id);
        message.set_id(self.message_id);

        let worthwhile = message.payload().len() >= self.compression_threshold;
        if !message.payload().is_empty() && (worthwhile || message.encrypted()) {
            self.compress(message)?;
        }
        if message.encrypted() {
            self.encrypt(message, outgoing)?;
        }
        if message.authentic() {
            self.authenticate(message, outgoing)?;
        }

        self.message_id = self.message_id.wrapping_add(1);
        Ok(())
    }

    /// Undo the wire protections of a received message.
    pub fn decode(&mut self, message: &mut Message, incoming: &mut KeyDb) -> Result<(), ChannelError> {
        if message.authentic() {
            self.authentication_verify(message, incoming)?;
        }
        if message.encrypted() {
            self.decrypt(message, incoming)?;
        }
        if message.zipped() {
            self.decompress(message)?;
        }
        Ok(())
    }

    fn compress(&self, message: &mut Message) -> Result<(), ChannelError> {
        let deflated = zstd::stream::encode_all(message.payload(), ZSTD_LEVEL)
            .map_err(|e| ChannelError::Context(format!("compression failed: {e}")))?;
        message.set_payload(deflated);
        message.set_zipped(true);
        Ok(())
    }

    fn decompress(&self, message: &mut Message) -> Result<(), ChannelError> {
        let inflated = zstd::stream::decode_all(message.payload())
            .map_err(|e| ChannelError::Message(format!("decompression failed: {e}")))?;
        message.set_payload(inflated);
        message.set_zipped(false);
        Ok(())
    }

    fn encrypt(&self, message: &mut Message, outgoing: &mut KeyDb) -> Result<(), ChannelError> {
        if message.payload().is_empty() {
            return Err(ChannelError::Message(
                "refused to encrypt an empty payload".to_string(),
            ));
        }

        let scheme = self.association.encryption_outgoing.scheme();
        let needed = scheme.key_len(message.payload().len());
        let mut keys = KeyVec::new();
        let mut drawn = Vec::new();
        if needed > 0 {
            (keys, drawn) = draw_continuous(outgoing, needed).map_err(|e| {
                warn!(message_id = message.id(), "encrypt: {e}");
                e
            })?;
            match narrow_id(keys[0]) {
                Ok(id) => message.set_encryption_key_id(id),
                Err(e) => {
                    outgoing.set_key_count(&keys, 0);
                    return Err(e);
                }
            }
        }

        match scheme.apply(&drawn, message.payload()) {
            Ok(cipher_text) => message.set_payload(cipher_text),
            Err(e) => {
                outgoing.set_key_count(&keys, 0);
                return Err(ChannelError::Context(e.to_string()));
            }
        }

        outgoing.del_many(&keys);
        outgoing.emit_charge_change(0, keys.len() as u64);
        Ok(())
    }

    fn decrypt(&self, message: &mut Message, incoming: &mut KeyDb) -> Result<(), ChannelError> {
        if message.payload().is_empty() {
            return Err(ChannelError::Message(
                "refused to decrypt an empty payload".to_string(),
            ));
        }

        let scheme = self.association.encryption_incoming.scheme();
        let needed = scheme.key_len(message.payload().len());
        let mut keys = KeyVec::new();
        let mut drawn = Vec::new();
        if needed > 0 {
            (keys, drawn) =
                gather_named(incoming, message.encryption_key_id() as u64, needed).map_err(
                    |e| {
                        warn!(message_id = message.id(), "decrypt: {e}");
                        e
                    },
                )?;
        }

        let plain = scheme
            .apply(&drawn, message.payload())
            .map_err(|e| ChannelError::Context(e.to_string()))?;
        message.set_payload(plain);

        incoming.del_many(&keys);
        incoming.emit_charge_change(0, keys.len() as u64);
        Ok(())
    }

    fn authenticate(&self, message: &mut Message, outgoing: &mut KeyDb) -> Result<(), ChannelError> {
        let context = &self.association.authentication_outgoing;
        let scheme = context.scheme();
        if scheme.tag_len() == 0 {
            return Ok(());
        }

        let needed = context.ephemeral_key_len();
        let mut keys = KeyVec::new();
        let mut drawn = Vec::new();
        if needed > 0 {
            (keys, drawn) = draw_continuous(outgoing, needed).map_err(|e| {
                warn!(message_id = message.id(), "authenticate: {e}");
                e
            })?;
            match narrow_id(keys[0]) {
                Ok(id) => message.set_authentication_key_id(id),
                Err(e) => {
                    outgoing.set_key_count(&keys, 0);
                    return Err(e);
                }
            }
        }

        let (init_key, final_key) = match split_ephemeral(context, &drawn) {
            Ok(split) => split,
            Err(e) => {
                outgoing.set_key_count(&keys, 0);
                return Err(e);
            }
        };

        // the length field counts the tag, so fix the tag size first; the
        // tag itself covers header and payload only
        message.set_tag(vec![0u8; scheme.tag_len()]);
        let mut data = message.header_bytes().to_vec();
        data.extend_from_slice(message.payload());

        match scheme.tag(init_key, final_key, &data) {
            Ok(tag) => message.set_tag(tag),
            Err(e) => {
                outgoing.set_key_count(&keys, 0);
                return Err(ChannelError::Context(e.to_string()));
            }
        }

        outgoing.del_many(&keys);
        outgoing.emit_charge_change(0, keys.len() as u64);
        Ok(())
    }

    fn authentication_verify(
        &self,
        message: &mut Message,
        incoming: &mut KeyDb,
    ) -> Result<(), ChannelError> {
        let context = &self.association.authentication_incoming;
        let scheme = context.scheme();
        if scheme.tag_len() == 0 {
            return Ok(());
        }

        // a message flagged authentic that cannot even hold a tag is
        // itself suspect
        if message.split_tag(scheme.tag_len()).is_err() {
            warn!(
                message_id = message.id(),
                "authentic message too short to hold its tag"
            );
            return Err(ChannelError::Auth {
                message_id: message.id(),
            });
        }

        let needed = context.ephemeral_key_len();
        let mut keys = KeyVec::new();
        let mut drawn = Vec::new();
        if needed > 0 {
            (keys, drawn) =
                gather_named(incoming, message.authentication_key_id() as u64, needed).map_err(
                    |e| {
                        warn!(message_id = message.id(), "verify: {e}");
                        e
                    },
                )?;
        }

        let (init_key, final_key) = split_ephemeral(context, &drawn)?;

        let mut data = message.header_bytes().to_vec();
        data.extend_from_slice(message.payload());
        let computed = scheme
            .tag(init_key, final_key, &data)
            .map_err(|e| ChannelError::Context(e.to_string()))?;

        if computed != message.tag() {
            // no key is consumed for a forged message
            return Err(ChannelError::Auth {
                message_id: message.id(),
            });
        }

        incoming.del_many(&keys);
        incoming.emit_charge_change(0, keys.len() as u64);
        debug!(message_id = message.id(), "message authentic");
        Ok(())
    }
}

/// Draw `needed` contiguous octets from a buffer, counters raised.
fn draw_continuous(buffer: &mut KeyDb, needed: usize) -> Result<(KeyVec, Vec<u8>), ChannelError> {
    let quantum = buffer.quantum();
    let keys = buffer.find_continuous(needed as u64, 1);
    if keys.len() * quantum < needed {
        buffer.set_key_count(&keys, 0);
        return Err(ChannelError::Keys(format!(
            "buffer {} holds no {needed} contiguous octets",
            buffer.describe()
        )));
    }
    let mut drawn = Vec::with_capacity(keys.len() * quantum);
    for &id in &keys {
        drawn.extend_from_slice(buffer.get(id).data.as_octets());
    }
    Ok((keys, drawn))
}

/// Collect the keys a received header names, starting at `first`.
fn gather_named(
    buffer: &mut KeyDb,
    first: u64,
    needed: usize,
) -> Result<(KeyVec, Vec<u8>), ChannelError> {
    let quantum = buffer.quantum();
    let count = (needed + quantum - 1) / quantum;
    let mut keys = KeyVec::with_capacity(count);
    let mut drawn = Vec::with_capacity(count * quantum);
    for i in 0..count as u64 {
        let id = first + i;
        if !buffer.valid(id) {
            return Err(ChannelError::Keys(format!(
                "key {id} in buffer {} is not valid",
                buffer.describe()
            )));
        }
        keys.push(id);
        drawn.extend_from_slice(buffer.get(id).data.as_octets());
    }
    Ok((keys, drawn))
}

/// Slice the drawn material into this context's init and final keys.
fn split_ephemeral<'a>(
    context: &'a shared_crypto::AuthContext,
    drawn: &'a [u8],
) -> Result<(&'a [u8], &'a [u8]), ChannelError> {
    let scheme = context.scheme();
    let mut offset = 0;

    let init_key: &[u8] = if scheme.init_key_len() == 0 {
        &[]
    } else if scheme.init_key_reusable() {
        context
            .init_key()
            .ok_or_else(|| ChannelError::Context("context has no init key seeded".to_string()))?
    } else {
        let end = scheme.init_key_len();
        offset = end;
        drawn
            .get(..end)
            .ok_or_else(|| ChannelError::Keys("drawn material short of init key".to_string()))?
    };

    let final_key: &[u8] = if scheme.final_key_len() == 0 || scheme.final_key_reusable() {
        &[]
    } else {
        drawn
            .get(offset..offset + scheme.final_key_len())
            .ok_or_else(|| ChannelError::Keys("drawn material short of final key".to_string()))?
    };

    Ok((init_key, final_key))
}

fn narrow_id(id: u64) -> Result<u32, ChannelError> {
    u32::try_from(id).map_err(|_| ChannelError::Message(format!("key id {id} exceeds header width")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key_db::DbProfile;
    use shared_crypto::{AssociationProfile, CryptoAssociation};
    use shared_types::Key;

    const QUANTUM: usize = 16;

    fn filled_buffer(name: &str, keys: usize) -> KeyDb {
        let mut db = KeyDb::open_ram(DbProfile::new(QUANTUM, 1, 256), name);
        for i in 0..keys {
            let octets: Vec<u8> = (0..QUANTUM).map(|j| (i * 31 + j * 7) as u8).collect();
            let id = db.insert(Key::new(0, octets)).unwrap();
            db.set_real_sync(id);
        }
        db
    }

    /// Master/slave channel pair over mirrored buffers: what the master's
    /// outgoing holds, the slave's incoming holds too.
    fn linked_pair() -> (Channel, Channel, KeyDb, KeyDb) {
        let profile = AssociationProfile::default();
        let secret: Vec<u8> = (0u8..32).collect();

        let mut master = CryptoAssociation::from_profile(&profile).unwrap();
        master.seed(&secret, false).unwrap();
        let mut slave = CryptoAssociation::from_profile(&profile).unwrap();
        slave.seed(&secret, true).unwrap();

        let master_outgoing = filled_buffer("ram://master-out", 64);
        let slave_incoming = filled_buffer("ram://slave-in", 64);

        (
            Channel::new(1, master),
            Channel::new(1, slave),
            master_outgoing,
            slave_incoming,
        )
    }

    #[test]
    fn test_encode_decode_roundtrip_consumes_mirrored_keys() {
        let (mut sender, mut receiver, mut outgoing, mut incoming) = linked_pair();

        let payload = b"application payload under one-time pad".to_vec();
        let mut message = Message::new(true, true);
        message.set_payload(payload.clone());

        let before = outgoing.count();
        sender.encode(&mut message, &mut outgoing).unwrap();
        assert!(outgoing.count() < before);
        assert_ne!(message.payload(), payload.as_slice());

        let mut received = Message::from_bytes(&message.to_bytes()).unwrap();
        receiver.decode(&mut received, &mut incoming).unwrap();
        assert_eq!(received.payload(), payload.as_slice());

        // both sides consumed the same ids
        assert_eq!(incoming.count(), outgoing.count());
        assert!(!incoming.valid(message.encryption_key_id() as u64));
        assert!(!incoming.valid(message.authentication_key_id() as u64));
    }

    #[test]
    fn test_tampered_message_is_auth_failure_and_keeps_keys() {
        let (mut sender, mut receiver, mut outgoing, mut incoming) = linked_pair();

        let mut message = Message::new(true, false);
        message.set_payload(b"authentic but tampered".to_vec());
        sender.encode(&mut message, &mut outgoing).unwrap();

        let mut bytes = message.to_bytes();
        let flip_at = crate::domain::message::HEADER_SIZE + 2;
        bytes[flip_at] ^= 0x01;

        let before = incoming.count();
        let mut received = Message::from_bytes(&bytes).unwrap();
        let err = receiver.decode(&mut received, &mut incoming).unwrap_err();
        assert!(matches!(err, ChannelError::Auth { .. }));
        assert_eq!(incoming.count(), before);
    }

    #[test]
    fn test_dry_buffer_is_keys_error_with_rollback() {
        let (mut sender, _, _, _) = linked_pair();
        let mut empty = KeyDb::open_ram(DbProfile::new(QUANTUM, 1, 16), "empty");

        let mut message = Message::new(true, true);
        message.set_payload(vec![0xAA; 64]);
        let err = sender.encode(&mut message, &mut empty).unwrap_err();
        assert!(matches!(err, ChannelError::Keys(_)));

        // nothing left marked
        for id in 1..=16u64 {
            assert_eq!(empty.key_count(id), 0);
        }
    }

    #[test]
    fn test_message_id_monotone_per_encode() {
        let (mut sender, _, mut outgoing, _) = linked_pair();
        assert_eq!(sender.next_message_id(), 1);

        for expected in 1u32..4 {
            let mut message = Message::new(true, false);
            message.set_payload(vec![1, 2, 3]);
            sender.encode(&mut message, &mut outgoing).unwrap();
            assert_eq!(message.id(), expected);
        }
        assert_eq!(sender.next_message_id(), 4);
    }

    #[test]
    fn test_large_plain_payload_is_compressed() {
        let (mut sender, mut receiver, mut outgoing, mut incoming) = linked_pair();

        let payload = vec![0x42u8; 4096];
        let mut message = Message::new(true, false);
        message.set_payload(payload.clone());
        sender.encode(&mut message, &mut outgoing).unwrap();
        assert!(message.zipped());
        assert!(message.payload().len() < payload.len());

        let mut received = Message::from_bytes(&message.to_bytes()).unwrap();
        receiver.decode(&mut received, &mut incoming).unwrap();
        assert!(!received.zipped());
        assert_eq!(received.payload(), payload.as_slice());
    }
}
