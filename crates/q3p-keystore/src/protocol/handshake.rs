//! # HANDSHAKE Protocol
//!
//! Both sides open with their role preference, a nonce, their four crypto
//! scheme names and the geometry of all four databases. The exchange must
//! produce exactly one master:
//!
//! - opposite preferences are accepted as declared
//! - equal or missing preferences fall back to the nonces; the parity of
//!   their sum decides whether the higher nonce becomes master
//! - equal nonces cannot be resolved; the side detecting it answers with a
//!   fresh handshake until a bounded number of retries runs out
//!
//! Schemes must cross-match (local incoming = peer outgoing), the database
//! geometries must agree, and the Common Store quantum must be a positive
//! multiple of the buffer quantum. On success both sides seed their crypto
//! contexts and prime the buffers from the shared initial secret.

use crate::domain::errors::ProtocolError;
use crate::domain::key_db::DbProfile;
use crate::domain::message::Message;
use crate::engine::Engine;
use crate::protocol::ProtocolId;
use rand::Rng;
use shared_types::wire::{Reader, Writer};
use tracing::{debug, warn};

/// Give up after this many nonce collisions in a row.
const MAX_NONCE_RETRIES: u32 = 3;

/// What one side declares during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HandshakeOffer {
    master: bool,
    slave: bool,
    nonce: u32,
    authentication_incoming: String,
    authentication_outgoing: String,
    encryption_incoming: String,
    encryption_outgoing: String,
    common: (u64, u64, u64),
    incoming: (u64, u64, u64),
    outgoing: (u64, u64, u64),
    application: (u64, u64, u64),
}

fn profile_triple(profile: DbProfile) -> (u64, u64, u64) {
    (profile.min_id, profile.max_id, profile.quantum as u64)
}

impl Engine {
    /// Send the local handshake offer. Draws a fresh nonce each time.
    pub(crate) fn begin_handshake(&mut self) -> Result<(), ProtocolError> {
        self.local_nonce = rand::thread_rng().gen_range(0..100_000);

        let payload =
            build_offer(self).map_err(|e: shared_types::WireError| ProtocolError::Message(e.to_string()))?;

        let mut message = Message::new(false, false);
        message.set_payload(payload);
        self.send_message(ProtocolId::Handshake, message)?;
        debug!(nonce = self.local_nonce, "handshake offer sent");
        Ok(())
    }

    pub(crate) fn recv_handshake(&mut self, message: Message) -> Result<(), ProtocolError> {
        if self.connected() {
            return Err(ProtocolError::Answer(
                "handshake on an established link".to_string(),
            ));
        }

        let offer = parse_offer(message.payload())?;

        match self.choose_role(offer.master, offer.slave, offer.nonce) {
            RoleOutcome::Decided => {}
            RoleOutcome::NonceCollision => {
                self.handshake_retries += 1;
                if self.handshake_retries > MAX_NONCE_RETRIES {
                    return Err(ProtocolError::Config(
                        "handshake nonces kept colliding".to_string(),
                    ));
                }
                warn!(
                    nonce = self.local_nonce,
                    "handshake nonces equal, retrying with a fresh one"
                );
                self.begin_handshake()?;
                return Err(ProtocolError::Config(
                    "handshake nonce collision; fresh offer sent".to_string(),
                ));
            }
        }

        // schemes must cross-match: what the peer receives we send
        let association = &self.config.association;
        let authentication_matches = offer.authentication_incoming
            == association.authentication_outgoing
            && offer.authentication_outgoing == association.authentication_incoming;
        if !authentication_matches {
            return Err(ProtocolError::Config(format!(
                "authentication scheme mismatch: peer {}/{}, local {}/{}",
                offer.authentication_incoming,
                offer.authentication_outgoing,
                association.authentication_incoming,
                association.authentication_outgoing
            )));
        }
        let encryption_matches = offer.encryption_incoming == association.encryption_outgoing
            && offer.encryption_outgoing == association.encryption_incoming;
        if !encryption_matches {
            return Err(ProtocolError::Config(format!(
                "encryption scheme mismatch: peer {}/{}, local {}/{}",
                offer.encryption_incoming,
                offer.encryption_outgoing,
                association.encryption_incoming,
                association.encryption_outgoing
            )));
        }

        // geometry checks
        let common = profile_triple(self.config.common_profile);
        let buffer = profile_triple(self.config.buffer_profile);
        if offer.common != common {
            return Err(ProtocolError::Config(
                "common store geometry mismatch".to_string(),
            ));
        }
        for (name, triple) in [
            ("incoming", offer.incoming),
            ("outgoing", offer.outgoing),
            ("application", offer.application),
        ] {
            if triple != buffer {
                return Err(ProtocolError::Config(format!(
                    "{name} buffer geometry mismatch"
                )));
            }
        }
        let (_, _, common_quantum) = common;
        let (_, _, buffer_quantum) = buffer;
        if common_quantum / buffer_quantum == 0 || common_quantum % buffer_quantum != 0 {
            return Err(ProtocolError::Config(
                "common store quantum is not a positive multiple of the buffer quantum".to_string(),
            ));
        }

        self.establish_link()
    }

    /// Decide the local role from both declarations.
    fn choose_role(&mut self, peer_master: bool, peer_slave: bool, peer_nonce: u32) -> RoleOutcome {
        let mut local_decided = self.master() ^ self.slave();
        let mut peer_decided = peer_master ^ peer_slave;

        if local_decided && peer_decided && (self.master() == peer_master) {
            // both want the same chair, roll the dice instead
            debug!("local and peer declared the same role, falling back to nonces");
            local_decided = false;
            peer_decided = false;
        }

        if !local_decided && !peer_decided {
            if self.local_nonce == peer_nonce {
                return RoleOutcome::NonceCollision;
            }
            // even sum: the higher nonce is master; odd sum: the lower one
            let higher_is_master = (self.local_nonce.wrapping_add(peer_nonce)) % 2 == 0;
            let local_is_higher = self.local_nonce > peer_nonce;
            self.set_master(local_is_higher == higher_is_master);
        } else if !local_decided && peer_decided {
            debug!("adopting the role the peer left open");
            self.set_master(!peer_master);
        }
        // a decided local side keeps its declaration

        RoleOutcome::Decided
    }
}

enum RoleOutcome {
    Decided,
    NonceCollision,
}

fn build_offer(engine: &Engine) -> Result<Vec<u8>, shared_types::WireError> {
    let association = &engine.config.association;
    let mut writer = Writer::new();
    writer.write(&engine.config.prefer_master)?;
    writer.write(&engine.config.prefer_slave)?;
    writer.write(&engine.local_nonce)?;
    writer.write(&association.authentication_incoming)?;
    writer.write(&association.authentication_outgoing)?;
    writer.write(&association.encryption_incoming)?;
    writer.write(&association.encryption_outgoing)?;
    writer.write(&profile_triple(engine.config.common_profile))?;
    // the three buffers share one geometry
    writer.write(&profile_triple(engine.config.buffer_profile))?;
    writer.write(&profile_triple(engine.config.buffer_profile))?;
    writer.write(&profile_triple(engine.config.buffer_profile))?;
    Ok(writer.into_bytes())
}

fn parse_offer(payload: &[u8]) -> Result<HandshakeOffer, ProtocolError> {
    let mut reader = Reader::new(payload);
    Ok(HandshakeOffer {
        master: reader.read()?,
        slave: reader.read()?,
        nonce: reader.read()?,
        authentication_incoming: reader.read()?,
        authentication_outgoing: reader.read()?,
        encryption_incoming: reader.read()?,
        encryption_outgoing: reader.read()?,
        common: reader.read()?,
        incoming: reader.read()?,
        outgoing: reader.read()?,
        application: reader.read()?,
    })
}
