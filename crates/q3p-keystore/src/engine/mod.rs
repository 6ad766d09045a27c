//! # Q3P Engine
//!
//! The engine owns the four key databases (Common Store, Incoming,
//! Outgoing, Application), the channel, the master/slave role and every
//! pending protocol exchange. Its lifecycle:
//!
//! ```text
//! Init -> Open (DB mounted) -> Connecting -> Handshake -> Connected
//!                  ^                                          |
//!                  +----------- transport loss ---------------+
//! ```
//!
//! The core is synchronous: frames go in through [`Engine::handle_frame`],
//! the periodic [`Engine::tick`] drives LOAD / LOAD-REQUEST / STORE and
//! timeout sweeps, and encoded wire frames come back out of
//! [`Engine::take_outbox`]. The async link task in [`crate::engine::link`]
//! owns the socket and is the only caller of the mutating surface, which
//! keeps all database mutation inside one task.

pub mod link;

use crate::domain::channel::Channel;
use crate::domain::errors::{KeyDbError, ProtocolError};
use crate::domain::key_db::{DbProfile, KeyDb};
use crate::domain::message::{Message, PACKET_MAX_SIZE};
use crate::ports::{DataSink, KeyStoreBackend};
use crate::protocol::{max_size, ProtocolId};
use shared_crypto::{AssociationProfile, CryptoAssociation};
use shared_types::{Key, KeyRing, KeyVec};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No database mounted.
    Init,
    /// Database mounted, no transport.
    Open,
    /// Transport attach in progress.
    Connecting,
    /// Transport up, roles and geometry being negotiated.
    Handshake,
    /// Fully negotiated link.
    Connected,
}

/// Static engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Geometry of the Common Store.
    pub common_profile: DbProfile,
    /// Geometry shared by the three buffers.
    pub buffer_profile: DbProfile,
    /// The four crypto scheme names.
    pub association: AssociationProfile,
    /// Preferred role, if any. Leaving both false lets the nonce decide.
    pub prefer_master: bool,
    pub prefer_slave: bool,
    /// Reconnect with the last peer address after transport loss.
    pub reconnect: bool,
    /// Buffers filled beyond this ratio are sated and skip LOAD rounds.
    pub sated_ratio: f64,
    /// Deadline for LOAD / STORE responses, enforced by the master.
    pub response_timeout: Duration,
    /// Period of the link task's tick.
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            common_profile: DbProfile::new(256, 1, 16384),
            buffer_profile: DbProfile::new(32, 1, 4096),
            association: AssociationProfile::default(),
            prefer_master: false,
            prefer_slave: false,
            reconnect: true,
            sated_ratio: 0.90,
            response_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// A LOAD the master sent and still awaits the answer for.
pub(crate) struct PendingLoad {
    pub sent_at: Instant,
    pub cs_for_outgoing: KeyVec,
    pub cs_for_application: KeyVec,
    pub outgoing_buffer_keys: KeyVec,
    pub application_buffer_keys: KeyVec,
}

/// A STORE the master sent and still awaits the answer for.
pub(crate) struct PendingStore {
    pub sent_at: Instant,
    pub pickup_ids: Vec<u64>,
    pub cs_ids: KeyVec,
}

/// The Q3P key-store engine.
pub struct Engine {
    pub(crate) config: EngineConfig,
    state: EngineState,
    pub(crate) common_store: Option<KeyDb>,
    pub(crate) incoming: Option<KeyDb>,
    pub(crate) outgoing: Option<KeyDb>,
    pub(crate) application: Option<KeyDb>,
    master: bool,
    slave: bool,
    pub(crate) local_nonce: u32,
    pub(crate) handshake_retries: u32,
    handshake_active: bool,
    transport_up: bool,
    auth_poisoned: bool,
    initial_secret: Option<Zeroizing<Vec<u8>>>,
    pub(crate) channel: Option<Channel>,
    next_channel_id: u16,
    pub(crate) pending_loads: HashMap<u32, PendingLoad>,
    pub(crate) pending_load_request: Option<(u32, Instant)>,
    pub(crate) pending_stores: HashMap<u32, PendingStore>,
    pub(crate) pickup: BTreeMap<u64, Key>,
    next_pickup_id: u64,
    outbox: Vec<Vec<u8>>,
    pub(crate) sink: Option<Box<dyn DataSink>>,
    url_listen: Option<String>,
    url_peer: Option<String>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        assert!(
            config.common_profile.quantum % config.buffer_profile.quantum == 0
                && config.common_profile.quantum >= config.buffer_profile.quantum,
            "common store quantum must be a positive multiple of the buffer quantum"
        );
        Self {
            config,
            state: EngineState::Init,
            common_store: None,
            incoming: None,
            outgoing: None,
            application: None,
            master: false,
            slave: false,
            local_nonce: 0,
            handshake_retries: 0,
            handshake_active: false,
            transport_up: false,
            auth_poisoned: false,
            initial_secret: None,
            channel: None,
            next_channel_id: 0,
            pending_loads: HashMap::new(),
            pending_load_request: None,
            pending_stores: HashMap::new(),
            pickup: BTreeMap::new(),
            next_pickup_id: 1,
            outbox: Vec::new(),
            sink: None,
            url_listen: None,
            url_peer: None,
        }
    }

    // ------------------------------------------------------------------
    // control surface

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn master(&self) -> bool {
        self.master
    }

    pub fn slave(&self) -> bool {
        self.slave
    }

    pub(crate) fn set_master(&mut self, master: bool) {
        self.master = master;
        self.slave = !master;
    }

    pub fn connected(&self) -> bool {
        self.state == EngineState::Connected
    }

    pub fn db_opened(&self) -> bool {
        self.common_store.is_some()
    }

    pub fn authentication_scheme_incoming(&self) -> &str {
        &self.config.association.authentication_incoming
    }

    pub fn authentication_scheme_outgoing(&self) -> &str {
        &self.config.association.authentication_outgoing
    }

    pub fn encryption_scheme_incoming(&self) -> &str {
        &self.config.association.encryption_incoming
    }

    pub fn encryption_scheme_outgoing(&self) -> &str {
        &self.config.association.encryption_outgoing
    }

    pub fn url_listen(&self) -> Option<&str> {
        self.url_listen.as_deref()
    }

    pub fn url_peer(&self) -> Option<&str> {
        self.url_peer.as_deref()
    }

    pub(crate) fn set_url_listen(&mut self, url: &str) {
        self.url_listen = Some(url.to_string());
    }

    pub(crate) fn set_url_peer(&mut self, url: &str) {
        self.url_peer = Some(url.to_string());
    }

    pub fn set_data_sink(&mut self, sink: Box<dyn DataSink>) {
        self.sink = Some(sink);
    }

    /// The mounted Common Store, if any.
    pub fn common_store(&self) -> Option<&KeyDb> {
        self.common_store.as_ref()
    }

    /// The Incoming buffer; present only while a link is established.
    pub fn incoming_buffer(&self) -> Option<&KeyDb> {
        self.incoming.as_ref()
    }

    /// The Outgoing buffer; present only while a link is established.
    pub fn outgoing_buffer(&self) -> Option<&KeyDb> {
        self.outgoing.as_ref()
    }

    /// The Application buffer; present only while a link is established.
    pub fn application_buffer(&self) -> Option<&KeyDb> {
        self.application.as_ref()
    }

    /// True once an authentication failure poisoned the link; the shell
    /// must not reconnect without operator intervention.
    pub fn auth_poisoned(&self) -> bool {
        self.auth_poisoned
    }

    /// Buffer charges for debugging:
    /// `<<C:used/cap>, <I:used/cap>, <O:used/cap>, <A:used/cap>>`.
    pub fn charge_string(&self) -> String {
        if !self.connected() {
            return "<not connected>".to_string();
        }
        let dbs = [
            ("C", self.common_store.as_ref()),
            ("I", self.incoming.as_ref()),
            ("O", self.outgoing.as_ref()),
            ("A", self.application.as_ref()),
        ];
        let parts: Vec<String> = dbs
            .iter()
            .map(|(tag, db)| match db {
                Some(db) => format!("<{tag}:{}/{}>", db.count(), db.amount()),
                None => format!("<{tag}:-/->"),
            })
            .collect();
        format!("<{}>", parts.join(", "))
    }

    // ------------------------------------------------------------------
    // database lifecycle

    /// Mount the Common Store; transitions `Init -> Open`.
    pub fn open_db(&mut self, url: &str) -> Result<(), KeyDbError> {
        let db = KeyDb::open(url, self.config.common_profile)?;
        info!(db = %db.describe(), "common store mounted");
        self.common_store = Some(db);
        self.calculate_state();
        Ok(())
    }

    /// Unmount everything; transitions back to `Init`.
    pub fn close_db(&mut self) {
        if let Some(mut db) = self.common_store.take() {
            if let Err(e) = db.sync() {
                warn!(error = %e, "common store close-time sync failed");
            }
        }
        self.incoming = None;
        self.outgoing = None;
        self.application = None;
        self.channel = None;
        self.calculate_state();
    }

    /// Insert key material into the Common Store without peer interaction.
    ///
    /// The blob is sliced to the store quantum; a trailing remainder is
    /// dropped. Refused while a peer is attached.
    pub fn inject(&mut self, secret_bits: &[u8]) -> Result<u64, ProtocolError> {
        if self.transport_up {
            return Err(ProtocolError::Engine(
                "refusing to inject keys while connected; disconnect first".to_string(),
            ));
        }
        let store = self
            .common_store
            .as_mut()
            .ok_or_else(|| ProtocolError::Engine("no database open".to_string()))?;

        let mut ring = KeyRing::new(store.quantum());
        ring.push(secret_bits);
        if !ring.remainder().is_empty() {
            debug!(
                dropped = ring.remainder().len(),
                quantum = store.quantum(),
                "dropping key material below one store quantum"
            );
        }

        let mut inserted = 0u64;
        for key in ring.into_keys() {
            match store.insert(key) {
                Ok(id) => {
                    store.set_injected(id);
                    store.set_real_sync(id);
                    inserted += 1;
                }
                Err(e) => {
                    warn!(error = %e, "key injection stopped");
                    break;
                }
            }
        }
        store.emit_charge_change(inserted, 0);
        info!(inserted, "injected keys into the common store");
        Ok(inserted)
    }

    /// Inject key material named by a URL; only `file://` is understood.
    pub fn inject_url(&mut self, url: &str) -> Result<u64, ProtocolError> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| ProtocolError::Config(format!("unknown inject scheme in {url:?}")))?;
        let bits = std::fs::read(path)
            .map_err(|e| ProtocolError::Engine(format!("cannot read {path:?}: {e}")))?;
        self.inject(&bits)
    }

    /// Hand a reconciled key to the pickup area for the STORE protocol.
    ///
    /// Both endpoints pick their reconciled keys up in the same order, so
    /// the monotone pickup ids agree across the link. Keys shorter than
    /// one store quantum can never be stored and are dropped.
    pub fn pickup_key(&mut self, key: Key) -> Option<u64> {
        let quantum = self.config.common_profile.quantum;
        if key.len_octets() < quantum {
            warn!(
                octets = key.len_octets(),
                quantum, "dropping reconciled key below one store quantum"
            );
            return None;
        }
        let id = self.next_pickup_id;
        self.next_pickup_id += 1;
        self.pickup.insert(id, key);
        Some(id)
    }

    /// Loan keys out of the Application buffer.
    ///
    /// Draws a contiguous run covering `bytes`, removes it from the buffer
    /// and returns it to the caller.
    pub fn acquire_keys(&mut self, bytes: u64) -> Result<Vec<Key>, ProtocolError> {
        let buffer = self
            .application
            .as_mut()
            .ok_or_else(|| ProtocolError::Engine("application buffer not set up".to_string()))?;
        let ids = buffer.find_continuous(bytes, 1);
        if ((ids.len() * buffer.quantum()) as u64) < bytes {
            buffer.set_key_count(&ids, 0);
            return Err(ProtocolError::Keys(format!(
                "application buffer cannot cover {bytes} bytes"
            )));
        }
        let keys: Vec<Key> = ids.iter().map(|&id| buffer.get(id)).collect();
        buffer.del_many(&ids);
        buffer.emit_charge_change(0, ids.len() as u64);
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // transport lifecycle

    /// Install the shared initial secret ahead of a connect or listen.
    pub fn set_initial_secret(&mut self, secret: Vec<u8>) -> Result<(), ProtocolError> {
        let needed = self
            .config
            .association
            .key_consumption()
            .map_err(|e| ProtocolError::Config(e.to_string()))?
            + 2;
        if secret.len() < needed {
            return Err(ProtocolError::Config(format!(
                "initial secret of {} bytes is below the {needed} byte minimum",
                secret.len()
            )));
        }
        self.initial_secret = Some(Zeroizing::new(secret));
        Ok(())
    }

    /// The shell began dialing or accepting.
    pub fn set_connecting(&mut self) {
        self.transport_up = false;
        self.handshake_active = false;
        if self.db_opened() {
            self.state = EngineState::Connecting;
        }
    }

    /// A transport is attached; start negotiating.
    pub fn transport_attached(&mut self) -> Result<(), ProtocolError> {
        if !self.db_opened() {
            return Err(ProtocolError::Engine(
                "no database open; refusing peer".to_string(),
            ));
        }
        if self.initial_secret.is_none() {
            return Err(ProtocolError::Config(
                "no initial secret installed".to_string(),
            ));
        }
        self.transport_up = true;
        self.handshake_active = true;
        self.master = self.config.prefer_master;
        self.slave = self.config.prefer_slave;
        self.begin_handshake()?;
        self.calculate_state();
        Ok(())
    }

    /// The transport is gone; roll pending work back and fall to `Open`.
    pub fn transport_lost(&mut self) {
        // release reservations while the buffers still exist
        self.rollback_all_pending();
        self.transport_up = false;
        self.handshake_active = false;
        self.channel = None;
        self.incoming = None;
        self.outgoing = None;
        self.application = None;
        self.outbox.clear();
        self.calculate_state();
    }

    /// An authentication failure: tear down hard, no reconnect.
    pub(crate) fn poison(&mut self) {
        warn!("authentication failure: tearing the link down");
        self.auth_poisoned = true;
        self.transport_lost();
    }

    /// Operator acknowledged the authentication incident.
    pub fn clear_poison(&mut self) {
        self.auth_poisoned = false;
    }

    fn calculate_state(&mut self) {
        let new_state = if !self.db_opened() {
            EngineState::Init
        } else if self.channel.is_some() && self.transport_up {
            EngineState::Connected
        } else if self.handshake_active {
            EngineState::Handshake
        } else if self.transport_up {
            EngineState::Connecting
        } else {
            EngineState::Open
        };
        if new_state != self.state {
            info!(from = ?self.state, to = ?new_state, "engine state changed");
            self.state = new_state;
        }
    }

    /// Called by the handshake on success: buffers, association, channel.
    pub(crate) fn establish_link(&mut self) -> Result<(), ProtocolError> {
        let secret = self
            .initial_secret
            .as_deref()
            .ok_or_else(|| ProtocolError::Config("no initial secret installed".to_string()))?
            .to_vec();

        let buffer_profile = self.config.buffer_profile;
        let mut incoming = KeyDb::open_ram(buffer_profile, "incoming");
        let mut outgoing = KeyDb::open_ram(buffer_profile, "outgoing");
        let application = KeyDb::open_ram(buffer_profile, "application");

        let mut association = CryptoAssociation::from_profile(&self.config.association)
            .map_err(|e| ProtocolError::Config(e.to_string()))?;
        let consumed = association
            .seed(&secret, self.slave)
            .map_err(|e| ProtocolError::Config(e.to_string()))?;

        // the rest of the secret primes the buffers in two even halves so
        // the very first tags are already backed by shared material
        let mut rest = secret.len() - consumed;
        if rest % 2 == 1 {
            rest -= 1;
        }
        let half = rest / 2;
        let first = &secret[consumed..consumed + half];
        let second = &secret[consumed + half..consumed + 2 * half];
        let (incoming_bits, outgoing_bits) = if self.master {
            (first, second)
        } else {
            (second, first)
        };

        prime_buffer(&mut incoming, incoming_bits)?;
        prime_buffer(&mut outgoing, outgoing_bits)?;

        self.next_channel_id = self.next_channel_id.wrapping_add(1).max(1);
        self.channel = Some(Channel::new(self.next_channel_id, association));
        self.incoming = Some(incoming);
        self.outgoing = Some(outgoing);
        self.application = Some(application);
        self.handshake_active = false;
        self.handshake_retries = 0;
        self.calculate_state();

        info!(
            master = self.master,
            charges = %self.charge_string(),
            "link established"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // frame plumbing

    /// Encoded wire frames waiting for the transport.
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Encode and queue one message; returns its assigned id.
    pub(crate) fn send_message(
        &mut self,
        protocol: ProtocolId,
        mut message: Message,
    ) -> Result<u32, ProtocolError> {
        message.set_protocol_id(protocol as u8);
        if message.length() >= max_size() {
            return Err(ProtocolError::PacketSize {
                got: message.length(),
                limit: max_size(),
            });
        }

        if message.authentic() || message.encrypted() {
            let channel = self
                .channel
                .as_mut()
                .ok_or_else(|| ProtocolError::Engine("no channel for a secured message".to_string()))?;
            let outgoing = self
                .outgoing
                .as_mut()
                .ok_or_else(|| ProtocolError::Engine("no outgoing buffer".to_string()))?;
            channel.encode(&mut message, outgoing)?;
        } else if let (Some(channel), Some(outgoing)) =
            (self.channel.as_mut(), self.outgoing.as_mut())
        {
            channel.encode(&mut message, outgoing)?;
        }

        let id = message.id();
        debug!(
            protocol = protocol.name(),
            message_id = id,
            bytes = message.length(),
            "queueing message"
        );
        self.outbox.push(message.to_bytes());
        Ok(id)
    }

    /// Parse and dispatch one received frame.
    pub fn handle_frame(&mut self, bytes: &[u8], now: Instant) -> Result<(), ProtocolError> {
        if bytes.len() > PACKET_MAX_SIZE {
            return Err(ProtocolError::PacketSize {
                got: bytes.len(),
                limit: PACKET_MAX_SIZE,
            });
        }
        let mut message = Message::from_bytes(bytes)?;

        if message.authentic() || message.encrypted() || message.zipped() {
            let channel = match self.channel.as_mut() {
                Some(channel) => channel,
                None => {
                    return Err(ProtocolError::Answer(
                        "secured message before the link was established".to_string(),
                    ))
                }
            };
            let incoming = self
                .incoming
                .as_mut()
                .ok_or_else(|| ProtocolError::Engine("no incoming buffer".to_string()))?;
            if let Err(e) = channel.decode(&mut message, incoming) {
                let e: ProtocolError = e.into();
                if e.is_hostile() {
                    self.poison();
                }
                return Err(e);
            }
        }

        match ProtocolId::try_from(message.protocol_id())? {
            ProtocolId::Handshake => self.recv_handshake(message),
            ProtocolId::Load | ProtocolId::LoadRequest => self.recv_load_family(message, now),
            ProtocolId::Store => self.recv_store_family(message, now),
            ProtocolId::Data => self.recv_data_message(message),
        }
    }

    /// Periodic driver: LOAD, LOAD-REQUEST, STORE, timeout sweeps.
    pub fn tick(&mut self, now: Instant) {
        if !self.connected() {
            return;
        }
        self.sweep_timeouts(now);

        if self.master {
            if let Err(e) = self.run_load(0, now) {
                warn!(error = %e, "periodic LOAD failed");
            }
            if let Err(e) = self.run_store(now) {
                warn!(error = %e, "periodic STORE failed");
            }
        } else {
            if let Err(e) = self.run_load_request(now) {
                warn!(error = %e, "periodic LOAD-REQUEST failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // shared helpers for the protocol modules

    /// All four databases, or an `Engine` error if the link is not up.
    pub(crate) fn dbs_mut(
        &mut self,
    ) -> Result<(&mut KeyDb, &mut KeyDb, &mut KeyDb, &mut KeyDb), ProtocolError> {
        match (
            self.common_store.as_mut(),
            self.incoming.as_mut(),
            self.outgoing.as_mut(),
            self.application.as_mut(),
        ) {
            (Some(c), Some(i), Some(o), Some(a)) => Ok((c, i, o, a)),
            _ => Err(ProtocolError::Engine(
                "databases not set up for this operation".to_string(),
            )),
        }
    }

    pub(crate) fn rollback_all_pending(&mut self) {
        let loads: Vec<u32> = self.pending_loads.keys().copied().collect();
        for id in loads {
            self.rollback_load(id);
        }
        let stores: Vec<u32> = self.pending_stores.keys().copied().collect();
        for id in stores {
            self.rollback_store(id);
        }
        self.pending_load_request = None;
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let deadline = self.config.response_timeout;

        if self.master {
            let stale: Vec<u32> = self
                .pending_loads
                .iter()
                .filter(|(_, p)| now.duration_since(p.sent_at) > deadline)
                .map(|(&id, _)| id)
                .collect();
            for id in stale {
                info!(message_id = id, "dropping timed-out LOAD; peer did not react");
                self.rollback_load(id);
            }

            let stale: Vec<u32> = self
                .pending_stores
                .iter()
                .filter(|(_, p)| now.duration_since(p.sent_at) > deadline)
                .map(|(&id, _)| id)
                .collect();
            for id in stale {
                info!(message_id = id, "dropping timed-out STORE; peer did not react");
                self.rollback_store(id);
            }
        } else {
            // the slave only forgets its request so the next tick resends
            if let Some((id, sent_at)) = self.pending_load_request {
                if now.duration_since(sent_at) > deadline {
                    debug!(message_id = id, "LOAD-REQUEST expired, will re-ask");
                    self.pending_load_request = None;
                }
            }
        }
    }

}

/// Slice octets into full-quantum keys and insert them real-sync.
pub(crate) fn prime_buffer(buffer: &mut KeyDb, bits: &[u8]) -> Result<(), ProtocolError> {
    let mut ring = KeyRing::new(buffer.quantum());
    ring.push(bits);
    if !ring.remainder().is_empty() {
        debug!(
            dropped = ring.remainder().len(),
            "initial secret tail below one buffer quantum dropped"
        );
    }
    let added = ring.len() as u64;
    for key in ring.into_keys() {
        let id = buffer.insert(key)?;
        buffer.set_real_sync(id);
    }
    buffer.emit_charge_change(added, 0);
    Ok(())
}
