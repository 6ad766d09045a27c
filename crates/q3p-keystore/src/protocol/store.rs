//! # STORE Protocol
//!
//! Ingestion of reconciled keys into the Common Store. After Cascade both
//! endpoints hold the identical reconciled octets in their pickup areas
//! under matching pickup ids, so the exchange only has to agree on slot
//! placement:
//!
//! ```text
//! master                              slave
//!   | STORE "PICKUP" ids "C" cs-ids   |
//!   |-------------------------------->|  slices its pickup copies into
//!   |                                 |  the named store slots
//!   |     STORE-ACK <id> cs-ids       |
//!   |<--------------------------------|
//!   commits the same slots
//! ```
//!
//! Each pickup key is sliced to the store quantum; the tail short of one
//! quantum is discarded. Reservations roll back on timeout exactly like
//! LOAD rounds.

use crate::domain::errors::ProtocolError;
use crate::domain::message::Message;
use crate::engine::{Engine, PendingStore};
use crate::ports::KeyStoreBackend;
use crate::protocol::ProtocolId;
use shared_types::wire::{Reader, Writer};
use shared_types::{Key, KeyVec};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

impl Engine {
    /// One master STORE round over everything waiting in the pickup area.
    pub(crate) fn run_store(&mut self, now: Instant) -> Result<(), ProtocolError> {
        if !self.master() || self.pickup.is_empty() {
            return Ok(());
        }
        if !self.pending_stores.is_empty() {
            return Ok(());
        }

        let quantum = self.config.common_profile.quantum;
        let pickup_ids: Vec<u64> = self.pickup.keys().copied().collect();
        let total_slices: u64 = self
            .pickup
            .values()
            .map(|key| (key.len_octets() / quantum) as u64)
            .sum();
        if total_slices == 0 {
            return Ok(());
        }

        let common = self
            .common_store
            .as_mut()
            .ok_or_else(|| ProtocolError::Engine("no common store".to_string()))?;
        let cs_ids = common.find_spare(total_slices * quantum as u64, 1);
        if (cs_ids.len() as u64) < total_slices {
            warn!(
                needed = total_slices,
                free = cs_ids.len(),
                "common store too full to pick reconciled keys up"
            );
            common.set_key_count(&cs_ids, 0);
            return Ok(());
        }

        let mut writer = Writer::new();
        write_store_body(&mut writer, &pickup_ids, &cs_ids)
            .map_err(|e| ProtocolError::Message(e.to_string()))?;
        let mut message = Message::new(true, false);
        message.set_payload(writer.into_bytes());

        match self.send_message(ProtocolId::Store, message) {
            Ok(id) => {
                debug!(message_id = id, keys = pickup_ids.len(), "STORE round opened");
                self.pending_stores.insert(
                    id,
                    PendingStore {
                        sent_at: now,
                        pickup_ids,
                        cs_ids,
                    },
                );
                Ok(())
            }
            Err(e) => {
                if let Some(common) = self.common_store.as_mut() {
                    common.set_key_count(&cs_ids, 0);
                }
                Err(e)
            }
        }
    }

    /// Dispatch STORE-family messages by their leading command tag.
    pub(crate) fn recv_store_family(
        &mut self,
        message: Message,
        _now: Instant,
    ) -> Result<(), ProtocolError> {
        let mut reader = Reader::new(message.payload());
        let command: String = reader.read()?;
        match command.as_str() {
            "STORE" => self.recv_store(&message),
            "STORE-ACK" => self.recv_store_ack(&message),
            other => Err(ProtocolError::Answer(format!(
                "unknown STORE-family command {other:?}"
            ))),
        }
    }

    /// The slave fills the named store slots from its own pickup copies.
    fn recv_store(&mut self, message: &Message) -> Result<(), ProtocolError> {
        if !self.slave() {
            return Err(ProtocolError::Answer(
                "STORE may only arrive at the slave".to_string(),
            ));
        }

        let mut reader = Reader::new(message.payload());
        reader.expect_tag("STORE")?;
        reader.expect_tag("PICKUP")?;
        let pickup_ids: Vec<u64> = reader.read()?;
        reader.expect_tag("C")?;
        let cs_ids: KeyVec = reader.read()?;

        let quantum = self.config.common_profile.quantum;
        let slices = pickup_slices(&self.pickup, &pickup_ids, quantum)?;
        if slices.len() != cs_ids.len() {
            return Err(ProtocolError::Answer(format!(
                "STORE names {} slots for {} slices",
                cs_ids.len(),
                slices.len()
            )));
        }

        let common = self
            .common_store
            .as_mut()
            .ok_or_else(|| ProtocolError::Engine("no common store".to_string()))?;
        for (&cs_id, slice) in cs_ids.iter().zip(slices) {
            common.set(Key::new(cs_id, slice))?;
            common.set_key_count(&[cs_id], 0);
            common.set_real_sync(cs_id);
        }
        common.emit_charge_change(cs_ids.len() as u64, 0);
        for id in &pickup_ids {
            self.pickup.remove(id);
        }

        let mut writer = Writer::new();
        write_store_ack_body(&mut writer, message.id(), &cs_ids)
            .map_err(|e| ProtocolError::Message(e.to_string()))?;
        let mut ack = Message::new(true, false);
        ack.set_payload(writer.into_bytes());
        self.send_message(ProtocolId::Store, ack)?;

        debug!(stored = cs_ids.len(), "STORE applied");
        Ok(())
    }

    /// The master commits the acknowledged slots from its own copies.
    fn recv_store_ack(&mut self, message: &Message) -> Result<(), ProtocolError> {
        if !self.master() {
            return Err(ProtocolError::Answer(
                "STORE-ACK may only arrive at the master".to_string(),
            ));
        }

        let mut reader = Reader::new(message.payload());
        reader.expect_tag("STORE-ACK")?;
        let original_id: u32 = reader.read()?;
        let cs_ids: KeyVec = reader.read()?;
        let pending = self.pending_stores.remove(&original_id).ok_or_else(|| {
            ProtocolError::Answer("acknowledgement for an unsent STORE".to_string())
        })?;

        if cs_ids != pending.cs_ids {
            self.pending_stores.insert(original_id, pending);
            self.rollback_store(original_id);
            return Err(ProtocolError::Answer(
                "STORE-ACK names different slots than proposed".to_string(),
            ));
        }

        let quantum = self.config.common_profile.quantum;
        let slices = pickup_slices(&self.pickup, &pending.pickup_ids, quantum)?;
        if slices.len() != cs_ids.len() {
            // pickup area drifted while the round was open
            self.pending_stores.insert(original_id, pending);
            self.rollback_store(original_id);
            return Err(ProtocolError::Answer(
                "pickup area no longer matches the open STORE round".to_string(),
            ));
        }

        let common = self
            .common_store
            .as_mut()
            .ok_or_else(|| ProtocolError::Engine("no common store".to_string()))?;
        for (&cs_id, slice) in cs_ids.iter().zip(slices) {
            common.set(Key::new(cs_id, slice))?;
            common.set_key_count(&[cs_id], 0);
            common.set_real_sync(cs_id);
        }
        common.emit_charge_change(cs_ids.len() as u64, 0);
        for id in &pending.pickup_ids {
            self.pickup.remove(id);
        }

        debug!(
            stored = cs_ids.len(),
            charges = %self.charge_string(),
            "STORE round closed"
        );
        Ok(())
    }

    /// Release the slot reservations of one pending STORE. The pickup keys
    /// stay in the area for the next round.
    pub(crate) fn rollback_store(&mut self, id: u32) {
        let Some(pending) = self.pending_stores.remove(&id) else {
            return;
        };
        if let Some(common) = self.common_store.as_mut() {
            common.set_key_count(&pending.cs_ids, 0);
        }
    }
}

/// Slice the named pickup keys down to store quanta, in id order.
fn pickup_slices(
    pickup: &BTreeMap<u64, Key>,
    ids: &[u64],
    quantum: usize,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut slices = Vec::new();
    for id in ids {
        let key = pickup
            .get(id)
            .ok_or_else(|| ProtocolError::Answer(format!("unknown pickup key {id}")))?;
        let octets = key.data.as_octets();
        for chunk in octets.chunks_exact(quantum) {
            slices.push(chunk.to_vec());
        }
    }
    Ok(slices)
}

fn write_store_body(
    writer: &mut Writer,
    pickup_ids: &[u64],
    cs_ids: &KeyVec,
) -> Result<(), shared_types::WireError> {
    writer.write(&"STORE".to_string())?;
    writer.write(&"PICKUP".to_string())?;
    writer.write(&pickup_ids.to_vec())?;
    writer.write(&"C".to_string())?;
    writer.write(cs_ids)?;
    Ok(())
}

fn write_store_ack_body(
    writer: &mut Writer,
    original_id: u32,
    cs_ids: &KeyVec,
) -> Result<(), shared_types::WireError> {
    writer.write(&"STORE-ACK".to_string())?;
    writer.write(&original_id)?;
    writer.write(cs_ids)?;
    Ok(())
}
