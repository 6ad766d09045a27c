//! # LOAD and LOAD-REQUEST Protocols
//!
//! Buffer replenishment. The master periodically inspects the charge of
//! Outgoing and Application, reserves Common-Store keys and spare buffer
//! slots, and proposes the move:
//!
//! ```text
//! master                             slave
//!   | LOAD  "OUTGOING" C/O "APPLICAT" C/A |
//!   |------------------------------------>|  moves CS keys into
//!   |                                     |  Incoming / Application
//!   |          LOAD-ACK <id> moved        |
//!   |<------------------------------------|
//!   commits the same move
//! ```
//!
//! The slave cannot reserve; it only asks. Its periodic LOAD-REQUEST names
//! the bytes its Incoming buffer is short of, and the master answers with
//! an ordinary LOAD round.
//!
//! Every reservation is rolled back on abort, timeout or transport loss;
//! a round that would gain less than twice the authentication-tag cost is
//! not worth playing and is abandoned before anything is sent.

use crate::domain::errors::ProtocolError;
use crate::domain::message::Message;
use crate::engine::{Engine, PendingLoad};
use crate::ports::KeyStoreBackend;
use crate::protocol::key_move::{move_to_buffer, not_moved};
use crate::protocol::ProtocolId;
use shared_types::wire::{Reader, Writer};
use shared_types::KeyVec;
use std::time::Instant;
use tracing::{debug, warn};

impl Engine {
    /// One master LOAD round.
    ///
    /// `requested_incoming_bytes` carries the demand of a slave
    /// LOAD-REQUEST; 0 on plain periodic rounds. A buffer that is sated
    /// (charge above the configured ratio, or at least as charged as
    /// Incoming) contributes no demand.
    pub(crate) fn run_load(
        &mut self,
        requested_incoming_bytes: u64,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        if !self.master() {
            return Ok(());
        }
        // wait for outstanding rounds before opening another
        if !self.pending_loads.is_empty() {
            return Ok(());
        }

        let sated = self.config.sated_ratio;
        let authentication_cost = self
            .channel
            .as_ref()
            .map(|c| c.authentication_cost())
            .unwrap_or(0) as u64;

        let (common, incoming, outgoing, application) = self.dbs_mut()?;
        let ratio = (common.quantum() / outgoing.quantum()) as u64;
        let out_quantum = outgoing.quantum() as u64;
        let app_quantum = application.quantum() as u64;

        // demand in buffer keys
        let mut keys_outgoing = outgoing.amount() - outgoing.count();
        if outgoing.count() as f64 > outgoing.amount() as f64 * sated {
            keys_outgoing = 0;
        }
        if outgoing.count() >= incoming.count() {
            keys_outgoing = 0;
        }
        // a slave request is served in whole store quanta, charge gates aside
        let requested_keys = (requested_incoming_bytes + out_quantum - 1) / out_quantum;
        let requested_keys = (requested_keys + ratio - 1) / ratio * ratio;
        keys_outgoing = keys_outgoing.max(requested_keys.min(outgoing.amount() - outgoing.count()));

        let mut keys_application = application.amount() - application.count();
        if application.count() as f64 > application.amount() as f64 * sated {
            keys_application = 0;
        }
        if application.count() >= incoming.count() {
            keys_application = 0;
        }
        if application.count() >= outgoing.count() + keys_outgoing {
            keys_application = 0;
        }

        if keys_outgoing + keys_application == 0 {
            return Ok(());
        }

        // never drain the store below two thirds
        let bytes_available = (common.count() / 3) * common.quantum() as u64;
        if bytes_available == 0 {
            return Ok(());
        }
        keys_outgoing = keys_outgoing.min(bytes_available / out_quantum);
        keys_application = keys_application.min(bytes_available / app_quantum);

        // whole common-store quanta only, anything else wastes material
        keys_outgoing -= keys_outgoing % ratio;
        keys_application -= keys_application % ratio;
        if keys_outgoing == 0 && keys_application == 0 {
            return Ok(());
        }

        let mut cs_for_outgoing = common.find_valid(keys_outgoing * out_quantum, 1);
        let mut outgoing_buffer_keys = outgoing.find_spare(keys_outgoing * out_quantum, 1);
        if (outgoing_buffer_keys.len() as u64) < ratio {
            common.set_key_count(&cs_for_outgoing, 0);
            outgoing.set_key_count(&outgoing_buffer_keys, 0);
            cs_for_outgoing.clear();
            outgoing_buffer_keys.clear();
        }

        let mut cs_for_application = common.find_valid(keys_application * app_quantum, 1);
        let mut application_buffer_keys = application.find_spare(keys_application * app_quantum, 1);
        if (application_buffer_keys.len() as u64) < ratio {
            common.set_key_count(&cs_for_application, 0);
            application.set_key_count(&application_buffer_keys, 0);
            cs_for_application.clear();
            application_buffer_keys.clear();
        }

        if cs_for_outgoing.is_empty() && cs_for_application.is_empty() {
            return Ok(());
        }

        // a round costs two authenticated messages; it must gain more
        if ((cs_for_outgoing.len() * common.quantum()) as u64) < authentication_cost * 2 {
            common.set_key_count(&cs_for_outgoing, 0);
            common.set_key_count(&cs_for_application, 0);
            outgoing.set_key_count(&outgoing_buffer_keys, 0);
            application.set_key_count(&application_buffer_keys, 0);
            return Ok(());
        }

        let mut writer = Writer::new();
        write_load_body(
            &mut writer,
            &cs_for_outgoing,
            &outgoing_buffer_keys,
            &cs_for_application,
            &application_buffer_keys,
        )
        .map_err(|e| ProtocolError::Message(e.to_string()))?;

        let mut message = Message::new(true, false);
        message.set_payload(writer.into_bytes());

        match self.send_message(ProtocolId::Load, message) {
            Ok(id) => {
                debug!(
                    message_id = id,
                    outgoing = cs_for_outgoing.len(),
                    application = cs_for_application.len(),
                    "LOAD round opened"
                );
                self.pending_loads.insert(
                    id,
                    PendingLoad {
                        sent_at: now,
                        cs_for_outgoing,
                        cs_for_application,
                        outgoing_buffer_keys,
                        application_buffer_keys,
                    },
                );
                Ok(())
            }
            Err(e) => {
                let (common, _, outgoing, application) = self.dbs_mut()?;
                common.set_key_count(&cs_for_outgoing, 0);
                common.set_key_count(&cs_for_application, 0);
                outgoing.set_key_count(&outgoing_buffer_keys, 0);
                application.set_key_count(&application_buffer_keys, 0);
                Err(e)
            }
        }
    }

    /// The slave's periodic ask for Incoming replenishment.
    pub(crate) fn run_load_request(&mut self, now: Instant) -> Result<(), ProtocolError> {
        if !self.slave() {
            return Ok(());
        }
        if self.pending_load_request.is_some() {
            return Ok(());
        }

        let needed_bytes = {
            let (common, incoming, outgoing, _) = self.dbs_mut()?;
            if common.count() / 3 == 0 {
                return Ok(());
            }
            let mut needed_keys = incoming.amount() - incoming.count();
            if incoming.count() >= outgoing.count() {
                needed_keys = 0;
            }
            if needed_keys == 0 {
                return Ok(());
            }
            needed_keys * incoming.quantum() as u64
        };

        let mut writer = Writer::new();
        write_load_request_body(&mut writer, needed_bytes)
            .map_err(|e| ProtocolError::Message(e.to_string()))?;

        let mut message = Message::new(false, false);
        message.set_payload(writer.into_bytes());
        let id = self.send_message(ProtocolId::LoadRequest, message)?;
        self.pending_load_request = Some((id, now));
        debug!(message_id = id, needed_bytes, "LOAD-REQUEST sent");
        Ok(())
    }

    /// Dispatch LOAD-family messages by their leading command tag.
    pub(crate) fn recv_load_family(
        &mut self,
        message: Message,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let mut reader = Reader::new(message.payload());
        let command: String = reader.read()?;
        match command.as_str() {
            "LOAD" => self.recv_load(&message),
            "LOAD-ACK" => self.recv_load_ack(&message),
            "LOAD-REQ" => self.recv_load_request(&message, now),
            other => Err(ProtocolError::Answer(format!(
                "unknown LOAD-family command {other:?}"
            ))),
        }
    }

    /// The slave executes the master's proposed move.
    fn recv_load(&mut self, message: &Message) -> Result<(), ProtocolError> {
        if !self.slave() {
            return Err(ProtocolError::Answer(
                "LOAD may only arrive at the slave".to_string(),
            ));
        }

        let mut reader = Reader::new(message.payload());
        reader.expect_tag("LOAD")?;
        reader.expect_tag("OUTGOING")?;
        reader.expect_tag("C")?;
        let cs_for_outgoing: KeyVec = reader.read()?;
        reader.expect_tag("O")?;
        let outgoing_buffer_keys: KeyVec = reader.read()?;
        reader.expect_tag("APPLICAT")?;
        reader.expect_tag("C")?;
        let cs_for_application: KeyVec = reader.read()?;
        reader.expect_tag("A")?;
        let application_buffer_keys: KeyVec = reader.read()?;

        // the ids the master picked for its Outgoing fill our Incoming
        let (common, incoming, _, application) = self.dbs_mut()?;
        let moved_incoming =
            move_to_buffer(common, incoming, &cs_for_outgoing, &outgoing_buffer_keys);
        let moved_application = move_to_buffer(
            common,
            application,
            &cs_for_application,
            &application_buffer_keys,
        );

        debug!(
            incoming = moved_incoming.len(),
            application = moved_application.len(),
            charges = %self.charge_string(),
            "LOAD applied"
        );

        let mut writer = Writer::new();
        write_load_ack_body(&mut writer, message.id(), &moved_incoming, &moved_application)
            .map_err(|e| ProtocolError::Message(e.to_string()))?;

        let mut ack = Message::new(true, false);
        ack.set_payload(writer.into_bytes());
        self.send_message(ProtocolId::Load, ack)?;

        // any of our own asks is satisfied by this round
        self.pending_load_request = None;
        Ok(())
    }

    /// The master commits the mirror move the slave acknowledged.
    fn recv_load_ack(&mut self, message: &Message) -> Result<(), ProtocolError> {
        if !self.master() {
            return Err(ProtocolError::Answer(
                "LOAD-ACK may only arrive at the master".to_string(),
            ));
        }

        let mut reader = Reader::new(message.payload());
        reader.expect_tag("LOAD-ACK")?;
        let original_id: u32 = reader.read()?;
        let pending = self.pending_loads.remove(&original_id).ok_or_else(|| {
            warn!(original_id, "acknowledgement for a LOAD never sent");
            ProtocolError::Answer("acknowledgement for an unsent LOAD".to_string())
        })?;
        reader.expect_tag("OUTGOING")?;
        let moved_outgoing: KeyVec = reader.read()?;
        reader.expect_tag("APPLICAT")?;
        let moved_application: KeyVec = reader.read()?;

        let (common, _, outgoing, application) = self.dbs_mut()?;
        let ratio = common.quantum() / outgoing.quantum();

        move_to_buffer(common, outgoing, &moved_outgoing, &pending.outgoing_buffer_keys);
        move_to_buffer(
            common,
            application,
            &moved_application,
            &pending.application_buffer_keys,
        );

        // whatever the peer did not move is released again
        let unmoved_outgoing = not_moved(&pending.cs_for_outgoing, &moved_outgoing);
        let unmoved_application = not_moved(&pending.cs_for_application, &moved_application);
        common.set_key_count(&unmoved_outgoing, 0);
        common.set_key_count(&unmoved_application, 0);

        // stranded spare slots sit at the tail of the proposed id lists
        for &id in pending
            .outgoing_buffer_keys
            .iter()
            .rev()
            .take(unmoved_outgoing.len() * ratio)
        {
            outgoing.del(id);
        }
        for &id in pending
            .application_buffer_keys
            .iter()
            .rev()
            .take(unmoved_application.len() * ratio)
        {
            application.del(id);
        }
        outgoing.set_key_count(&pending.outgoing_buffer_keys, 0);
        application.set_key_count(&pending.application_buffer_keys, 0);

        debug!(
            outgoing = moved_outgoing.len(),
            application = moved_application.len(),
            charges = %self.charge_string(),
            "LOAD round closed"
        );
        Ok(())
    }

    /// The master answers a slave's ask with a LOAD round.
    fn recv_load_request(&mut self, message: &Message, now: Instant) -> Result<(), ProtocolError> {
        if !self.master() {
            return Err(ProtocolError::Role(
                "LOAD-REQUEST may only arrive at the master".to_string(),
            ));
        }
        if !self.pending_loads.is_empty() {
            // a round is in flight; the slave will ask again
            return Ok(());
        }

        let mut reader = Reader::new(message.payload());
        reader.expect_tag("LOAD-REQ")?;
        reader.expect_tag("INCOMING")?;
        let wanted_bytes: u64 = reader.read()?;

        self.run_load(wanted_bytes, now)
    }

    /// Release every reservation held for one pending LOAD.
    pub(crate) fn rollback_load(&mut self, id: u32) {
        let Some(pending) = self.pending_loads.remove(&id) else {
            return;
        };
        if let Ok((common, _, outgoing, application)) = self.dbs_mut() {
            common.set_key_count(&pending.cs_for_outgoing, 0);
            common.set_key_count(&pending.cs_for_application, 0);
            outgoing.set_key_count(&pending.outgoing_buffer_keys, 0);
            application.set_key_count(&pending.application_buffer_keys, 0);
        }
    }
}

fn write_load_body(
    writer: &mut Writer,
    cs_for_outgoing: &KeyVec,
    outgoing_buffer_keys: &KeyVec,
    cs_for_application: &KeyVec,
    application_buffer_keys: &KeyVec,
) -> Result<(), shared_types::WireError> {
    writer.write(&"LOAD".to_string())?;
    writer.write(&"OUTGOING".to_string())?;
    writer.write(&"C".to_string())?;
    writer.write(cs_for_outgoing)?;
    writer.write(&"O".to_string())?;
    writer.write(outgoing_buffer_keys)?;
    writer.write(&"APPLICAT".to_string())?;
    writer.write(&"C".to_string())?;
    writer.write(cs_for_application)?;
    writer.write(&"A".to_string())?;
    writer.write(application_buffer_keys)?;
    Ok(())
}

fn write_load_request_body(
    writer: &mut Writer,
    needed_bytes: u64,
) -> Result<(), shared_types::WireError> {
    writer.write(&"LOAD-REQ".to_string())?;
    writer.write(&"INCOMING".to_string())?;
    writer.write(&needed_bytes)?;
    Ok(())
}

fn write_load_ack_body(
    writer: &mut Writer,
    original_id: u32,
    moved_outgoing: &KeyVec,
    moved_application: &KeyVec,
) -> Result<(), shared_types::WireError> {
    writer.write(&"LOAD-ACK".to_string())?;
    writer.write(&original_id)?;
    writer.write(&"OUTGOING".to_string())?;
    writer.write(moved_outgoing)?;
    writer.write(&"APPLICAT".to_string())?;
    writer.write(moved_application)?;
    Ok(())
}
