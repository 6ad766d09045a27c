//! # DATA Protocol
//!
//! Opaque application payloads. There is no state to keep: a DATA message
//! is a single send, protected by the channel (authentic and encrypted by
//! default), and handed to the [`crate::ports::DataSink`] on decode.

use crate::domain::errors::ProtocolError;
use crate::domain::message::Message;
use crate::engine::Engine;
use crate::protocol::ProtocolId;
use shared_types::wire::{Reader, Writer};
use tracing::debug;

impl Engine {
    /// Wrap application bytes in an authentic, encrypted DATA message.
    pub fn send_data(&mut self, data: &[u8]) -> Result<u32, ProtocolError> {
        if !self.connected() {
            return Err(ProtocolError::Transport(
                "refusing to send data while disconnected".to_string(),
            ));
        }
        let mut message = Message::new(true, true);
        let mut writer = Writer::new();
        writer
            .write(&data.to_vec())
            .map_err(|e| ProtocolError::Message(e.to_string()))?;
        message.set_payload(writer.into_bytes());
        self.send_message(ProtocolId::Data, message)
    }

    pub(crate) fn recv_data_message(&mut self, message: Message) -> Result<(), ProtocolError> {
        let mut reader = Reader::new(message.payload());
        let data: Vec<u8> = reader.read()?;
        match self.sink.as_mut() {
            Some(sink) => sink.recv_data(&data),
            None => debug!(bytes = data.len(), "DATA received with no sink attached"),
        }
        Ok(())
    }
}
