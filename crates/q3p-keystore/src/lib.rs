//! # Q3P Key Store
//!
//! Once Cascade has reconciled raw key material, both endpoints must store,
//! order and consume identical key bytes for every cryptographic operation
//! on the classical channel. This crate implements that discipline:
//!
//! - **Key-DB** (`domain::key_db`): a keyed slot container with a fixed
//!   octet quantum, a fixed id window, slot states and synchronization
//!   flags. Backends are `ram://` and `file://`.
//! - **Four DBs per engine**: the persistent Common Store and the small-
//!   quantum Incoming, Outgoing and Application buffers. The Incoming
//!   buffer of one endpoint is byte-identical to the Outgoing buffer of
//!   its peer.
//! - **Message & Channel** (`domain::message`, `domain::channel`): the Q3P
//!   wire header and the compress/encrypt/authenticate pipeline drawing
//!   keys from the buffers.
//! - **Protocols** (`protocol`): HANDSHAKE, LOAD, LOAD-REQUEST, STORE and
//!   DATA as fixed-role exchanges.
//! - **Engine** (`engine`): the state machine owning all of the above,
//!   driven by a single cooperatively scheduled link task.

pub mod adapters;
pub mod domain;
pub mod engine;
pub mod ports;
pub mod protocol;

pub use domain::channel::Channel;
pub use domain::errors::{ChannelError, KeyDbError, ProtocolError};
pub use domain::key_db::{DbProfile, KeyDb, SlotState};
pub use domain::message::{Message, HEADER_SIZE, PACKET_MAX_SIZE};
pub use engine::{Engine, EngineConfig, EngineState};
pub use ports::DataSink;
