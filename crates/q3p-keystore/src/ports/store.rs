//! The storage backend port of the key database.

use crate::domain::errors::KeyDbError;
use crate::domain::key_db::{DbProfile, SlotState};
use shared_types::{Key, KeyId, KeyVec};

/// Narrow interface every key-db storage backend implements.
///
/// Backends are `ram://` (plain slot table) and `file://` (slot table with
/// a durable slot array and side journal). All semantics live in the slot
/// table; backends add persistence only.
pub trait KeyStoreBackend: Send {
    fn profile(&self) -> DbProfile;

    fn quantum(&self) -> usize {
        self.profile().quantum
    }

    fn min_id(&self) -> KeyId {
        self.profile().min_id
    }

    fn max_id(&self) -> KeyId {
        self.profile().max_id
    }

    /// Populated slot count.
    fn count(&self) -> u64;

    /// Window capacity.
    fn amount(&self) -> u64;

    /// Assign the lowest free id; fails when the window is exhausted.
    fn insert(&mut self, key: Key) -> Result<KeyId, KeyDbError>;

    /// Key at `id`, or the null key.
    fn get(&self, id: KeyId) -> Key;

    /// Overwrite octets of the slot named by the key id.
    fn set(&mut self, key: Key) -> Result<(), KeyDbError>;

    /// Free one slot.
    fn del(&mut self, id: KeyId);

    /// Free many slots.
    fn del_many(&mut self, ids: &[KeyId]) {
        for &id in ids {
            self.del(id);
        }
    }

    /// Real-sync and present.
    fn valid(&self, id: KeyId) -> bool;

    fn slot_state(&self, id: KeyId) -> SlotState;

    fn set_real_sync(&mut self, id: KeyId);

    fn set_eventual_sync(&mut self, id: KeyId);

    fn set_injected(&mut self, id: KeyId);

    fn key_count(&self, id: KeyId) -> u32;

    fn set_key_count(&mut self, ids: &[KeyId], n: u32);

    fn find_valid(&mut self, bytes: u64, counter_step: u32) -> KeyVec;

    fn find_spare(&mut self, bytes: u64, counter_step: u32) -> KeyVec;

    fn find_continuous(&mut self, bytes: u64, counter_step: u32) -> KeyVec;

    /// Publish a charge change for observers.
    fn emit_charge_change(&mut self, added: u64, removed: u64);

    /// Flush pending persistence work.
    fn sync(&mut self) -> Result<(), KeyDbError>;

    /// The backend's URL, for logs.
    fn describe(&self) -> String;
}
