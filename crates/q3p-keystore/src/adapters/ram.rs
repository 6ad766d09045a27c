//! In-memory key store: the slot table with no persistence.
//!
//! The engine buffers (Incoming, Outgoing, Application) always live here;
//! their content is re-negotiated on every connect.

use crate::domain::errors::KeyDbError;
use crate::domain::key_db::{DbProfile, SlotState, SlotTable};
use crate::ports::KeyStoreBackend;
use shared_types::{Key, KeyId, KeyVec};

pub struct RamKeyStore {
    table: SlotTable,
}

impl RamKeyStore {
    pub fn new(profile: DbProfile, name: &str) -> Self {
        Self {
            table: SlotTable::new(profile, name),
        }
    }
}

impl KeyStoreBackend for RamKeyStore {
    fn profile(&self) -> DbProfile {
        self.table.profile()
    }

    fn count(&self) -> u64 {
        self.table.count()
    }

    fn amount(&self) -> u64 {
        self.table.amount()
    }

    fn insert(&mut self, key: Key) -> Result<KeyId, KeyDbError> {
        self.table.insert(key)
    }

    fn get(&self, id: KeyId) -> Key {
        self.table.get(id)
    }

    fn set(&mut self, key: Key) -> Result<(), KeyDbError> {
        self.table.set(key)
    }

    fn del(&mut self, id: KeyId) {
        self.table.del(id);
    }

    fn valid(&self, id: KeyId) -> bool {
        self.table.valid(id)
    }

    fn slot_state(&self, id: KeyId) -> SlotState {
        self.table.slot_state(id)
    }

    fn set_real_sync(&mut self, id: KeyId) {
        self.table.set_real_sync(id);
    }

    fn set_eventual_sync(&mut self, id: KeyId) {
        self.table.set_eventual_sync(id);
    }

    fn set_injected(&mut self, id: KeyId) {
        self.table.set_injected(id);
    }

    fn key_count(&self, id: KeyId) -> u32 {
        self.table.key_count(id)
    }

    fn set_key_count(&mut self, ids: &[KeyId], n: u32) {
        self.table.set_key_count(ids, n);
    }

    fn find_valid(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        self.table.find_valid(bytes, counter_step)
    }

    fn find_spare(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        self.table.find_spare(bytes, counter_step)
    }

    fn find_continuous(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        self.table.find_continuous(bytes, counter_step)
    }

    fn emit_charge_change(&mut self, added: u64, removed: u64) {
        self.table.emit_charge_change(added, removed);
    }

    fn sync(&mut self) -> Result<(), KeyDbError> {
        Ok(())
    }

    fn describe(&self) -> String {
        self.table.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_store_basic_lifecycle() {
        let mut store = RamKeyStore::new(DbProfile::new(8, 1, 32), "ram://test");
        let id = store.insert(Key::new(0, vec![0x55; 8])).unwrap();
        store.set_real_sync(id);
        assert!(store.valid(id));
        assert_eq!(store.get(id).data.as_octets(), &[0x55; 8]);

        store.del(id);
        assert!(store.get(id).is_null());
        assert_eq!(store.count(), 0);
    }
}
