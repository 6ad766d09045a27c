//! # Key Database
//!
//! A keyed container of fixed-quantum key material with a fixed id window.
//! Every slot carries a state, two synchronization flags and a use counter:
//!
//! - *real-sync*: authoritatively present and usable; both endpoints agree
//!   on the set of real-sync slots and on each slot's octets
//! - *eventual-sync*: reserved for material not yet confirmed by the peer
//! - *use counter*: a slot whose counter goes positive is held exclusively
//!   until the counter returns to 0 or the slot is deleted; every `find_*`
//!   call with a non-zero step must be paired with a later `del` (commit)
//!   or `set_key_count(.., 0)` (rollback)
//!
//! The slot logic lives in [`SlotTable`]; storage backends wrap it and add
//! persistence. `KeyDb::open` selects the backend by URL scheme.

use crate::adapters::file::FileKeyStore;
use crate::adapters::ram::RamKeyStore;
use crate::domain::errors::KeyDbError;
use crate::ports::KeyStoreBackend;
use shared_types::{Key, KeyId, KeyVec};
use std::collections::BTreeSet;
use tracing::debug;
use zeroize::Zeroize;

/// Geometry of one database: octet quantum and inclusive id window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbProfile {
    pub quantum: usize,
    pub min_id: KeyId,
    pub max_id: KeyId,
}

impl DbProfile {
    pub fn new(quantum: usize, min_id: KeyId, max_id: KeyId) -> Self {
        assert!(quantum > 0, "db quantum must be positive");
        assert!(min_id >= 1, "key id 0 is the null key");
        assert!(max_id >= min_id, "empty id window");
        Self {
            quantum,
            min_id,
            max_id,
        }
    }

    /// Number of slots in the window.
    pub fn capacity(&self) -> u64 {
        self.max_id - self.min_id + 1
    }

    /// Keys needed to cover `bytes` octets.
    pub fn keys_for_bytes(&self, bytes: u64) -> u64 {
        (bytes + self.quantum as u64 - 1) / self.quantum as u64
    }
}

/// Slot occupancy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Empty.
    Free,
    /// Holds material not yet confirmed by the peer.
    Reserved,
    /// Authoritative key material.
    Real,
    /// Authoritative material injected locally, without peer interaction.
    Injected,
}

impl SlotState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            SlotState::Free => 0,
            SlotState::Reserved => 1,
            SlotState::Real => 2,
            SlotState::Injected => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self, KeyDbError> {
        match v {
            0 => Ok(SlotState::Free),
            1 => Ok(SlotState::Reserved),
            2 => Ok(SlotState::Real),
            3 => Ok(SlotState::Injected),
            _ => Err(KeyDbError::Corrupt(format!("slot state byte {v}"))),
        }
    }
}

/// One slot of the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    pub state: SlotState,
    pub real_sync: bool,
    pub eventual_sync: bool,
    pub use_count: u32,
    pub octets: Vec<u8>,
}

impl Slot {
    pub(crate) fn free() -> Self {
        Self {
            state: SlotState::Free,
            real_sync: false,
            eventual_sync: false,
            use_count: 0,
            octets: Vec::new(),
        }
    }

    fn clear(&mut self) {
        self.octets.zeroize();
        *self = Slot::free();
    }
}

/// The in-memory slot window with all id allocation and lookup logic.
///
/// Backends delegate here and persist the slot ids the calls report back.
pub struct SlotTable {
    profile: DbProfile,
    name: String,
    slots: Vec<Slot>,
    /// State-free slot ids; a free slot with a positive use counter is
    /// reserved as a spare and excluded from allocation.
    free_ids: BTreeSet<KeyId>,
    populated: u64,
}

impl SlotTable {
    pub fn new(profile: DbProfile, name: impl Into<String>) -> Self {
        let capacity = profile.capacity() as usize;
        Self {
            profile,
            name: name.into(),
            slots: vec![Slot::free(); capacity],
            free_ids: (profile.min_id..=profile.max_id).collect(),
            populated: 0,
        }
    }

    pub fn profile(&self) -> DbProfile {
        self.profile
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn index(&self, id: KeyId) -> Option<usize> {
        if id < self.profile.min_id || id > self.profile.max_id {
            return None;
        }
        Some((id - self.profile.min_id) as usize)
    }

    pub(crate) fn slot(&self, id: KeyId) -> Option<&Slot> {
        self.index(id).map(|i| &self.slots[i])
    }

    pub(crate) fn slot_mut(&mut self, id: KeyId) -> Option<&mut Slot> {
        self.index(id).map(move |i| &mut self.slots[i])
    }

    /// Restore a slot read back from persistent storage.
    pub(crate) fn restore(&mut self, id: KeyId, slot: Slot) -> Result<(), KeyDbError> {
        let profile = self.profile;
        let index = self.index(id).ok_or(KeyDbError::OutOfWindow {
            id,
            min_id: profile.min_id,
            max_id: profile.max_id,
        })?;
        let was_free = self.slots[index].state == SlotState::Free;
        let is_free = slot.state == SlotState::Free;
        match (was_free, is_free) {
            (true, false) => {
                self.populated += 1;
                self.free_ids.remove(&id);
            }
            (false, true) => {
                self.populated -= 1;
                self.free_ids.insert(id);
            }
            _ => {}
        }
        self.slots[index] = slot;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.populated
    }

    pub fn amount(&self) -> u64 {
        self.profile.capacity()
    }

    /// Assign the lowest free id to `key`.
    pub fn insert(&mut self, key: Key) -> Result<KeyId, KeyDbError> {
        if key.len_octets() != self.profile.quantum {
            return Err(KeyDbError::QuantumMismatch {
                got: key.len_octets(),
                quantum: self.profile.quantum,
            });
        }
        // spare-reserved free slots (positive counter) are not allocatable
        let id = self
            .free_ids
            .iter()
            .copied()
            .find(|&id| {
                self.slot(id)
                    .map(|s| s.use_count == 0)
                    .unwrap_or(false)
            })
            .ok_or(KeyDbError::WindowExhausted {
                min_id: self.profile.min_id,
                max_id: self.profile.max_id,
            })?;

        self.free_ids.remove(&id);
        self.populated += 1;
        let index = self.index(id).expect("free id inside window");
        self.slots[index] = Slot {
            state: SlotState::Real,
            real_sync: false,
            eventual_sync: false,
            use_count: 0,
            octets: key.data.as_octets().to_vec(),
        };
        Ok(id)
    }

    /// The key at `id`, or the null key if the slot is free or unknown.
    pub fn get(&self, id: KeyId) -> Key {
        match self.slot(id) {
            Some(slot) if slot.state != SlotState::Free => Key::new(id, slot.octets.clone()),
            _ => Key::null(),
        }
    }

    /// Overwrite the octets of the slot named by the key's id.
    ///
    /// Writing to a free slot turns it `Reserved`; synchronization flags are
    /// untouched.
    pub fn set(&mut self, key: Key) -> Result<(), KeyDbError> {
        let profile = self.profile;
        if key.len_octets() != profile.quantum {
            return Err(KeyDbError::QuantumMismatch {
                got: key.len_octets(),
                quantum: profile.quantum,
            });
        }
        let id = key.id;
        let index = self.index(id).ok_or(KeyDbError::OutOfWindow {
            id,
            min_id: profile.min_id,
            max_id: profile.max_id,
        })?;
        if self.slots[index].state == SlotState::Free {
            self.slots[index].state = SlotState::Reserved;
            self.populated += 1;
            self.free_ids.remove(&id);
        }
        self.slots[index].octets = key.data.as_octets().to_vec();
        Ok(())
    }

    /// Mark a slot free again. A no-op on unknown ids.
    pub fn del(&mut self, id: KeyId) -> bool {
        let Some(index) = self.index(id) else {
            return false;
        };
        let was_populated = self.slots[index].state != SlotState::Free;
        let had_count = self.slots[index].use_count != 0;
        if !was_populated && !had_count {
            return false;
        }
        self.slots[index].clear();
        if was_populated {
            self.populated -= 1;
            self.free_ids.insert(id);
        }
        true
    }

    /// Real-sync and present.
    pub fn valid(&self, id: KeyId) -> bool {
        self.slot(id)
            .map(|s| s.real_sync && matches!(s.state, SlotState::Real | SlotState::Injected))
            .unwrap_or(false)
    }

    pub fn slot_state(&self, id: KeyId) -> SlotState {
        self.slot(id).map(|s| s.state).unwrap_or(SlotState::Free)
    }

    /// Promote a slot to authoritative presence.
    pub fn set_real_sync(&mut self, id: KeyId) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.state != SlotState::Free => {
                if slot.state == SlotState::Reserved {
                    slot.state = SlotState::Real;
                }
                slot.real_sync = true;
                slot.eventual_sync = false;
                true
            }
            _ => false,
        }
    }

    /// Flag a slot as reserved pending peer confirmation.
    pub fn set_eventual_sync(&mut self, id: KeyId) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.state != SlotState::Free => {
                slot.eventual_sync = true;
                true
            }
            _ => false,
        }
    }

    /// Mark a slot as locally injected material.
    pub fn set_injected(&mut self, id: KeyId) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.state != SlotState::Free => {
                slot.state = SlotState::Injected;
                true
            }
            _ => false,
        }
    }

    pub fn key_count(&self, id: KeyId) -> u32 {
        self.slot(id).map(|s| s.use_count).unwrap_or(0)
    }

    /// Reset the use counters of `ids` to `n`.
    pub fn set_key_count(&mut self, ids: &[KeyId], n: u32) {
        for &id in ids {
            if let Some(slot) = self.slot_mut(id) {
                slot.use_count = n;
            }
        }
    }

    /// Valid keys with counter 0, lowest ids first, covering `bytes`.
    ///
    /// Counters of the returned ids are raised by `counter_step` in the
    /// same step, so concurrent callers see disjoint id sets. The result
    /// may fall short of `bytes`; callers check and roll back.
    pub fn find_valid(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        let needed = self.profile.keys_for_bytes(bytes);
        let mut found = KeyVec::new();
        if needed == 0 {
            return found;
        }
        for id in self.profile.min_id..=self.profile.max_id {
            if found.len() as u64 == needed {
                break;
            }
            if self.valid(id) && self.key_count(id) == 0 {
                found.push(id);
            }
        }
        if counter_step > 0 {
            for &id in &found {
                if let Some(slot) = self.slot_mut(id) {
                    slot.use_count += counter_step;
                }
            }
        }
        found
    }

    /// Free slots able to receive `bytes` worth of keys, lowest ids first.
    ///
    /// The slots stay free but their raised counters reserve them against
    /// allocation and concurrent spare hunts.
    pub fn find_spare(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        let needed = self.profile.keys_for_bytes(bytes);
        let mut found = KeyVec::new();
        if needed == 0 {
            return found;
        }
        for id in self.free_ids.iter().copied() {
            if found.len() as u64 == needed {
                break;
            }
            if self.slots[(id - self.profile.min_id) as usize].use_count == 0 {
                found.push(id);
            }
        }
        if counter_step > 0 {
            for &id in &found {
                if let Some(slot) = self.slot_mut(id) {
                    slot.use_count += counter_step;
                }
            }
        }
        found
    }

    /// A contiguous ascending run of valid counter-0 keys covering `bytes`.
    ///
    /// Contiguity lets a message name the run by its first id alone.
    /// Returns an empty vector if no run exists; otherwise the counters of
    /// the whole run are raised in the same step.
    pub fn find_continuous(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        let needed = self.profile.keys_for_bytes(bytes);
        if needed == 0 {
            return KeyVec::new();
        }

        let mut run_start = None;
        let mut run_len = 0u64;
        for id in self.profile.min_id..=self.profile.max_id {
            if self.valid(id) && self.key_count(id) == 0 {
                if run_start.is_none() {
                    run_start = Some(id);
                    run_len = 0;
                }
                run_len += 1;
                if run_len == needed {
                    break;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }

        match run_start {
            Some(start) if run_len == needed => {
                let found: KeyVec = (start..start + needed).collect();
                if counter_step > 0 {
                    for &id in &found {
                        if let Some(slot) = self.slot_mut(id) {
                            slot.use_count += counter_step;
                        }
                    }
                }
                found
            }
            _ => KeyVec::new(),
        }
    }

    /// Publish a charge change for observers.
    pub fn emit_charge_change(&self, added: u64, removed: u64) {
        debug!(
            db = %self.name,
            added,
            removed,
            count = self.populated,
            amount = self.amount(),
            "charge changed"
        );
    }
}

/// A key database bound to its storage backend.
pub struct KeyDb {
    backend: Box<dyn KeyStoreBackend>,
}

impl KeyDb {
    /// Open a database. Supported schemes: `ram://` and `file://`.
    pub fn open(url: &str, profile: DbProfile) -> Result<Self, KeyDbError> {
        if url.starts_with("ram://") {
            return Ok(Self {
                backend: Box::new(RamKeyStore::new(profile, url)),
            });
        }
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Self {
                backend: Box::new(FileKeyStore::open(path, profile, url)?),
            });
        }
        Err(KeyDbError::UnknownScheme(url.to_string()))
    }

    /// A memory-backed database, the default for the engine buffers.
    pub fn open_ram(profile: DbProfile, name: &str) -> Self {
        Self {
            backend: Box::new(RamKeyStore::new(profile, &format!("ram://{name}"))),
        }
    }
}

impl std::ops::Deref for KeyDb {
    type Target = dyn KeyStoreBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl std::ops::DerefMut for KeyDb {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SlotTable {
        SlotTable::new(DbProfile::new(4, 1, 16), "test")
    }

    fn key(octet: u8) -> Key {
        Key::new(0, vec![octet; 4])
    }

    #[test]
    fn test_insert_assigns_lowest_free_id() {
        let mut t = table();
        assert_eq!(t.insert(key(1)).unwrap(), 1);
        assert_eq!(t.insert(key(2)).unwrap(), 2);
        t.del(1);
        assert_eq!(t.insert(key(3)).unwrap(), 1);
        assert_eq!(t.count(), 2);
        assert_eq!(t.amount(), 16);
    }

    #[test]
    fn test_insert_rejects_wrong_quantum() {
        let mut t = table();
        assert!(matches!(
            t.insert(Key::new(0, vec![0; 5])),
            Err(KeyDbError::QuantumMismatch { got: 5, quantum: 4 })
        ));
    }

    #[test]
    fn test_window_exhaustion() {
        let mut t = SlotTable::new(DbProfile::new(1, 1, 2), "tiny");
        t.insert(Key::new(0, vec![0])).unwrap();
        t.insert(Key::new(0, vec![0])).unwrap();
        assert!(matches!(
            t.insert(Key::new(0, vec![0])),
            Err(KeyDbError::WindowExhausted { .. })
        ));
    }

    #[test]
    fn test_get_unknown_is_null_key() {
        let t = table();
        assert!(t.get(5).is_null());
        assert!(t.get(999).is_null());
    }

    #[test]
    fn test_valid_needs_real_sync() {
        let mut t = table();
        let id = t.insert(key(7)).unwrap();
        assert!(!t.valid(id));
        t.set_real_sync(id);
        assert!(t.valid(id));
        t.del(id);
        assert!(!t.valid(id));
    }

    #[test]
    fn test_find_valid_marks_counters_disjointly() {
        let mut t = table();
        for i in 0..8u8 {
            let id = t.insert(key(i)).unwrap();
            t.set_real_sync(id);
        }
        // 10 bytes at quantum 4 -> 3 keys
        let first = t.find_valid(10, 1);
        assert_eq!(first, vec![1, 2, 3]);
        for &id in &first {
            assert_eq!(t.key_count(id), 1);
        }
        let second = t.find_valid(10, 1);
        assert_eq!(second, vec![4, 5, 6]);

        // rollback releases the reservation
        t.set_key_count(&first, 0);
        assert_eq!(t.find_valid(4, 0), vec![1]);
    }

    #[test]
    fn test_find_spare_excludes_reserved_spares_from_insert() {
        let mut t = table();
        let spares = t.find_spare(8, 1);
        assert_eq!(spares, vec![1, 2]);
        assert_eq!(t.slot_state(1), SlotState::Free);

        // allocation must skip the reserved spares
        assert_eq!(t.insert(key(0)).unwrap(), 3);

        t.set_key_count(&spares, 0);
        assert_eq!(t.insert(key(0)).unwrap(), 1);
    }

    #[test]
    fn test_find_continuous_requires_a_run() {
        let mut t = table();
        for i in 0..6u8 {
            let id = t.insert(key(i)).unwrap();
            t.set_real_sync(id);
        }
        t.del(3); // break the run

        let run = t.find_continuous(12, 1);
        assert_eq!(run, vec![4, 5, 6]);
        for &id in &run {
            assert_eq!(t.key_count(id), 1);
        }

        // 4 keys needed but the longest clean run is 1..=2
        assert!(t.find_continuous(16, 1).is_empty());
    }

    #[test]
    fn test_set_into_free_slot_reserves_it() {
        let mut t = table();
        t.set(Key::new(9, vec![1, 2, 3, 4])).unwrap();
        assert_eq!(t.slot_state(9), SlotState::Reserved);
        assert!(!t.valid(9));
        t.set_real_sync(9);
        assert!(t.valid(9));
        assert_eq!(t.get(9).data.as_octets(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_injected_state() {
        let mut t = table();
        let id = t.insert(key(1)).unwrap();
        t.set_injected(id);
        t.set_real_sync(id);
        assert_eq!(t.slot_state(id), SlotState::Injected);
        assert!(t.valid(id));
    }
}
