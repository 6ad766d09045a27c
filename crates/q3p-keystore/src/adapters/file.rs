//! # File-Backed Key Store
//!
//! Persists the slot window as a dense array behind a fixed header, with a
//! side journal for crash recovery:
//!
//! ```text
//! <path>          header { magic, version, quantum, min_id, max_id }
//!                 then one record per slot: { state, flags, use_count,
//!                 octets[quantum] }
//! <path>.journal  { crc32, id, record } entries, replayed on open
//! ```
//!
//! Every mutation journals the complete new slot record (crc-checked and
//! flushed) before the main array is touched, so slot state and use counter
//! are durable before the octets ever count as real-sync. `sync()` flushes
//! the array and truncates the journal. A torn journal tail (bad crc or
//! short read) ends replay at the last good record.
//!
//! The database file carries an exclusive advisory lock while open.
//!
//! Mutators that cannot report errors through the port (del, sync flags,
//! counters) log persistence failures and park them; the next `sync()`
//! surfaces the parked error.

use crate::domain::errors::KeyDbError;
use crate::domain::key_db::{DbProfile, Slot, SlotState, SlotTable};
use crate::ports::KeyStoreBackend;
use fs2::FileExt;
use shared_types::{Key, KeyId, KeyVec};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const MAGIC: &[u8; 4] = b"Q3PD";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 32;
const FLAG_REAL_SYNC: u8 = 0x01;
const FLAG_EVENTUAL_SYNC: u8 = 0x02;

pub struct FileKeyStore {
    table: SlotTable,
    url: String,
    path: PathBuf,
    file: File,
    journal: File,
    journal_len: u64,
    parked_error: Option<KeyDbError>,
}

impl FileKeyStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, profile: DbProfile, url: &str) -> Result<Self, KeyDbError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| KeyDbError::Locked(path.display().to_string()))?;

        let record_len = record_len(profile.quantum);
        let expected_len = HEADER_LEN + profile.capacity() * record_len;

        let mut store = Self {
            table: SlotTable::new(profile, url),
            url: url.to_string(),
            journal: OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(journal_path(&path))?,
            journal_len: 0,
            path,
            file,
            parked_error: None,
        };

        let file_len = store.file.metadata()?.len();
        if file_len == 0 {
            store.format(expected_len)?;
            store.truncate_journal()?;
            info!(db = %store.url, "created key database");
        } else {
            store.load()?;
            let replayed = store.replay_journal()?;
            if replayed > 0 {
                info!(db = %store.url, replayed, "recovered journal records");
            }
            store.file.sync_all()?;
            store.truncate_journal()?;
        }

        Ok(store)
    }

    fn format(&mut self, expected_len: u64) -> Result<(), KeyDbError> {
        let profile = self.table.profile();
        let mut header = [0u8; HEADER_LEN as usize];
        header[0..4].copy_from_slice(MAGIC);
        header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&(profile.quantum as u64).to_le_bytes());
        header[16..24].copy_from_slice(&profile.min_id.to_le_bytes());
        header[24..32].copy_from_slice(&profile.max_id.to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        // zero-filled records decode as free slots
        self.file.set_len(expected_len)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn load(&mut self) -> Result<(), KeyDbError> {
        let profile = self.table.profile();
        let mut header = [0u8; HEADER_LEN as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(KeyDbError::Corrupt("bad magic".to_string()));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FORMAT_VERSION {
            return Err(KeyDbError::Corrupt(format!("format version {version}")));
        }
        let quantum = u64::from_le_bytes(header[8..16].try_into().expect("slice of 8"));
        let min_id = u64::from_le_bytes(header[16..24].try_into().expect("slice of 8"));
        let max_id = u64::from_le_bytes(header[24..32].try_into().expect("slice of 8"));
        if quantum != profile.quantum as u64 || min_id != profile.min_id || max_id != profile.max_id
        {
            return Err(KeyDbError::Corrupt(format!(
                "geometry mismatch: file has quantum {quantum} window [{min_id}, {max_id}], \
                 profile wants quantum {} window [{}, {}]",
                profile.quantum, profile.min_id, profile.max_id
            )));
        }

        let mut record = vec![0u8; record_len(profile.quantum) as usize];
        for id in profile.min_id..=profile.max_id {
            self.file.read_exact(&mut record)?;
            let slot = decode_record(&record, profile.quantum)?;
            if slot.state != SlotState::Free || slot.use_count != 0 {
                self.table.restore(id, slot)?;
            }
        }
        Ok(())
    }

    /// Apply intact journal records; stop at the first torn one.
    fn replay_journal(&mut self) -> Result<u64, KeyDbError> {
        let profile = self.table.profile();
        let entry_len = 12 + record_len(profile.quantum) as usize;

        self.journal.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        self.journal.read_to_end(&mut raw)?;

        let mut replayed = 0u64;
        for entry in raw.chunks(entry_len) {
            if entry.len() < entry_len {
                warn!(db = %self.url, "torn journal tail ignored");
                break;
            }
            let stored_crc = u32::from_le_bytes(entry[0..4].try_into().expect("slice of 4"));
            if crc32fast::hash(&entry[4..]) != stored_crc {
                warn!(db = %self.url, "journal checksum mismatch, replay stopped");
                break;
            }
            let id = u64::from_le_bytes(entry[4..12].try_into().expect("slice of 8"));
            let slot = decode_record(&entry[12..], profile.quantum)?;
            self.table.restore(id, slot)?;
            self.write_main_record(id)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    fn truncate_journal(&mut self) -> Result<(), KeyDbError> {
        self.journal.set_len(0)?;
        self.journal.seek(SeekFrom::Start(0))?;
        self.journal.sync_all()?;
        self.journal_len = 0;
        Ok(())
    }

    fn write_main_record(&mut self, id: KeyId) -> Result<(), KeyDbError> {
        let profile = self.table.profile();
        let record = encode_record(
            self.table.slot(id).cloned().unwrap_or_else(Slot::free),
            profile.quantum,
        );
        let offset = HEADER_LEN + (id - profile.min_id) * record_len(profile.quantum);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&record)?;
        Ok(())
    }

    fn journal_record(&mut self, id: KeyId) -> Result<(), KeyDbError> {
        let profile = self.table.profile();
        let record = encode_record(
            self.table.slot(id).cloned().unwrap_or_else(Slot::free),
            profile.quantum,
        );
        let mut entry = Vec::with_capacity(12 + record.len());
        entry.extend_from_slice(&[0u8; 4]);
        entry.extend_from_slice(&id.to_le_bytes());
        entry.extend_from_slice(&record);
        let crc = crc32fast::hash(&entry[4..]);
        entry[0..4].copy_from_slice(&crc.to_le_bytes());

        self.journal.seek(SeekFrom::Start(self.journal_len))?;
        self.journal.write_all(&entry)?;
        self.journal.sync_data()?;
        self.journal_len += entry.len() as u64;
        Ok(())
    }

    /// Journal then write the main array for every changed slot.
    fn persist(&mut self, ids: &[KeyId]) {
        for &id in ids {
            let result = self
                .journal_record(id)
                .and_then(|_| self.write_main_record(id));
            if let Err(e) = result {
                error!(db = %self.url, id, error = %e, "slot persistence failed");
                if self.parked_error.is_none() {
                    self.parked_error = Some(e);
                }
                break;
            }
        }
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut journal = path.as_os_str().to_owned();
    journal.push(".journal");
    PathBuf::from(journal)
}

fn record_len(quantum: usize) -> u64 {
    6 + quantum as u64
}

fn encode_record(slot: Slot, quantum: usize) -> Vec<u8> {
    let mut record = Vec::with_capacity(6 + quantum);
    record.push(slot.state.to_u8());
    let mut flags = 0u8;
    if slot.real_sync {
        flags |= FLAG_REAL_SYNC;
    }
    if slot.eventual_sync {
        flags |= FLAG_EVENTUAL_SYNC;
    }
    record.push(flags);
    record.extend_from_slice(&slot.use_count.to_le_bytes());
    if slot.octets.len() == quantum {
        record.extend_from_slice(&slot.octets);
    } else {
        record.resize(6 + quantum, 0);
    }
    record
}

fn decode_record(record: &[u8], quantum: usize) -> Result<Slot, KeyDbError> {
    if record.len() < 6 + quantum {
        return Err(KeyDbError::Corrupt("short slot record".to_string()));
    }
    let state = SlotState::from_u8(record[0])?;
    let flags = record[1];
    let use_count = u32::from_le_bytes(record[2..6].try_into().expect("slice of 4"));
    let octets = if state == SlotState::Free {
        Vec::new()
    } else {
        record[6..6 + quantum].to_vec()
    };
    Ok(Slot {
        state,
        real_sync: flags & FLAG_REAL_SYNC != 0,
        eventual_sync: flags & FLAG_EVENTUAL_SYNC != 0,
        use_count,
        octets,
    })
}

impl KeyStoreBackend for FileKeyStore {
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
        let id = self.table.insert(key)?;
        self.persist(&[id]);
        if let Some(e) = self.parked_error.take() {
            return Err(e);
        }
        Ok(id)
    }

    fn get(&self, id: KeyId) -> Key {
        self.table.get(id)
    }

    fn set(&mut self, key: Key) -> Result<(), KeyDbError> {
        let id = key.id;
        self.table.set(key)?;
        self.persist(&[id]);
        if let Some(e) = self.parked_error.take() {
            return Err(e);
        }
        Ok(())
    }

    fn del(&mut self, id: KeyId) {
        if self.table.del(id) {
            self.persist(&[id]);
        }
    }

    fn valid(&self, id: KeyId) -> bool {
        self.table.valid(id)
    }

    fn slot_state(&self, id: KeyId) -> SlotState {
        self.table.slot_state(id)
    }

    fn set_real_sync(&mut self, id: KeyId) {
        if self.table.set_real_sync(id) {
            self.persist(&[id]);
        }
    }

    fn set_eventual_sync(&mut self, id: KeyId) {
        if self.table.set_eventual_sync(id) {
            self.persist(&[id]);
        }
    }

    fn set_injected(&mut self, id: KeyId) {
        if self.table.set_injected(id) {
            self.persist(&[id]);
        }
    }

    fn key_count(&self, id: KeyId) -> u32 {
        self.table.key_count(id)
    }

    fn set_key_count(&mut self, ids: &[KeyId], n: u32) {
        self.table.set_key_count(ids, n);
        self.persist(ids);
    }

    fn find_valid(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        let found = self.table.find_valid(bytes, counter_step);
        if counter_step > 0 {
            self.persist(&found);
        }
        found
    }

    fn find_spare(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        let found = self.table.find_spare(bytes, counter_step);
        if counter_step > 0 {
            self.persist(&found);
        }
        found
    }

    fn find_continuous(&mut self, bytes: u64, counter_step: u32) -> KeyVec {
        let found = self.table.find_continuous(bytes, counter_step);
        if counter_step > 0 {
            self.persist(&found);
        }
        found
    }

    fn emit_charge_change(&mut self, added: u64, removed: u64) {
        self.table.emit_charge_change(added, removed);
    }

    fn sync(&mut self) -> Result<(), KeyDbError> {
        if let Some(e) = self.parked_error.take() {
            return Err(e);
        }
        self.file.sync_all()?;
        self.truncate_journal()?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

impl Drop for FileKeyStore {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all().and_then(|_| self.file.unlock()) {
            warn!(db = %self.url, error = %e, "close-time flush failed");
        }
        let _ = std::fs::remove_file(journal_path(&self.path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn profile() -> DbProfile {
        DbProfile::new(8, 1, 64)
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("common.db");
        let url = format!("file://{}", path.display());

        let id = {
            let mut store = FileKeyStore::open(&path, profile(), &url).unwrap();
            let id = store.insert(Key::new(0, vec![0xEE; 8])).unwrap();
            store.set_real_sync(id);
            store.sync().unwrap();
            id
        };

        let store = FileKeyStore::open(&path, profile(), &url).unwrap();
        assert!(store.valid(id));
        assert_eq!(store.get(id).data.as_octets(), &[0xEE; 8]);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_journal_recovers_unsynced_mutations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("common.db");
        let url = format!("file://{}", path.display());

        {
            let mut store = FileKeyStore::open(&path, profile(), &url).unwrap();
            let id = store.insert(Key::new(0, vec![0x77; 8])).unwrap();
            store.set_real_sync(id);
            store.sync().unwrap();
            store.insert(Key::new(0, vec![0x88; 8])).unwrap();
            // no sync: keep the journal alive by skipping Drop; release the
            // advisory lock so the reopen below can take it
            store.file.unlock().unwrap();
            std::mem::forget(store);
        }

        let store = FileKeyStore::open(&path, profile(), &url).unwrap();
        assert_eq!(store.count(), 2);
        assert_eq!(store.get(2).data.as_octets(), &[0x88; 8]);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("common.db");
        let url = format!("file://{}", path.display());

        {
            FileKeyStore::open(&path, profile(), &url).unwrap();
        }
        let other = DbProfile::new(16, 1, 64);
        assert!(matches!(
            FileKeyStore::open(&path, other, &url),
            Err(KeyDbError::Corrupt(_))
        ));
    }

    #[test]
    fn test_counter_reservation_is_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("common.db");
        let url = format!("file://{}", path.display());

        {
            let mut store = FileKeyStore::open(&path, profile(), &url).unwrap();
            for i in 0..4u8 {
                let id = store.insert(Key::new(0, vec![i; 8])).unwrap();
                store.set_real_sync(id);
            }
            let reserved = store.find_valid(16, 1);
            assert_eq!(reserved, vec![1, 2]);
            store.file.unlock().unwrap();
            std::mem::forget(store);
        }

        let mut store = FileKeyStore::open(&path, profile(), &url).unwrap();
        assert_eq!(store.key_count(1), 1);
        // the held slots stay invisible to a fresh hunt
        assert_eq!(store.find_valid(16, 1), vec![3, 4]);
    }
}
