//! # Key Movement
//!
//! The shared machinery of LOAD and LOAD-ACK: transplanting Common-Store
//! keys into a buffer. One store key fans out into
//! `store quantum / buffer quantum` buffer keys.
//!
//! A *move* is the committing form: the buffer slots take the octets,
//! become real-sync with counter 0, and the store slot is deleted. Both
//! endpoints perform the same move with the same id lists, which is what
//! keeps the mirror invariant (my Outgoing = your Incoming) intact.

use crate::domain::key_db::KeyDb;
use crate::ports::KeyStoreBackend;
use shared_types::{Key, KeyRing, KeyVec};
use tracing::warn;

/// Move common-store keys into buffer slots, returning the store ids
/// actually moved.
///
/// `buffer_keys` is consumed front to back; iteration stops early when the
/// remaining buffer ids cannot absorb one more full store key. Unknown
/// store ids are skipped with a warning and do not consume buffer slots.
pub(crate) fn move_to_buffer(
    common_store: &mut KeyDb,
    buffer: &mut KeyDb,
    common_store_keys: &KeyVec,
    buffer_keys: &KeyVec,
) -> KeyVec {
    let ratio = common_store.quantum() / buffer.quantum();
    let buffer_charge_before = buffer.count();
    let store_charge_before = common_store.count();

    let mut moved = KeyVec::new();
    let mut buffer_index = 0usize;

    for &store_id in common_store_keys {
        if buffer_keys.len() - buffer_index < ratio {
            break;
        }
        let key = common_store.get(store_id);
        if key.is_null() {
            warn!(store_id, "move skipped an unknown common store key");
            continue;
        }

        let mut ring = KeyRing::new(buffer.quantum());
        ring.push_key(&key);
        for piece in ring.into_keys() {
            let target = buffer_keys[buffer_index];
            if let Err(e) = buffer.set(Key::new(target, piece.data.as_octets().to_vec())) {
                warn!(target, error = %e, "buffer refused a moved key");
            } else {
                buffer.set_key_count(&[target], 0);
                buffer.set_real_sync(target);
            }
            buffer_index += 1;
        }

        common_store.del(store_id);
        moved.push(store_id);
    }

    let buffer_charge = buffer.count();
    let store_charge = common_store.count();
    buffer.emit_charge_change(buffer_charge.saturating_sub(buffer_charge_before), 0);
    common_store.emit_charge_change(0, store_charge_before.saturating_sub(store_charge));

    moved
}

/// Ids in `all` that are not in `moved`, keeping order.
pub(crate) fn not_moved(all: &KeyVec, moved: &KeyVec) -> KeyVec {
    all.iter()
        .copied()
        .filter(|id| !moved.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key_db::DbProfile;

    fn stores() -> (KeyDb, KeyDb) {
        let mut common = KeyDb::open_ram(DbProfile::new(8, 1, 64), "common");
        for i in 0..4u8 {
            let id = common.insert(Key::new(0, vec![i; 8])).unwrap();
            common.set_real_sync(id);
        }
        let buffer = KeyDb::open_ram(DbProfile::new(4, 1, 64), "buffer");
        (common, buffer)
    }

    #[test]
    fn test_move_fans_out_and_deletes() {
        let (mut common, mut buffer) = stores();
        let moved = move_to_buffer(&mut common, &mut buffer, &vec![1, 2], &vec![10, 11, 12, 13]);

        assert_eq!(moved, vec![1, 2]);
        assert_eq!(common.count(), 2);
        assert!(common.get(1).is_null());

        assert_eq!(buffer.count(), 4);
        for id in [10u64, 11] {
            assert!(buffer.valid(id));
            assert_eq!(buffer.get(id).data.as_octets(), &[0u8; 4]);
            assert_eq!(buffer.key_count(id), 0);
        }
        assert_eq!(buffer.get(12).data.as_octets(), &[1u8; 4]);
    }

    #[test]
    fn test_move_stops_when_buffer_ids_run_out() {
        let (mut common, mut buffer) = stores();
        // three buffer ids cannot absorb the second store key
        let moved = move_to_buffer(&mut common, &mut buffer, &vec![1, 2], &vec![10, 11, 12]);
        assert_eq!(moved, vec![1]);
        assert_eq!(common.count(), 3);
        assert_eq!(buffer.count(), 2);
    }

    #[test]
    fn test_not_moved() {
        assert_eq!(not_moved(&vec![1, 2, 3, 4], &vec![2, 4]), vec![1, 3]);
        assert!(not_moved(&vec![], &vec![1]).is_empty());
    }

    /// 400 bytes requested against a 128-byte store quantum and 32-byte
    /// buffer quantum: four store slots cover it and land as sixteen
    /// buffer slots, identically on both endpoints.
    #[test]
    fn test_load_roundtrip_geometry() {
        let build_common = || {
            let mut common = KeyDb::open_ram(DbProfile::new(128, 1, 64), "common");
            for i in 0..6u8 {
                let id = common.insert(Key::new(0, vec![i; 128])).unwrap();
                common.set_real_sync(id);
            }
            common
        };
        let mut master_common = build_common();
        let mut slave_common = build_common();
        let mut master_outgoing = KeyDb::open_ram(DbProfile::new(32, 1, 128), "outgoing");
        let mut slave_incoming = KeyDb::open_ram(DbProfile::new(32, 1, 128), "incoming");

        let cs_keys = master_common.find_valid(400, 1);
        assert_eq!(cs_keys.len(), 4);
        let buffer_keys = master_outgoing.find_spare(4 * 128, 1);
        assert_eq!(buffer_keys.len(), 16);

        let moved_slave =
            move_to_buffer(&mut slave_common, &mut slave_incoming, &cs_keys, &buffer_keys);
        let moved_master =
            move_to_buffer(&mut master_common, &mut master_outgoing, &cs_keys, &buffer_keys);
        assert_eq!(moved_slave, cs_keys);
        assert_eq!(moved_master, cs_keys);

        assert_eq!(master_common.count(), 2);
        assert_eq!(slave_common.count(), 2);
        assert_eq!(master_outgoing.count(), 16);
        assert_eq!(slave_incoming.count(), 16);

        for &id in &buffer_keys {
            assert!(master_outgoing.valid(id));
            assert_eq!(
                master_outgoing.get(id).data.as_octets(),
                slave_incoming.get(id).data.as_octets()
            );
        }
    }
}
