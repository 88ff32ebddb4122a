//! Composite index key encoders for every family in §3.
//!
//! Grounded in the teacher's `storage/lmdb.rs::encode_*_key` functions
//! (stack-array BE packing for the fixed-width families, `Vec<u8>` for the
//! variable-width tag/word families), generalized to the full family list:
//! Event, Id, FullId, PubkeyKindTs, PubkeyTs, KindTs, Ts, TagValueTs, Word,
//! Expiration, Version, Marker.
//!
//! Each family is its own named LMDB database (see `store`), so unlike the
//! spec's flat single-byte-prefix keyspace, no prefix byte is embedded in
//! the key bytes here — the database name already partitions the keyspace
//! into a contiguous range per family.

use crate::codec::ints::{created_at_to_u64, u40_array, U40_LEN};
use crate::event::{Event, EventId, PublicKey, Serial};

pub const ID_PREFIX_LEN: usize = 8;

/// `serial₄₀` — key for the Event family.
pub fn event_key(serial: Serial) -> [u8; U40_LEN] {
    u40_array(serial)
}

/// `id₈ ‖ serial₄₀` — key for the Id family.
pub fn id_key(id: &EventId, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_PREFIX_LEN + U40_LEN);
    key.extend_from_slice(&id.as_bytes()[..ID_PREFIX_LEN]);
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn id_prefix_range(id: &EventId) -> ([u8; ID_PREFIX_LEN], [u8; ID_PREFIX_LEN]) {
    let mut start = [0u8; ID_PREFIX_LEN];
    start.copy_from_slice(&id.as_bytes()[..ID_PREFIX_LEN]);
    (start, start)
}

/// `serial₄₀ ‖ id₃₂ ‖ pubkey₃₂ ‖ created_at₆₄` — key for the FullId family.
/// The value is empty (per §3, only the Event family stores a value); the
/// (id, pubkey, created_at) triplet is embedded entirely in the key, so a
/// lookup by serial is a one-hit prefix range scan over the fixed serial
/// prefix.
pub fn full_id_key(serial: Serial, event: &Event) -> Vec<u8> {
    let mut key = Vec::with_capacity(U40_LEN + 32 + 32 + 8);
    key.extend_from_slice(&u40_array(serial));
    key.extend_from_slice(event.id.as_bytes());
    key.extend_from_slice(event.pubkey.as_bytes());
    key.extend_from_slice(&created_at_to_u64(event.created_at).to_be_bytes());
    key
}

pub fn full_id_serial_range(serial: Serial) -> (Vec<u8>, Vec<u8>) {
    let prefix = u40_array(serial);
    let mut start = Vec::with_capacity(U40_LEN + 72);
    start.extend_from_slice(&prefix);
    start.extend_from_slice(&[0u8; 72]);

    let mut end = Vec::with_capacity(U40_LEN + 72);
    end.extend_from_slice(&prefix);
    end.extend_from_slice(&[0xffu8; 72]);

    (start, end)
}

pub struct FullIdValue {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: i64,
}

/// Parse the `(id, pubkey, created_at)` triplet out of a full FullId key
/// (not its — empty — value).
pub fn decode_full_id_key(key: &[u8]) -> Option<FullIdValue> {
    if key.len() != U40_LEN + 72 {
        return None;
    }
    let body = &key[U40_LEN..];
    let mut id = [0u8; 32];
    id.copy_from_slice(&body[0..32]);
    let mut pk = [0u8; 32];
    pk.copy_from_slice(&body[32..64]);
    let ts = u64::from_be_bytes(body[64..72].try_into().ok()?);
    Some(FullIdValue {
        id: EventId(id),
        pubkey: PublicKey(pk),
        created_at: ts as i64,
    })
}

/// `pubkey₃₂ ‖ kind₁₆ ‖ created_at₆₄ ‖ serial₄₀` — key for PubkeyKindTs.
pub fn pubkey_kind_ts_key(pubkey: &PublicKey, kind: u16, created_at: i64, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 2 + 8 + U40_LEN);
    key.extend_from_slice(pubkey.as_bytes());
    key.extend_from_slice(&kind.to_be_bytes());
    key.extend_from_slice(&created_at_to_u64(created_at).to_be_bytes());
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn pubkey_kind_range(pubkey: &PublicKey, kind: u16, since: u64, until: u64) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(42);
    start.extend_from_slice(pubkey.as_bytes());
    start.extend_from_slice(&kind.to_be_bytes());
    start.extend_from_slice(&since.to_be_bytes());
    start.extend_from_slice(&[0u8; U40_LEN]);

    let mut end = Vec::with_capacity(42);
    end.extend_from_slice(pubkey.as_bytes());
    end.extend_from_slice(&kind.to_be_bytes());
    end.extend_from_slice(&until.to_be_bytes());
    end.extend_from_slice(&[0xffu8; U40_LEN]);

    (start, end)
}

/// `pubkey₃₂ ‖ created_at₆₄ ‖ serial₄₀` — key for PubkeyTs.
pub fn pubkey_ts_key(pubkey: &PublicKey, created_at: i64, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 8 + U40_LEN);
    key.extend_from_slice(pubkey.as_bytes());
    key.extend_from_slice(&created_at_to_u64(created_at).to_be_bytes());
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn pubkey_ts_range(pubkey: &PublicKey, since: u64, until: u64) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(40);
    start.extend_from_slice(pubkey.as_bytes());
    start.extend_from_slice(&since.to_be_bytes());
    start.extend_from_slice(&[0u8; U40_LEN]);

    let mut end = Vec::with_capacity(40);
    end.extend_from_slice(pubkey.as_bytes());
    end.extend_from_slice(&until.to_be_bytes());
    end.extend_from_slice(&[0xffu8; U40_LEN]);

    (start, end)
}

/// `kind₁₆ ‖ created_at₆₄ ‖ serial₄₀` — key for KindTs.
pub fn kind_ts_key(kind: u16, created_at: i64, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8 + U40_LEN);
    key.extend_from_slice(&kind.to_be_bytes());
    key.extend_from_slice(&created_at_to_u64(created_at).to_be_bytes());
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn kind_ts_range(kind: u16, since: u64, until: u64) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(10);
    start.extend_from_slice(&kind.to_be_bytes());
    start.extend_from_slice(&since.to_be_bytes());
    start.extend_from_slice(&[0u8; U40_LEN]);

    let mut end = Vec::with_capacity(10);
    end.extend_from_slice(&kind.to_be_bytes());
    end.extend_from_slice(&until.to_be_bytes());
    end.extend_from_slice(&[0xffu8; U40_LEN]);

    (start, end)
}

/// `created_at₆₄ ‖ serial₄₀` — key for Ts.
pub fn ts_key(created_at: i64, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + U40_LEN);
    key.extend_from_slice(&created_at_to_u64(created_at).to_be_bytes());
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn ts_range(since: u64, until: u64) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(13);
    start.extend_from_slice(&since.to_be_bytes());
    start.extend_from_slice(&[0u8; U40_LEN]);

    let mut end = Vec::with_capacity(13);
    end.extend_from_slice(&until.to_be_bytes());
    end.extend_from_slice(&[0xffu8; U40_LEN]);

    (start, end)
}

/// `tag_key₁ ‖ tag_value_hash₈ ‖ created_at₆₄ ‖ serial₄₀` — key for TagValueTs.
pub fn tag_value_ts_key(tag_key: u8, value_hash: [u8; 8], created_at: i64, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + 8 + U40_LEN);
    key.push(tag_key);
    key.extend_from_slice(&value_hash);
    key.extend_from_slice(&created_at_to_u64(created_at).to_be_bytes());
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn tag_value_range(tag_key: u8, value_hash: [u8; 8], since: u64, until: u64) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(17);
    start.push(tag_key);
    start.extend_from_slice(&value_hash);
    start.extend_from_slice(&since.to_be_bytes());
    start.extend_from_slice(&[0u8; U40_LEN]);

    let mut end = Vec::with_capacity(17);
    end.push(tag_key);
    end.extend_from_slice(&value_hash);
    end.extend_from_slice(&until.to_be_bytes());
    end.extend_from_slice(&[0xffu8; U40_LEN]);

    (start, end)
}

/// `word_hash₈ ‖ serial₄₀` — key for the Word family.
pub fn word_key(word_hash: [u8; 8], serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + U40_LEN);
    key.extend_from_slice(&word_hash);
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn word_range(word_hash: [u8; 8]) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(13);
    start.extend_from_slice(&word_hash);
    start.extend_from_slice(&[0u8; U40_LEN]);

    let mut end = Vec::with_capacity(13);
    end.extend_from_slice(&word_hash);
    end.extend_from_slice(&[0xffu8; U40_LEN]);

    (start, end)
}

/// `expire_at₆₄ ‖ serial₄₀` — key for the Expiration family.
pub fn expiration_key(expire_at: i64, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + U40_LEN);
    key.extend_from_slice(&created_at_to_u64(expire_at).to_be_bytes());
    key.extend_from_slice(&u40_array(serial));
    key
}

pub fn expiration_range_upto(expire_at_inclusive: i64) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(13);
    start.extend_from_slice(&[0u8; 8]);
    start.extend_from_slice(&[0u8; U40_LEN]);

    let mut end = Vec::with_capacity(13);
    end.extend_from_slice(&created_at_to_u64(expire_at_inclusive).to_be_bytes());
    end.extend_from_slice(&[0xffu8; U40_LEN]);

    (start, end)
}

/// Splits a trailing 40-bit serial off any of the fixed-suffix keys above.
pub fn trailing_serial(key: &[u8]) -> Option<Serial> {
    if key.len() < U40_LEN {
        return None;
    }
    crate::codec::ints::read_u40(&key[key.len() - U40_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_keys_sort_by_serial() {
        let a = event_key(1);
        let b = event_key(2);
        let c = event_key(300);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn pubkey_ts_range_is_inclusive_and_sorted() {
        let pk = PublicKey([5u8; 32]);
        let (start, end) = pubkey_ts_range(&pk, 100, 200);
        let key_in_range = pubkey_ts_key(&pk, 150, 42);
        assert!(start.as_slice() <= key_in_range.as_slice());
        assert!(key_in_range.as_slice() <= end.as_slice());

        let key_before = pubkey_ts_key(&pk, 50, 42);
        assert!(key_before.as_slice() < start.as_slice());
    }

    #[test]
    fn trailing_serial_round_trip() {
        let pk = PublicKey([1u8; 32]);
        let key = pubkey_ts_key(&pk, 100, 999);
        assert_eq!(trailing_serial(&key), Some(999));
    }

    #[test]
    fn full_id_key_round_trip_and_seekable_by_serial() {
        let ev_id = EventId([2u8; 32]);
        let pk = PublicKey([3u8; 32]);
        let event = Event {
            id: ev_id,
            pubkey: pk,
            created_at: 42,
            kind: crate::event::Kind(1),
            tags: vec![],
            content: String::new(),
            sig: [0u8; 64],
        };
        let key = full_id_key(7, &event);
        let decoded = decode_full_id_key(&key).unwrap();
        assert_eq!(decoded.id, ev_id);
        assert_eq!(decoded.pubkey, pk);
        assert_eq!(decoded.created_at, 42);

        let (start, end) = full_id_serial_range(7);
        assert!(start.as_slice() <= key.as_slice());
        assert!(key.as_slice() <= end.as_slice());

        let (other_start, _) = full_id_serial_range(8);
        assert!(key.as_slice() < other_start.as_slice());
    }
}
