//! Write pipeline (§4.3–§4.5): admission, replacement collapse, deletion
//! tombstone enforcement, index generation, atomic commit.
//!
//! Grounded in the teacher's `storage/lmdb.rs::{save_event, delete_event_txn,
//! handle_replaceable, remove_indices}`: the commit-with-indices shape and
//! the delete-then-insert collapse come straight from there, generalized
//! from the teacher's 4 index families to the full family list of §3 and
//! the tombstone rules of §4.5, which the teacher does not implement.

use std::collections::HashSet;

use heed::RwTxn;

use crate::codec::canonical::compute_id;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventId, PublicKey, Serial};
use crate::keys::{
    expiration_key, full_id_key, id_key, kind_ts_key, pubkey_kind_range, pubkey_kind_ts_key,
    pubkey_ts_key, tag_value_ts_key, trailing_serial, ts_key, word_key,
};
use crate::store::{ByteRange, SerialAllocator, Store};
use crate::tokenizer::{hash_word, tokenize};

/// The full set of secondary-index keys generated for one event at one
/// serial. Built once and reused by both the insert path and the delete
/// path (§4.4 step 3 requires the delete side to *regenerate* this same
/// set) so the two can never drift apart.
struct IndexEntries {
    full_id: Vec<u8>,
    id: Vec<u8>,
    pubkey_kind_ts: Vec<u8>,
    pubkey_ts: Vec<u8>,
    kind_ts: Vec<u8>,
    ts: Vec<u8>,
    tag_value_ts: Vec<Vec<u8>>,
    word: Vec<Vec<u8>>,
    expiration: Option<Vec<u8>>,
}

fn build_index_entries(serial: Serial, event: &Event) -> IndexEntries {
    let tag_value_ts = event
        .tags
        .iter()
        .filter_map(|tag| {
            let key = tag.key()?;
            let value = tag.value()?;
            if key.len() != 1 || !key.is_ascii() {
                return None;
            }
            let hash = hash_word(value);
            Some(tag_value_ts_key(
                key.as_bytes()[0],
                hash,
                event.created_at,
                serial,
            ))
        })
        .collect();

    let mut words: HashSet<[u8; 8]> = tokenize(&event.content);
    for tag in &event.tags {
        for field in &tag.0 {
            words.extend(tokenize(field));
        }
    }
    let word = words.into_iter().map(|hash| word_key(hash, serial)).collect();

    IndexEntries {
        full_id: full_id_key(serial, event),
        id: id_key(&event.id, serial),
        pubkey_kind_ts: pubkey_kind_ts_key(&event.pubkey, event.kind.0, event.created_at, serial),
        pubkey_ts: pubkey_ts_key(&event.pubkey, event.created_at, serial),
        kind_ts: kind_ts_key(event.kind.0, event.created_at, serial),
        ts: ts_key(event.created_at, serial),
        tag_value_ts,
        word,
        expiration: event.expiration().map(|exp| expiration_key(exp, serial)),
    }
}

fn put_index_entries(wtxn: &mut RwTxn, store: &Store, entries: &IndexEntries) -> Result<()> {
    store.full_id.put(wtxn, &entries.full_id, &())?;
    store.id_idx.put(wtxn, &entries.id, &())?;
    store.pubkey_kind_ts.put(wtxn, &entries.pubkey_kind_ts, &())?;
    store.pubkey_ts.put(wtxn, &entries.pubkey_ts, &())?;
    store.kind_ts.put(wtxn, &entries.kind_ts, &())?;
    store.ts.put(wtxn, &entries.ts, &())?;
    for key in &entries.tag_value_ts {
        store.tag_value_ts.put(wtxn, key, &())?;
    }
    for key in &entries.word {
        store.word.put(wtxn, key, &())?;
    }
    if let Some(key) = &entries.expiration {
        store.expiration.put(wtxn, key, &())?;
    }
    Ok(())
}

fn delete_index_entries(wtxn: &mut RwTxn, store: &Store, entries: &IndexEntries) -> Result<()> {
    store.full_id.delete(wtxn, &entries.full_id)?;
    store.id_idx.delete(wtxn, &entries.id)?;
    store.pubkey_kind_ts.delete(wtxn, &entries.pubkey_kind_ts)?;
    store.pubkey_ts.delete(wtxn, &entries.pubkey_ts)?;
    store.kind_ts.delete(wtxn, &entries.kind_ts)?;
    store.ts.delete(wtxn, &entries.ts)?;
    for key in &entries.tag_value_ts {
        store.tag_value_ts.delete(wtxn, key)?;
    }
    for key in &entries.word {
        store.word.delete(wtxn, key)?;
    }
    if let Some(key) = &entries.expiration {
        store.expiration.delete(wtxn, key)?;
    }
    Ok(())
}

/// Delete the event at `serial` inside an already-open write transaction:
/// regenerate its index key set and remove it along with the Event record
/// itself (§4.4). Used both by the public delete path and by replacement
/// collapse.
fn delete_event_txn(wtxn: &mut RwTxn, store: &Store, serial: Serial, event: &Event) -> Result<()> {
    let entries = build_index_entries(serial, event);
    delete_index_entries(wtxn, store, &entries)?;
    store.delete_event_record(wtxn, serial)?;
    Ok(())
}

/// True iff `existing` wins over `incoming` under the ordering rule
/// between two writers touching the same replaceable address: greater
/// `created_at` wins, ties broken by the greater event id.
fn dominates(existing: &Event, incoming: &Event) -> bool {
    existing.created_at > incoming.created_at
        || (existing.created_at == incoming.created_at && existing.id > incoming.id)
}

/// What to do about `event`'s replaceable (or parameterized-replaceable)
/// address: either an existing event already dominates it (`dominated`,
/// in which case nothing is deleted and the incoming event must not be
/// stored), or a set of now-superseded events to delete before it is.
struct ReplacementPlan {
    dominated: bool,
    to_delete: Vec<Serial>,
}

/// Scan every existing event at `event`'s address and classify it against
/// the domination rule, excluding `event` itself.
fn plan_replacement(wtxn: &RwTxn, store: &Store, event: &Event) -> Result<ReplacementPlan> {
    let (start, end) = pubkey_kind_range(&event.pubkey, event.kind.0, 0, u64::MAX);
    let range = ByteRange::new(&start, &end);

    let mut serials = Vec::new();
    for entry in store.pubkey_kind_ts.range(wtxn, &range)? {
        let (key, _) = entry?;
        if let Some(serial) = trailing_serial(key) {
            serials.push(serial);
        }
    }

    let wanted_d = event
        .kind
        .is_parameterized_replaceable()
        .then(|| event.d_tag().unwrap_or("").to_string());

    let mut dominated = false;
    let mut to_delete = Vec::with_capacity(serials.len());
    for serial in serials {
        let Some(existing) = store.fetch_event(wtxn, serial)? else {
            continue;
        };
        if existing.id == event.id {
            continue;
        }
        if let Some(wanted_d) = &wanted_d {
            if existing.d_tag().unwrap_or("") != wanted_d {
                continue;
            }
        }
        if dominates(&existing, event) {
            dominated = true;
        } else {
            to_delete.push(serial);
        }
    }

    Ok(ReplacementPlan { dominated, to_delete })
}

/// Delete every event `event` supersedes at its (pubkey, kind[, d])
/// address (§4.3 step 3), honoring the domination rule: between two
/// writers touching the same address, exactly one survives, and it is
/// the one with greater `created_at` (ties broken by the greater event
/// id). Returns `true` when an existing event dominates `event`, meaning
/// the caller must skip the insert entirely and leave every existing
/// event untouched. Deletion precedes insertion so a later query always
/// sees exactly one survivor. Per-victim delete errors are logged and
/// skipped rather than aborting the save (§7): the new event should still
/// succeed if at least its own indexes commit.
fn collapse_replacements(wtxn: &mut RwTxn, store: &Store, event: &Event) -> Result<bool> {
    if !event.kind.is_replaceable() && !event.kind.is_parameterized_replaceable() {
        return Ok(false);
    }

    let plan = plan_replacement(wtxn, store, event)?;
    if plan.dominated {
        return Ok(true);
    }

    for serial in plan.to_delete {
        let Some(victim) = store.fetch_event(wtxn, serial)? else {
            continue;
        };
        if let Err(err) = delete_event_txn(wtxn, store, serial, &victim) {
            tracing::warn!(serial, error = %err, "replacement collapse: failed to delete victim");
        }
    }
    Ok(false)
}

/// Effective admin set against which deletion tombstones are evaluated
/// for `event` (§4.5): the event's own author plus the configured admins.
fn effective_admins(event: &Event, configured_admins: &[PublicKey]) -> Vec<PublicKey> {
    let mut admins = Vec::with_capacity(configured_admins.len() + 1);
    admins.push(event.pubkey);
    admins.extend(configured_admins.iter().copied());
    admins
}

/// §4.5: does a still-effective deletion by the admin-set cover `event`?
/// Returns the blocking deletion's id on a match.
pub fn check_for_deleted(
    rtxn: &heed::RoTxn,
    store: &Store,
    event: &Event,
    configured_admins: &[PublicKey],
) -> Result<Option<EventId>> {
    let admins = effective_admins(event, configured_admins);

    if event.kind.is_parameterized_replaceable() {
        let address = event.address();
        return find_blocking_deletion(rtxn, store, &admins, |d| {
            d.created_at > event.created_at && d.tag_values("a").any(|v| v == address)
        });
    }

    if event.kind.is_replaceable() {
        let kind_str = event.kind.0.to_string();
        let kind_pubkey = event.kind_pubkey();
        return find_blocking_deletion(rtxn, store, &admins, |d| {
            d.created_at > event.created_at
                && (d.tag_values("k").any(|v| v == kind_str) || d.tag_values("a").any(|v| v == kind_pubkey))
        });
    }

    let hex_id = event.id.to_hex();
    find_blocking_deletion(rtxn, store, &admins, |d| d.tag_values("e").any(|v| v == hex_id))
}

/// Scan every admin's PubkeyKindTs range for kind-5 events and test `pred`
/// against each materialized deletion. Deletion volume per author is small
/// relative to total events, so a linear scan over each admin's deletions
/// is acceptable; this mirrors how the reference relay resolves policy
/// look-ups by author.
fn find_blocking_deletion(
    rtxn: &heed::RoTxn,
    store: &Store,
    admins: &[PublicKey],
    pred: impl Fn(&Event) -> bool,
) -> Result<Option<EventId>> {
    for admin in admins {
        let (start, end) = pubkey_kind_range(admin, 5, 0, u64::MAX);
        let range = ByteRange::new(&start, &end);
        for entry in store.pubkey_kind_ts.range(rtxn, &range)? {
            let (key, _) = entry?;
            let Some(serial) = trailing_serial(key) else {
                continue;
            };
            if let Some(deletion) = store.fetch_event(rtxn, serial)? {
                if pred(&deletion) {
                    return Ok(Some(deletion.id));
                }
            }
        }
    }
    Ok(None)
}

/// §4.5 final paragraph: a deletion with no `e`/`a` tags but `k` tags
/// deletes all of the author's existing events of those kinds that
/// predate the deletion. Runs after the deletion event itself has been
/// committed as a normal event.
pub fn process_delete(wtxn: &mut RwTxn, store: &Store, deletion: &Event) -> Result<()> {
    if !deletion.kind.is_deletion() {
        return Ok(());
    }

    let has_e_or_a = deletion.tag_values("e").next().is_some() || deletion.tag_values("a").next().is_some();
    if has_e_or_a {
        return Ok(());
    }

    let kinds: Vec<u16> = deletion
        .tag_values("k")
        .filter_map(|v| v.parse::<u16>().ok())
        .collect();
    if kinds.is_empty() {
        return Ok(());
    }

    for kind in kinds {
        let (start, end) = pubkey_kind_range(&deletion.pubkey, kind, 0, deletion.created_at as u64);
        let range = ByteRange::new(&start, &end);
        let victims: Vec<Serial> = store
            .pubkey_kind_ts
            .range(wtxn, &range)?
            .filter_map(|r| r.ok())
            .filter_map(|(key, _)| trailing_serial(key))
            .collect();

        for serial in victims {
            let Some(victim) = store.fetch_event(wtxn, serial)? else {
                continue;
            };
            if victim.created_at >= deletion.created_at {
                continue;
            }
            if let Err(err) = delete_event_txn(wtxn, store, serial, &victim) {
                tracing::warn!(serial, error = %err, "process_delete: failed to delete victim");
            }
        }
    }
    Ok(())
}

/// §4.3: admit and store `event`. Returns the serial it was stored under.
pub fn save_event(
    store: &Store,
    allocator: &SerialAllocator,
    event: &Event,
    configured_admins: &[PublicKey],
) -> Result<Serial> {
    if compute_id(event) != event.id.0 {
        return Err(EngineError::Invalid("event id does not match its canonical hash".into()));
    }
    if event.kind.is_ephemeral() {
        return Err(EngineError::Invalid("ephemeral events are not stored".into()));
    }

    let mut wtxn = store.write_txn()?;

    if store.find_serial_by_id(&wtxn, &event.id)?.is_some() {
        return Err(EngineError::Duplicate);
    }

    if collapse_replacements(&mut wtxn, store, event)? {
        tracing::debug!(event_id = %event.id, "admission superseded by an existing event at the same address");
        return Err(EngineError::Superseded);
    }

    if let Some(by) = check_for_deleted(&wtxn, store, event, configured_admins)? {
        tracing::info!(event_id = %event.id, deleted_by = %by, "admission blocked by deletion tombstone");
        return Err(EngineError::Blocked { by });
    }

    let serial = allocator.allocate(&mut wtxn, store)?;
    let entries = build_index_entries(serial, event);
    store.put_event(&mut wtxn, serial, event)?;
    put_index_entries(&mut wtxn, store, &entries)?;

    if event.kind.is_deletion() {
        process_delete(&mut wtxn, store, event)?;
    }

    wtxn.commit()?;
    tracing::debug!(event_id = %event.id, pubkey = %event.pubkey, kind = event.kind.0, serial, "event saved");
    Ok(serial)
}

/// §4.4: delete the event identified by `id`, if present.
pub fn delete_event(store: &Store, id: &EventId) -> Result<()> {
    let mut wtxn = store.write_txn()?;
    let Some(serial) = store.find_serial_by_id(&wtxn, id)? else {
        return Err(EngineError::NotFound);
    };
    let Some(event) = store.fetch_event(&wtxn, serial)? else {
        return Err(EngineError::NotFound);
    };
    delete_event_txn(&mut wtxn, store, serial, &event)?;
    wtxn.commit()?;
    tracing::debug!(event_id = %id, serial, "event deleted");
    Ok(())
}

/// §4.4: delete a known (serial, event) pair without a redundant id
/// lookup. Used internally by replacement collapse and the maintenance
/// sweeper.
pub fn delete_event_by_serial(store: &Store, serial: Serial, event: &Event) -> Result<()> {
    let mut wtxn = store.write_txn()?;
    delete_event_txn(&mut wtxn, store, serial, event)?;
    wtxn.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Kind, Tag};
    use tempfile::tempdir;

    fn sample_event(pubkey: PublicKey, created_at: i64, kind: u16, content: &str, tags: Vec<Tag>) -> Event {
        let mut event = Event {
            id: EventId([0; 32]),
            pubkey,
            created_at,
            kind: Kind(kind),
            tags,
            content: content.to_string(),
            sig: [0u8; 64],
        };
        event.id = EventId(compute_id(&event));
        event
    }

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path(), 10 * 1024 * 1024).unwrap()
    }

    #[test]
    fn save_and_fetch_by_serial() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([1u8; 32]);
        let event = sample_event(pk, 1_700_000_000, 1, "hello", vec![]);

        let serial = save_event(&store, &allocator, &event, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        let fetched = store.fetch_event(&rtxn, serial).unwrap().unwrap();
        assert_eq!(fetched.id, event.id);
        assert_eq!(fetched.content, "hello");
    }

    #[test]
    fn duplicate_save_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([2u8; 32]);
        let event = sample_event(pk, 1_700_000_000, 1, "hi", vec![]);

        save_event(&store, &allocator, &event, &[]).unwrap();
        let err = save_event(&store, &allocator, &event, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Duplicate));
    }

    #[test]
    fn rejects_event_with_bad_id() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([3u8; 32]);
        let mut event = sample_event(pk, 1_700_000_000, 1, "hi", vec![]);
        event.id = EventId([0xff; 32]);

        let err = save_event(&store, &allocator, &event, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
    }

    #[test]
    fn replaceable_collapse_keeps_only_newest() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([4u8; 32]);

        let e1 = sample_event(pk, 100, 0, "A", vec![]);
        let e2 = sample_event(pk, 200, 0, "B", vec![]);

        save_event(&store, &allocator, &e1, &[]).unwrap();
        save_event(&store, &allocator, &e2, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        assert!(store.find_serial_by_id(&rtxn, &e1.id).unwrap().is_none());
        assert!(store.find_serial_by_id(&rtxn, &e2.id).unwrap().is_some());
    }

    #[test]
    fn replaceable_collapse_keeps_newest_even_when_saved_out_of_order() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([40u8; 32]);

        let e1 = sample_event(pk, 100, 0, "A", vec![]);
        let e2 = sample_event(pk, 200, 0, "B", vec![]);

        // e2 arrives first (e.g. a replay or out-of-order delivery), then
        // the older e1 arrives after it. e2 must remain the sole survivor.
        save_event(&store, &allocator, &e2, &[]).unwrap();
        let err = save_event(&store, &allocator, &e1, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Superseded));

        let rtxn = store.read_txn().unwrap();
        assert!(store.find_serial_by_id(&rtxn, &e1.id).unwrap().is_none());
        assert!(store.find_serial_by_id(&rtxn, &e2.id).unwrap().is_some());
    }

    #[test]
    fn parameterized_replaceable_respects_d_tag() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([5u8; 32]);

        let d_x = Tag::new(vec!["d".into(), "x".into()]);
        let d_y = Tag::new(vec!["d".into(), "y".into()]);

        let e1 = sample_event(pk, 100, 30_000, "profile-x-1", vec![d_x.clone()]);
        let e2 = sample_event(pk, 200, 30_000, "profile-x-2", vec![d_x.clone()]);
        let e3 = sample_event(pk, 150, 30_000, "profile-y-1", vec![d_y.clone()]);

        save_event(&store, &allocator, &e1, &[]).unwrap();
        save_event(&store, &allocator, &e2, &[]).unwrap();
        save_event(&store, &allocator, &e3, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        assert!(store.find_serial_by_id(&rtxn, &e1.id).unwrap().is_none());
        assert!(store.find_serial_by_id(&rtxn, &e2.id).unwrap().is_some());
        assert!(store.find_serial_by_id(&rtxn, &e3.id).unwrap().is_some());
    }

    #[test]
    fn deletion_by_id_blocks_resubmission() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([6u8; 32]);

        let target = sample_event(pk, 100, 1, "delete me", vec![]);
        save_event(&store, &allocator, &target, &[]).unwrap();

        let e_tag = Tag::new(vec!["e".into(), target.id.to_hex()]);
        let deletion = sample_event(pk, 200, 5, "", vec![e_tag]);
        save_event(&store, &allocator, &deletion, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        assert!(store.find_serial_by_id(&rtxn, &target.id).unwrap().is_none());
        drop(rtxn);

        let err = save_event(&store, &allocator, &target, &[]).unwrap_err();
        assert!(matches!(err, EngineError::Blocked { .. }));
    }

    #[test]
    fn process_delete_removes_events_by_kind() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([7u8; 32]);

        let e1 = sample_event(pk, 100, 1, "one", vec![]);
        let e2 = sample_event(pk, 150, 1, "two", vec![]);
        save_event(&store, &allocator, &e1, &[]).unwrap();
        save_event(&store, &allocator, &e2, &[]).unwrap();

        let k_tag = Tag::new(vec!["k".into(), "1".into()]);
        let deletion = sample_event(pk, 300, 5, "", vec![k_tag]);
        save_event(&store, &allocator, &deletion, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        assert!(store.find_serial_by_id(&rtxn, &e1.id).unwrap().is_none());
        assert!(store.find_serial_by_id(&rtxn, &e2.id).unwrap().is_none());
    }

    #[test]
    fn delete_event_removes_all_index_entries() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([8u8; 32]);
        let tag = Tag::new(vec!["t".into(), "nostr".into()]);
        let event = sample_event(pk, 100, 1, "hello world", vec![tag]);

        save_event(&store, &allocator, &event, &[]).unwrap();
        delete_event(&store, &event.id).unwrap();

        let rtxn = store.read_txn().unwrap();
        assert!(store.find_serial_by_id(&rtxn, &event.id).unwrap().is_none());

        let (start, end) = crate::keys::pubkey_ts_range(&pk, 0, u64::MAX);
        let range = ByteRange::new(&start, &end);
        assert_eq!(store.pubkey_ts.range(&rtxn, &range).unwrap().count(), 0);
    }
}
