//! Maintenance (§4.7): versioned schema migrations, the periodic
//! expiration sweeper, and small out-of-band markers.
//!
//! The periodic-task shape (`tokio::time::interval`, skip the immediate
//! first tick, loop until a shutdown signal fires) is grounded in the
//! teacher's `stats.rs::stats_background_loop`, generalized to sweep the
//! Expiration family via the write pipeline's delete path instead of
//! snapshotting system stats.

use std::sync::Arc;
use std::time::Duration;

use heed::RwTxn;

use crate::codec::ints::read_u40;
use crate::codec::record;
use crate::error::Result;
use crate::event::Serial;
use crate::keys::{expiration_key, expiration_range_upto, trailing_serial};
use crate::store::{ByteRange, Store};
use crate::tokenizer::tokenize;
use crate::write::delete_event_by_serial;

/// Current schema version; bump this and add a migration below whenever a
/// derived index needs backfilling.
const CURRENT_VERSION: u32 = 2;

fn current_schema_version(rtxn: &heed::RoTxn, store: &Store) -> Result<u32> {
    for entry in store.version.iter(rtxn)? {
        let (key, _) = entry?;
        if key.len() == 4 {
            return Ok(u32::from_be_bytes(key.try_into().unwrap()));
        }
    }
    Ok(0)
}

/// The Version family holds exactly one key (§3); replace it atomically.
fn set_schema_version(wtxn: &mut RwTxn, store: &Store, version: u32) -> Result<()> {
    let stale: Vec<Vec<u8>> = store
        .version
        .iter(wtxn)?
        .filter_map(|r| r.ok())
        .map(|(key, _)| key.to_vec())
        .collect();
    for key in stale {
        store.version.delete(wtxn, &key)?;
    }
    store.version.put(wtxn, &version.to_be_bytes(), &())?;
    Ok(())
}

/// `→1`: backfill Expiration entries from every stored event carrying an
/// `expiration` tag. Safe to re-run: re-inserting an existing key is a
/// no-op.
fn migrate_backfill_expiration(wtxn: &mut RwTxn, store: &Store) -> Result<()> {
    let mut entries = Vec::new();
    for entry in store.events.iter(wtxn)? {
        let (key, value) = entry?;
        let Some(serial) = read_u40(key) else { continue };
        let event = match record::decode(value) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(serial, error = %err, "migration →1: skipping corrupt record");
                continue;
            }
        };
        if let Some(expire_at) = event.expiration() {
            entries.push(expiration_key(expire_at, serial));
        }
    }
    entries.sort();
    for key in entries {
        store.expiration.put(wtxn, &key, &())?;
    }
    Ok(())
}

/// `→2`: backfill Word entries from content and every tag field of every
/// stored event.
fn migrate_backfill_words(wtxn: &mut RwTxn, store: &Store) -> Result<()> {
    let mut entries = Vec::new();
    for entry in store.events.iter(wtxn)? {
        let (key, value) = entry?;
        let Some(serial) = read_u40(key) else { continue };
        let event = match record::decode(value) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(serial, error = %err, "migration →2: skipping corrupt record");
                continue;
            }
        };
        let mut words = tokenize(&event.content);
        for tag in &event.tags {
            for field in &tag.0 {
                words.extend(tokenize(field));
            }
        }
        for hash in words {
            entries.push(crate::keys::word_key(hash, serial));
        }
    }
    entries.sort();
    for key in entries {
        store.word.put(wtxn, &key, &())?;
    }
    Ok(())
}

/// On startup: apply every migration between the stored schema version and
/// `CURRENT_VERSION`, in order, then atomically replace the version key.
pub fn run_migrations(store: &Store) -> Result<()> {
    let mut wtxn = store.write_txn()?;
    let mut version = current_schema_version(&wtxn, store)?;
    let starting_version = version;

    if version < 1 {
        migrate_backfill_expiration(&mut wtxn, store)?;
        version = 1;
    }
    if version < 2 {
        migrate_backfill_words(&mut wtxn, store)?;
        version = 2;
    }

    if version != starting_version {
        set_schema_version(&mut wtxn, store, version)?;
        tracing::info!(from = starting_version, to = version, "applied schema migrations");
    }
    wtxn.commit()?;
    Ok(())
}

/// Collect the serials of every Expiration entry with `expire_at <= now`.
fn due_serials(rtxn: &heed::RoTxn, store: &Store, now: i64) -> Result<Vec<Serial>> {
    let (start, end) = expiration_range_upto(now);
    let range = ByteRange::new(&start, &end);
    let mut serials = Vec::new();
    for entry in store.expiration.range(rtxn, &range)? {
        let (key, _) = entry?;
        if let Some(serial) = trailing_serial(key) {
            serials.push(serial);
        }
    }
    Ok(serials)
}

/// One sweep tick: delete every event whose `expiration` tag has passed.
/// Per-event failures are logged and skipped (§7) — one corrupt or
/// already-gone record must not stall the rest of the sweep.
pub fn sweep_expired(store: &Store, now: i64) -> Result<usize> {
    let rtxn = store.read_txn()?;
    let serials = due_serials(&rtxn, store, now)?;
    drop(rtxn);

    let mut swept = 0;
    for serial in serials {
        let rtxn = store.read_txn()?;
        let event = store.fetch_event(&rtxn, serial)?;
        drop(rtxn);
        let Some(event) = event else { continue };

        match delete_event_by_serial(store, serial, &event) {
            Ok(()) => {
                swept += 1;
                tracing::debug!(serial, event_id = %event.id, "expired event swept");
            }
            Err(err) => {
                tracing::warn!(serial, error = %err, "expiration sweep: failed to delete event");
            }
        }
    }
    Ok(swept)
}

/// Periodic expiration sweeper (§4.7, §5 lifecycle). Runs until `shutdown`
/// fires, mirroring the teacher's `stats_background_loop` shape: an
/// interval timer with the immediate first tick skipped, looping forever
/// otherwise.
pub async fn run_expiration_sweeper(
    store: Arc<Store>,
    period: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // first tick is immediate — skip it

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
                    Ok(d) => d.as_secs() as i64,
                    Err(_) => continue,
                };
                match sweep_expired(&store, now) {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "expiration sweep completed"),
                    Err(err) => tracing::warn!(error = %err, "expiration sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!("expiration sweeper observed shutdown signal, exiting");
                break;
            }
        }
    }
}

/// Markers: small named byte blobs under an out-of-band slot (§4.7),
/// independent of the queryable index families.
pub fn set_marker(store: &Store, name: &str, value: &[u8]) -> Result<()> {
    let mut wtxn = store.write_txn()?;
    store.marker.put(&mut wtxn, marker_key(name).as_slice(), value)?;
    wtxn.commit()?;
    Ok(())
}

pub fn get_marker(store: &Store, name: &str) -> Result<Option<Vec<u8>>> {
    let rtxn = store.read_txn()?;
    Ok(store.marker.get(&rtxn, marker_key(name).as_slice())?.map(|v| v.to_vec()))
}

pub fn has_marker(store: &Store, name: &str) -> Result<bool> {
    Ok(get_marker(store, name)?.is_some())
}

pub fn delete_marker(store: &Store, name: &str) -> Result<()> {
    let mut wtxn = store.write_txn()?;
    store.marker.delete(&mut wtxn, marker_key(name).as_slice())?;
    wtxn.commit()?;
    Ok(())
}

fn marker_key(name: &str) -> Vec<u8> {
    let mut key = b"MARKER:".to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}
