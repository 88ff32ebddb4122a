use std::fs;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use heed::types::{Bytes, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn};

use crate::codec::record;
use crate::error::EngineError;
use crate::event::{Event, EventId, Serial};
use crate::keys;

/// A range over borrowed byte slices implementing `RangeBounds<[u8]>`,
/// required because heed's `Bytes` codec has an unsized `EItem = [u8]`.
/// Lifted verbatim from the teacher's `storage/lmdb.rs::ByteRange`.
pub struct ByteRange<'a> {
    start: &'a [u8],
    end: &'a [u8],
}

impl<'a> ByteRange<'a> {
    pub fn new(start: &'a [u8], end: &'a [u8]) -> Self {
        Self { start, end }
    }
}

impl<'a> RangeBounds<[u8]> for ByteRange<'a> {
    fn start_bound(&self) -> Bound<&[u8]> {
        Bound::Included(self.start)
    }
    fn end_bound(&self) -> Bound<&[u8]> {
        Bound::Included(self.end)
    }
}

/// One `heed::Database` per index family (§3). Each family's keyspace is
/// already disjoint by virtue of being its own named LMDB sub-database, so
/// no manual prefix byte is embedded in key bytes (see DESIGN.md).
#[derive(Clone)]
pub struct Store {
    pub(crate) env: Arc<Env>,
    pub(crate) events: Database<Bytes, Bytes>,
    pub(crate) id_idx: Database<Bytes, Unit>,
    pub(crate) full_id: Database<Bytes, Unit>,
    pub(crate) pubkey_kind_ts: Database<Bytes, Unit>,
    pub(crate) pubkey_ts: Database<Bytes, Unit>,
    pub(crate) kind_ts: Database<Bytes, Unit>,
    pub(crate) ts: Database<Bytes, Unit>,
    pub(crate) tag_value_ts: Database<Bytes, Unit>,
    pub(crate) word: Database<Bytes, Unit>,
    pub(crate) expiration: Database<Bytes, Unit>,
    pub(crate) version: Database<Bytes, Unit>,
    pub(crate) marker: Database<Bytes, Bytes>,
    pub(crate) serial_seq: Database<Bytes, Bytes>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P, map_size_bytes: usize) -> Result<Self, EngineError> {
        fs::create_dir_all(&path)?;

        let mut builder = EnvOpenOptions::new();
        builder.max_dbs(20);
        builder.map_size(map_size_bytes);
        let env = unsafe { builder.open(path)? };

        let mut wtxn = env.write_txn()?;
        let events = env.create_database(&mut wtxn, Some("events"))?;
        let id_idx = env.create_database(&mut wtxn, Some("idx_id"))?;
        let full_id = env.create_database(&mut wtxn, Some("idx_full_id"))?;
        let pubkey_kind_ts = env.create_database(&mut wtxn, Some("idx_pubkey_kind_ts"))?;
        let pubkey_ts = env.create_database(&mut wtxn, Some("idx_pubkey_ts"))?;
        let kind_ts = env.create_database(&mut wtxn, Some("idx_kind_ts"))?;
        let ts = env.create_database(&mut wtxn, Some("idx_ts"))?;
        let tag_value_ts = env.create_database(&mut wtxn, Some("idx_tag_value_ts"))?;
        let word = env.create_database(&mut wtxn, Some("idx_word"))?;
        let expiration = env.create_database(&mut wtxn, Some("idx_expiration"))?;
        let version = env.create_database(&mut wtxn, Some("version"))?;
        let marker = env.create_database(&mut wtxn, Some("marker"))?;
        let serial_seq = env.create_database(&mut wtxn, Some("serial_seq"))?;
        wtxn.commit()?;

        Ok(Self {
            env: Arc::new(env),
            events,
            id_idx,
            full_id,
            pubkey_kind_ts,
            pubkey_ts,
            kind_ts,
            ts,
            tag_value_ts,
            word,
            expiration,
            version,
            marker,
            serial_seq,
        })
    }

    pub fn read_txn(&self) -> Result<heed::RoTxn<'_>, EngineError> {
        Ok(self.env.read_txn()?)
    }

    pub fn write_txn(&self) -> Result<heed::RwTxn<'_>, EngineError> {
        Ok(self.env.write_txn()?)
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        self.env.force_sync()?;
        Ok(())
    }

    /// Materialize the event stored at `serial`, if any.
    pub fn fetch_event(&self, rtxn: &RoTxn, serial: Serial) -> Result<Option<Event>, EngineError> {
        let key = keys::event_key(serial);
        match self.events.get(rtxn, &key)? {
            Some(bytes) => Ok(Some(record::decode(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_event(&self, wtxn: &mut heed::RwTxn, serial: Serial, event: &Event) -> Result<(), EngineError> {
        let key = keys::event_key(serial);
        let record = record::encode(event);
        self.events.put(wtxn, &key, &record)?;
        Ok(())
    }

    pub fn delete_event_record(&self, wtxn: &mut heed::RwTxn, serial: Serial) -> Result<(), EngineError> {
        let key = keys::event_key(serial);
        self.events.delete(wtxn, &key)?;
        Ok(())
    }

    /// Resolve an event id to its serial via the Id index, tolerating the
    /// 8-byte hash truncation by verifying the full id against the
    /// materialized event for every candidate (§3: candidate sets must be
    /// verified when exactness matters).
    pub fn find_serial_by_id(&self, rtxn: &RoTxn, id: &EventId) -> Result<Option<Serial>, EngineError> {
        let (start, end) = keys::id_prefix_range(id);
        let range = ByteRange::new(&start, &end);
        for entry in self.id_idx.range(rtxn, &range)? {
            let (key, _) = entry?;
            let Some(serial) = keys::trailing_serial(key) else {
                continue;
            };
            if let Some(event) = self.fetch_event(rtxn, serial)? {
                if event.id == *id {
                    return Ok(Some(serial));
                }
            }
        }
        Ok(None)
    }
}
