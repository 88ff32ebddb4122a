//! Event storage and query engine for a Nostr relay.
//!
//! `Engine` is the facade transport/subscription layers talk to (§6): it
//! owns the LMDB-backed `Store`, the durable serial allocator, and the
//! admin pubkey set that gates deletion tombstones, and dispatches to the
//! free functions in `write` and `query` under its own transactions.

pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod keys;
pub mod maintenance;
pub mod query;
pub mod store;
pub mod tokenizer;
pub mod write;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use event::{Event, EventId, Kind, PublicKey, Serial, Tag};
pub use query::{Filter, IdPkTs};

use store::{SerialAllocator, Store};

const RELAY_IDENTITY_MARKER: &str = "relay_identity_secret";

/// The engine's public entry point. Cheap to clone: `Store` wraps its
/// `heed::Env` in an `Arc` internally.
#[derive(Clone)]
pub struct Engine {
    store: Arc<Store>,
    allocator: Arc<SerialAllocator>,
    admin_pubkeys: Vec<PublicKey>,
    sweep_interval: Duration,
}

impl Engine {
    /// Open (creating if absent) the LMDB environment at `config.data_dir`,
    /// run any pending schema migrations, and return a ready engine.
    pub fn open(config: &EngineConfig, ctx: &CancelToken) -> Result<Self> {
        ctx.check()?;
        let store = Store::open(&config.data_dir, config.map_size_bytes)?;
        maintenance::run_migrations(&store)?;
        ctx.check()?;

        tracing::info!(data_dir = %config.data_dir, "engine opened");

        Ok(Self {
            store: Arc::new(store),
            allocator: Arc::new(SerialAllocator::new(config.serial_lease_size)),
            admin_pubkeys: config.admin_pubkey_set(),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        })
    }

    /// Flush the environment to disk. The `Store`'s `Env` itself is closed
    /// on drop once every clone of this `Engine` (and any in-flight
    /// maintenance task holding its own `Arc<Store>`) has gone away.
    pub fn close(&self, ctx: &CancelToken) -> Result<()> {
        ctx.check()?;
        self.store.flush()
    }

    /// Spawn the periodic expiration sweeper as a background task, exiting
    /// once `shutdown` fires (§5).
    pub fn spawn_expiration_sweeper(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let period = self.sweep_interval;
        tokio::spawn(maintenance::run_expiration_sweeper(store, period, shutdown))
    }

    pub fn save_event(&self, ctx: &CancelToken, event: &Event) -> Result<Serial> {
        ctx.check()?;
        write::save_event(&self.store, &self.allocator, event, &self.admin_pubkeys)
    }

    pub fn delete_event(&self, ctx: &CancelToken, id: &EventId) -> Result<()> {
        ctx.check()?;
        write::delete_event(&self.store, id)
    }

    pub fn query_events(&self, ctx: &CancelToken, filter: &Filter) -> Result<Vec<Event>> {
        ctx.check()?;
        let rtxn = self.store.read_txn()?;
        query::query_events(&rtxn, &self.store, filter, ctx)
    }

    pub fn query_for_ids(&self, ctx: &CancelToken, filter: &Filter) -> Result<Vec<IdPkTs>> {
        ctx.check()?;
        let rtxn = self.store.read_txn()?;
        query::query_for_ids(&rtxn, &self.store, filter, ctx)
    }

    /// Same plan as `query_for_ids`, trimmed to bare serials for callers
    /// that only need to track or re-fetch events later.
    pub fn query_for_serials(&self, ctx: &CancelToken, filter: &Filter) -> Result<Vec<Serial>> {
        Ok(self.query_for_ids(ctx, filter)?.into_iter().map(|t| t.serial).collect())
    }

    pub fn fetch_event_by_serial(&self, ctx: &CancelToken, serial: Serial) -> Result<Event> {
        ctx.check()?;
        let rtxn = self.store.read_txn()?;
        self.store.fetch_event(&rtxn, serial)?.ok_or(EngineError::NotFound)
    }

    /// Batch-fetch events for `serials` in one read transaction; serials
    /// with no stored event are simply absent from the returned map.
    pub fn fetch_events_by_serials(&self, ctx: &CancelToken, serials: &[Serial]) -> Result<HashMap<Serial, Event>> {
        ctx.check()?;
        let rtxn = self.store.read_txn()?;
        let mut out = HashMap::with_capacity(serials.len());
        for (i, &serial) in serials.iter().enumerate() {
            if i % 256 == 0 {
                ctx.check()?;
            }
            if let Some(event) = self.store.fetch_event(&rtxn, serial)? {
                out.insert(serial, event);
            }
        }
        Ok(out)
    }

    /// §4.5: error with `Blocked` if a still-effective deletion tombstone
    /// covers `event`; `Ok(())` otherwise. Exposed directly so a transport
    /// layer can reject an event before it ever reaches `save_event`.
    pub fn check_for_deleted(&self, ctx: &CancelToken, event: &Event) -> Result<()> {
        ctx.check()?;
        let rtxn = self.store.read_txn()?;
        match write::check_for_deleted(&rtxn, &self.store, event, &self.admin_pubkeys)? {
            Some(by) => Err(EngineError::Blocked { by }),
            None => Ok(()),
        }
    }

    /// §4.5 final paragraph, run standalone (the write pipeline already
    /// invokes this for every admitted kind-5 event).
    pub fn process_delete(&self, ctx: &CancelToken, deletion: &Event) -> Result<()> {
        ctx.check()?;
        let mut wtxn = self.store.write_txn()?;
        write::process_delete(&mut wtxn, &self.store, deletion)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn set_marker(&self, ctx: &CancelToken, name: &str, value: &[u8]) -> Result<()> {
        ctx.check()?;
        maintenance::set_marker(&self.store, name, value)
    }

    pub fn get_marker(&self, ctx: &CancelToken, name: &str) -> Result<Option<Vec<u8>>> {
        ctx.check()?;
        maintenance::get_marker(&self.store, name)
    }

    pub fn has_marker(&self, ctx: &CancelToken, name: &str) -> Result<bool> {
        ctx.check()?;
        maintenance::has_marker(&self.store, name)
    }

    pub fn delete_marker(&self, ctx: &CancelToken, name: &str) -> Result<()> {
        ctx.check()?;
        maintenance::delete_marker(&self.store, name)
    }

    /// The relay's own 32-byte secret, generated once on first use and
    /// persisted as a marker so restarts keep the same identity.
    pub fn get_or_create_relay_identity_secret(&self, ctx: &CancelToken) -> Result<[u8; 32]> {
        ctx.check()?;
        if let Some(existing) = self.get_marker(ctx, RELAY_IDENTITY_MARKER)? {
            if existing.len() == 32 {
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&existing);
                return Ok(secret);
            }
            tracing::warn!("relay identity marker had unexpected length, regenerating");
        }

        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        self.set_marker(ctx, RELAY_IDENTITY_MARKER, &secret)?;
        tracing::info!("generated new relay identity secret");
        Ok(secret)
    }
}
