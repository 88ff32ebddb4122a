//! Storage facade: the embedded ordered KV store contract (§5) realized
//! over `heed`/LMDB, plus the 40-bit serial allocator (§4.2).
//!
//! Grounded in the teacher's `storage/lmdb.rs` (`LmdbStore::new`, the
//! `ByteRange` adapter for heed's unsized `Bytes` codec, and per-family
//! `Database` handles), generalized from 5 index families to the full
//! set named in §3.

mod allocator;
mod lmdb;

pub use allocator::SerialAllocator;
pub use lmdb::{ByteRange, Store};
