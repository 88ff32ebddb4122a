use std::sync::Mutex;

use heed::RwTxn;

use crate::error::EngineError;
use crate::event::Serial;

use super::lmdb::Store;

const SEQ_KEY: &[u8] = b"next_serial";

struct Lease {
    next: u64,
    end: u64, // exclusive
}

/// Durable 40-bit counter, leased in batches (§4.2). A dedicated single-key
/// LMDB database (`serial_seq`) holds the next unleased serial; refilling
/// the lease bumps it by `lease_size` under the caller's own write
/// transaction (the same one that will go on to write the event and its
/// indexes, so a refill never opens a second writer), and in-process
/// callers hand out serials from that lease without touching the store
/// again until it is exhausted. On restart, any unleased serials beyond
/// the last committed high-water mark are simply never handed out again.
pub struct SerialAllocator {
    lease_size: u64,
    lease: Mutex<Lease>,
}

impl SerialAllocator {
    pub fn new(lease_size: u64) -> Self {
        Self {
            lease_size: lease_size.max(1),
            lease: Mutex::new(Lease { next: 0, end: 0 }),
        }
    }

    /// Allocate the next serial, refilling the lease inside `wtxn` if it is
    /// exhausted. `wtxn` is not committed here; the caller commits once,
    /// together with whatever else the transaction is writing.
    pub fn allocate(&self, wtxn: &mut RwTxn, store: &Store) -> Result<Serial, EngineError> {
        let mut lease = self.lease.lock().expect("serial allocator mutex poisoned");

        if lease.next >= lease.end {
            let current = match store.serial_seq.get(wtxn, SEQ_KEY)? {
                Some(bytes) => u64::from_be_bytes(
                    bytes
                        .try_into()
                        .map_err(|_| EngineError::Corrupt("serial_seq value malformed".into()))?,
                ),
                None => 0,
            };
            let new_end = current + self.lease_size;
            store.serial_seq.put(wtxn, SEQ_KEY, &new_end.to_be_bytes())?;

            lease.next = current;
            lease.end = new_end;

            tracing::debug!(lease_start = current, lease_end = new_end, "leased new serial batch");
        }

        let serial = lease.next;
        lease.next += 1;
        Ok(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocates_monotonically_increasing_serials() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let alloc = SerialAllocator::new(4);

        let mut serials = Vec::new();
        for _ in 0..10 {
            let mut wtxn = store.write_txn().unwrap();
            let serial = alloc.allocate(&mut wtxn, &store).unwrap();
            wtxn.commit().unwrap();
            serials.push(serial);
        }
        for w in serials.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert_eq!(serials[0], 0);
    }

    #[test]
    fn survives_reopen_without_reusing_serials() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
            let alloc = SerialAllocator::new(4);
            for _ in 0..3 {
                let mut wtxn = store.write_txn().unwrap();
                alloc.allocate(&mut wtxn, &store).unwrap();
                wtxn.commit().unwrap();
            }
            // lease has one unused serial (index 3) that is discarded on "restart"
        }
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let alloc = SerialAllocator::new(4);
        let mut wtxn = store.write_txn().unwrap();
        let next = alloc.allocate(&mut wtxn, &store).unwrap();
        wtxn.commit().unwrap();
        assert!(next >= 4, "must not reuse serials from the prior lease");
    }
}
