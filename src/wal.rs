use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::context::EngineContext;
use crate::datafile::DatafilePair;
use crate::errors::JournalError;
use crate::journal_v1::{
    BLOCK_SIZE, MAX_PAGES_PER_EXTENT, STORE_DATA, STORE_PADDING, encode_transaction,
    transaction_size,
};

/// A write-ahead buffer carrying one or more framed transactions. The buffer
/// is always an exact multiple of the block size; `used <= buf_size`.
pub struct Wal {
    transaction_id: u64,
    buf: Vec<u8>,
    used: usize,
}

impl Wal {
    /// Id assigned to this buffer's first transaction at acquire time.
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    pub fn buf_size(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Packs one `STORE_DATA` transaction at the current fill position.
    pub fn append_store_data(
        &mut self,
        id: u64,
        data: &crate::journal_v1::StoreData,
    ) -> Result<(), JournalError> {
        if data.descriptors.len() > MAX_PAGES_PER_EXTENT {
            return Err(JournalError::Corruption(format!(
                "{} pages in one extent, the journal carries at most {MAX_PAGES_PER_EXTENT}",
                data.descriptors.len()
            )));
        }
        let mut payload = Vec::with_capacity(data.payload_size());
        data.encode_payload(&mut payload);
        if self.used + transaction_size(payload.len()) > self.buf.len() {
            return Err(JournalError::Corruption(
                "transaction does not fit in the acquired WAL buffer".into(),
            ));
        }
        let tx = encode_transaction(id, STORE_DATA, &payload);
        self.buf[self.used..self.used + tx.len()].copy_from_slice(&tx);
        self.used += tx.len();
        Ok(())
    }
}

/// Pool of WAL buffers, recycled across flushes to keep allocations off the
/// ingest path.
#[derive(Default)]
pub struct WalPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl WalPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_buffer(&self, buf_size: usize) -> Vec<u8> {
        let mut free = self.free.lock();
        let reusable = free.iter().position(|b| b.capacity() >= buf_size);
        let mut buf = match reusable {
            Some(i) => free.swap_remove(i),
            None => Vec::with_capacity(buf_size),
        };
        drop(free);
        buf.clear();
        buf.resize(buf_size, 0);
        buf
    }

    fn release_buffer(&self, buf: Vec<u8>) {
        self.free.lock().push(buf);
    }
}

fn round_to_blocks(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

impl EngineContext {
    /// Acquires a zeroed WAL buffer of at least `size` bytes, rounded up to
    /// the block alignment, and assigns it the next transaction id. Returns
    /// `None` while the engine is quiescing.
    pub fn wal_get(&self, size: usize) -> Option<Wal> {
        if self.is_quiescing() {
            return None;
        }
        let buf_size = round_to_blocks(size.max(1));
        Some(Wal {
            transaction_id: self.next_transaction_id(),
            buf: self.wal_pool.acquire_buffer(buf_size),
            used: 0,
        })
    }

    pub fn wal_release(&self, wal: Wal) {
        self.wal_pool.release_buffer(wal.buf);
    }
}

/// Hands a packed WAL buffer to the flusher: one asynchronous positional
/// write of `buf_size` bytes at the journal's current append position. The
/// position advances at submission, so flushes for one journal land in the
/// order their positions were assigned. The completion always releases the
/// buffer back to the pool and decrements the in-flight gauge; write errors
/// are counted, not retried; the datafile layer decides recovery.
pub fn wal_flush_transaction_buffer(
    ctx: &Arc<EngineContext>,
    datafile: &Arc<DatafilePair>,
    mut wal: Wal,
    handle: &tokio::runtime::Handle,
) -> tokio::task::JoinHandle<()> {
    let journal = datafile.journal();
    if wal.used < wal.buf.len() {
        // Simulate an empty transaction so replay skips the rest of the block.
        let used = wal.used;
        wal.buf[used] = STORE_PADDING;
    }

    let buf_size = wal.buf.len() as u64;
    let pos = journal.advance_pos(buf_size);
    let file = journal.file_handle();

    ctx.add_disk_space(buf_size);
    ctx.telemetry.io_write_bytes.fetch_add(buf_size, Ordering::Relaxed);
    ctx.telemetry.io_write_requests.fetch_add(1, Ordering::Relaxed);
    ctx.telemetry
        .extents_currently_being_flushed
        .fetch_add(1, Ordering::Relaxed);

    let ctx = ctx.clone();
    handle.spawn_blocking(move || {
        use std::os::unix::fs::FileExt;
        match file {
            Some(file) => {
                if let Err(e) = file.write_all_at(&wal.buf, pos) {
                    ctx.telemetry.io_errors.fetch_add(1, Ordering::Relaxed);
                    log::error!("journal write at {pos}: {e}");
                } else {
                    log::debug!("journal block was written to disk at {pos}");
                }
            }
            None => {
                ctx.telemetry.io_errors.fetch_add(1, Ordering::Relaxed);
                log::error!("journal has no open file, dropping WAL flush at {pos}");
            }
        }
        ctx.telemetry
            .extents_currently_being_flushed
            .fetch_sub(1, Ordering::Relaxed);
        ctx.wal_release(wal);
    })
}
