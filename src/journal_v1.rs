use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use memmap2::Mmap;
use uuid::Uuid;

use crate::context::EngineContext;
use crate::datafile::DatafilePair;
use crate::errors::JournalError;
use crate::paths;
use crate::registry::MetricEntry;
use crate::types::{PAGE_TYPE_MAX, now_realtime_sec, validate_page_descriptor};

pub const BLOCK_SIZE: usize = 4096;
pub const READAHEAD_BYTES: usize = 256 * BLOCK_SIZE;

pub const JF_SUPERBLOCK_SIZE: usize = BLOCK_SIZE;
pub const JF_MAGIC: &[u8] = b"chronolite-journal";
pub const JF_VERSION: &[u8] = b"1.0";
const JF_MAGIC_FIELD_SIZE: usize = 32;
const JF_VERSION_FIELD_SIZE: usize = 16;

pub const TRANSACTION_HEADER_SIZE: usize = 16;
pub const TRANSACTION_TRAILER_SIZE: usize = 4;

pub const STORE_PADDING: u8 = 0;
pub const STORE_DATA: u8 = 1;

pub const STORE_DATA_FIXED_SIZE: usize = 13;
pub const PAGE_DESCRIPTOR_SIZE: usize = 41;

/// Transactions must stay below one block until the replay cursor learns to
/// follow records across block boundaries.
pub const MAX_PAGES_PER_EXTENT: usize = 64;

// ---------------------------------------------------------------------------
// Superblock
// ---------------------------------------------------------------------------

fn superblock_bytes() -> Vec<u8> {
    let mut sb = vec![0u8; JF_SUPERBLOCK_SIZE];
    sb[..JF_MAGIC.len()].copy_from_slice(JF_MAGIC);
    sb[JF_MAGIC_FIELD_SIZE..JF_MAGIC_FIELD_SIZE + JF_VERSION.len()].copy_from_slice(JF_VERSION);
    sb
}

fn field_matches(field: &[u8], expected: &[u8]) -> bool {
    field.len() > expected.len()
        && &field[..expected.len()] == expected
        && field[expected.len()] == 0
}

/// Writes the aligned superblock at offset 0 of a freshly created journal.
pub fn write_superblock(file: &File) -> std::io::Result<()> {
    file.write_all_at(&superblock_bytes(), 0)
}

/// Verifies the magic and version strings of an existing journal.
pub fn check_superblock(file: &File) -> Result<(), JournalError> {
    let mut sb = vec![0u8; JF_SUPERBLOCK_SIZE];
    file.read_exact_at(&mut sb, 0)?;
    if !field_matches(&sb[..JF_MAGIC_FIELD_SIZE], JF_MAGIC)
        || !field_matches(&sb[JF_MAGIC_FIELD_SIZE..JF_MAGIC_FIELD_SIZE + JF_VERSION_FIELD_SIZE], JF_VERSION)
    {
        return Err(JournalError::InvalidFormat("journal superblock mismatch".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transaction codec
// ---------------------------------------------------------------------------

/// One page recorded inside a `STORE_DATA` transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub uuid: Uuid,
    pub page_length: u32,
    pub start_time_s: i64,
    pub end_time_s: i64,
    pub update_every_s: u32,
    pub page_type: u8,
}

/// Payload of a `STORE_DATA` transaction: one flushed extent and the pages it
/// contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreData {
    pub extent_offset: u64,
    pub extent_size: u32,
    pub descriptors: Vec<PageDescriptor>,
}

impl StoreData {
    pub fn payload_size(&self) -> usize {
        STORE_DATA_FIXED_SIZE + self.descriptors.len() * PAGE_DESCRIPTOR_SIZE
    }

    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.extent_offset.to_le_bytes());
        out.extend_from_slice(&self.extent_size.to_le_bytes());
        out.push(self.descriptors.len() as u8);
        for d in &self.descriptors {
            out.extend_from_slice(d.uuid.as_bytes());
            out.extend_from_slice(&d.page_length.to_le_bytes());
            out.extend_from_slice(&d.start_time_s.to_le_bytes());
            out.extend_from_slice(&d.end_time_s.to_le_bytes());
            out.extend_from_slice(&d.update_every_s.to_le_bytes());
            out.push(d.page_type);
        }
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, JournalError> {
        if payload.len() < STORE_DATA_FIXED_SIZE {
            return Err(JournalError::Corruption("store-data payload shorter than its fixed part".into()));
        }
        let extent_offset = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let extent_size = u32::from_le_bytes(payload[8..12].try_into().unwrap());
        let count = payload[12] as usize;
        let needed = STORE_DATA_FIXED_SIZE + count * PAGE_DESCRIPTOR_SIZE;
        if needed > payload.len() {
            return Err(JournalError::Corruption("corrupted transaction payload".into()));
        }
        let mut descriptors = Vec::with_capacity(count);
        let mut at = STORE_DATA_FIXED_SIZE;
        for _ in 0..count {
            let d = &payload[at..at + PAGE_DESCRIPTOR_SIZE];
            descriptors.push(PageDescriptor {
                uuid: Uuid::from_slice(&d[0..16]).expect("16-byte uuid slice"),
                page_length: u32::from_le_bytes(d[16..20].try_into().unwrap()),
                start_time_s: i64::from_le_bytes(d[20..28].try_into().unwrap()),
                end_time_s: i64::from_le_bytes(d[28..36].try_into().unwrap()),
                update_every_s: u32::from_le_bytes(d[36..40].try_into().unwrap()),
                page_type: d[40],
            });
            at += PAGE_DESCRIPTOR_SIZE;
        }
        Ok(Self { extent_offset, extent_size, descriptors })
    }
}

pub fn transaction_size(payload_length: usize) -> usize {
    TRANSACTION_HEADER_SIZE + payload_length + TRANSACTION_TRAILER_SIZE
}

/// Frames a payload as `header || payload || crc trailer`. The CRC covers
/// header and payload.
pub fn encode_transaction(id: u64, transaction_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(transaction_size(payload.len()));
    out.extend_from_slice(&id.to_le_bytes());
    out.push(transaction_type);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out
}

/// Outcome of decoding one transaction at the replay cursor.
#[derive(Debug)]
pub enum ReplayedTransaction {
    /// Not enough bytes left for a header; advance to the next block.
    UnknownSize,
    /// Padding marker; the rest of the block is unused.
    Padding,
    /// Record dropped (bad size, CRC mismatch or unknown type); the cursor
    /// still advances by the size the record claimed.
    Skipped { size: usize, id: u64 },
    Valid { size: usize, id: u64, data: StoreData },
}

/// Decodes one transaction from the start of `buf`, tolerating corruption as
/// the replay rules demand.
pub fn replay_transaction(buf: &[u8]) -> ReplayedTransaction {
    if buf.len() < TRANSACTION_HEADER_SIZE {
        return ReplayedTransaction::UnknownSize;
    }
    let id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let transaction_type = buf[8];
    if transaction_type == STORE_PADDING {
        log::debug!("skipping journal padding");
        return ReplayedTransaction::Padding;
    }
    let payload_length = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
    let size = transaction_size(payload_length);
    if size > buf.len() {
        log::error!("corrupted transaction record, skipping");
        return ReplayedTransaction::Skipped { size, id };
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..TRANSACTION_HEADER_SIZE + payload_length]);
    let crc = hasher.finalize();
    let stored = u32::from_le_bytes(
        buf[TRANSACTION_HEADER_SIZE + payload_length..size].try_into().unwrap(),
    );
    if crc != stored {
        log::error!("transaction {id} was read from disk, CRC32 check FAILED");
        return ReplayedTransaction::Skipped { size, id };
    }
    if transaction_type != STORE_DATA {
        log::error!("unknown transaction type {transaction_type}, skipping record");
        return ReplayedTransaction::Skipped { size, id };
    }
    match StoreData::decode_payload(&buf[TRANSACTION_HEADER_SIZE..TRANSACTION_HEADER_SIZE + payload_length]) {
        Ok(data) => ReplayedTransaction::Valid { size, id, data },
        Err(e) => {
            log::error!("transaction {id}: {e}");
            ReplayedTransaction::Skipped { size, id }
        }
    }
}

// ---------------------------------------------------------------------------
// Replay engine
// ---------------------------------------------------------------------------

/// Feeds the pages of one valid `STORE_DATA` record into the registry and the
/// open-pages cache.
fn restore_extent_metadata(ctx: &EngineContext, datafile: &DatafilePair, data: &StoreData) {
    let now_s = now_realtime_sec();
    let section = ctx.section();
    for d in &data.descriptors {
        if d.page_type > PAGE_TYPE_MAX {
            if ctx.telemetry.first_unknown_page_type(d.page_type) {
                log::error!("unknown page type {} encountered", d.page_type);
            }
            continue;
        }

        let metric = ctx.registry.get_and_acquire(&d.uuid, section);
        let known_update_every = metric.as_ref().map(|m| m.update_every_s()).unwrap_or(0);
        let vd = validate_page_descriptor(
            &d.uuid,
            d.page_length,
            d.start_time_s,
            d.end_time_s,
            d.update_every_s,
            d.page_type,
            now_s,
            known_update_every,
        );
        if !vd.data_on_disk_valid {
            continue;
        }

        let (metric, update_retention) = match metric {
            Some(m) => (m, true),
            None => {
                let (m, added) = ctx.registry.add_and_acquire(MetricEntry {
                    uuid: d.uuid,
                    section,
                    first_time_s: vd.start_time_s,
                    last_time_s: vd.end_time_s,
                    update_every_s: vd.update_every_s,
                });
                (m, !added)
            }
        };
        if update_retention {
            ctx.registry
                .expand_retention(&metric, vd.start_time_s, vd.end_time_s, vd.update_every_s);
        }

        ctx.open_cache.add_hot_page(
            section,
            metric.id(),
            vd.start_time_s,
            vd.end_time_s,
            vd.update_every_s,
            datafile,
            data.extent_offset,
            data.extent_size,
            vd.page_length,
        );
    }
}

fn align_to_next_block(pos: usize) -> usize {
    (pos / BLOCK_SIZE) * BLOCK_SIZE + BLOCK_SIZE
}

/// Walks one chunk of journal bytes, replaying every decodable transaction.
/// Returns the maximum transaction id observed in the chunk.
fn replay_chunk(ctx: &EngineContext, datafile: &DatafilePair, chunk: &[u8]) -> u64 {
    let mut max_id = 0u64;
    let mut pos = 0usize;
    while pos < chunk.len() {
        match replay_transaction(&chunk[pos..]) {
            ReplayedTransaction::UnknownSize | ReplayedTransaction::Padding => {
                pos = align_to_next_block(pos);
            }
            ReplayedTransaction::Skipped { size, id } => {
                max_id = max_id.max(id);
                pos += size;
            }
            ReplayedTransaction::Valid { size, id, data } => {
                max_id = max_id.max(id);
                restore_extent_metadata(ctx, datafile, &data);
                pos += size;
            }
        }
    }
    max_id
}

/// Iterates the journal's transactions and populates the registry and the
/// open-pages cache, reading either through a shared mapping or through
/// aligned readahead chunks. Returns the maximum transaction id discovered.
fn iterate_transactions(
    ctx: &EngineContext,
    datafile: &DatafilePair,
    file: &File,
    file_size: u64,
    map: Option<&Mmap>,
) -> u64 {
    let mut max_id = 1u64;
    let mut read_buf = if map.is_none() { vec![0u8; READAHEAD_BYTES] } else { Vec::new() };

    let mut pos = JF_SUPERBLOCK_SIZE as u64;
    while pos < file_size {
        let chunk_len = (READAHEAD_BYTES as u64).min(file_size - pos) as usize;
        let chunk: &[u8] = match map {
            Some(m) => &m[pos as usize..pos as usize + chunk_len],
            None => {
                if let Err(e) = file.read_exact_at(&mut read_buf[..chunk_len], pos) {
                    log::error!("journal read at {pos}: {e}");
                    ctx.telemetry.io_errors.fetch_add(1, Ordering::Relaxed);
                    return max_id;
                }
                ctx.telemetry.io_read_requests.fetch_add(1, Ordering::Relaxed);
                ctx.telemetry.io_read_bytes.fetch_add(chunk_len as u64, Ordering::Relaxed);
                &read_buf[..chunk_len]
            }
        };
        max_id = max_id.max(replay_chunk(ctx, datafile, chunk));
        pos += READAHEAD_BYTES as u64;
    }
    max_id
}

/// Opens and replays a v1 journal. On success the journal's file handle and
/// append position are set, the registry and open-pages cache are populated,
/// and the context's transaction id is bumped past the largest id seen.
pub fn replay_journal(ctx: &EngineContext, datafile: &DatafilePair) -> Result<u64, JournalError> {
    let path = paths::journalfile_path(&ctx.config.dbfiles_path, datafile.tier, datafile.fileno);
    let file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
    };

    let raw_size = file.metadata()?.len();
    if raw_size < JF_SUPERBLOCK_SIZE as u64 {
        return Err(JournalError::InvalidFormat(format!(
            "journal {} is smaller than its superblock",
            path.display()
        )));
    }
    let file_size = (raw_size / BLOCK_SIZE as u64) * BLOCK_SIZE as u64;

    if let Err(e) = check_superblock(&file) {
        log::info!("invalid journal file '{}'; superblock check failed", path.display());
        return Err(e);
    }
    ctx.telemetry.io_read_bytes.fetch_add(JF_SUPERBLOCK_SIZE as u64, Ordering::Relaxed);
    ctx.telemetry.io_read_requests.fetch_add(1, Ordering::Relaxed);

    let file = Arc::new(file);
    let journal = datafile.journal();
    journal.set_file(Some(file.clone()));
    journal.set_pos(file_size);

    // Mapping the whole file is the fast path; fall back to positional reads.
    let map = unsafe { Mmap::map(&*file) }.ok();
    log::info!(
        "loading journal file '{}' using {}",
        path.display(),
        if map.is_some() { "mmap" } else { "positional reads" }
    );

    let max_id = iterate_transactions(ctx, datafile, &file, file_size, map.as_ref());
    ctx.bump_transaction_id_to(max_id + 1);

    log::info!("journal file '{}' loaded (size:{file_size})", path.display());
    Ok(max_id)
}
