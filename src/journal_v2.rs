use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use memmap2::{Mmap, MmapMut};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::datafile::DatafilePair;
use crate::journal_v1::BLOCK_SIZE;
use crate::journalfile::MappedIndex;
use crate::open_cache::{JournalExtentInfo, JournalMetricInfo};
use crate::paths;
use crate::types::{MetricId, SectionId, now_realtime_usec};

pub const JOURNAL_V2_MAGIC: u32 = 0x0124_0601;
pub const JOURNAL_V2_REBUILD_MAGIC: u32 = 0x0024_0601;
pub const JOURNAL_V2_SKIP_MAGIC: u32 = 0x0224_0601;

pub const V2_HEADER_SIZE: usize = 72;
/// The header region is padded to one block; the extent list starts there.
pub const V2_HEADER_PADDED_SIZE: usize = BLOCK_SIZE;
pub const EXTENT_LIST_ENTRY_SIZE: usize = 16;
pub const METRIC_LIST_ENTRY_SIZE: usize = 32;
pub const PAGE_HEADER_SIZE: usize = 32;
pub const PAGE_LIST_ENTRY_SIZE: usize = 19;
pub const BLOCK_TRAILER_SIZE: usize = 4;

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

// ---------------------------------------------------------------------------
// On-disk records
// ---------------------------------------------------------------------------

/// The v2 file header. The on-disk record carries two reserved fields (a u32
/// after the magic and a trailing u64 scratch slot); both are always zero on
/// disk and excluded here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct V2Header {
    pub magic: u32,
    pub start_time_ut: u64,
    pub end_time_ut: u64,
    pub extent_count: u32,
    pub extent_offset: u32,
    pub extent_trailer_offset: u32,
    pub metric_count: u32,
    pub metric_offset: u32,
    pub metric_trailer_offset: u32,
    pub page_count: u32,
    pub page_offset: u32,
    pub total_file_size: u32,
    pub original_file_size: u32,
}

impl V2Header {
    pub fn encode(&self) -> [u8; V2_HEADER_SIZE] {
        let mut out = [0u8; V2_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        // out[4..8] reserved
        out[8..16].copy_from_slice(&self.start_time_ut.to_le_bytes());
        out[16..24].copy_from_slice(&self.end_time_ut.to_le_bytes());
        out[24..28].copy_from_slice(&self.extent_count.to_le_bytes());
        out[28..32].copy_from_slice(&self.extent_offset.to_le_bytes());
        out[32..36].copy_from_slice(&self.extent_trailer_offset.to_le_bytes());
        out[36..40].copy_from_slice(&self.metric_count.to_le_bytes());
        out[40..44].copy_from_slice(&self.metric_offset.to_le_bytes());
        out[44..48].copy_from_slice(&self.metric_trailer_offset.to_le_bytes());
        out[48..52].copy_from_slice(&self.page_count.to_le_bytes());
        out[52..56].copy_from_slice(&self.page_offset.to_le_bytes());
        out[56..60].copy_from_slice(&self.total_file_size.to_le_bytes());
        out[60..64].copy_from_slice(&self.original_file_size.to_le_bytes());
        // out[64..72] reserved pointer slot, zero on disk
        out
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            start_time_ut: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            end_time_ut: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            extent_count: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            extent_offset: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            extent_trailer_offset: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            metric_count: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            metric_offset: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            metric_trailer_offset: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
            page_count: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
            page_offset: u32::from_le_bytes(buf[52..56].try_into().unwrap()),
            total_file_size: u32::from_le_bytes(buf[56..60].try_into().unwrap()),
            original_file_size: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentListEntry {
    pub file_index: u16,
    pub datafile_offset: u64,
    pub datafile_size: u32,
    pub pages: u16,
}

impl ExtentListEntry {
    pub fn encode(&self) -> [u8; EXTENT_LIST_ENTRY_SIZE] {
        let mut out = [0u8; EXTENT_LIST_ENTRY_SIZE];
        out[0..2].copy_from_slice(&self.file_index.to_le_bytes());
        out[2..10].copy_from_slice(&self.datafile_offset.to_le_bytes());
        out[10..14].copy_from_slice(&self.datafile_size.to_le_bytes());
        out[14..16].copy_from_slice(&self.pages.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            file_index: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            datafile_offset: u64::from_le_bytes(buf[2..10].try_into().unwrap()),
            datafile_size: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
            pages: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricListEntry {
    pub uuid: Uuid,
    pub entries: u32,
    pub page_offset: u32,
    pub delta_start_s: u32,
    pub delta_end_s: u32,
}

impl MetricListEntry {
    pub fn encode(&self) -> [u8; METRIC_LIST_ENTRY_SIZE] {
        let mut out = [0u8; METRIC_LIST_ENTRY_SIZE];
        out[0..16].copy_from_slice(self.uuid.as_bytes());
        out[16..20].copy_from_slice(&self.entries.to_le_bytes());
        out[20..24].copy_from_slice(&self.page_offset.to_le_bytes());
        out[24..28].copy_from_slice(&self.delta_start_s.to_le_bytes());
        out[28..32].copy_from_slice(&self.delta_end_s.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            uuid: Uuid::from_slice(&buf[0..16]).expect("16-byte uuid slice"),
            entries: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            page_offset: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            delta_start_s: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            delta_end_s: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        }
    }
}

/// Header of one per-metric page list. On disk the `crc` field holds
/// `JOURNAL_V2_MAGIC` so a page block can be recognized from a page-list
/// pointer; `checksum` covers the header bytes with `checksum` itself zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2PageHeader {
    pub uuid: Uuid,
    pub entries: u32,
    pub uuid_offset: u32,
}

impl V2PageHeader {
    fn encode_with(&self, crc_field: u32, checksum: u32) -> [u8; PAGE_HEADER_SIZE] {
        let mut out = [0u8; PAGE_HEADER_SIZE];
        out[0..16].copy_from_slice(self.uuid.as_bytes());
        out[16..20].copy_from_slice(&self.entries.to_le_bytes());
        out[20..24].copy_from_slice(&self.uuid_offset.to_le_bytes());
        out[24..28].copy_from_slice(&crc_field.to_le_bytes());
        out[28..32].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    pub fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let checksum = crc32(&self.encode_with(JOURNAL_V2_MAGIC, 0));
        self.encode_with(JOURNAL_V2_MAGIC, checksum)
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            uuid: Uuid::from_slice(&buf[0..16]).expect("16-byte uuid slice"),
            entries: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            uuid_offset: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        }
    }

    /// Verifies the stored checksum of a raw 32-byte page header.
    pub fn verify(buf: &[u8]) -> bool {
        let stored = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        let mut local = [0u8; PAGE_HEADER_SIZE];
        local.copy_from_slice(&buf[..PAGE_HEADER_SIZE]);
        local[24..28].copy_from_slice(&JOURNAL_V2_MAGIC.to_le_bytes());
        local[28..32].fill(0);
        crc32(&local) == stored
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageListEntry {
    pub delta_start_s: u32,
    pub delta_end_s: u32,
    pub extent_index: u32,
    pub update_every_s: u32,
    pub page_length: u16,
    pub page_type: u8,
}

impl PageListEntry {
    pub fn encode(&self) -> [u8; PAGE_LIST_ENTRY_SIZE] {
        let mut out = [0u8; PAGE_LIST_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.delta_start_s.to_le_bytes());
        out[4..8].copy_from_slice(&self.delta_end_s.to_le_bytes());
        out[8..12].copy_from_slice(&self.extent_index.to_le_bytes());
        out[12..16].copy_from_slice(&self.update_every_s.to_le_bytes());
        out[16..18].copy_from_slice(&self.page_length.to_le_bytes());
        out[18] = self.page_type;
        out
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            delta_start_s: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            delta_end_s: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            extent_index: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            update_every_s: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            page_length: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            page_type: buf[18],
        }
    }
}

/// Size of one per-metric page block: header, entries, trailer.
pub fn page_block_size(entries: usize) -> usize {
    PAGE_HEADER_SIZE + entries * PAGE_LIST_ENTRY_SIZE + BLOCK_TRAILER_SIZE
}

// ---------------------------------------------------------------------------
// Validation and loading
// ---------------------------------------------------------------------------

/// Outcome of a v2 load attempt. Anything but `Loaded` means the caller
/// decides between replaying v1 and leaving the file alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2LoadStatus {
    Loaded,
    /// The file is unusable (bad magic, size or CRC); rebuild from v1.
    Invalid,
    /// The file explicitly asks to be rebuilt.
    Rebuild,
    /// A previous migration failed here; leave the file alone.
    Skip,
}

fn section_in_bounds(offset: u32, len: u64, file_size: usize) -> bool {
    (offset as u64) + len <= file_size as u64
}

/// Verifies the multi-section structure of a mapped v2 file. Returns the
/// decoded header on success.
fn check_journal_v2_file(data: &[u8], original_size: u32, deep_check: bool) -> Result<V2Header, V2LoadStatus> {
    let header = V2Header::decode(&data[..V2_HEADER_SIZE]);

    match header.magic {
        JOURNAL_V2_REBUILD_MAGIC => return Err(V2LoadStatus::Rebuild),
        JOURNAL_V2_SKIP_MAGIC => return Err(V2LoadStatus::Skip),
        JOURNAL_V2_MAGIC => {}
        _ => return Err(V2LoadStatus::Invalid),
    }

    if header.total_file_size as usize != data.len() {
        return Err(V2LoadStatus::Invalid);
    }
    if original_size != 0 && header.original_file_size != original_size {
        return Err(V2LoadStatus::Invalid);
    }

    // Every offset the header advertises must stay inside the mapping before
    // any section is sliced.
    let extent_len = header.extent_count as u64 * EXTENT_LIST_ENTRY_SIZE as u64;
    let metric_len = header.metric_count as u64 * METRIC_LIST_ENTRY_SIZE as u64;
    if !section_in_bounds(header.extent_offset, extent_len, data.len())
        || !section_in_bounds(header.extent_trailer_offset, BLOCK_TRAILER_SIZE as u64, data.len())
        || !section_in_bounds(header.metric_offset, metric_len, data.len())
        || !section_in_bounds(header.metric_trailer_offset, BLOCK_TRAILER_SIZE as u64, data.len())
    {
        return Err(V2LoadStatus::Invalid);
    }

    let file_trailer = &data[data.len() - BLOCK_TRAILER_SIZE..];
    if crc32(&data[..V2_HEADER_SIZE]) != u32::from_le_bytes(file_trailer.try_into().unwrap()) {
        log::error!("file CRC32 check FAILED");
        return Err(V2LoadStatus::Invalid);
    }

    let extent_start = header.extent_offset as usize;
    let extent_region = &data[extent_start..extent_start + extent_len as usize];
    let extent_trailer = &data[header.extent_trailer_offset as usize..][..BLOCK_TRAILER_SIZE];
    if crc32(extent_region) != u32::from_le_bytes(extent_trailer.try_into().unwrap()) {
        log::error!("extent list CRC32 check FAILED");
        return Err(V2LoadStatus::Invalid);
    }

    let metric_start = header.metric_offset as usize;
    let metric_region = &data[metric_start..metric_start + metric_len as usize];
    let metric_trailer = &data[header.metric_trailer_offset as usize..][..BLOCK_TRAILER_SIZE];
    if crc32(metric_region) != u32::from_le_bytes(metric_trailer.try_into().unwrap()) {
        log::error!("metric list CRC32 check FAILED");
        return Err(V2LoadStatus::Invalid);
    }

    if !deep_check {
        return Ok(header);
    }

    // Verify the complete per-metric chain.
    log::info!("checking {} metrics that exist in the journal", header.metric_count);
    let mut verified = 0usize;
    let mut total_pages = 0usize;
    for i in 0..header.metric_count as usize {
        let entry = MetricListEntry::decode(&metric_region[i * METRIC_LIST_ENTRY_SIZE..]);
        let page_offset = entry.page_offset as usize;
        let block = page_block_size(entry.entries as usize);
        if page_offset + block > data.len() {
            log::info!("verification failed, page block of metric {} leaves the mapping", entry.uuid);
            return Err(V2LoadStatus::Invalid);
        }
        let raw_header = &data[page_offset..page_offset + PAGE_HEADER_SIZE];
        if !V2PageHeader::verify(raw_header) {
            continue;
        }
        let page_header = V2PageHeader::decode(raw_header);
        if page_header.uuid != entry.uuid || page_header.entries != entry.entries {
            continue;
        }
        let list_start = page_offset + PAGE_HEADER_SIZE;
        let list_len = entry.entries as usize * PAGE_LIST_ENTRY_SIZE;
        let trailer = &data[list_start + list_len..][..BLOCK_TRAILER_SIZE];
        if crc32(&data[list_start..list_start + list_len]) == u32::from_le_bytes(trailer.try_into().unwrap()) {
            verified += 1;
            total_pages += entry.entries as usize;
        }
    }
    if verified != header.metric_count as usize {
        log::info!(
            "verification failed, total entries {}, verified {verified}",
            header.metric_count
        );
        return Err(V2LoadStatus::Invalid);
    }
    log::info!(
        "verification succeeded, total entries {}, verified {verified} ({total_pages} total pages)",
        header.metric_count
    );
    Ok(header)
}

#[cfg(target_os = "linux")]
fn advise_mapping(map: &Mmap) {
    use memmap2::Advice;
    if let Err(e) = map.advise(Advice::DontFork) {
        log::debug!("madvise(DONTFORK): {e}");
    }
    if let Err(e) = map.advise(Advice::DontDump) {
        log::debug!("madvise(DONTDUMP): {e}");
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_mapping(_map: &Mmap) {}

/// Maps and validates a v2 index; on success publishes the mapping and seeds
/// metric retention in the registry.
pub fn load_journal_v2(ctx: &EngineContext, datafile: &DatafilePair) -> V2LoadStatus {
    let v1 = paths::journalfile_path(&ctx.config.dbfiles_path, datafile.tier, datafile.fileno);
    let original_file_size = std::fs::metadata(&v1).map(|m| m.len() as u32).unwrap_or(0);

    let path = paths::journalfile_v2_path(&ctx.config.dbfiles_path, datafile.tier, datafile.fileno);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("no journal index at '{}': {e}", path.display());
            return V2LoadStatus::Invalid;
        }
        Err(e) => {
            ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
            log::error!("failed to open '{}': {e}", path.display());
            return V2LoadStatus::Invalid;
        }
    };

    let file_size = match file.metadata() {
        Ok(m) => m.len() as usize,
        Err(e) => {
            log::error!("failed to get file information for '{}': {e}", path.display());
            return V2LoadStatus::Invalid;
        }
    };
    if file_size < V2_HEADER_SIZE {
        log::error!("invalid file '{}', not the expected size", path.display());
        return V2LoadStatus::Invalid;
    }

    let start_loading_ut = now_realtime_usec();
    let map = match unsafe { Mmap::map(&file) } {
        Ok(m) => m,
        Err(e) => {
            ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
            log::error!("failed to map '{}': {e}", path.display());
            return V2LoadStatus::Invalid;
        }
    };
    drop(file);

    log::info!("checking integrity of '{}'", path.display());
    let header = match check_journal_v2_file(&map, original_file_size, ctx.config.journal_deep_check) {
        Ok(h) => h,
        Err(status) => {
            match status {
                V2LoadStatus::Rebuild => log::warn!("file '{}' needs to be rebuilt", path.display()),
                V2LoadStatus::Skip => log::warn!("file '{}' will be skipped", path.display()),
                _ => log::warn!("file '{}' is invalid and it will be rebuilt", path.display()),
            }
            return status;
        }
    };

    if header.metric_count == 0 {
        return V2LoadStatus::Invalid;
    }

    advise_mapping(&map);

    let index = Arc::new(MappedIndex::new(map));
    datafile.journal().publish_mapped(Some(index.clone()));

    let data = index.as_bytes();
    let header_start_s = (header.start_time_ut / 1_000_000) as i64;
    let metric_region = &data[header.metric_offset as usize..];
    let section = ctx.section();
    for i in 0..header.metric_count as usize {
        let entry = MetricListEntry::decode(&metric_region[i * METRIC_LIST_ENTRY_SIZE..]);
        let start_time_s = header_start_s + entry.delta_start_s as i64;
        let end_time_s = header_start_s + entry.delta_end_s as i64;
        let update_every_s = if entry.entries > 1 {
            ((end_time_s - start_time_s) / (entry.entries as i64 - 1)) as u32
        } else {
            0
        };
        ctx.registry.update_metric_retention_and_granularity(
            section,
            &entry.uuid,
            start_time_s,
            end_time_s,
            update_every_s,
        );
    }

    log::info!(
        "journal file '{}' loaded (size:{file_size}) with {} metrics in {} ms",
        path.display(),
        header.metric_count,
        (now_realtime_usec() - start_loading_ut) / 1_000
    );
    V2LoadStatus::Loaded
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

struct V2Layout {
    extent_offset: usize,
    extent_trailer_offset: usize,
    metric_offset: usize,
    metric_trailer_offset: usize,
    pages_offset: usize,
    trailer_offset: usize,
    total_file_size: usize,
}

fn compute_layout(number_of_extents: usize, number_of_metrics: usize, number_of_pages: usize) -> V2Layout {
    let extent_offset = V2_HEADER_PADDED_SIZE;
    let extent_trailer_offset = extent_offset + number_of_extents * EXTENT_LIST_ENTRY_SIZE;
    let metric_offset = extent_trailer_offset + BLOCK_TRAILER_SIZE;
    let metric_trailer_offset = metric_offset + number_of_metrics * METRIC_LIST_ENTRY_SIZE;
    let pages_offset = metric_trailer_offset + BLOCK_TRAILER_SIZE;
    let trailer_offset = pages_offset
        + number_of_pages * PAGE_LIST_ENTRY_SIZE
        + number_of_metrics * (PAGE_HEADER_SIZE + BLOCK_TRAILER_SIZE);
    V2Layout {
        extent_offset,
        extent_trailer_offset,
        metric_offset,
        metric_trailer_offset,
        pages_offset,
        trailer_offset,
        total_file_size: trailer_offset + BLOCK_TRAILER_SIZE,
    }
}

/// All writers go through this guard: a write may never reach into the file
/// trailer.
fn verify_journal_space(total_file_size: usize, cursor: usize, bytes: usize) -> bool {
    cursor + bytes <= total_file_size - BLOCK_TRAILER_SIZE
}

/// Stamps the header with `SKIP_MAGIC` and shrinks the file down to a bare
/// header, so a future load leaves it alone instead of trusting partial data.
fn abort_migration(ctx: &EngineContext, file: &File, path: &Path, header: &V2Header, map: MmapMut) {
    log::warn!("failed to build index '{}', file will be skipped", path.display());
    let mut skip_header = *header;
    skip_header.magic = JOURNAL_V2_SKIP_MAGIC;
    let total_file_size = header.total_file_size as u64;

    let mut map = map;
    map[..V2_HEADER_SIZE].copy_from_slice(&skip_header.encode());
    drop(map);

    if let Err(e) = file.set_len(V2_HEADER_SIZE as u64) {
        ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
        ctx.add_disk_space(total_file_size);
        log::error!("failed to resize file '{}': {e}", path.display());
    } else {
        ctx.add_disk_space(V2_HEADER_SIZE as u64);
    }
}

/// Builds the v2 index for a sealed datafile from the in-memory indices the
/// open-pages cache accumulated, then atomically activates the new mapping.
#[allow(clippy::too_many_arguments)]
pub fn migrate_to_v2_callback(
    ctx: &EngineContext,
    section: SectionId,
    fileno: u32,
    page_type: u8,
    metrics: &BTreeMap<MetricId, JournalMetricInfo>,
    extents: &BTreeMap<u64, JournalExtentInfo>,
    number_of_extents: usize,
    number_of_metrics: usize,
    number_of_pages: usize,
    datafile: &DatafilePair,
) {
    debug_assert_eq!(section, ctx.section());
    let journal = datafile.journal();
    let path = paths::journalfile_v2_path(&ctx.config.dbfiles_path, datafile.tier, fileno);

    log::info!(
        "indexing file '{}': extents {number_of_extents}, metrics {number_of_metrics}, pages {number_of_pages}",
        path.display()
    );

    let layout = compute_layout(number_of_extents, number_of_metrics, number_of_pages);
    let total_file_size = layout.total_file_size;

    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) => {
            ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
            log::error!("failed to create index '{}': {e}", path.display());
            return;
        }
    };
    if let Err(e) = file.set_len(total_file_size as u64) {
        ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
        log::error!("failed to size index '{}': {e}", path.display());
        return;
    }
    let mut map = match unsafe { MmapMut::map_mut(&file) } {
        Ok(m) => m,
        Err(e) => {
            ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
            log::error!("failed to map index '{}': {e}", path.display());
            let _ = file.write_all_at(
                &V2Header { magic: JOURNAL_V2_SKIP_MAGIC, ..Default::default() }.encode(),
                0,
            );
            let _ = file.set_len(V2_HEADER_SIZE as u64);
            return;
        }
    };

    map[..layout.extent_offset].fill(0);

    let mut header = V2Header {
        magic: JOURNAL_V2_MAGIC,
        extent_count: number_of_extents as u32,
        extent_offset: layout.extent_offset as u32,
        extent_trailer_offset: layout.extent_trailer_offset as u32,
        metric_count: number_of_metrics as u32,
        metric_offset: layout.metric_offset as u32,
        metric_trailer_offset: layout.metric_trailer_offset as u32,
        page_count: number_of_pages as u32,
        page_offset: layout.pages_offset as u32,
        total_file_size: total_file_size as u32,
        original_file_size: journal.pos() as u32,
        ..Default::default()
    };

    // Extent list, in datafile-position order.
    for extent in extents.values() {
        let at = layout.extent_offset + extent.index as usize * EXTENT_LIST_ENTRY_SIZE;
        let entry = ExtentListEntry {
            file_index: extent.index as u16,
            datafile_offset: extent.pos,
            datafile_size: extent.bytes,
            pages: extent.number_of_pages,
        };
        map[at..at + EXTENT_LIST_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }
    let extent_crc = crc32(&map[layout.extent_offset..layout.extent_trailer_offset]);
    map[layout.extent_trailer_offset..layout.metric_offset].copy_from_slice(&extent_crc.to_le_bytes());

    // Metrics sorted by uuid so lookups can binary-search the directory.
    let mut sorted: Vec<&JournalMetricInfo> = metrics.values().collect();
    sorted.sort_unstable_by(|a, b| a.uuid.cmp(&b.uuid));

    let min_time_s = sorted.iter().map(|m| m.first_time_s).min().unwrap_or(0);
    let max_time_s = sorted.iter().map(|m| m.last_time_s).max().unwrap_or(0);
    header.start_time_ut = min_time_s.max(0) as u64 * 1_000_000;
    header.end_time_ut = max_time_s.max(0) as u64 * 1_000_000;
    let base_time_s = min_time_s.max(0);

    let mut cursor = layout.metric_offset;
    let mut pages_offset = layout.pages_offset;
    let mut failed = false;

    for info in &sorted {
        if !verify_journal_space(total_file_size, cursor, METRIC_LIST_ENTRY_SIZE) {
            failed = true;
            break;
        }
        let uuid_offset = cursor as u32;
        let metric_entry = MetricListEntry {
            uuid: info.uuid,
            entries: info.number_of_pages as u32,
            page_offset: pages_offset as u32,
            delta_start_s: (info.first_time_s - base_time_s) as u32,
            delta_end_s: (info.last_time_s - base_time_s) as u32,
        };
        map[cursor..cursor + METRIC_LIST_ENTRY_SIZE].copy_from_slice(&metric_entry.encode());
        cursor += METRIC_LIST_ENTRY_SIZE;

        let page_header = V2PageHeader {
            uuid: info.uuid,
            entries: info.number_of_pages as u32,
            uuid_offset,
        };
        if !verify_journal_space(total_file_size, pages_offset, page_block_size(info.number_of_pages)) {
            failed = true;
            break;
        }
        map[pages_offset..pages_offset + PAGE_HEADER_SIZE].copy_from_slice(&page_header.encode());

        let mut page_cursor = pages_offset + PAGE_HEADER_SIZE;
        for page in info.pages_by_start_time.values() {
            let entry = PageListEntry {
                delta_start_s: (page.start_time_s - base_time_s) as u32,
                delta_end_s: (page.end_time_s - base_time_s) as u32,
                extent_index: page.extent_index,
                update_every_s: page.update_every_s,
                page_length: page.page_length as u16,
                page_type,
            };
            map[page_cursor..page_cursor + PAGE_LIST_ENTRY_SIZE].copy_from_slice(&entry.encode());
            page_cursor += PAGE_LIST_ENTRY_SIZE;
        }
        let list_start = pages_offset + PAGE_HEADER_SIZE;
        let page_crc = crc32(&map[list_start..page_cursor]);
        map[page_cursor..page_cursor + BLOCK_TRAILER_SIZE].copy_from_slice(&page_crc.to_le_bytes());

        pages_offset += page_block_size(info.number_of_pages);
        if pages_offset != page_cursor + BLOCK_TRAILER_SIZE {
            failed = true;
            break;
        }
    }

    if failed || cursor != layout.metric_trailer_offset {
        abort_migration(ctx, &file, &path, &header, map);
        return;
    }

    let metric_crc = crc32(&map[layout.metric_offset..layout.metric_trailer_offset]);
    map[layout.metric_trailer_offset..layout.pages_offset].copy_from_slice(&metric_crc.to_le_bytes());

    let header_bytes = header.encode();
    let file_crc = crc32(&header_bytes);
    map[layout.trailer_offset..total_file_size].copy_from_slice(&file_crc.to_le_bytes());
    map[..V2_HEADER_SIZE].copy_from_slice(&header_bytes);

    if let Err(e) = map.flush() {
        ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
        log::error!("failed to flush index '{}': {e}", path.display());
        abort_migration(ctx, &file, &path, &header, map);
        return;
    }
    let map = match map.make_read_only() {
        Ok(m) => m,
        Err(e) => {
            ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
            log::error!("failed to remap index '{}' read-only: {e}", path.display());
            return;
        }
    };

    log::info!("migrated journal file '{}', file size {total_file_size}", path.display());
    journal.publish_mapped(Some(Arc::new(MappedIndex::new(map))));
    ctx.add_disk_space(total_file_size as u64);
}

// ---------------------------------------------------------------------------
// Mapped index accessors
// ---------------------------------------------------------------------------

impl MappedIndex {
    pub fn header(&self) -> V2Header {
        V2Header::decode(&self.as_bytes()[..V2_HEADER_SIZE])
    }

    pub fn metric_entry(&self, i: usize) -> MetricListEntry {
        let header = self.header();
        let at = header.metric_offset as usize + i * METRIC_LIST_ENTRY_SIZE;
        MetricListEntry::decode(&self.as_bytes()[at..at + METRIC_LIST_ENTRY_SIZE])
    }

    /// Binary search over the uuid-sorted metric directory.
    pub fn find_metric(&self, uuid: &Uuid) -> Option<MetricListEntry> {
        let count = self.header().metric_count as usize;
        let mut low = 0usize;
        let mut high = count;
        while low < high {
            let mid = (low + high) / 2;
            let entry = self.metric_entry(mid);
            match entry.uuid.cmp(uuid) {
                std::cmp::Ordering::Equal => return Some(entry),
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }
        None
    }

    /// Page list of one metric directory entry.
    pub fn page_list(&self, entry: &MetricListEntry) -> Vec<PageListEntry> {
        let data = self.as_bytes();
        let start = entry.page_offset as usize + PAGE_HEADER_SIZE;
        (0..entry.entries as usize)
            .map(|i| PageListEntry::decode(&data[start + i * PAGE_LIST_ENTRY_SIZE..]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_encode() {
        let header = V2Header {
            magic: JOURNAL_V2_MAGIC,
            start_time_ut: 1_000_000_000,
            end_time_ut: 2_000_000_000,
            extent_count: 3,
            extent_offset: 4096,
            extent_trailer_offset: 4144,
            metric_count: 2,
            metric_offset: 4148,
            metric_trailer_offset: 4212,
            page_count: 5,
            page_offset: 4216,
            total_file_size: 4500,
            original_file_size: 8192,
        };
        assert_eq!(V2Header::decode(&header.encode()), header);
    }

    #[test]
    fn page_header_checksum_verifies_and_rejects_flips() {
        let ph = V2PageHeader {
            uuid: Uuid::new_v4(),
            entries: 4,
            uuid_offset: 4148,
        };
        let mut raw = ph.encode();
        assert!(V2PageHeader::verify(&raw));
        // The crc field carries the magic tag on disk.
        assert_eq!(u32::from_le_bytes(raw[24..28].try_into().unwrap()), JOURNAL_V2_MAGIC);
        raw[3] ^= 0x01;
        assert!(!V2PageHeader::verify(&raw));
    }

    #[test]
    fn layout_accounts_for_every_section() {
        let l = compute_layout(3, 2, 5);
        assert_eq!(l.extent_offset, V2_HEADER_PADDED_SIZE);
        assert_eq!(l.extent_trailer_offset, l.extent_offset + 3 * EXTENT_LIST_ENTRY_SIZE);
        assert_eq!(l.metric_offset, l.extent_trailer_offset + BLOCK_TRAILER_SIZE);
        assert_eq!(l.metric_trailer_offset, l.metric_offset + 2 * METRIC_LIST_ENTRY_SIZE);
        assert_eq!(l.pages_offset, l.metric_trailer_offset + BLOCK_TRAILER_SIZE);
        let blocks = 2 * (PAGE_HEADER_SIZE + BLOCK_TRAILER_SIZE) + 5 * PAGE_LIST_ENTRY_SIZE;
        assert_eq!(l.trailer_offset, l.pages_offset + blocks);
        assert_eq!(l.total_file_size, l.trailer_offset + BLOCK_TRAILER_SIZE);
    }

    #[test]
    fn aborted_migration_leaves_a_bare_skip_header() {
        let dir = crate::test_support::temp_dir("v2_abort");
        let path = dir.join("journalfile-1-0000000009.wjf2");
        let total = compute_layout(1, 1, 1).total_file_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(total as u64).unwrap();
        let map = unsafe { MmapMut::map_mut(&file) }.unwrap();

        let ctx = crate::context::EngineContext::new(crate::config::EngineConfig::default());
        let header = V2Header {
            magic: JOURNAL_V2_MAGIC,
            total_file_size: total as u32,
            ..Default::default()
        };
        abort_migration(&ctx, &file, &path, &header, map);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), V2_HEADER_SIZE);
        assert_eq!(V2Header::decode(&bytes).magic, JOURNAL_V2_SKIP_MAGIC);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn space_guard_protects_the_file_trailer() {
        let total = 1000;
        assert!(verify_journal_space(total, 0, total - BLOCK_TRAILER_SIZE));
        assert!(!verify_journal_space(total, 0, total - BLOCK_TRAILER_SIZE + 1));
        assert!(!verify_journal_space(total, total - BLOCK_TRAILER_SIZE, 1));
    }
}
