use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chronolite::config::EngineConfig;
use chronolite::context::EngineContext;
use chronolite::datafile::DatafilePair;
use chronolite::journal_v1::{BLOCK_SIZE, JF_SUPERBLOCK_SIZE, PageDescriptor, STORE_DATA, StoreData, encode_transaction};
use chronolite::journal_v2::{
    BLOCK_TRAILER_SIZE, EXTENT_LIST_ENTRY_SIZE, ExtentListEntry, JOURNAL_V2_MAGIC,
    METRIC_LIST_ENTRY_SIZE, MetricListEntry, PAGE_HEADER_SIZE, PAGE_LIST_ENTRY_SIZE, V2_HEADER_SIZE,
    V2_HEADER_PADDED_SIZE, V2Header, V2PageHeader,
};
use chronolite::journalfile::{journal_close, journal_create, journal_load};
use tempfile::tempdir;
use uuid::Uuid;

fn ctx_in(dir: &Path) -> Arc<EngineContext> {
    EngineContext::new(EngineConfig { dbfiles_path: dir.to_path_buf(), tier: 1, ..Default::default() })
}

fn u(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn append_transaction_block(dir: &Path, block_index: u64, id: u64, data: &StoreData) {
    let path = dir.join("journalfile-1-0000000001.wjf");
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    let mut payload = Vec::new();
    data.encode_payload(&mut payload);
    let tx = encode_transaction(id, STORE_DATA, &payload);
    let mut block = vec![0u8; BLOCK_SIZE];
    block[..tx.len()].copy_from_slice(&tx);
    file.write_all_at(&block, JF_SUPERBLOCK_SIZE as u64 + block_index * BLOCK_SIZE as u64)
        .unwrap();
}

fn descr(uuid: Uuid, start: i64, end: i64) -> PageDescriptor {
    PageDescriptor {
        uuid,
        page_length: 240,
        start_time_s: start,
        end_time_s: end,
        update_every_s: 1,
        page_type: 0,
    }
}

/// Three extents, two metrics, five pages; extents deliberately recorded out
/// of datafile order across transactions 1..=3.
fn build_v1_dataset(dir: &Path) {
    let ctx = ctx_in(dir);
    let datafile = DatafilePair::new(1, 1);
    journal_create(&ctx, &datafile).unwrap();

    append_transaction_block(
        dir,
        0,
        1,
        &StoreData {
            extent_offset: 8192,
            extent_size: 4096,
            descriptors: vec![descr(u(2), 1060, 1119), descr(u(1), 1060, 1119)],
        },
    );
    append_transaction_block(
        dir,
        1,
        2,
        &StoreData {
            extent_offset: 0,
            extent_size: 4096,
            descriptors: vec![descr(u(2), 1000, 1059), descr(u(1), 1000, 1059)],
        },
    );
    append_transaction_block(
        dir,
        2,
        3,
        &StoreData {
            extent_offset: 16384,
            extent_size: 2048,
            descriptors: vec![descr(u(1), 1120, 1179)],
        },
    );
}

fn seal_and_migrate(dir: &Path) -> (Arc<EngineContext>, Arc<DatafilePair>) {
    let ctx = ctx_in(dir);
    ctx.set_last_fileno(1);
    let datafile = Arc::new(DatafilePair::new(1, 1));
    datafile.set_pos(ctx.config.target_datafile_size);
    journal_load(&ctx, &datafile).unwrap();
    (ctx, datafile)
}

#[test]
fn test_v2_layout_matches_computed_offsets() {
    let dir = tempdir().unwrap();
    build_v1_dataset(dir.path());
    let (ctx, datafile) = seal_and_migrate(dir.path());

    let bytes = std::fs::read(dir.path().join("journalfile-1-0000000001.wjf2")).unwrap();
    let header = V2Header::decode(&bytes);

    // Offsets exactly as the layout arithmetic dictates.
    let extent_offset = V2_HEADER_PADDED_SIZE;
    let extent_trailer = extent_offset + 3 * EXTENT_LIST_ENTRY_SIZE;
    let metric_offset = extent_trailer + BLOCK_TRAILER_SIZE;
    let metric_trailer = metric_offset + 2 * METRIC_LIST_ENTRY_SIZE;
    let pages_offset = metric_trailer + BLOCK_TRAILER_SIZE;
    let block1 = PAGE_HEADER_SIZE + 3 * PAGE_LIST_ENTRY_SIZE + BLOCK_TRAILER_SIZE;
    let block2 = PAGE_HEADER_SIZE + 2 * PAGE_LIST_ENTRY_SIZE + BLOCK_TRAILER_SIZE;
    let trailer_offset = pages_offset + block1 + block2;
    let total = trailer_offset + BLOCK_TRAILER_SIZE;

    assert_eq!(header.magic, JOURNAL_V2_MAGIC);
    assert_eq!((header.extent_count, header.metric_count, header.page_count), (3, 2, 5));
    assert_eq!(header.extent_offset as usize, extent_offset);
    assert_eq!(header.extent_trailer_offset as usize, extent_trailer);
    assert_eq!(header.metric_offset as usize, metric_offset);
    assert_eq!(header.metric_trailer_offset as usize, metric_trailer);
    assert_eq!(header.page_offset as usize, pages_offset);
    assert_eq!(header.total_file_size as usize, total);
    assert_eq!(bytes.len(), total);
    assert_eq!(header.original_file_size as u64, (JF_SUPERBLOCK_SIZE + 3 * BLOCK_SIZE) as u64);
    assert_eq!(header.start_time_ut, 1_000 * 1_000_000);
    assert_eq!(header.end_time_ut, 1_179 * 1_000_000);

    // Every trailer CRC verifies against its section.
    let crc_at = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
    assert_eq!(crc32fast::hash(&bytes[extent_offset..extent_trailer]), crc_at(extent_trailer));
    assert_eq!(crc32fast::hash(&bytes[metric_offset..metric_trailer]), crc_at(metric_trailer));
    assert_eq!(crc32fast::hash(&bytes[..V2_HEADER_SIZE]), crc_at(trailer_offset));

    // Extents land in datafile-position order, no matter the replay order.
    let extents: Vec<ExtentListEntry> = (0..3)
        .map(|i| ExtentListEntry::decode(&bytes[extent_offset + i * EXTENT_LIST_ENTRY_SIZE..]))
        .collect();
    assert_eq!(
        extents
            .iter()
            .map(|e| (e.file_index, e.datafile_offset, e.datafile_size, e.pages))
            .collect::<Vec<_>>(),
        vec![(0, 0, 4096, 2), (1, 8192, 4096, 2), (2, 16384, 2048, 1)]
    );

    // The metric directory is sorted ascending by uuid.
    let metrics: Vec<MetricListEntry> = (0..2)
        .map(|i| MetricListEntry::decode(&bytes[metric_offset + i * METRIC_LIST_ENTRY_SIZE..]))
        .collect();
    assert!(metrics[0].uuid < metrics[1].uuid);
    assert_eq!(metrics[0].uuid, u(1));
    assert_eq!((metrics[0].entries, metrics[0].delta_start_s, metrics[0].delta_end_s), (3, 0, 179));
    assert_eq!(metrics[0].page_offset as usize, pages_offset);
    assert_eq!((metrics[1].entries, metrics[1].delta_start_s, metrics[1].delta_end_s), (2, 0, 119));
    assert_eq!(metrics[1].page_offset as usize, pages_offset + block1);

    // Each page block: valid header checksum, back-reference into the
    // directory, and a page list trailer that verifies.
    for (i, m) in metrics.iter().enumerate() {
        let at = m.page_offset as usize;
        let raw = &bytes[at..at + PAGE_HEADER_SIZE];
        assert!(V2PageHeader::verify(raw));
        let ph = V2PageHeader::decode(raw);
        assert_eq!(ph.uuid, m.uuid);
        assert_eq!(ph.entries, m.entries);
        assert_eq!(ph.uuid_offset as usize, metric_offset + i * METRIC_LIST_ENTRY_SIZE);
        let list = at + PAGE_HEADER_SIZE;
        let list_len = m.entries as usize * PAGE_LIST_ENTRY_SIZE;
        assert_eq!(crc32fast::hash(&bytes[list..list + list_len]), crc_at(list + list_len));
    }

    // Accounting and publication.
    assert!(ctx.disk_space() >= total as u64);
    let index = datafile.journal().mapped_index().unwrap();
    assert_eq!(index.len(), total);
}

#[test]
fn test_page_lists_are_sorted_by_start_time_with_extent_links() {
    let dir = tempdir().unwrap();
    build_v1_dataset(dir.path());
    let (_ctx, datafile) = seal_and_migrate(dir.path());

    let index = datafile.journal().mapped_index().unwrap();
    let m1 = index.find_metric(&u(1)).unwrap();
    let pages = index.page_list(&m1);
    assert_eq!(pages.len(), 3);
    let starts: Vec<u32> = pages.iter().map(|p| p.delta_start_s).collect();
    assert_eq!(starts, vec![0, 60, 120]);
    // Pages reference the position-ordered extent slots.
    let extent_indexes: Vec<u32> = pages.iter().map(|p| p.extent_index).collect();
    assert_eq!(extent_indexes, vec![0, 1, 2]);
    assert!(pages.iter().all(|p| p.page_length == 240 && p.update_every_s == 1));

    assert!(index.find_metric(&u(3)).is_none());
}

#[test]
fn test_publication_is_never_torn() {
    let dir = tempdir().unwrap();
    build_v1_dataset(dir.path());

    let ctx = ctx_in(dir.path());
    ctx.set_last_fileno(1);
    let datafile = Arc::new(DatafilePair::new(1, 1));
    datafile.set_pos(ctx.config.target_datafile_size);

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let datafile = datafile.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut observed = 0u64;
            // Keep polling until told to stop AND the published state was seen
            // at least once; the main thread only stops us after publishing.
            while !stop.load(Ordering::Relaxed) || observed == 0 {
                if let Some(index) = datafile.journal().mapped_index() {
                    // A published mapping is complete: valid magic and a
                    // size that matches its own header.
                    let header = index.header();
                    assert_eq!(header.magic, JOURNAL_V2_MAGIC);
                    assert_eq!(header.total_file_size as usize, index.len());
                    observed += 1;
                }
            }
            observed
        })
    };

    journal_load(&ctx, &datafile).unwrap();
    // Give the reader a chance to see the published state as well.
    while datafile.journal().mapped_index().is_none() {
        std::thread::yield_now();
    }
    stop.store(true, Ordering::Relaxed);
    let observed = reader.join().unwrap();
    assert!(observed > 0, "reader must observe the published mapping");
}

#[test]
fn test_close_after_migration_drops_mapping_but_readers_keep_theirs() {
    let dir = tempdir().unwrap();
    build_v1_dataset(dir.path());
    let (ctx, datafile) = seal_and_migrate(dir.path());

    let held = datafile.journal().mapped_index().unwrap();
    journal_close(&ctx, &datafile);
    assert!(datafile.journal().mapped_index().is_none());
    // The reader's clone stays fully readable.
    assert_eq!(held.header().magic, JOURNAL_V2_MAGIC);
    assert!(held.find_metric(&u(1)).is_some());
}
