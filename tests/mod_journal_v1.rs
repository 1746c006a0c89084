use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use chronolite::config::EngineConfig;
use chronolite::context::EngineContext;
use chronolite::datafile::DatafilePair;
use chronolite::journal_v1::{
    BLOCK_SIZE, JF_SUPERBLOCK_SIZE, PageDescriptor, STORE_DATA, StoreData, encode_transaction,
};
use chronolite::journalfile::{journal_close, journal_create, journal_load};
use chronolite::types::now_realtime_sec;
use chronolite::wal::wal_flush_transaction_buffer;
use tempfile::tempdir;
use uuid::Uuid;

fn ctx_in(dir: &Path) -> Arc<EngineContext> {
    EngineContext::new(EngineConfig { dbfiles_path: dir.to_path_buf(), tier: 1, ..Default::default() })
}

fn store_data(uuid: Uuid, start: i64, end: i64) -> StoreData {
    StoreData {
        extent_offset: 0,
        extent_size: 4096,
        descriptors: vec![PageDescriptor {
            uuid,
            page_length: 240,
            start_time_s: start,
            end_time_s: end,
            update_every_s: 1,
            page_type: 0,
        }],
    }
}

/// Appends one framed transaction in its own block right after the superblock.
fn append_transaction_block(dir: &Path, block_index: u64, tx: &[u8]) {
    let path = dir.join("journalfile-1-0000000001.wjf");
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    let mut block = vec![0u8; BLOCK_SIZE];
    block[..tx.len()].copy_from_slice(tx);
    file.write_all_at(&block, JF_SUPERBLOCK_SIZE as u64 + block_index * BLOCK_SIZE as u64)
        .unwrap();
}

#[test]
fn test_create_flush_replay_round_trip() {
    let dir = tempdir().unwrap();
    let uuid = Uuid::new_v4();

    {
        let ctx = ctx_in(dir.path());
        let datafile = Arc::new(DatafilePair::new(1, 1));
        journal_create(&ctx, &datafile).unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut wal = ctx.wal_get(256).unwrap();
        let id = wal.transaction_id();
        assert_eq!(id, 1);
        wal.append_store_data(id, &store_data(uuid, 1000, 1059)).unwrap();
        let flush = wal_flush_transaction_buffer(&ctx, &datafile, wal, rt.handle());
        rt.block_on(flush).unwrap();

        assert_eq!(datafile.journal().pos(), (JF_SUPERBLOCK_SIZE + BLOCK_SIZE) as u64);
        assert_eq!(ctx.telemetry.snapshot().extents_currently_being_flushed, 0);
        journal_close(&ctx, &datafile);
    }

    let ctx = ctx_in(dir.path());
    ctx.set_last_fileno(1);
    let datafile = Arc::new(DatafilePair::new(1, 1));
    journal_load(&ctx, &datafile).unwrap();

    let metric = ctx.registry.get_and_acquire(&uuid, ctx.section()).unwrap();
    assert_eq!(metric.retention(), (1000, 1059, 1));
    let pages = ctx.open_cache.hot_pages(ctx.section(), 1);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].extent_offset, 0);
    assert_eq!(pages[0].extent_size, 4096);
    assert_eq!(pages[0].page_length, 240);
    assert_eq!(ctx.current_transaction_id(), 2);
}

#[test]
fn test_corrupted_payload_is_skipped_on_replay() {
    let dir = tempdir().unwrap();
    let uuid = Uuid::new_v4();

    {
        let ctx = ctx_in(dir.path());
        let datafile = DatafilePair::new(1, 1);
        journal_create(&ctx, &datafile).unwrap();
    }
    let mut payload = Vec::new();
    store_data(uuid, 1000, 1059).encode_payload(&mut payload);
    let mut tx = encode_transaction(1, STORE_DATA, &payload);
    tx[20] ^= 0xff; // flip one payload byte so the CRC no longer matches
    append_transaction_block(dir.path(), 0, &tx);

    let ctx = ctx_in(dir.path());
    ctx.set_last_fileno(1);
    let datafile = DatafilePair::new(1, 1);
    journal_load(&ctx, &datafile).unwrap();

    assert!(ctx.registry.is_empty());
    assert!(ctx.open_cache.hot_pages(ctx.section(), 1).is_empty());
    // max_id stayed at 1, so the next assigned id is 2
    assert_eq!(ctx.current_transaction_id(), 2);
}

#[test]
fn test_padding_block_is_skipped_and_scan_continues() {
    let dir = tempdir().unwrap();
    let uuid = Uuid::new_v4();

    {
        let ctx = ctx_in(dir.path());
        let datafile = DatafilePair::new(1, 1);
        journal_create(&ctx, &datafile).unwrap();
    }
    // First block: zeroed, i.e. nothing but padding. Second block: a valid
    // transaction with a noticeable id.
    append_transaction_block(dir.path(), 0, &[]);
    let mut payload = Vec::new();
    store_data(uuid, 2000, 2059).encode_payload(&mut payload);
    append_transaction_block(dir.path(), 1, &encode_transaction(5, STORE_DATA, &payload));

    let ctx = ctx_in(dir.path());
    ctx.set_last_fileno(1);
    let datafile = DatafilePair::new(1, 1);
    journal_load(&ctx, &datafile).unwrap();

    let metric = ctx.registry.get_and_acquire(&uuid, ctx.section()).unwrap();
    assert_eq!(metric.retention(), (2000, 2059, 1));
    assert_eq!(ctx.current_transaction_id(), 6);
}

#[test]
fn test_future_end_time_is_clamped_to_now() {
    let dir = tempdir().unwrap();
    let uuid = Uuid::new_v4();

    {
        let ctx = ctx_in(dir.path());
        let datafile = DatafilePair::new(1, 1);
        journal_create(&ctx, &datafile).unwrap();
    }
    let now = now_realtime_sec();
    let mut payload = Vec::new();
    store_data(uuid, now - 60, now + 3600).encode_payload(&mut payload);
    append_transaction_block(dir.path(), 0, &encode_transaction(1, STORE_DATA, &payload));

    let ctx = ctx_in(dir.path());
    ctx.set_last_fileno(1);
    let datafile = DatafilePair::new(1, 1);
    journal_load(&ctx, &datafile).unwrap();

    let metric = ctx.registry.get_and_acquire(&uuid, ctx.section()).unwrap();
    let (first, last, _) = metric.retention();
    assert_eq!(first, now - 60);
    assert!(last <= now_realtime_sec());
    assert!(last >= now);
}

#[test]
fn test_garbage_superblock_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("journalfile-1-0000000001.wjf");
    std::fs::write(&path, vec![0xabu8; JF_SUPERBLOCK_SIZE + BLOCK_SIZE]).unwrap();

    let ctx = ctx_in(dir.path());
    ctx.set_last_fileno(1);
    let datafile = DatafilePair::new(1, 1);
    assert!(journal_load(&ctx, &datafile).is_err());
    assert!(ctx.registry.is_empty());
}
