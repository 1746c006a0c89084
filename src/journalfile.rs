use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::context::EngineContext;
use crate::datafile::DatafilePair;
use crate::errors::JournalError;
use crate::journal_v1::{self, JF_SUPERBLOCK_SIZE};
use crate::journal_v2::{self, V2LoadStatus};
use crate::paths;

/// An immutable, validated v2 mapping. Published as a unit: readers holding a
/// clone keep the mapping alive even after the journal replaces or drops it.
pub struct MappedIndex {
    map: Mmap,
}

impl MappedIndex {
    pub(crate) fn new(map: Mmap) -> Self {
        Self { map }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Journal file state: v1 file handle and append position while the pair is
/// open for ingest, plus the v2 mapping once migrated.
pub struct JournalFile {
    file: RwLock<Option<Arc<File>>>,
    pos: AtomicU64,
    mapped: RwLock<Option<Arc<MappedIndex>>>,
}

impl JournalFile {
    pub(crate) fn new() -> Self {
        Self {
            file: RwLock::new(None),
            pos: AtomicU64::new(0),
            mapped: RwLock::new(None),
        }
    }

    /// Current append position. Writes are append-only, so this never moves
    /// backwards.
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub(crate) fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    /// Reserves `bytes` at the current append position and returns the
    /// position the caller must write at. Advancing at submission keeps
    /// flushes for one journal in position order.
    pub(crate) fn advance_pos(&self, bytes: u64) -> u64 {
        self.pos.fetch_add(bytes, Ordering::AcqRel)
    }

    pub fn file_handle(&self) -> Option<Arc<File>> {
        self.file.read().clone()
    }

    pub(crate) fn set_file(&self, file: Option<Arc<File>>) {
        *self.file.write() = file;
    }

    /// The published v2 mapping, or `None` while the journal is v1-backed.
    pub fn mapped_index(&self) -> Option<Arc<MappedIndex>> {
        self.mapped.read().clone()
    }

    pub(crate) fn publish_mapped(&self, index: Option<Arc<MappedIndex>>) {
        *self.mapped.write() = index;
    }
}

fn v1_path(ctx: &EngineContext, datafile: &DatafilePair) -> PathBuf {
    paths::journalfile_path(&ctx.config.dbfiles_path, datafile.tier, datafile.fileno)
}

fn v2_path(ctx: &EngineContext, datafile: &DatafilePair) -> PathBuf {
    paths::journalfile_v2_path(&ctx.config.dbfiles_path, datafile.tier, datafile.fileno)
}

/// Creates an empty v1 journal: the superblock is written at offset 0 and the
/// append position starts right after it.
pub fn journal_create(ctx: &EngineContext, datafile: &DatafilePair) -> Result<(), JournalError> {
    let path = v1_path(ctx, datafile);
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
            log::error!("failed to create journal '{}': {e}", path.display());
            return Err(e.into());
        }
    };
    ctx.telemetry.journalfile_creations.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = journal_v1::write_superblock(&file) {
        ctx.telemetry.io_errors.fetch_add(1, Ordering::Relaxed);
        log::error!("failed to write journal superblock '{}': {e}", path.display());
        let journal = datafile.journal();
        journal.set_file(Some(Arc::new(file)));
        let _ = journal_destroy_unsafe(ctx, datafile);
        return Err(e.into());
    }

    let journal = datafile.journal();
    journal.set_file(Some(Arc::new(file)));
    journal.set_pos(JF_SUPERBLOCK_SIZE as u64);
    ctx.telemetry.io_write_bytes.fetch_add(JF_SUPERBLOCK_SIZE as u64, Ordering::Relaxed);
    ctx.telemetry.io_write_requests.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Loads a journal at startup: the v2 index when one is valid, otherwise a v1
/// replay followed by migration. The newest pair is always replayed and
/// live-migrated so ingest can continue appending to it.
pub fn journal_load(ctx: &EngineContext, datafile: &DatafilePair) -> Result<(), JournalError> {
    let mut skip_migration = false;

    if datafile.fileno != ctx.last_fileno() {
        match journal_v2::load_journal_v2(ctx, datafile) {
            V2LoadStatus::Loaded => return Ok(()),
            V2LoadStatus::Skip => skip_migration = true,
            V2LoadStatus::Invalid | V2LoadStatus::Rebuild => {}
        }
    }

    journal_v1::replay_journal(ctx, datafile)?;

    let is_last_file = ctx.last_fileno() == datafile.fileno;
    if is_last_file && datafile.pos() <= ctx.config.target_datafile_size / 3 {
        // Keep filling the current pair instead of sealing it.
        ctx.set_create_new_datafile_pair(false);
        return Ok(());
    }

    if !skip_migration {
        ctx.open_cache.to_journal_v2(
            ctx.section(),
            datafile.fileno,
            ctx.config.page_type,
            &ctx.registry,
            Box::new(|section, fileno, page_type, metrics, extents, n_ext, n_metrics, n_pages| {
                journal_v2::migrate_to_v2_callback(
                    ctx, section, fileno, page_type, metrics, extents, n_ext, n_metrics, n_pages,
                    datafile,
                );
            }),
        );
    }

    if is_last_file {
        ctx.set_create_new_datafile_pair(true);
    }
    Ok(())
}

/// Closes the journal: unmaps v2 when mapped (preferred), otherwise closes
/// the v1 file descriptor. Readers still holding the mapping keep it alive.
pub fn journal_close(_ctx: &EngineContext, datafile: &DatafilePair) {
    let journal = datafile.journal();
    if journal.mapped_index().is_some() {
        journal.publish_mapped(None);
        return;
    }
    journal.set_file(None);
}

/// Removes the v1 journal file.
pub fn journal_unlink(ctx: &EngineContext, datafile: &DatafilePair) -> Result<(), JournalError> {
    let path = v1_path(ctx, datafile);
    let ret = std::fs::remove_file(&path);
    if let Err(e) = &ret {
        log::error!("unlink('{}'): {e}", path.display());
        ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
    }
    ctx.telemetry.journalfile_deletions.fetch_add(1, Ordering::Relaxed);
    ret.map_err(Into::into)
}

/// Tears down both journal artifacts: truncates v1 to zero, closes it, then
/// unlinks v2 and v1 and drops the mapping. "Unsafe" means the caller has
/// already guaranteed no reader needs this journal anymore.
pub fn journal_destroy_unsafe(ctx: &EngineContext, datafile: &DatafilePair) -> Result<(), JournalError> {
    let journal = datafile.journal();
    let path = v1_path(ctx, datafile);
    let path_v2 = v2_path(ctx, datafile);

    if let Some(file) = journal.file_handle() {
        if let Err(e) = file.set_len(0) {
            log::error!("ftruncate('{}'): {e}", path.display());
            ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
        }
        journal.set_file(None);
    }

    if let Err(e) = std::fs::remove_file(&path_v2) {
        log::error!("unlink('{}'): {e}", path_v2.display());
        ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
    }

    let ret = std::fs::remove_file(&path);
    if let Err(e) = &ret {
        log::error!("unlink('{}'): {e}", path.display());
        ctx.telemetry.fs_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Both journal artifacts of the pair are gone.
    ctx.telemetry.journalfile_deletions.fetch_add(2, Ordering::Relaxed);

    journal.publish_mapped(None);

    ret.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_support::temp_dir;

    fn ctx_in(dir: std::path::PathBuf) -> std::sync::Arc<EngineContext> {
        EngineContext::new(EngineConfig { dbfiles_path: dir, tier: 1, ..Default::default() })
    }

    #[test]
    fn create_writes_superblock_and_sets_position() {
        let dir = temp_dir("jf_create");
        let ctx = ctx_in(dir.clone());
        let datafile = DatafilePair::new(1, 1);
        journal_create(&ctx, &datafile).unwrap();

        assert_eq!(datafile.journal().pos(), JF_SUPERBLOCK_SIZE as u64);
        let path = v1_path(&ctx, &datafile);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), JF_SUPERBLOCK_SIZE as u64);
        let file = std::fs::File::open(&path).unwrap();
        journal_v1::check_superblock(&file).unwrap();
        assert_eq!(ctx.telemetry.snapshot().journalfile_creations, 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn destroy_removes_both_artifacts_and_counts_twice() {
        let dir = temp_dir("jf_destroy");
        let ctx = ctx_in(dir.clone());
        let datafile = DatafilePair::new(1, 2);
        journal_create(&ctx, &datafile).unwrap();
        let v2 = v2_path(&ctx, &datafile);
        std::fs::write(&v2, b"stale index").unwrap();

        journal_destroy_unsafe(&ctx, &datafile).unwrap();

        assert!(!v1_path(&ctx, &datafile).exists());
        assert!(!v2.exists());
        assert!(datafile.journal().file_handle().is_none());
        assert_eq!(ctx.telemetry.snapshot().journalfile_deletions, 2);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unlink_removes_only_v1() {
        let dir = temp_dir("jf_unlink");
        let ctx = ctx_in(dir.clone());
        let datafile = DatafilePair::new(1, 3);
        journal_create(&ctx, &datafile).unwrap();
        let v2 = v2_path(&ctx, &datafile);
        std::fs::write(&v2, b"index").unwrap();

        journal_unlink(&ctx, &datafile).unwrap();

        assert!(!v1_path(&ctx, &datafile).exists());
        assert!(v2.exists());
        assert_eq!(ctx.telemetry.snapshot().journalfile_deletions, 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
