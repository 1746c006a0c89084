use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::journalfile::JournalFile;
use crate::paths;

/// A datafile/journalfile pair identified by `(tier, fileno)`. The datafile
/// side (extent payload storage) lives outside this crate; the pair carries
/// only what the journal needs: identity, append position and the owned
/// journal file.
pub struct DatafilePair {
    pub tier: u32,
    pub fileno: u32,
    pos: AtomicU64,
    journal: JournalFile,
}

impl DatafilePair {
    pub fn new(tier: u32, fileno: u32) -> Self {
        Self {
            tier,
            fileno,
            pos: AtomicU64::new(0),
            journal: JournalFile::new(),
        }
    }

    pub fn journal(&self) -> &JournalFile {
        &self.journal
    }

    /// Bytes written to the companion datafile so far.
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Relaxed)
    }

    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Relaxed);
    }

    pub fn datafile_path(&self, base: &std::path::Path) -> PathBuf {
        paths::datafile_path(base, self.tier, self.fileno)
    }
}
