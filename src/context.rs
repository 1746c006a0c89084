use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::EngineConfig;
use crate::open_cache::OpenCache;
use crate::registry::MetricRegistry;
use crate::telemetry::Telemetry;
use crate::types::SectionId;
use crate::wal::WalPool;

static NEXT_SECTION: AtomicU64 = AtomicU64::new(1);

/// Shared state of one engine context (one tier). Everything the journal
/// subsystem touches hangs off this.
pub struct EngineContext {
    pub config: EngineConfig,
    pub telemetry: Arc<Telemetry>,
    pub registry: MetricRegistry,
    pub open_cache: OpenCache,
    pub(crate) wal_pool: WalPool,
    section: SectionId,
    next_transaction_id: AtomicU64,
    disk_space: AtomicU64,
    last_fileno: AtomicU32,
    create_new_datafile_pair: AtomicBool,
    quiesce: AtomicBool,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            telemetry: Arc::new(Telemetry::default()),
            registry: MetricRegistry::new(),
            open_cache: OpenCache::new(),
            wal_pool: WalPool::new(),
            section: SectionId(NEXT_SECTION.fetch_add(1, Ordering::Relaxed)),
            next_transaction_id: AtomicU64::new(1),
            disk_space: AtomicU64::new(0),
            last_fileno: AtomicU32::new(0),
            create_new_datafile_pair: AtomicBool::new(false),
            quiesce: AtomicBool::new(false),
        })
    }

    /// Initializes file logging for this engine per the configuration. Call
    /// once per process, before the first journal operation.
    pub fn init_logging(&self) -> Result<(), crate::errors::JournalError> {
        crate::logger::init_for_engine(&self.config)
            .map_err(|e| crate::errors::JournalError::Config(e.to_string()))
    }

    pub fn section(&self) -> SectionId {
        self.section
    }

    /// Hands out the next transaction id; ids are monotonic and start at 1.
    pub fn next_transaction_id(&self) -> u64 {
        self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// After replay: make sure freshly assigned ids stay above what the
    /// journal already contains.
    pub fn bump_transaction_id_to(&self, floor: u64) {
        self.next_transaction_id.fetch_max(floor, Ordering::Relaxed);
    }

    pub fn current_transaction_id(&self) -> u64 {
        self.next_transaction_id.load(Ordering::Relaxed)
    }

    pub fn disk_space(&self) -> u64 {
        self.disk_space.load(Ordering::Relaxed)
    }

    pub fn add_disk_space(&self, bytes: u64) {
        self.disk_space.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_disk_space(&self, bytes: u64) {
        self.disk_space.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Newest fileno of this context; the newest pair is always replayed from
    /// v1 and live-migrated instead of loading its v2 index.
    pub fn last_fileno(&self) -> u32 {
        self.last_fileno.load(Ordering::Relaxed)
    }

    pub fn set_last_fileno(&self, fileno: u32) {
        self.last_fileno.store(fileno, Ordering::Relaxed);
    }

    pub fn create_new_datafile_pair(&self) -> bool {
        self.create_new_datafile_pair.load(Ordering::Relaxed)
    }

    pub fn set_create_new_datafile_pair(&self, value: bool) {
        self.create_new_datafile_pair.store(value, Ordering::Relaxed);
    }

    /// Once set, no new WAL buffers are handed out; outstanding flushes are
    /// allowed to complete.
    pub fn quiesce(&self) {
        self.quiesce.store(true, Ordering::Relaxed);
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiesce.load(Ordering::Relaxed)
    }

    /// Drains the telemetry counters into the log. Call once at shutdown.
    pub fn shutdown(&self) {
        let snap = self.telemetry.snapshot();
        log::info!(
            "journal telemetry: writes {} ({} bytes), reads {} ({} bytes), \
             io errors {}, fs errors {}, journal files created {}, deleted {}",
            snap.io_write_requests,
            snap.io_write_bytes,
            snap.io_read_requests,
            snap.io_read_bytes,
            snap.io_errors,
            snap.fs_errors,
            snap.journalfile_creations,
            snap.journalfile_deletions,
        );
    }
}
