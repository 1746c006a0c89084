use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Counters describing journal activity since engine start. Owned by the
/// engine context; incremented from the I/O paths, drained once at shutdown.
#[derive(Default)]
pub struct Telemetry {
    pub io_errors: AtomicU64,
    pub fs_errors: AtomicU64,
    pub io_write_bytes: AtomicU64,
    pub io_write_requests: AtomicU64,
    pub io_read_bytes: AtomicU64,
    pub io_read_requests: AtomicU64,
    pub journalfile_creations: AtomicU64,
    pub journalfile_deletions: AtomicU64,
    /// Gauge: WAL buffers handed to the flusher and not yet completed.
    pub extents_currently_being_flushed: AtomicU64,
    // one bit per page type already reported as unknown
    page_type_error_map: [AtomicU64; 4],
}

impl Telemetry {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            io_errors: self.io_errors.load(Ordering::Relaxed),
            fs_errors: self.fs_errors.load(Ordering::Relaxed),
            io_write_bytes: self.io_write_bytes.load(Ordering::Relaxed),
            io_write_requests: self.io_write_requests.load(Ordering::Relaxed),
            io_read_bytes: self.io_read_bytes.load(Ordering::Relaxed),
            io_read_requests: self.io_read_requests.load(Ordering::Relaxed),
            journalfile_creations: self.journalfile_creations.load(Ordering::Relaxed),
            journalfile_deletions: self.journalfile_deletions.load(Ordering::Relaxed),
            extents_currently_being_flushed: self
                .extents_currently_being_flushed
                .load(Ordering::Relaxed),
        }
    }

    /// Returns true the first time `page_type` is reported, so the caller can
    /// log unknown types once instead of once per page.
    pub fn first_unknown_page_type(&self, page_type: u8) -> bool {
        let word = &self.page_type_error_map[(page_type >> 6) as usize];
        let bit = 1u64 << (page_type & 63);
        word.fetch_or(bit, Ordering::Relaxed) & bit == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetrySnapshot {
    pub io_errors: u64,
    pub fs_errors: u64,
    pub io_write_bytes: u64,
    pub io_write_requests: u64,
    pub io_read_bytes: u64,
    pub io_read_requests: u64,
    pub journalfile_creations: u64,
    pub journalfile_deletions: u64,
    pub extents_currently_being_flushed: u64,
}

struct RateState {
    last: Option<Instant>,
    suppressed: u64,
}

/// Rate limiter for log lines about recurring on-disk anomalies: at most one
/// line per interval, carrying the number of suppressed occurrences.
pub struct RateLimited {
    interval: Duration,
    state: Mutex<RateState>,
}

impl RateLimited {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(RateState { last: None, suppressed: 0 }),
        }
    }

    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Invokes `emit` with the suppressed count if the interval has elapsed,
    /// otherwise counts the occurrence silently.
    pub fn log<F: FnOnce(u64)>(&self, emit: F) {
        let mut state = self.state.lock();
        let due = match state.last {
            None => true,
            Some(last) => last.elapsed() >= self.interval,
        };
        if due {
            let suppressed = state.suppressed;
            state.last = Some(Instant::now());
            state.suppressed = 0;
            drop(state);
            emit(suppressed);
        } else {
            state.suppressed += 1;
        }
    }
}
