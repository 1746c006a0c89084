use std::time::{SystemTime, UNIX_EPOCH};

use crate::telemetry::RateLimited;
use once_cell::sync::Lazy;
use uuid::Uuid;

/// Opaque identity of an engine context. Metrics are namespaced by it so that
/// several tiers can share one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(pub u64);

/// Registry-assigned metric handle, stable for the lifetime of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricId(pub u64);

/// On-disk page payload kinds. Anything above `PAGE_TYPE_MAX` is unknown and
/// skipped during replay.
pub const PAGE_TYPE_METRICS: u8 = 0;
pub const PAGE_TYPE_TIER: u8 = 1;
pub const PAGE_TYPE_MAX: u8 = 1;

pub fn now_realtime_sec() -> i64 {
    now_realtime_usec() / 1_000_000
}

pub fn now_realtime_usec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// A page descriptor after timestamp sanitation. `data_on_disk_valid` is false
/// when the descriptor cannot describe any readable data.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedPageDescriptor {
    pub start_time_s: i64,
    pub end_time_s: i64,
    pub update_every_s: u32,
    pub page_length: u32,
    pub page_type: u8,
    pub data_on_disk_valid: bool,
}

static WRONG_LAST_TIME: Lazy<RateLimited> = Lazy::new(RateLimited::per_second);
static WRONG_FIRST_TIME: Lazy<RateLimited> = Lazy::new(RateLimited::per_second);
static ZERO_TIMESTAMPS: Lazy<RateLimited> = Lazy::new(RateLimited::per_second);

/// Sanitize the timestamps of a descriptor read from disk.
///
/// `last > now` is clamped to `now`, `first > last` collapses to `last`, zero
/// timestamps are kept as-is; every anomaly is logged rate-limited. A zero
/// `update_every` is overwritten with `overwrite_zero_update_every_s` (the
/// granularity the registry already knows for this metric, when any).
pub fn validate_page_descriptor(
    uuid: &Uuid,
    page_length: u32,
    mut start_time_s: i64,
    mut end_time_s: i64,
    update_every_s: u32,
    page_type: u8,
    now_s: i64,
    overwrite_zero_update_every_s: u32,
) -> ValidatedPageDescriptor {
    if end_time_s > now_s {
        WRONG_LAST_TIME.log(|suppressed| {
            log::warn!(
                "wrong last time on-disk for {uuid} ({start_time_s} - {end_time_s}, now {now_s}), \
                 fixing last time to now ({suppressed} similar suppressed)"
            );
        });
        end_time_s = now_s;
    }

    if start_time_s > end_time_s {
        WRONG_FIRST_TIME.log(|suppressed| {
            log::warn!(
                "wrong first time on-disk for {uuid} ({start_time_s} - {end_time_s}, now {now_s}), \
                 fixing first time to last time ({suppressed} similar suppressed)"
            );
        });
        start_time_s = end_time_s;
    }

    if start_time_s == 0 || end_time_s == 0 {
        ZERO_TIMESTAMPS.log(|suppressed| {
            log::warn!(
                "zero on-disk timestamps for {uuid} ({start_time_s} - {end_time_s}, now {now_s}), \
                 using them as-is ({suppressed} similar suppressed)"
            );
        });
    }

    let update_every_s = if update_every_s != 0 {
        update_every_s
    } else {
        overwrite_zero_update_every_s
    };

    let data_on_disk_valid = page_length > 0 && start_time_s > 0 && end_time_s > 0;

    ValidatedPageDescriptor {
        start_time_s,
        end_time_s,
        update_every_s,
        page_length,
        page_type,
        data_on_disk_valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_future_end_time_to_now() {
        let uuid = Uuid::new_v4();
        let now = 10_000;
        let vd = validate_page_descriptor(&uuid, 240, 9_000, now + 3_600, 1, 0, now, 0);
        assert!(vd.data_on_disk_valid);
        assert_eq!(vd.end_time_s, now);
        assert_eq!(vd.start_time_s, 9_000);
    }

    #[test]
    fn collapses_inverted_range() {
        let uuid = Uuid::new_v4();
        let vd = validate_page_descriptor(&uuid, 240, 500, 100, 1, 0, 10_000, 0);
        assert_eq!(vd.start_time_s, 100);
        assert_eq!(vd.end_time_s, 100);
    }

    #[test]
    fn zero_page_length_is_invalid() {
        let uuid = Uuid::new_v4();
        let vd = validate_page_descriptor(&uuid, 0, 100, 200, 1, 0, 10_000, 0);
        assert!(!vd.data_on_disk_valid);
    }

    #[test]
    fn zero_update_every_takes_known_granularity() {
        let uuid = Uuid::new_v4();
        let vd = validate_page_descriptor(&uuid, 240, 100, 200, 0, 0, 10_000, 15);
        assert_eq!(vd.update_every_s, 15);
    }
}
