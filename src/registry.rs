use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{MetricId, SectionId, now_realtime_sec, validate_page_descriptor};

/// One registered metric. Retention fields are atomics so replay, v2 loading
/// and queries can touch them without holding the registry lock.
pub struct Metric {
    id: MetricId,
    uuid: Uuid,
    section: SectionId,
    first_time_s: AtomicI64,
    last_time_s: AtomicI64,
    update_every_s: AtomicU32,
}

impl Metric {
    pub fn id(&self) -> MetricId {
        self.id
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn section(&self) -> SectionId {
        self.section
    }

    pub fn first_time_s(&self) -> i64 {
        self.first_time_s.load(Ordering::Relaxed)
    }

    pub fn last_time_s(&self) -> i64 {
        self.last_time_s.load(Ordering::Relaxed)
    }

    pub fn update_every_s(&self) -> u32 {
        self.update_every_s.load(Ordering::Relaxed)
    }

    /// Retention tuple, handy for asserting registry state in tests.
    pub fn retention(&self) -> (i64, i64, u32) {
        (self.first_time_s(), self.last_time_s(), self.update_every_s())
    }
}

/// The fields needed to register a metric.
#[derive(Debug, Clone)]
pub struct MetricEntry {
    pub uuid: Uuid,
    pub section: SectionId,
    pub first_time_s: i64,
    pub last_time_s: i64,
    pub update_every_s: u32,
}

/// The metric registry (MRG): maps `(section, uuid)` to retention state.
/// Acquire/release is expressed through `Arc<Metric>`; dropping the handle
/// releases it.
#[derive(Default)]
pub struct MetricRegistry {
    by_uuid: RwLock<HashMap<(SectionId, Uuid), Arc<Metric>>>,
    by_id: RwLock<HashMap<MetricId, Arc<Metric>>>,
    next_id: AtomicU64,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry`, or returns the existing metric. The boolean is true
    /// when the metric was added by this call.
    pub fn add_and_acquire(&self, entry: MetricEntry) -> (Arc<Metric>, bool) {
        let key = (entry.section, entry.uuid);
        if let Some(existing) = self.by_uuid.read().get(&key) {
            return (existing.clone(), false);
        }
        let mut by_uuid = self.by_uuid.write();
        if let Some(existing) = by_uuid.get(&key) {
            return (existing.clone(), false);
        }
        let id = MetricId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let metric = Arc::new(Metric {
            id,
            uuid: entry.uuid,
            section: entry.section,
            first_time_s: AtomicI64::new(entry.first_time_s),
            last_time_s: AtomicI64::new(entry.last_time_s),
            update_every_s: AtomicU32::new(entry.update_every_s),
        });
        by_uuid.insert(key, metric.clone());
        self.by_id.write().insert(id, metric.clone());
        (metric, true)
    }

    pub fn get_and_acquire(&self, uuid: &Uuid, section: SectionId) -> Option<Arc<Metric>> {
        self.by_uuid.read().get(&(section, *uuid)).cloned()
    }

    pub fn get_by_id(&self, id: MetricId) -> Option<Arc<Metric>> {
        self.by_id.read().get(&id).cloned()
    }

    /// Widens the metric's known retention window to cover `[first, last]` and
    /// records the latest granularity.
    pub fn expand_retention(&self, metric: &Metric, first_time_s: i64, last_time_s: i64, update_every_s: u32) {
        if first_time_s > 0 {
            metric.first_time_s.fetch_min(first_time_s, Ordering::Relaxed);
        }
        if last_time_s > 0 {
            metric.last_time_s.fetch_max(last_time_s, Ordering::Relaxed);
        }
        if update_every_s > 0 {
            metric.update_every_s.store(update_every_s, Ordering::Relaxed);
        }
    }

    /// Seeds retention from an on-disk tuple, fixing timestamp anomalies the
    /// same way the replay path does.
    pub fn update_metric_retention_and_granularity(
        &self,
        section: SectionId,
        uuid: &Uuid,
        first_time_s: i64,
        last_time_s: i64,
        update_every_s: u32,
    ) {
        let now_s = now_realtime_sec();
        let vd = validate_page_descriptor(uuid, 1, first_time_s, last_time_s, update_every_s, 0, now_s, 0);

        let (metric, added) = self.add_and_acquire(MetricEntry {
            uuid: *uuid,
            section,
            first_time_s: vd.start_time_s,
            last_time_s: vd.end_time_s,
            update_every_s: vd.update_every_s,
        });
        if !added {
            self.expand_retention(&metric, vd.start_time_s, vd.end_time_s, vd.update_every_s);
        }
    }

    pub fn len(&self) -> usize {
        self.by_uuid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.read().is_empty()
    }

    /// Retention tuples for one section, sorted by uuid; test and shutdown aid.
    pub fn retention_dump(&self, section: SectionId) -> Vec<(Uuid, i64, i64, u32)> {
        let mut out: Vec<_> = self
            .by_uuid
            .read()
            .values()
            .filter(|m| m.section == section)
            .map(|m| (m.uuid, m.first_time_s(), m.last_time_s(), m.update_every_s()))
            .collect();
        out.sort_by_key(|(u, ..)| *u);
        out
    }
}
