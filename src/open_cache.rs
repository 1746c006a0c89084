use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::datafile::DatafilePair;
use crate::registry::MetricRegistry;
use crate::types::{MetricId, SectionId};

/// An entry in the open-pages cache: points at on-disk bytes of a page that
/// has been flushed but not yet loaded.
#[derive(Debug, Clone)]
pub struct HotPage {
    pub metric_id: MetricId,
    pub start_time_s: i64,
    pub end_time_s: i64,
    pub update_every_s: u32,
    pub fileno: u32,
    pub extent_offset: u64,
    pub extent_size: u32,
    pub page_length: u32,
}

/// Extent entry handed to the migrator, keyed by datafile position.
#[derive(Debug, Clone)]
pub struct JournalExtentInfo {
    pub index: u32,
    pub pos: u64,
    pub bytes: u32,
    pub number_of_pages: u16,
}

#[derive(Debug, Clone)]
pub struct JournalPageInfo {
    pub start_time_s: i64,
    pub end_time_s: i64,
    pub update_every_s: u32,
    pub page_length: u32,
    pub extent_index: u32,
}

/// Per-metric migration input; `pages_by_start_time` iterates in ascending
/// start-time order, which is the order pages land in the v2 page list.
#[derive(Debug, Clone)]
pub struct JournalMetricInfo {
    pub uuid: Uuid,
    pub first_time_s: i64,
    pub last_time_s: i64,
    pub number_of_pages: usize,
    pub pages_by_start_time: BTreeMap<i64, JournalPageInfo>,
}

/// Migration callback: `(section, fileno, page_type, metrics, extents,
/// number_of_extents, number_of_metrics, number_of_pages)`.
pub type MigrateCallback<'a> = dyn FnOnce(
        SectionId,
        u32,
        u8,
        &BTreeMap<MetricId, JournalMetricInfo>,
        &BTreeMap<u64, JournalExtentInfo>,
        usize,
        usize,
        usize,
    ) + 'a;

/// The open-pages cache. Hot pages accumulate here while a datafile pair is
/// being written; once the pair is sealed they become the in-memory indices
/// the v2 migrator consumes.
#[derive(Default)]
pub struct OpenCache {
    pages: RwLock<HashMap<(SectionId, u32), Vec<HotPage>>>,
}

impl OpenCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_hot_page(
        &self,
        section: SectionId,
        metric_id: MetricId,
        start_time_s: i64,
        end_time_s: i64,
        update_every_s: u32,
        datafile: &DatafilePair,
        extent_offset: u64,
        extent_size: u32,
        page_length: u32,
    ) {
        let page = HotPage {
            metric_id,
            start_time_s,
            end_time_s,
            update_every_s,
            fileno: datafile.fileno,
            extent_offset,
            extent_size,
            page_length,
        };
        self.pages
            .write()
            .entry((section, datafile.fileno))
            .or_default()
            .push(page);
    }

    pub fn hot_pages(&self, section: SectionId, fileno: u32) -> Vec<HotPage> {
        self.pages
            .read()
            .get(&(section, fileno))
            .cloned()
            .unwrap_or_default()
    }

    /// Drops every hot page of a destroyed or rotated datafile.
    pub fn evict_datafile(&self, section: SectionId, fileno: u32) {
        self.pages.write().remove(&(section, fileno));
    }

    /// Assembles the ordered migration indices for one sealed datafile and
    /// invokes `migrate` once. Returns false (without invoking the callback)
    /// when the cache holds nothing for this `(section, fileno)`.
    pub fn to_journal_v2(
        &self,
        section: SectionId,
        fileno: u32,
        page_type: u8,
        registry: &MetricRegistry,
        migrate: Box<MigrateCallback<'_>>,
    ) -> bool {
        let hot = self.hot_pages(section, fileno);
        if hot.is_empty() {
            log::debug!("no open pages for section {:?} fileno {fileno}, nothing to index", section);
            return false;
        }

        // Extents in datafile-position order, indexed in that order.
        let mut extents: BTreeMap<u64, JournalExtentInfo> = BTreeMap::new();
        for page in &hot {
            let e = extents.entry(page.extent_offset).or_insert(JournalExtentInfo {
                index: 0,
                pos: page.extent_offset,
                bytes: page.extent_size,
                number_of_pages: 0,
            });
            e.number_of_pages += 1;
        }
        for (index, e) in extents.values_mut().enumerate() {
            e.index = index as u32;
        }

        let mut metrics: BTreeMap<MetricId, JournalMetricInfo> = BTreeMap::new();
        let mut number_of_pages = 0usize;
        for page in &hot {
            let Some(metric) = registry.get_by_id(page.metric_id) else {
                log::warn!("open page references unregistered metric {:?}, dropping", page.metric_id);
                continue;
            };
            let extent_index = extents[&page.extent_offset].index;
            let info = metrics.entry(page.metric_id).or_insert_with(|| JournalMetricInfo {
                uuid: *metric.uuid(),
                first_time_s: page.start_time_s,
                last_time_s: page.end_time_s,
                number_of_pages: 0,
                pages_by_start_time: BTreeMap::new(),
            });
            info.first_time_s = info.first_time_s.min(page.start_time_s);
            info.last_time_s = info.last_time_s.max(page.end_time_s);
            let inserted = info
                .pages_by_start_time
                .insert(
                    page.start_time_s,
                    JournalPageInfo {
                        start_time_s: page.start_time_s,
                        end_time_s: page.end_time_s,
                        update_every_s: page.update_every_s,
                        page_length: page.page_length,
                        extent_index,
                    },
                )
                .is_none();
            if inserted {
                info.number_of_pages += 1;
                number_of_pages += 1;
            }
        }

        if metrics.is_empty() {
            return false;
        }

        let number_of_extents = extents.len();
        let number_of_metrics = metrics.len();
        migrate(
            section,
            fileno,
            page_type,
            &metrics,
            &extents,
            number_of_extents,
            number_of_metrics,
            number_of_pages,
        );
        true
    }
}
