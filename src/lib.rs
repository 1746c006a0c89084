//! chronolite: the journal subsystem of a lightweight time-series storage
//! engine. Extent metadata is recorded at ingest time in an append-only v1
//! journal; when a datafile pair is sealed the journal is migrated into a
//! compact, memory-mapped v2 index that seeds the metric registry at startup.

pub mod config;
pub mod context;
pub mod datafile;
pub mod errors;
pub mod journal_v1;
pub mod journal_v2;
pub mod journalfile;
pub mod logger;
pub mod open_cache;
pub mod paths;
pub mod registry;
pub mod telemetry;
pub mod types;
pub mod wal;

mod test_support;

pub use config::EngineConfig;
pub use context::EngineContext;
pub use datafile::DatafilePair;
pub use errors::JournalError;
pub use journal_v2::V2LoadStatus;
pub use journalfile::{
    JournalFile, MappedIndex, journal_close, journal_create, journal_destroy_unsafe, journal_load,
    journal_unlink,
};
pub use wal::{Wal, wal_flush_transaction_buffer};
