use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::JournalError;

/// Engine-wide configuration. All fields have defaults so a partial TOML file
/// (or none at all) is enough to run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the datafile/journalfile pairs.
    pub dbfiles_path: PathBuf,
    /// Storage tier this context serves.
    pub tier: u32,
    /// Default page type written by this context.
    pub page_type: u8,
    /// Verify every per-metric page block when loading a v2 index.
    pub journal_deep_check: bool,
    /// Datafile size at which ingest rolls over to a new pair.
    pub target_datafile_size: u64,
    /// Level for the engine's file logger ("off" to "trace").
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dbfiles_path: PathBuf::from("."),
            tier: 0,
            page_type: crate::types::PAGE_TYPE_METRICS,
            journal_deep_check: false,
            target_datafile_size: 256 * 1024 * 1024,
            log_level: "info".into(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_toml(path: &Path) -> Result<Self, JournalError> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| JournalError::Config(e.to_string()))
    }
}
