use std::error::Error;
use std::path::Path;

use log::LevelFilter;
use log4rs::Config;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::EngineConfig;

const LOG_FILE_SIZE_LIMIT: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: u32 = 3;

fn archived_pattern(dir: &Path) -> String {
    format!("{}/chronolite.{{}}.log", dir.display())
}

/// Routes the `log` facade into `{dbfiles_path}/logs/chronolite.log`, rolled
/// by size with a fixed number of archives kept. The level comes from
/// `EngineConfig::log_level`. Call once per process, at engine startup.
pub fn init_for_engine(config: &EngineConfig) -> Result<(), Box<dyn Error>> {
    let level = config.log_level.parse::<LevelFilter>()?;
    let log_dir = config.dbfiles_path.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let roller = FixedWindowRoller::builder().build(&archived_pattern(&log_dir), LOG_FILES_KEPT)?;
    let trigger = SizeTrigger::new(LOG_FILE_SIZE_LIMIT);
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%dT%H:%M:%S%.6f)} {l:<5} [{T}] {t}: {m}{n}",
        )))
        .build(
            log_dir.join("chronolite.log"),
            Box::new(CompoundPolicy::new(Box::new(trigger), Box::new(roller))),
        )?;

    let log_config = Config::builder()
        .appender(Appender::builder().build("journal", Box::new(appender)))
        .build(Root::builder().appender("journal").build(level))?;
    log4rs::init_config(log_config)?;
    Ok(())
}
