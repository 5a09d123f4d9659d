use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_FILE: &str = "dsflow.log";
pub const REPORT_FILE: &str = "dsflow-requests.json";

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), log_dir: None }
    }
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self { log_level: log_level.into(), log_dir }
    }
}

/// Installs the global subscriber.
///
/// - stdout always gets the human-readable log, filtered by `log_level` (an `EnvFilter` directive).
/// - with a `log_dir`, the same log also goes to a daily-rolling text file, and every
///   `target: "request"` event (one per RPC round trip) lands in a daily-rolling JSON report.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(&config.log_level));

    match &config.log_dir {
        None => Registry::default().with(stdout_layer).try_init()?,
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            let txt_layer = fmt::layer()
                .with_writer(txt_appender)
                .with_ansi(false)
                .with_filter(EnvFilter::new(&config.log_level));

            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, REPORT_FILE);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new("request=info"));

            Registry::default()
                .with(stdout_layer)
                .with(txt_layer)
                .with(json_layer)
                .try_init()?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_init_is_an_error_not_a_panic() {
        let tmp = TempDir::new().unwrap();
        let cfg = LogConfig::new("debug", Some(tmp.path().join("logs")));
        let first = init_tracing(&cfg);
        // another test in this binary may have installed a subscriber already
        if first.is_ok() {
            assert!(tmp.path().join("logs").exists());
        }
        assert!(init_tracing(&LogConfig::default()).is_err());
    }
}
