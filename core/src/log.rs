//!
//! Logger and logging macros shared by every helm crate.
//!
//! Call [`init_logger`] once at startup. Tests may call [`try_init_logger`]
//! as often as they like.
//!

mod appender;
mod consts;
mod logger;

pub use consts::*;
use log::LevelFilter;
use log4rs::config::{Appender, Config, Root};
use logger::Directives;
use std::path::Path;
use thiserror::Error;

#[doc(hidden)]
pub use log as __log;

#[derive(Clone, Debug, Error)]
pub enum LogError {
    #[error("Logger spec parsing error: {0}")]
    ParseLoggerSpecError(String),

    #[error("Log appender error: {0}")]
    AppenderError(String),

    #[error("Logger configuration error: {0}")]
    ConfigError(String),

    #[error("A logger is already installed")]
    AlreadyInstalled,
}

pub type LogResult<T> = std::result::Result<T, LogError>;

/// Maps a 0..=127 verbosity (as taken by `--clog-level` and `--flog-level`) to a level filter
pub fn verbosity_to_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the process logger.
///
/// The console appender is filtered at `console_level`. When `log_dir` is set, a rolling
/// log file filtered at `file_level` and a rolling error file are written under it, with
/// `file_stem` prefixing both file names. Per-module levels are read from [`DEFAULT_LOGGER_ENV`].
pub fn init_logger(log_dir: Option<&str>, file_stem: &str, console_level: LevelFilter, file_level: LevelFilter) -> LogResult<()> {
    let file_level = if log_dir.is_some() { file_level } else { LevelFilter::Off };
    let directives = Directives::new(console_level.max(file_level)).with_env(DEFAULT_LOGGER_ENV);

    let mut appenders = vec![appender::console(CONSOLE_APPENDER, Some(console_level))];
    if let Some(log_dir) = log_dir {
        let log_dir = Path::new(log_dir);
        let log_file = format!("{}{}", file_stem, LOG_FILE_SUFFIX);
        appenders.push(appender::rolling_file(LOG_FILE_APPENDER, Some(file_level), log_dir, &log_file)?);
        let err_log_file = format!("{}{}", file_stem, ERR_LOG_FILE_SUFFIX);
        appenders.push(appender::rolling_file(ERR_LOG_FILE_APPENDER, Some(LevelFilter::Warn), log_dir, &err_log_file)?);
    }
    install(appenders, directives)
}

/// Installs a console-only logger configured by a `<level>,<module>=<level>` expression.
///
/// Does nothing if a logger is already installed, so tests may call it freely.
pub fn try_init_logger(filters: &str) {
    let directives = Directives::new(LevelFilter::Info).with_expression(filters);
    let _ = install(vec![appender::console(CONSOLE_APPENDER, None)], directives);
}

fn install(appenders: Vec<Appender>, directives: Directives) -> LogResult<()> {
    let names = appenders.iter().map(|appender| appender.name().to_string()).collect::<Vec<_>>();
    let config = Config::builder()
        .appenders(appenders)
        .loggers(directives.loggers())
        .build(Root::builder().appenders(names).build(directives.root()))
        .map_err(|err| LogError::ConfigError(err.to_string()))?;
    log4rs::init_config(config).map(|_| ()).map_err(|_| LogError::AlreadyInstalled)
}

#[macro_export]
macro_rules! trace {
    ($($t:tt)*) => (
        $crate::log::__log::trace!($($t)*)
    )
}

#[macro_export]
macro_rules! debug {
    ($($t:tt)*) => (
        $crate::log::__log::debug!($($t)*)
    )
}

#[macro_export]
macro_rules! info {
    ($($t:tt)*) => (
        $crate::log::__log::info!($($t)*)
    )
}

#[macro_export]
macro_rules! warn {
    ($($t:tt)*) => (
        $crate::log::__log::warn!($($t)*)
    )
}

#[macro_export]
macro_rules! error {
    ($($t:tt)*) => (
        $crate::log::__log::error!($($t)*)
    )
}
