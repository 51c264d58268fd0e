use super::{
    LogError, LogResult,
    consts::{LOG_ARCHIVE_SUFFIX, LOG_FILE_BASE_ROLLS, LOG_FILE_MAX_ROLLS, LOG_FILE_MAX_SIZE, LOG_LINE_PATTERN, LOG_LINE_PATTERN_COLORED},
};
use log::LevelFilter;
use log4rs::{
    append::{
        Append,
        console::ConsoleAppender,
        rolling_file::{
            RollingFileAppender,
            policy::compound::{CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger},
        },
    },
    config::Appender,
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use std::path::Path;

/// Colored stdout appender
pub(super) fn console(name: &'static str, threshold: Option<LevelFilter>) -> Appender {
    let console = ConsoleAppender::builder().encoder(Box::new(PatternEncoder::new(LOG_LINE_PATTERN_COLORED))).build();
    filtered(name, threshold, Box::new(console))
}

/// Appender writing `<log_dir>/<file_name>`. The file is rolled into gzip archives next
/// to it once it grows past [`LOG_FILE_MAX_SIZE`].
pub(super) fn rolling_file(name: &'static str, threshold: Option<LevelFilter>, log_dir: &Path, file_name: &str) -> LogResult<Appender> {
    let archives = log_dir.join(format!("{}{}", file_name, LOG_ARCHIVE_SUFFIX));
    let archives =
        archives.to_str().ok_or_else(|| LogError::AppenderError(format!("log directory {} is not valid UTF-8", log_dir.display())))?;
    let roller = FixedWindowRoller::builder()
        .base(LOG_FILE_BASE_ROLLS)
        .build(archives, LOG_FILE_MAX_ROLLS)
        .map_err(|err| LogError::AppenderError(err.to_string()))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(LOG_FILE_MAX_SIZE)), Box::new(roller));

    let file_path = log_dir.join(file_name);
    let file = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_LINE_PATTERN)))
        .build(&file_path, Box::new(policy))
        .map_err(|err| LogError::AppenderError(format!("{}: {}", file_path.display(), err)))?;
    Ok(filtered(name, threshold, Box::new(file)))
}

fn filtered(name: &'static str, threshold: Option<LevelFilter>, append: Box<dyn Append>) -> Appender {
    let builder = Appender::builder();
    let builder = match threshold {
        Some(level) => builder.filter(Box::new(ThresholdFilter::new(level))),
        None => builder,
    };
    builder.build(name, append)
}
