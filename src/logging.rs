use std::path::Path;

use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config,
};

use crate::error::ConvertError;

const STDERR_PATTERN: &str = "{h({d(%Y-%m-%d %H:%M:%S)} [{l}] {M})} - {m}{n}";
// No color codes in the file copy.
const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} [{l}] {M} - {m}{n}";

/// Set up logging to stderr, and to `log_file` as well when one is given.
///
/// Multi-year batch runs can take hours; the file copy keeps the full run
/// record after the terminal scrolls away.
pub fn init_logging(level: log::LevelFilter, log_file: Option<&Path>) {
    let config = build_config(level, log_file).expect("Failed to configure logger");
    log4rs::init_config(config).expect("Failed to initialize logger");
}

fn build_config(
    level: log::LevelFilter,
    log_file: Option<&Path>,
) -> Result<Config, ConvertError> {
    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(STDERR_PATTERN)))
        .target(Target::Stderr)
        .build();

    let mut config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
            .append(true)
            .build(path)
            .map_err(|e| {
                ConvertError::Configuration(format!(
                    "could not open log file {}: {e}",
                    path.display()
                ))
            })?;
        config = config.appender(Appender::builder().build("logfile", Box::new(file)));
        root = root.appender("logfile");
    }

    config
        .build(root.build(level))
        .map_err(|e| ConvertError::Configuration(format!("invalid logging setup: {e}")))
}
