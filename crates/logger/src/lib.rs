use colored::Colorize;
use log::{Level, LevelFilter};
use std::sync::OnceLock;

#[derive(Clone)]
pub struct Logger {
  level: Level,
}

impl log::Log for Logger {
  fn enabled(&self, metadata: &log::Metadata) -> bool {
    metadata.level() <= self.level
  }

  fn log(&self, record: &log::Record) {
    if !self.enabled(record.metadata()) {
      return;
    }

    let time = chrono::Local::now()
      .format("%Y-%m-%d %H:%M:%S")
      .to_string()
      .magenta();

    let level = match record.level() {
      Level::Error => "ERROR".red(),
      Level::Warn => "WARN".yellow(),
      Level::Info => "INFO".green(),
      Level::Debug => "DEBUG".blue(),
      Level::Trace => "TRACE".white(),
    };

    let prefix = match (record.file(), record.line()) {
      (Some(file), Some(line)) if self.level >= Level::Debug => {
        format!("{}:{} ", file, line).cyan()
      }
      _ => String::new().black(),
    };

    // Runner logs go to stderr so step output on stdout stays clean
    eprintln!("{}{} {} {}", prefix, time, level, record.args());
  }

  fn flush(&self) {}
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

pub fn init_logger() {
  init_logger_with_level(Level::Info);
}

pub fn init_logger_with_level(level: Level) {
  if LOGGER.get().is_some() {
    return;
  }

  let logger = LOGGER.get_or_init(|| Logger { level });

  if log::set_logger(logger).is_ok() {
    log::set_max_level(level.to_level_filter());
  }
}

/// Parses `LOG_LEVEL` style values, falling back to `Info`.
pub fn level_from_str(value: &str) -> Level {
  match value.parse::<LevelFilter>() {
    Ok(filter) => filter.to_level().unwrap_or(Level::Error),
    Err(_) => Level::Info,
  }
}
