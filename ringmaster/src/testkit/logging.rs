use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Verbosity for [`init_logging`], least severe first.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum LogLevel {
  /// Everything, down to individual datagrams.
  Trace,
  /// Protocol decisions.
  Debug,
  /// Membership and master changes.
  Info,
  /// Recoverable trouble.
  Warn,
  /// Protocol violations only.
  Error,
  /// Logs nothing.
  Off,
}
impl LogLevel {
  /// The most verbose level.
  pub const MIN: LogLevel = LogLevel::Trace;
}
impl From<LogLevel> for LevelFilter {
  fn from(level: LogLevel) -> LevelFilter {
    match level {
      LogLevel::Trace => LevelFilter::TRACE,
      LogLevel::Debug => LevelFilter::DEBUG,
      LogLevel::Info => LevelFilter::INFO,
      LogLevel::Warn => LevelFilter::WARN,
      LogLevel::Error => LevelFilter::ERROR,
      LogLevel::Off => LevelFilter::OFF,
    }
  }
}
impl FromStr for LogLevel {
  type Err = String;

  fn from_str(s: &str) -> Result<LogLevel, String> {
    match s.to_ascii_lowercase().as_str() {
      "trace" => Ok(LogLevel::Trace),
      "debug" => Ok(LogLevel::Debug),
      "info" => Ok(LogLevel::Info),
      "warn" => Ok(LogLevel::Warn),
      "error" => Ok(LogLevel::Error),
      "off" => Ok(LogLevel::Off),
      _ => Err(format!("unknown log level `{}`", s)),
    }
  }
}

/// Installs a global `fmt` subscriber at `level`, unless `RUST_LOG` says otherwise.
///
/// Only the first call in a process has an effect, so every test may call it.
pub fn init_logging(level: LogLevel) {
  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::from(level).into())
    .from_env_lossy();
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_thread_names(true)
    .try_init();
}

#[test]
fn test_log_level_parse() {
  assert_eq!("Debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
  assert!("loud".parse::<LogLevel>().is_err());
  assert!(LogLevel::MIN < LogLevel::Off);
  assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
}
