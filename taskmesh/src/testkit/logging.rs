use tracing_subscriber::EnvFilter;

/// Severity floor for the crate's logging macros. Every module declares a `LOG_LEVEL` constant; a
/// message is forwarded to [`tracing`] only if its own level is at or above that constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;

  pub fn enabled(self, floor: LogLevel) -> bool {
    floor != LogLevel::Off && self >= floor
  }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to `default_filter`. Calling
/// it twice is harmless; the second install is ignored.
pub fn init_logging(default_filter: &str) {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
  let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

#[macro_export]
macro_rules! trace {
  ($level:expr, $($arg:tt)+) => {
    if $crate::testkit::LogLevel::Trace.enabled($level) {
      ::tracing::trace!($($arg)+);
    }
  };
}

#[macro_export]
macro_rules! debug {
  ($level:expr, $($arg:tt)+) => {
    if $crate::testkit::LogLevel::Debug.enabled($level) {
      ::tracing::debug!($($arg)+);
    }
  };
}

#[macro_export]
macro_rules! info {
  ($level:expr, $($arg:tt)+) => {
    if $crate::testkit::LogLevel::Info.enabled($level) {
      ::tracing::info!($($arg)+);
    }
  };
}

#[macro_export]
macro_rules! warn {
  ($level:expr, $($arg:tt)+) => {
    if $crate::testkit::LogLevel::Warn.enabled($level) {
      ::tracing::warn!($($arg)+);
    }
  };
}

#[macro_export]
macro_rules! error {
  ($level:expr, $($arg:tt)+) => {
    if $crate::testkit::LogLevel::Error.enabled($level) {
      ::tracing::error!($($arg)+);
    }
  };
}

#[test]
fn test_level_floor() {
  assert!(LogLevel::Warn.enabled(LogLevel::Info));
  assert!(LogLevel::Info.enabled(LogLevel::Info));
  assert!(!LogLevel::Debug.enabled(LogLevel::Info));
  assert!(!LogLevel::Error.enabled(LogLevel::Off));
  assert!(LogLevel::Trace.enabled(LogLevel::MIN));
}
