//! Logging levels, fault injection, and the in-memory bus and scripted workers used by the
//! crate's tests.

mod failure_config;
mod local_hub;
mod logging;
mod nodes;
mod worker;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  local_hub::LocalHub,
  local_hub::LocalTransport,
  logging::init_logging,
  logging::LogLevel,
  nodes::fast_config,
  nodes::wait_until,
  worker::TestWorker,
};
