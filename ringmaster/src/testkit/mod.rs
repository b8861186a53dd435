//! Tools for testing protocols on a single machine: an in-process network that loses and delays
//! datagrams on demand, and a logging bootstrap.

mod failure_config;
mod logging;
mod mock_network;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  logging::init_logging,
  logging::LogLevel,
  mock_network::MockNetwork,
  mock_network::MockTransport,
};
