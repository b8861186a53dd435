use im::HashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How datagrams headed to one host misbehave.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  /// Probability in `[0, 1]` that a datagram is lost.
  pub drop_prob: f64,
  /// Delivered datagrams are held back for a uniformly random duration in this range.
  pub delay: Option<(Duration, Duration)>,
}

/// Failure settings for a whole test network.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  /// Applies to every host without an override.
  pub cluster_wide: FailureConfig,
  /// Overrides for datagrams sent to particular hosts.
  pub node_wide: HashMap<String, FailureConfig>,
}
impl FailureConfigMap {
  /// The settings for datagrams sent to `host`.
  pub fn get(&self, host: &str) -> &FailureConfig {
    self.node_wide.get(host).unwrap_or(&self.cluster_wide)
  }
}
