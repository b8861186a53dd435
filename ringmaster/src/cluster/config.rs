use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Parameters of the [`FailureDetector`](crate::cluster::FailureDetector).
#[derive(Serialize, Deserialize, Validate, Clone, Debug)]
#[serde(default)]
pub struct DetectorConfig {
  /// Period of the gossip loop.
  /// default: `250ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub gossip_interval: Duration,

  /// A neighbor silent for longer than this is declared failed.
  /// default: `2000ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub failure_timeout: Duration,

  /// Extra time a newly admitted member has before its first heartbeat must arrive.
  /// default: `2000ms`
  #[serde(with = "millis")]
  pub new_member_slack: Duration,

  /// How many gossip rounds carry each join, leave and failure, and how many copies of a join
  /// request are sent.
  /// default: `4`
  #[validate(range(min = 1))]
  pub redundancy: usize,

  /// How long `stop` waits for the loops to exit.
  /// default: `2000ms`
  #[serde(with = "millis")]
  pub stop_grace: Duration,
}
impl Default for DetectorConfig {
  fn default() -> Self {
    DetectorConfig {
      gossip_interval: Duration::from_millis(250),
      failure_timeout: Duration::from_millis(2000),
      new_member_slack: Duration::from_millis(2000),
      redundancy: 4,
      stop_grace: Duration::from_millis(2000),
    }
  }
}

/// Parameters of the [`Election`](crate::cluster::Election).
#[derive(Serialize, Deserialize, Validate, Clone, Debug)]
#[serde(default)]
pub struct ElectionConfig {
  /// Minimum wait between losing the master and starting an election.
  /// default: `12000ms`
  #[serde(with = "millis")]
  pub stabilization: Duration,

  /// A random extra wait in `[0, stabilization_jitter)` is added to `stabilization`, so nodes
  /// rarely initiate at the same time.
  /// default: `6000ms`
  #[serde(with = "millis")]
  pub stabilization_jitter: Duration,

  /// An election not finished after this long is restarted.
  /// default: `15000ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub election_timeout: Duration,

  /// A node that declared itself master restarts the election if its announcement has not
  /// come back around the ring after this long.
  /// default: `5000ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub elected_timeout: Duration,

  /// Period of the loop sending queued election messages.
  /// default: `250ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub message_interval: Duration,

  /// Copies sent of each ELECTION, ELECTED and PROPOSAL.
  /// default: `3`
  #[validate(range(min = 1))]
  pub redundancy: usize,

  /// Copies sent of each INTRODUCTION.
  /// default: `8`
  #[validate(range(min = 1))]
  pub introduction_redundancy: usize,

  /// How often the election timer is checked.
  /// default: `100ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub timer_resolution: Duration,

  /// Number of refresh cycles a seen message UUID is remembered for.
  /// default: `5`
  #[validate(range(min = 1))]
  pub seen_ttl_cycles: usize,

  /// Length of one refresh cycle of the seen UUID cache.
  /// default: `60000ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub seen_refresh_interval: Duration,

  /// Longest single wait inside `wait_for_master` before the state is checked again.
  /// default: `1000ms`
  #[serde(with = "millis")]
  #[validate(custom = "non_zero")]
  pub master_poll: Duration,

  /// How long `stop` waits for the loops to exit.
  /// default: `2000ms`
  #[serde(with = "millis")]
  pub stop_grace: Duration,
}
impl Default for ElectionConfig {
  fn default() -> Self {
    ElectionConfig {
      stabilization: Duration::from_millis(12000),
      stabilization_jitter: Duration::from_millis(6000),
      election_timeout: Duration::from_millis(15000),
      elected_timeout: Duration::from_millis(5000),
      message_interval: Duration::from_millis(250),
      redundancy: 3,
      introduction_redundancy: 8,
      timer_resolution: Duration::from_millis(100),
      seen_ttl_cycles: 5,
      seen_refresh_interval: Duration::from_secs(60),
      master_poll: Duration::from_millis(1000),
      stop_grace: Duration::from_millis(2000),
    }
  }
}

/// Everything one node needs to take part in the group.
#[derive(Serialize, Deserialize, Validate, Clone, Debug)]
#[serde(default)]
#[validate(schema(function = "distinct_ports"))]
pub struct NodeConfig {
  /// The name other nodes reach this one by.
  /// default: `"localhost"`
  #[validate(length(min = 1))]
  pub hostname: String,

  /// Whether this node founds the group instead of joining it.
  /// default: `false`
  pub first_node: bool,

  /// default: `1234`
  pub membership_port: u16,

  /// default: `1235`
  pub election_port: u16,

  /// Membership protocol settings.
  #[validate]
  pub detector: DetectorConfig,

  /// Election protocol settings.
  #[validate]
  pub election: ElectionConfig,
}
impl Default for NodeConfig {
  fn default() -> Self {
    NodeConfig {
      hostname: "localhost".to_string(),
      first_node: false,
      membership_port: 1234,
      election_port: 1235,
      detector: DetectorConfig::default(),
      election: ElectionConfig::default(),
    }
  }
}
impl NodeConfig {
  /// Reads a JSON config, missing fields taking their defaults, and validates it.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<NodeConfig> {
    let text = std::fs::read_to_string(path)?;
    let config: NodeConfig = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }
}

fn non_zero(d: &Duration) -> std::result::Result<(), ValidationError> {
  if d.is_zero() {
    return Err(ValidationError::new("zero_duration"));
  }
  Ok(())
}

fn distinct_ports(config: &NodeConfig) -> std::result::Result<(), ValidationError> {
  if config.membership_port == config.election_port {
    return Err(ValidationError::new("shared_port"));
  }
  Ok(())
}

mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}
