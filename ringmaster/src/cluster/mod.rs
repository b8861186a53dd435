//! The two protocols and their wiring.
//!
//! [`FailureDetector`] keeps the membership: who is in the group, in ring order, with joins,
//! departures and failures spread by gossip between ring neighbors. [`Election`] keeps the
//! master: it watches the detector for the master's disappearance and elects the live member with
//! the highest ID by passing messages along the detector's ring.
//!
//! Both talk over a [`Transport`](crate::core::Transport) on separate ports. [`Node`] builds
//! both from one [`NodeConfig`].
//!
//! ```ignore
//! let transport = Arc::new(UdpTransport::new("10.0.0.2".to_string()));
//! let mut config = NodeConfig::default();
//! config.hostname = "10.0.0.2".to_string();
//! let node = Node::new(config, transport)?;
//! node.start().await?;
//! node.join("10.0.0.1").await?;
//! let master = node.election().wait_for_master().await;
//! ```

mod config;
mod detector;
mod election;
pub mod messages;
mod node;
mod timer;

pub(crate) use detector::Tasks;

#[rustfmt::skip]
pub use {
  config::DetectorConfig,
  config::ElectionConfig,
  config::NodeConfig,
  detector::FailureDetector,
  detector::MemberCallback,
  election::Election,
  election::Phase,
  node::Node,
  timer::ElectionTimer,
};
