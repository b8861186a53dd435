use crate::cluster::{Election, FailureDetector, NodeConfig};
use crate::core::{Member, Transport};
use crate::Result;
use std::sync::Arc;
use validator::Validate;

/// One participant: a failure detector and an election sharing a transport.
#[derive(Clone)]
pub struct Node {
  config: NodeConfig,
  detector: FailureDetector,
  election: Election,
}
impl Node {
  /// Validates `config` and wires the services together. Nothing runs until [`start`].
  ///
  /// [`start`]: Node::start
  pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Node> {
    config.validate()?;
    let detector = FailureDetector::new(
      config.detector.clone(),
      config.hostname.clone(),
      config.membership_port,
      config.first_node,
      transport.clone(),
    );
    let election = Election::new(
      config.election.clone(),
      config.election_port,
      detector.clone(),
      transport,
    );
    Ok(Node {
      config: config,
      detector: detector,
      election: election,
    })
  }

  /// Starts the detector, then the election.
  pub async fn start(&self) -> Result<()> {
    self.detector.start().await?;
    self.election.start().await
  }

  /// Joins through `seed`. Does nothing on the first node.
  pub async fn join(&self, seed: &str) -> Result<()> {
    self.detector.join(seed).await
  }

  /// See [`FailureDetector::leave`]. Keep the node running for a few gossip rounds afterwards
  /// so the departure gets out.
  pub fn leave(&self) {
    self.detector.leave();
  }

  /// Stops the election, then the detector.
  pub async fn stop(&self) {
    self.election.stop().await;
    self.detector.stop().await;
  }

  /// The configuration the node was built from.
  pub fn config(&self) -> &NodeConfig {
    &self.config
  }

  /// The membership service.
  pub fn detector(&self) -> &FailureDetector {
    &self.detector
  }

  /// The election service.
  pub fn election(&self) -> &Election {
    &self.election
  }

  /// Our member ID, `0` before joining.
  pub fn id(&self) -> u32 {
    self.detector.id()
  }

  /// See [`FailureDetector::get_members`].
  pub fn members(&self) -> Vec<Member> {
    self.detector.get_members()
  }

  /// See [`Election::master`].
  pub fn master(&self) -> Option<Member> {
    self.election.master()
  }
}
