#![allow(dead_code)]

use itertools::Itertools;
use ringmaster::cluster::{DetectorConfig, ElectionConfig, Node, NodeConfig};
use ringmaster::testkit::{init_logging, FailureConfigMap, LogLevel, MockNetwork};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const POLL: Duration = Duration::from_millis(25);

/// Roughly five times faster than the defaults.
pub fn detector_config() -> DetectorConfig {
  let mut cfg = DetectorConfig::default();
  cfg.gossip_interval = Duration::from_millis(50);
  cfg.failure_timeout = Duration::from_millis(500);
  cfg.new_member_slack = Duration::from_millis(500);
  cfg.stop_grace = Duration::from_millis(500);
  cfg
}

pub fn election_config() -> ElectionConfig {
  let mut cfg = ElectionConfig::default();
  cfg.stabilization = Duration::from_millis(2400);
  cfg.stabilization_jitter = Duration::from_millis(1200);
  cfg.election_timeout = Duration::from_millis(3000);
  cfg.elected_timeout = Duration::from_millis(1000);
  cfg.message_interval = Duration::from_millis(50);
  cfg.timer_resolution = Duration::from_millis(20);
  cfg.master_poll = Duration::from_millis(200);
  cfg.stop_grace = Duration::from_millis(500);
  cfg
}

pub fn node_config(host: &str, first: bool) -> NodeConfig {
  let mut cfg = NodeConfig::default();
  cfg.hostname = host.to_string();
  cfg.first_node = first;
  cfg.detector = detector_config();
  cfg.election = election_config();
  cfg
}

#[derive(Clone, Debug)]
pub enum Event {
  /// Starts a node. Without a seed it founds the group.
  Spawn(&'static str, Option<&'static str>),
  /// Cuts the node off the network and stops it without a word.
  Kill(&'static str),
  Leave(&'static str),
  Sleep(u64),
  /// Every live node lists exactly the live nodes.
  WaitForConvergence,
  /// Every live node agrees the live node with the highest ID is master.
  WaitForHighestMaster,
  /// Every live node agrees on this host as master.
  WaitForMaster(&'static str),
}

pub struct TestCluster {
  pub net: MockNetwork,
  pub nodes: BTreeMap<&'static str, Node>,
  pub step_timeout: Duration,
}
impl TestCluster {
  pub fn new(fail_map: FailureConfigMap, step_timeout: Duration) -> TestCluster {
    TestCluster {
      net: MockNetwork::new(fail_map),
      nodes: BTreeMap::new(),
      step_timeout: step_timeout,
    }
  }

  pub fn node(&self, host: &str) -> &Node {
    &self.nodes[host]
  }

  pub async fn spawn(&mut self, host: &'static str, seed: Option<&'static str>) -> Node {
    let node = Node::new(
      node_config(host, seed.is_none()),
      Arc::new(self.net.transport(host)),
    )
    .unwrap();
    node.start().await.unwrap();
    if let Some(seed) = seed {
      node.join(seed).await.unwrap();
    }
    self.nodes.insert(host, node.clone());
    // Admission is asynchronous; later joins may go through this node.
    let joined = self.poll(|| node.members().iter().any(|m| m.id == node.id())).await;
    assert!(joined, "{} was never admitted", host);
    node
  }

  pub async fn kill(&mut self, host: &str) {
    let node = self.nodes.remove(host).unwrap();
    self.net.isolate(host);
    node.stop().await;
  }

  pub async fn leave(&mut self, host: &str) {
    let node = self.nodes.remove(host).unwrap();
    node.leave();
    sleep(node.config().detector.gossip_interval * 10).await;
    node.stop().await;
  }

  pub fn converged(&self) -> bool {
    let alive = self.nodes.keys().map(|h| h.to_string()).collect::<BTreeSet<_>>();
    self.nodes.values().all(|n| {
      n.members().into_iter().map(|m| m.hostname).collect::<BTreeSet<_>>() == alive
    })
  }

  pub fn agreed_master(&self) -> Option<u32> {
    let masters = self.nodes.values().map(|n| n.master().map(|m| m.id)).collect_vec();
    match masters.first() {
      Some(Some(id)) if masters.iter().all(|m| *m == Some(*id)) => Some(*id),
      _ => None,
    }
  }

  pub fn highest_id(&self) -> Option<u32> {
    self.nodes.values().map(|n| n.id()).max()
  }

  pub async fn poll(&self, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + self.step_timeout;
    while Instant::now() < deadline {
      if done() {
        return true;
      }
      sleep(POLL).await;
    }
    done()
  }

  pub async fn run(&mut self, events: Vec<Event>) {
    for event in events {
      println!("EVENT {:?}", event);
      match event {
        Event::Spawn(host, seed) => {
          self.spawn(host, seed).await;
        }
        Event::Kill(host) => self.kill(host).await,
        Event::Leave(host) => self.leave(host).await,
        Event::Sleep(ms) => sleep(Duration::from_millis(ms)).await,
        Event::WaitForConvergence => {
          let ok = self.poll(|| self.converged()).await;
          assert!(ok, "no convergence: {:?}", self.views());
        }
        Event::WaitForHighestMaster => {
          let ok = self.poll(|| self.agreed_master() == self.highest_id()).await;
          assert!(ok, "no agreement on the highest master: {:?}", self.masters());
        }
        Event::WaitForMaster(host) => {
          let ok = self.poll(|| self.agreed_master() == Some(self.node(host).id())).await;
          assert!(ok, "no agreement on {} as master: {:?}", host, self.masters());
        }
      }
    }
  }

  pub async fn shutdown(self) {
    for node in self.nodes.values() {
      node.stop().await;
    }
  }

  fn views(&self) -> Vec<(&str, Vec<String>)> {
    self
      .nodes
      .iter()
      .map(|(h, n)| (*h, n.members().into_iter().map(|m| m.hostname).sorted().collect()))
      .collect()
  }

  fn masters(&self) -> Vec<(&str, Option<u32>)> {
    self.nodes.iter().map(|(h, n)| (*h, n.master().map(|m| m.id))).collect()
  }
}

/// Runs `f` on a fresh multi-threaded runtime, failing after `timeout`.
pub fn run_cluster_test<F, Fut>(timeout: Duration, f: F)
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = ()>,
{
  init_logging(LogLevel::Warn);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(4)
    .enable_all()
    .build()
    .unwrap();
  rt.block_on(async { tokio::time::timeout(timeout, f()).await.expect("test timed out") });
}
