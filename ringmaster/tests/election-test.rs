mod common;

use common::{run_cluster_test, Event::*, TestCluster};
use ringmaster::cluster::{Node, Phase};
use ringmaster::testkit::FailureConfigMap;
use std::sync::Arc;
use std::time::Duration;

// Failover takes up to stabilization + jitter + election and elected timeouts.
const STEP: Duration = Duration::from_secs(10);

#[test]
fn three_node_failover() {
  run_cluster_test(Duration::from_secs(60), || async {
    let mut cluster = TestCluster::new(FailureConfigMap::default(), STEP);
    cluster
      .run(vec![
        Spawn("h0", None),
        Sleep(400),
        Spawn("h1", Some("h0")),
        Sleep(400),
        Spawn("h2", Some("h0")),
        WaitForConvergence,
        WaitForMaster("h0"),
        Kill("h0"),
        WaitForConvergence,
        WaitForHighestMaster,
      ])
      .await;
    for node in cluster.nodes.values() {
      assert_eq!(node.election().phase(), Phase::Normal);
      assert!(node.detector().joins_allowed());
    }
    let master = cluster.agreed_master().unwrap();
    let masters_themselves = cluster
      .nodes
      .values()
      .filter(|n| n.election().master().map(|m| m.id) == Some(n.id()))
      .count();
    assert_eq!(masters_themselves, 1);
    assert_eq!(Some(master), cluster.highest_id());
    cluster.shutdown().await;
  });
}

#[test]
fn successive_failovers() {
  run_cluster_test(Duration::from_secs(90), || async {
    let mut cluster = TestCluster::new(FailureConfigMap::default(), STEP);
    cluster
      .run(vec![
        Spawn("h0", None),
        Spawn("h1", Some("h0")),
        Spawn("h2", Some("h1")),
        Spawn("h3", Some("h2")),
        Spawn("h4", Some("h3")),
        WaitForConvergence,
        WaitForMaster("h0"),
        Kill("h0"),
        WaitForConvergence,
        WaitForHighestMaster,
      ])
      .await;
    let master = cluster.agreed_master().unwrap();
    let host = *cluster.nodes.iter().find(|(_, n)| n.id() == master).unwrap().0;
    cluster.run(vec![Kill(host), WaitForConvergence, WaitForHighestMaster]).await;

    // A node arriving after the election is introduced to the new master.
    let seed = *cluster.nodes.keys().next().unwrap();
    cluster.run(vec![Spawn("h5", Some(seed)), WaitForConvergence]).await;
    let late = cluster.node("h5").election().wait_for_master().await.unwrap();
    assert!(cluster.poll(|| cluster.agreed_master() == Some(late.id)).await);
    assert_ne!(late.hostname, "h5");
    cluster.shutdown().await;
  });
}

#[test]
fn leaving_master_is_replaced() {
  run_cluster_test(Duration::from_secs(60), || async {
    let mut cluster = TestCluster::new(FailureConfigMap::default(), STEP);
    cluster
      .run(vec![
        Spawn("h0", None),
        Spawn("h1", Some("h0")),
        Spawn("h2", Some("h0")),
        Spawn("h3", Some("h0")),
        WaitForConvergence,
        WaitForMaster("h0"),
        Leave("h0"),
        WaitForConvergence,
        WaitForHighestMaster,
      ])
      .await;
    cluster.shutdown().await;
  });
}

#[test]
fn wait_for_master_returns_on_stop() {
  run_cluster_test(Duration::from_secs(10), || async {
    let cluster = TestCluster::new(FailureConfigMap::default(), STEP);
    // Never joins anything, so it never learns of a master.
    let node = Node::new(
      common::node_config("lonely", false),
      Arc::new(cluster.net.transport("lonely")),
    )
    .unwrap();
    assert!(node.election().wait_for_master().await.is_none());
    node.start().await.unwrap();
    let election = node.election().clone();
    let waiter = tokio::spawn(async move { election.wait_for_master().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiter.is_finished());
    node.stop().await;
    assert!(waiter.await.unwrap().is_none());
  });
}
