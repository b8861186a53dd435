mod common;

use common::{run_cluster_test, Event::*, TestCluster};
use parking_lot::Mutex;
use ringmaster::testkit::{FailureConfig, FailureConfigMap};
use std::sync::Arc;
use std::time::Duration;

fn lossy() -> FailureConfigMap {
  let mut fail_map = FailureConfigMap::default();
  fail_map.cluster_wide = FailureConfig {
    drop_prob: 0.1,
    delay: Some((Duration::from_millis(1), Duration::from_millis(5))),
  };
  fail_map
}

#[test]
fn membership_converges_under_loss() {
  run_cluster_test(Duration::from_secs(60), || async {
    let mut cluster = TestCluster::new(lossy(), Duration::from_secs(8));
    cluster
      .run(vec![
        Spawn("h0", None),
        Spawn("h1", Some("h0")),
        Spawn("h2", Some("h1")),
        Spawn("h3", Some("h2")),
        WaitForConvergence,
        Spawn("h4", Some("h0")),
        Spawn("h5", Some("h3")),
        Spawn("h6", Some("h4")),
        Spawn("h7", Some("h5")),
        WaitForConvergence,
        WaitForMaster("h0"),
        Kill("h3"),
        WaitForConvergence,
        Leave("h5"),
        WaitForConvergence,
        Sleep(500),
        WaitForConvergence,
      ])
      .await;
    cluster.shutdown().await;
  });
}

#[test]
fn failure_and_leave_callbacks() {
  run_cluster_test(Duration::from_secs(30), || async {
    let mut cluster = TestCluster::new(FailureConfigMap::default(), Duration::from_secs(5));
    cluster
      .run(vec![
        Spawn("h0", None),
        Spawn("h1", Some("h0")),
        Spawn("h2", Some("h0")),
        Spawn("h3", Some("h0")),
        WaitForConvergence,
      ])
      .await;
    let failed = Arc::new(Mutex::new(vec![]));
    let left = Arc::new(Mutex::new(vec![]));
    let joined = Arc::new(Mutex::new(vec![]));
    let observer = cluster.node("h1").detector().clone();
    let f = failed.clone();
    observer.on_fail(move |m| f.lock().push(m.hostname.clone()));
    let l = left.clone();
    observer.on_leave(move |m| l.lock().push(m.hostname.clone()));
    let j = joined.clone();
    observer.on_join(move |m| j.lock().push(m.hostname.clone()));

    cluster.run(vec![Kill("h2"), WaitForConvergence]).await;
    cluster.run(vec![Leave("h3"), WaitForConvergence]).await;
    cluster.run(vec![Spawn("h4", Some("h0")), WaitForConvergence]).await;

    assert_eq!(*failed.lock(), vec!["h2".to_string()]);
    assert_eq!(*left.lock(), vec!["h3".to_string()]);
    assert_eq!(*joined.lock(), vec!["h4".to_string()]);
    assert_eq!(cluster.node("h1").detector().get_members().len(), 3);
    cluster.shutdown().await;
  });
}

#[test]
fn join_requests_wait_for_unlock() {
  run_cluster_test(Duration::from_secs(30), || async {
    let mut cluster = TestCluster::new(FailureConfigMap::default(), Duration::from_secs(5));
    cluster.run(vec![Spawn("h0", None), WaitForConvergence]).await;
    let seed = cluster.node("h0").detector().clone();

    seed.lock_new_joins();
    let node = ringmaster::cluster::Node::new(
      common::node_config("h1", false),
      Arc::new(cluster.net.transport("h1")),
    )
    .unwrap();
    node.start().await.unwrap();
    node.join("h0").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(seed.get_members().len(), 1);
    assert!(node.members().is_empty());

    seed.unlock_new_joins();
    node.join("h0").await.unwrap();
    let admitted = cluster.poll(|| node.members().len() == 2 && seed.get_members().len() == 2).await;
    assert!(admitted);
    node.stop().await;
    cluster.shutdown().await;
  });
}
