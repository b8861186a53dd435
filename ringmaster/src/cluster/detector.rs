use crate::cluster::messages::{Heartbeat, JoinRequest, MembershipMsg};
use crate::cluster::DetectorConfig;
use crate::core::{now_ms, wall_clock_ms, Member, RedundantQueue, RingDirectory, Transport};
use crate::Result;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// A membership callback. Invoked with the member that joined, left or failed.
pub type MemberCallback = Arc<dyn Fn(&Member) + Send + Sync>;

type Pending = Vec<(MemberCallback, Member)>;

struct DetectorState {
  ring: RingDirectory,
  joined_ids: HashSet<u32>,
  failed: RedundantQueue<u32>,
  left: RedundantQueue<u32>,
  joined: RedundantQueue<Member>,
  new_nodes: RedundantQueue<Member>,
  on_fail: Vec<MemberCallback>,
  on_leave: Vec<MemberCallback>,
  on_join: Vec<MemberCallback>,
}
impl DetectorState {
  fn admit(&mut self, member: &Member) -> bool {
    if !self.joined_ids.insert(member.id) {
      return false;
    }
    self.ring.add(&member.hostname, member.id);
    true
  }
}

pub(crate) struct Tasks {
  pub(crate) shutdown: watch::Sender<bool>,
  pub(crate) handles: Vec<JoinHandle<()>>,
}
impl Tasks {
  /// Signals the loops and waits up to `grace` for each of them.
  pub(crate) async fn shut_down(self, grace: Duration) {
    let _ = self.shutdown.send(true);
    for handle in self.handles {
      if timeout(grace, handle).await.is_err() {
        warn!("loop did not exit within {:?}", grace);
      }
    }
  }
}

struct DetectorInner {
  config: DetectorConfig,
  hostname: String,
  port: u16,
  first_node: bool,
  transport: Arc<dyn Transport>,
  state: Mutex<DetectorState>,
  our_id: AtomicU32,
  joined_group: AtomicBool,
  joins_allowed: AtomicBool,
  tasks: Mutex<Option<Tasks>>,
}

/// Gossip-based membership with failure detection.
///
/// Every gossip round a node heartbeats its ring neighbors, attaching the joins, leaves and
/// failures it still has redundancy left for. A neighbor not heard from within
/// `failure_timeout` is removed and its failure gossiped in turn. Joins go through an
/// introducer, the seed a new node sends its join request to, which answers with the whole
/// membership and then announces the newcomer.
///
/// Cloning yields another handle to the same detector.
#[derive(Clone)]
pub struct FailureDetector {
  inner: Arc<DetectorInner>,
}
impl FailureDetector {
  /// A first node founds the group: it is a member of its own one-node ring right away.
  pub fn new(
    config: DetectorConfig,
    hostname: String,
    port: u16,
    first_node: bool,
    transport: Arc<dyn Transport>,
  ) -> FailureDetector {
    let mut state = DetectorState {
      ring: RingDirectory::new(hostname.clone(), config.new_member_slack.as_millis() as u64),
      joined_ids: HashSet::new(),
      failed: RedundantQueue::new(),
      left: RedundantQueue::new(),
      joined: RedundantQueue::new(),
      new_nodes: RedundantQueue::new(),
      on_fail: vec![],
      on_leave: vec![],
      on_join: vec![],
    };
    let mut our_id = 0;
    if first_node {
      our_id = Member::derive_id(&hostname, wall_clock_ms());
      state.admit(&Member::new(our_id, hostname.clone()));
    }
    FailureDetector {
      inner: Arc::new(DetectorInner {
        config: config,
        hostname: hostname,
        port: port,
        first_node: first_node,
        transport: transport,
        state: Mutex::new(state),
        our_id: AtomicU32::new(our_id),
        joined_group: AtomicBool::new(first_node),
        joins_allowed: AtomicBool::new(true),
        tasks: Mutex::new(None),
      }),
    }
  }

  /// Binds the membership port and spawns the gossip and receive loops. Does nothing if
  /// already running.
  pub async fn start(&self) -> Result<()> {
    if self.inner.tasks.lock().is_some() {
      return Ok(());
    }
    let mut recvr = self.inner.transport.bind(self.inner.port).await?;
    info!(host = self.inner.hostname.as_str(), port = self.inner.port, "starting failure detector");
    let (tx, rx) = watch::channel(false);

    let inner = self.inner.clone();
    let mut stop = rx.clone();
    let gossip = tokio::spawn(async move {
      let mut ticks = interval(inner.config.gossip_interval);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = stop.changed() => break,
          _ = ticks.tick() => inner.gossip_round().await,
        }
      }
      debug!("gossip loop exited");
    });

    let inner = self.inner.clone();
    let mut stop = rx;
    let receive = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = stop.changed() => break,
          res = recvr.recv() => match res {
            Ok(bytes) => inner.receive(&bytes),
            Err(e) => {
              warn!(error = %e, "membership receive failed");
              tokio::time::sleep(inner.config.gossip_interval).await;
            }
          },
        }
      }
      debug!("membership receive loop exited");
    });

    let mut tasks = self.inner.tasks.lock();
    if tasks.is_some() {
      // Lost a race with a concurrent start.
      gossip.abort();
      receive.abort();
      return Ok(());
    }
    *tasks = Some(Tasks {
      shutdown: tx,
      handles: vec![gossip, receive],
    });
    Ok(())
  }

  /// Stops both loops, waiting up to `stop_grace` for each. Membership state is kept.
  pub async fn stop(&self) {
    let tasks = self.inner.tasks.lock().take();
    if let Some(tasks) = tasks {
      info!(host = self.inner.hostname.as_str(), "stopping failure detector");
      tasks.shut_down(self.inner.config.stop_grace).await;
    }
  }

  /// Whether the loops are running.
  pub fn is_running(&self) -> bool {
    self.inner.tasks.lock().is_some()
  }

  /// Asks `seed` to let this node in. Admission is asynchronous: the node is a member once the
  /// seed's introduction arrives. A first node is already a member, so this does nothing.
  pub async fn join(&self, seed: &str) -> Result<()> {
    if self.inner.first_node {
      return Ok(());
    }
    let id = Member::derive_id(&self.inner.hostname, wall_clock_ms());
    info!(id, seed, "requesting to join group");
    self.inner.our_id.store(id, Ordering::SeqCst);
    self.inner.joined_group.store(true, Ordering::SeqCst);
    let request = MembershipMsg::JoinRequest(JoinRequest {
      candidate: Member::new(id, self.inner.hostname.clone()),
    })
    .encode(id);
    for _ in 0..self.inner.config.redundancy {
      self.inner.transport.send(seed, self.inner.port, &request).await?;
    }
    Ok(())
  }

  /// Announces our departure over the next gossip rounds. Traffic from the group is ignored
  /// from now on.
  pub fn leave(&self) {
    let id = self.id();
    info!(id, "leaving group");
    self.inner.joined_group.store(false, Ordering::SeqCst);
    self.inner.state.lock().left.push(id, self.inner.config.redundancy);
  }

  /// `0` until this node has asked to join.
  pub fn id(&self) -> u32 {
    self.inner.our_id.load(Ordering::SeqCst)
  }

  /// The hostname this node was configured with.
  pub fn hostname(&self) -> &str {
    &self.inner.hostname
  }

  /// Whether this node founded the group.
  pub fn is_first_node(&self) -> bool {
    self.inner.first_node
  }

  /// True from `join` (or construction, on a first node) until `leave`.
  pub fn joined_group(&self) -> bool {
    self.inner.joined_group.load(Ordering::SeqCst)
  }

  /// Every known member in ID order, ourselves included.
  pub fn get_members(&self) -> Vec<Member> {
    self.inner.state.lock().ring.all()
  }

  /// The member with `id`, if it is alive as far as we know.
  pub fn get_member(&self, id: u32) -> Option<Member> {
    self.inner.state.lock().ring.get(id).cloned()
  }

  /// Our successor on the ring, ourselves when alone.
  pub fn get_successor(&self) -> Option<Member> {
    let id = self.id();
    self.inner.state.lock().ring.successor_of(id).cloned()
  }

  /// Runs `f` while holding the membership lock, so that nothing joins or leaves meanwhile.
  ///
  /// The lock is not reentrant: `f` must read through the directory it is given and must not
  /// call back into this detector, other than the lock-free [`id`](Self::id) and
  /// [`lock_new_joins`](Self::lock_new_joins) family.
  pub fn run_atomically<R>(&self, f: impl FnOnce(&RingDirectory) -> R) -> R {
    let state = self.inner.state.lock();
    f(&state.ring)
  }

  /// Called after a member is failed, by us or by gossip. Callbacks run outside the membership
  /// lock.
  pub fn on_fail(&self, f: impl Fn(&Member) + Send + Sync + 'static) {
    self.inner.state.lock().on_fail.push(Arc::new(f));
  }

  /// Called after a member announced its departure.
  pub fn on_leave(&self, f: impl Fn(&Member) + Send + Sync + 'static) {
    self.inner.state.lock().on_leave.push(Arc::new(f));
  }

  /// Called after a member is admitted, including ourselves.
  pub fn on_join(&self, f: impl Fn(&Member) + Send + Sync + 'static) {
    self.inner.state.lock().on_join.push(Arc::new(f));
  }

  /// Join requests are ignored, and introductions held back, until unlocked.
  pub fn lock_new_joins(&self) {
    self.inner.joins_allowed.store(false, Ordering::SeqCst);
  }

  /// Lets join requests in again.
  pub fn unlock_new_joins(&self) {
    self.inner.joins_allowed.store(true, Ordering::SeqCst);
  }

  /// False while an election holds joins back.
  pub fn joins_allowed(&self) -> bool {
    self.inner.joins_allowed.load(Ordering::SeqCst)
  }

  /// Processes one datagram as if it had arrived on the membership port.
  #[cfg(test)]
  pub(crate) fn receive(&self, bytes: &[u8]) {
    self.inner.receive(bytes)
  }

  /// Makes `member` known without any gossip.
  #[cfg(test)]
  pub(crate) fn admit(&self, member: &Member) {
    self.inner.state.lock().admit(member);
  }

  /// Puts this node in the group under a chosen ID, as if its join had completed.
  #[cfg(test)]
  pub(crate) fn assume_identity(&self, id: u32) {
    self.inner.our_id.store(id, Ordering::SeqCst);
    self.inner.joined_group.store(true, Ordering::SeqCst);
    self.admit(&Member::new(id, self.inner.hostname.clone()));
  }
}

impl DetectorInner {
  fn id(&self) -> u32 {
    self.our_id.load(Ordering::SeqCst)
  }

  async fn gossip_round(&self) {
    let (sends, pending) = self.prepare_round();
    for (host, bytes) in sends {
      if let Err(e) = self.transport.send(&host, self.port, &bytes).await {
        debug!(host = host.as_str(), error = %e, "heartbeat send failed");
      }
    }
    run_callbacks(pending);
  }

  fn prepare_round(&self) -> (Vec<(String, Vec<u8>)>, Pending) {
    let our_id = self.id();
    let redundancy = self.config.redundancy;
    let mut st = self.state.lock();
    let mut pending = Pending::new();

    let now = now_ms();
    let timeout = self.config.failure_timeout.as_millis() as u64;
    for neighbor in st.ring.neighbors() {
      // Stamps of new members lie in the future by the slack.
      if now <= neighbor.last_heartbeat.saturating_add(timeout) {
        continue;
      }
      info!(id = neighbor.id, host = neighbor.hostname.as_str(), "neighbor timed out");
      st.ring.remove(neighbor.id);
      // A node that left no longer speaks for the group; everyone drops it soon anyway.
      if self.joined_group.load(Ordering::SeqCst) {
        st.failed.push(neighbor.id, redundancy);
        pending.extend(st.on_fail.iter().map(|f| (f.clone(), neighbor.clone())));
      }
    }

    let heartbeat = MembershipMsg::Heartbeat(Heartbeat {
      failed: st.failed.pop(),
      left: st.left.pop(),
      joined: st.joined.pop(),
    })
    .encode(our_id);
    let mut sends = st
      .ring
      .neighbors()
      .into_iter()
      .map(|m| (m.hostname, heartbeat.clone()))
      .collect::<Vec<_>>();

    if self.joins_allowed.load(Ordering::SeqCst) && !st.new_nodes.is_empty() {
      let intro = MembershipMsg::Heartbeat(Heartbeat {
        joined: st.ring.all(),
        ..Heartbeat::default()
      })
      .encode(our_id);
      for node in st.new_nodes.pop() {
        debug!(id = node.id, host = node.hostname.as_str(), "sending introduction");
        sends.push((node.hostname.clone(), intro.clone()));
        // Introduced often enough, so the rest of the group can hear of it.
        if !st.new_nodes.iter().any(|m| m.id == node.id) {
          st.joined.push(node, redundancy);
        }
      }
    }
    (sends, pending)
  }

  fn receive(&self, bytes: &[u8]) {
    if !self.joined_group.load(Ordering::SeqCst) {
      return;
    }
    let (sender, msg) = match MembershipMsg::decode(bytes) {
      Ok(x) => x,
      Err(e) => {
        debug!(error = %e, "dropping malformed membership datagram");
        return;
      }
    };
    let pending = self.handle(sender, msg);
    run_callbacks(pending);
  }

  fn handle(&self, sender: u32, msg: MembershipMsg) -> Pending {
    let our_id = self.id();
    let redundancy = self.config.redundancy;
    let mut st = self.state.lock();
    let mut pending = Pending::new();

    if let MembershipMsg::JoinRequest(_) = msg {
      if !self.joins_allowed.load(Ordering::SeqCst) {
        debug!(sender, "ignoring join request, joins are locked");
        return pending;
      }
    } else if st.ring.contains(our_id) && !st.ring.contains(sender) {
      // Until we are in the ring ourselves, the introducer is a stranger too.
      trace!(sender, "ignoring heartbeat from non-member");
      return pending;
    }

    match msg {
      MembershipMsg::JoinRequest(JoinRequest { candidate }) => {
        if st.admit(&candidate) {
          info!(id = candidate.id, host = candidate.hostname.as_str(), "received join request");
          st.new_nodes.push(candidate.clone(), redundancy);
          pending.extend(st.on_join.iter().map(|f| (f.clone(), candidate.clone())));
        }
      }
      MembershipMsg::Heartbeat(hb) => {
        for member in hb.joined {
          if !st.admit(&member) {
            continue;
          }
          if member.id == our_id {
            info!(id = our_id, "joined group");
          } else {
            info!(id = member.id, host = member.hostname.as_str(), "member joined");
          }
          st.joined.push(member.clone(), redundancy);
          pending.extend(st.on_join.iter().map(|f| (f.clone(), member.clone())));
        }
        for id in hb.left {
          if let Some(member) = st.ring.remove(id) {
            info!(id, host = member.hostname.as_str(), "member left");
            st.left.push(id, redundancy);
            pending.extend(st.on_leave.iter().map(|f| (f.clone(), member.clone())));
          }
        }
        for id in hb.failed {
          if let Some(member) = st.ring.remove(id) {
            info!(id, host = member.hostname.as_str(), "member failed");
            st.failed.push(id, redundancy);
            pending.extend(st.on_fail.iter().map(|f| (f.clone(), member.clone())));
          }
        }
      }
    }
    st.ring.update_heartbeat(sender);
    pending
  }
}

fn run_callbacks(pending: Pending) {
  for (f, member) in pending {
    f(&member);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testkit::{FailureConfigMap, MockNetwork};
  use maplit::hashset;
  use std::sync::atomic::AtomicUsize;

  fn detector(host: &str, first: bool) -> FailureDetector {
    let net = MockNetwork::new(FailureConfigMap::default());
    FailureDetector::new(
      DetectorConfig::default(),
      host.to_string(),
      1234,
      first,
      Arc::new(net.transport(host)),
    )
  }

  fn heartbeat(failed: Vec<u32>, left: Vec<u32>, joined: Vec<Member>) -> MembershipMsg {
    MembershipMsg::Heartbeat(Heartbeat {
      failed: failed,
      left: left,
      joined: joined,
    })
  }

  fn ids(fd: &FailureDetector) -> std::collections::HashSet<u32> {
    fd.get_members().iter().map(|m| m.id).collect()
  }

  #[test]
  fn test_first_node_self_inserts() {
    let fd = detector("h0", true);
    assert_ne!(fd.id(), 0);
    assert!(fd.joined_group());
    assert_eq!(fd.get_members(), vec![Member::new(fd.id(), "h0".to_string())]);
    assert_eq!(fd.get_successor().map(|m| m.id), Some(fd.id()));

    let joiner = detector("h1", false);
    assert_eq!(joiner.id(), 0);
    assert!(joiner.get_members().is_empty());
    assert!(joiner.get_successor().is_none());
  }

  #[test]
  fn test_join_request_admission() {
    let fd = detector("h0", true);
    let joins = Arc::new(AtomicUsize::new(0));
    let j = joins.clone();
    fd.on_join(move |m| {
      assert_eq!(m.hostname, "h7");
      j.fetch_add(1, Ordering::SeqCst);
    });
    let req = MembershipMsg::JoinRequest(JoinRequest {
      candidate: Member::new(7, "h7".to_string()),
    });
    fd.receive(&req.encode(7));
    fd.receive(&req.encode(7));
    assert_eq!(joins.load(Ordering::SeqCst), 1);
    assert!(fd.get_member(7).is_some());

    // Introduced with the full list, then announced to the group once.
    let (sends, _) = fd.inner.prepare_round();
    let intro = sends.iter().filter(|(h, _)| h == "h7").count();
    assert_eq!(intro, 2);
    for _ in 0..3 {
      fd.inner.prepare_round();
    }
    assert_eq!(fd.inner.state.lock().joined.peek(), vec![Member::new(7, "h7".to_string())]);
  }

  #[test]
  fn test_introductions_wait_for_unlock() {
    let fd = detector("h0", true);
    let h7 = Member::new(7, "h7".to_string());
    let req = MembershipMsg::JoinRequest(JoinRequest { candidate: h7.clone() });
    fd.receive(&req.encode(7));
    fd.lock_new_joins();

    // h7 is already a neighbor, so it still gets the plain heartbeat.
    for _ in 0..6 {
      let (sends, _) = fd.inner.prepare_round();
      assert_eq!(sends.iter().filter(|(h, _)| h == "h7").count(), 1);
    }
    {
      let st = fd.inner.state.lock();
      assert_eq!(st.new_nodes.peek(), vec![h7.clone()]);
      assert!(st.joined.is_empty());
    }

    fd.unlock_new_joins();
    let (sends, _) = fd.inner.prepare_round();
    assert_eq!(sends.iter().filter(|(h, _)| h == "h7").count(), 2);
    for _ in 0..3 {
      fd.inner.prepare_round();
    }
    let st = fd.inner.state.lock();
    assert!(st.new_nodes.is_empty());
    assert_eq!(st.joined.peek(), vec![h7]);
  }

  #[test]
  fn test_left_node_ignores_traffic() {
    let fd = detector("h0", true);
    let me = fd.id();
    fd.admit(&Member::new(5, "h5".to_string()));
    fd.leave();
    fd.receive(&heartbeat(vec![5], vec![], vec![Member::new(6, "h6".to_string())]).encode(5));
    let req = MembershipMsg::JoinRequest(JoinRequest {
      candidate: Member::new(7, "h7".to_string()),
    });
    fd.receive(&req.encode(7));
    assert_eq!(ids(&fd), hashset! {me, 5});
    let st = fd.inner.state.lock();
    assert!(st.new_nodes.is_empty());
    assert!(st.failed.is_empty());
  }

  #[test]
  fn test_locked_joins_are_ignored() {
    let fd = detector("h0", true);
    fd.lock_new_joins();
    let req = MembershipMsg::JoinRequest(JoinRequest {
      candidate: Member::new(7, "h7".to_string()),
    });
    fd.receive(&req.encode(7));
    assert!(fd.get_member(7).is_none());
    fd.unlock_new_joins();
    fd.receive(&req.encode(7));
    assert!(fd.get_member(7).is_some());
  }

  #[test]
  fn test_heartbeat_from_stranger_is_ignored() {
    let fd = detector("h0", true);
    let me = fd.id();
    fd.receive(&heartbeat(vec![], vec![me], vec![]).encode(99));
    assert_eq!(ids(&fd), hashset! {me});
    fd.receive(&heartbeat(vec![], vec![], vec![Member::new(5, "h5".to_string())]).encode(99));
    assert_eq!(ids(&fd), hashset! {me});
  }

  #[test]
  fn test_heartbeat_events_and_callbacks() {
    let fd = detector("h0", true);
    let me = fd.id();
    fd.admit(&Member::new(5, "h5".to_string()));
    let failures = Arc::new(Mutex::new(vec![]));
    let leaves = Arc::new(Mutex::new(vec![]));
    let (f, l) = (failures.clone(), leaves.clone());
    fd.on_fail(move |m| f.lock().push(m.id));
    fd.on_leave(move |m| l.lock().push(m.id));

    let joined = vec![Member::new(6, "h6".to_string()), Member::new(8, "h8".to_string())];
    fd.receive(&heartbeat(vec![], vec![], joined.clone()).encode(5));
    assert_eq!(ids(&fd), hashset! {me, 5, 6, 8});

    let msg = heartbeat(vec![6], vec![8], vec![]);
    fd.receive(&msg.encode(5));
    fd.receive(&msg.encode(5));
    assert_eq!(ids(&fd), hashset! {me, 5});
    assert_eq!(*failures.lock(), vec![6]);
    assert_eq!(*leaves.lock(), vec![8]);

    // Removed members stay known, so a stale join does not resurrect them.
    fd.receive(&heartbeat(vec![], vec![], joined).encode(5));
    assert_eq!(ids(&fd), hashset! {me, 5});

    let st = fd.inner.state.lock();
    assert_eq!(st.failed.peek(), vec![6]);
    assert_eq!(st.left.peek(), vec![8]);
  }

  #[test]
  fn test_joiner_accepts_introduction() {
    let fd = detector("h1", false);
    tokio_test::block_on(fd.join("h0")).unwrap();
    let me = fd.id();
    assert_ne!(me, 0);
    let all = vec![Member::new(3, "h0".to_string()), Member::new(me, "h1".to_string())];
    fd.receive(&heartbeat(vec![], vec![], all).encode(3));
    assert_eq!(ids(&fd), hashset! {3, me});
    assert_eq!(fd.get_successor().map(|m| m.id), Some(3));
  }

  #[test]
  fn test_timed_out_neighbor_fails() {
    let mut config = DetectorConfig::default();
    config.new_member_slack = Duration::ZERO;
    config.failure_timeout = Duration::from_millis(20);
    let net = MockNetwork::new(FailureConfigMap::default());
    let fd = FailureDetector::new(config, "h0".to_string(), 1, true, Arc::new(net.transport("h0")));
    let failures = Arc::new(AtomicUsize::new(0));
    let f = failures.clone();
    fd.on_fail(move |_| {
      f.fetch_add(1, Ordering::SeqCst);
    });
    fd.admit(&Member::new(5, "h5".to_string()));
    std::thread::sleep(Duration::from_millis(40));
    let (_, pending) = fd.inner.prepare_round();
    run_callbacks(pending);
    assert!(fd.get_member(5).is_none());
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    // After leaving, timeouts are silent.
    fd.leave();
    fd.admit(&Member::new(6, "h6".to_string()));
    std::thread::sleep(Duration::from_millis(40));
    let (_, pending) = fd.inner.prepare_round();
    assert!(pending.is_empty());
    assert!(fd.get_member(6).is_none());
    assert!(fd.inner.state.lock().left.contains(&fd.id()));
  }
}
