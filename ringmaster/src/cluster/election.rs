use crate::cluster::messages::{Ballot, Elected, ElectionMsg, Introduction};
use crate::cluster::{ElectionConfig, ElectionTimer, FailureDetector, Tasks};
use crate::core::{now_ms, Member, RedundantQueue, RingDirectory, Transport};
use crate::Result;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Where a node stands with respect to the master.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
  /// Joined after the master was chosen and has not been introduced to it yet.
  NoMaster,
  /// The master is known.
  Normal,
  /// The master is gone. Waiting for the membership to settle before initiating.
  ElectionWait,
  /// Transient: sending our own ELECTION.
  ElectionInit,
  /// An ELECTION is circulating.
  Electing,
  /// Our ID won; waiting for our ELECTED to come back around.
  Elected,
}

#[derive(Clone, Debug)]
struct Outbound {
  dest: String,
  uuid: u32,
  msg: ElectionMsg,
}

struct ElectionState {
  phase: Phase,
  master: Member,
  highest_initiator_id: u32,
  outbox: RedundantQueue<Outbound>,
  seen: RedundantQueue<u32>,
  rng: SmallRng,
}

struct ElectionInner {
  config: ElectionConfig,
  port: u16,
  detector: FailureDetector,
  transport: Arc<dyn Transport>,
  state: Mutex<ElectionState>,
  timer: Mutex<ElectionTimer>,
  master_changed: Notify,
  running: AtomicBool,
  hooked: AtomicBool,
  tasks: Mutex<Option<Tasks>>,
}

/// Chang-Roberts style leader election over the failure detector's ring.
///
/// When the master fails or leaves, every node waits for the membership to settle, then some
/// node sends an ELECTION around the ring carrying the highest ID it meets. The node whose ID
/// comes back wins and circulates ELECTED. Elections that stall are restarted with a PROPOSAL.
///
/// Every event is handled inside [`FailureDetector::run_atomically`], so the ring cannot change
/// between reading a successor and acting on it. Locks are always taken in the order
/// membership, election state, timer.
#[derive(Clone)]
pub struct Election {
  inner: Arc<ElectionInner>,
}
impl Election {
  /// On the first node, the node itself is master from the start.
  pub fn new(
    config: ElectionConfig,
    port: u16,
    detector: FailureDetector,
    transport: Arc<dyn Transport>,
  ) -> Election {
    let (phase, master) = match detector.get_member(detector.id()) {
      Some(me) if detector.is_first_node() => (Phase::Normal, me),
      _ => (Phase::NoMaster, Member::default()),
    };
    Election {
      inner: Arc::new(ElectionInner {
        config: config,
        port: port,
        detector: detector,
        transport: transport,
        state: Mutex::new(ElectionState {
          phase: phase,
          master: master,
          highest_initiator_id: 0,
          outbox: RedundantQueue::new(),
          seen: RedundantQueue::new(),
          rng: SmallRng::from_entropy(),
        }),
        timer: Mutex::new(ElectionTimer::new()),
        master_changed: Notify::new(),
        running: AtomicBool::new(false),
        hooked: AtomicBool::new(false),
        tasks: Mutex::new(None),
      }),
    }
  }

  /// Binds the election port and spawns the send, receive and timer loops. The failure
  /// detector must be started separately.
  pub async fn start(&self) -> Result<()> {
    if self.inner.tasks.lock().is_some() {
      return Ok(());
    }
    let mut recvr = self.inner.transport.bind(self.inner.port).await?;
    info!(port = self.inner.port, "starting election");
    self.inner.timer.lock().stop();
    self.inner.running.store(true, Ordering::SeqCst);
    self.hook_membership();
    let (tx, rx) = watch::channel(false);

    let inner = self.inner.clone();
    let mut stop = rx.clone();
    let client = tokio::spawn(async move {
      let mut ticks = interval(inner.config.message_interval);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = stop.changed() => break,
          _ = ticks.tick() => inner.send_pending().await,
        }
      }
      debug!("election send loop exited");
    });

    let inner = self.inner.clone();
    let mut stop = rx.clone();
    let server = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = stop.changed() => break,
          res = recvr.recv() => match res {
            Ok(bytes) => inner.receive(&bytes),
            Err(e) => {
              warn!(error = %e, "election receive failed");
              tokio::time::sleep(inner.config.message_interval).await;
            }
          },
        }
      }
      debug!("election receive loop exited");
    });

    let inner = self.inner.clone();
    let mut stop = rx;
    let timer = tokio::spawn(async move {
      let mut ticks = interval(inner.config.timer_resolution);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut refresh = interval(inner.config.seen_refresh_interval);
      refresh.tick().await;
      loop {
        tokio::select! {
          _ = stop.changed() => break,
          _ = ticks.tick() => inner.tick(now_ms()),
          _ = refresh.tick() => inner.state.lock().seen.expire(),
        }
      }
      debug!("election timer loop exited");
    });

    let mut tasks = self.inner.tasks.lock();
    if tasks.is_some() {
      client.abort();
      server.abort();
      timer.abort();
      return Ok(());
    }
    *tasks = Some(Tasks {
      shutdown: tx,
      handles: vec![client, server, timer],
    });
    Ok(())
  }

  /// Stops all loops. The master may be left undefined; pending [`wait_for_master`] calls
  /// return `None`.
  ///
  /// [`wait_for_master`]: Election::wait_for_master
  pub async fn stop(&self) {
    let tasks = self.inner.tasks.lock().take();
    self.inner.running.store(false, Ordering::SeqCst);
    self.inner.master_changed.notify_waiters();
    if let Some(tasks) = tasks {
      info!("stopping election");
      tasks.shut_down(self.inner.config.stop_grace).await;
    }
  }

  /// Calls `f` with the master and whether it is valid. While an election is in progress the
  /// flag is false and the member must not be relied on.
  pub fn get_master<R>(&self, f: impl FnOnce(&Member, bool) -> R) -> R {
    let st = self.inner.state.lock();
    f(&st.master, st.phase == Phase::Normal)
  }

  /// The master, unless an election is in progress.
  pub fn master(&self) -> Option<Member> {
    self.get_master(|m, valid| if valid { Some(m.clone()) } else { None })
  }

  /// Waits until a master is known. `None` if the election is stopped, or was never started,
  /// before one is.
  pub async fn wait_for_master(&self) -> Option<Member> {
    loop {
      let changed = self.inner.master_changed.notified();
      if let Some(master) = self.master() {
        return Some(master);
      }
      if !self.inner.running.load(Ordering::SeqCst) {
        return None;
      }
      let _ = timeout(self.inner.config.master_poll, changed).await;
    }
  }

  /// The current phase.
  pub fn phase(&self) -> Phase {
    self.inner.state.lock().phase
  }

  fn hook_membership(&self) {
    if self.inner.hooked.swap(true, Ordering::SeqCst) {
      return;
    }
    let weak = Arc::downgrade(&self.inner);
    let lost = move |m: &Member| {
      with_running(&weak, |inner| inner.on_member_lost(m));
    };
    self.inner.detector.on_fail(lost.clone());
    self.inner.detector.on_leave(lost);
    let weak = Arc::downgrade(&self.inner);
    self.inner.detector.on_join(move |m| {
      with_running(&weak, |inner| inner.on_member_joined(m));
    });
  }
}

fn with_running(weak: &Weak<ElectionInner>, f: impl FnOnce(&ElectionInner)) {
  if let Some(inner) = weak.upgrade() {
    if inner.running.load(Ordering::SeqCst) {
      f(&inner);
    }
  }
}

impl ElectionInner {
  fn me(&self) -> u32 {
    self.detector.id()
  }

  fn fresh_uuid(st: &mut ElectionState) -> u32 {
    st.rng.gen()
  }

  fn enqueue(&self, st: &mut ElectionState, dest: &str, uuid: u32, msg: ElectionMsg) {
    let redundancy = match msg {
      ElectionMsg::Introduction(_) => self.config.introduction_redundancy,
      _ => self.config.redundancy,
    };
    debug!(dest, uuid, ?msg, "queueing election message");
    st.outbox.push(
      Outbound {
        dest: dest.to_string(),
        uuid: uuid,
        msg: msg,
      },
      redundancy,
    );
  }

  fn enqueue_to_successor(
    &self,
    ring: &RingDirectory,
    st: &mut ElectionState,
    uuid: u32,
    msg: ElectionMsg,
  ) {
    match ring.successor_of(self.me()) {
      Some(succ) => self.enqueue(st, &succ.hostname, uuid, msg),
      None => warn!(?msg, "not in the ring, cannot reach a successor"),
    }
  }

  fn transition(&self, ring: &RingDirectory, st: &mut ElectionState, from: Phase, to: Phase) {
    if st.phase != from {
      fatal!("election transition {:?} -> {:?} attempted from {:?}", from, to, st.phase);
    }
    self.timer.lock().stop();
    st.phase = to;
    debug!("election state {:?} -> {:?}", from, to);
    let me = self.me();
    match to {
      Phase::ElectionWait => {
        self.detector.lock_new_joins();
        let jitter = self.config.stabilization_jitter.as_millis() as u64;
        let jitter = if jitter > 0 { st.rng.gen_range(0..jitter) } else { 0 };
        let wait = self.config.stabilization + Duration::from_millis(jitter);
        self.timer.lock().arm(wait, now_ms());
        debug!(?wait, "waiting for membership to stabilize");
      }
      Phase::ElectionInit => {
        let uuid = Self::fresh_uuid(st);
        let ballot = Ballot {
          initiator_id: me,
          vote_id: me,
        };
        self.enqueue_to_successor(ring, st, uuid, ElectionMsg::Election(ballot));
        st.highest_initiator_id = me;
        self.transition(ring, st, Phase::ElectionInit, Phase::Electing);
      }
      Phase::Electing => {
        self.detector.lock_new_joins();
        self.timer.lock().arm(self.config.election_timeout, now_ms());
      }
      Phase::Elected => {
        let uuid = Self::fresh_uuid(st);
        let elected = Elected { master_id: me };
        self.enqueue_to_successor(ring, st, uuid, ElectionMsg::Elected(elected));
        info!(id = me, "nominated as master");
        self.timer.lock().arm(self.config.elected_timeout, now_ms());
      }
      Phase::Normal => {
        self.detector.unlock_new_joins();
        self.master_changed.notify_waiters();
      }
      Phase::NoMaster => fatal!("election never returns to {:?}", to),
    }
  }

  fn add_to_cache(st: &mut ElectionState, ballot: &Ballot) {
    st.highest_initiator_id = st.highest_initiator_id.max(ballot.initiator_id);
  }

  fn propagate(&self, ring: &RingDirectory, st: &mut ElectionState, uuid: u32, ballot: &Ballot) {
    if ballot.initiator_id < st.highest_initiator_id {
      trace!(initiator = ballot.initiator_id, "swallowing ballot of a lower initiator");
      return;
    }
    let me = self.me();
    // Our own ballot back from its first lap goes around again under a new UUID.
    let uuid = if ballot.initiator_id == me { Self::fresh_uuid(st) } else { uuid };
    let forward = Ballot {
      initiator_id: ballot.initiator_id,
      vote_id: ballot.vote_id.max(me),
    };
    self.enqueue_to_successor(ring, st, uuid, ElectionMsg::Election(forward));
  }

  fn receive(&self, bytes: &[u8]) {
    let (header, msg) = match ElectionMsg::decode(bytes) {
      Ok(x) => x,
      Err(e) => {
        debug!(error = %e, "dropping malformed election datagram");
        return;
      }
    };
    self.detector.run_atomically(|ring| {
      if !ring.contains(header.sender) {
        trace!(sender = header.sender, "ignoring election message from non-member");
        return;
      }
      let mut st = self.state.lock();
      if st.seen.contains(&header.uuid) {
        trace!(sender = header.sender, uuid = header.uuid, "duplicate election message");
        return;
      }
      st.seen.push(header.uuid, self.config.seen_ttl_cycles);
      debug!(sender = header.sender, uuid = header.uuid, ?msg, phase = ?st.phase, "election message");
      self.handle(ring, &mut st, header.uuid, msg);
    });
  }

  fn handle(&self, ring: &RingDirectory, st: &mut ElectionState, uuid: u32, msg: ElectionMsg) {
    let me = self.me();
    let phase = st.phase;
    match msg {
      ElectionMsg::Election(ballot) => match phase {
        Phase::NoMaster | Phase::ElectionWait => {
          Self::add_to_cache(st, &ballot);
          self.propagate(ring, st, uuid, &ballot);
          self.transition(ring, st, phase, Phase::Electing);
        }
        Phase::Electing if ballot.vote_id == me => {
          self.transition(ring, st, Phase::Electing, Phase::Elected);
        }
        Phase::Electing => {
          Self::add_to_cache(st, &ballot);
          self.propagate(ring, st, uuid, &ballot);
        }
        Phase::Elected if ballot.vote_id == me => {
          debug!(initiator = ballot.initiator_id, "already elected by another lap");
        }
        Phase::Elected => {
          Self::add_to_cache(st, &ballot);
          self.propagate(ring, st, uuid, &ballot);
          self.transition(ring, st, Phase::Elected, Phase::Electing);
        }
        Phase::Normal | Phase::ElectionInit => {
          fatal!("ELECTION {:?} received in {:?}", ballot, phase)
        }
      },
      ElectionMsg::Elected(Elected { master_id }) => match phase {
        Phase::Electing => match ring.get(master_id) {
          Some(master) => {
            st.master = master.clone();
            info!(id = master_id, host = st.master.hostname.as_str(), "elected master");
            if master_id != me {
              self.enqueue_to_successor(ring, st, uuid, msg);
            }
            self.transition(ring, st, Phase::Electing, Phase::Normal);
          }
          None => {
            info!(id = master_id, "new master failed during the election, restarting");
            st.highest_initiator_id = 0;
            self.transition(ring, st, Phase::Electing, Phase::ElectionWait);
          }
        },
        Phase::Elected if master_id == me => {
          st.master = match ring.get(me) {
            Some(m) => m.clone(),
            None => Member::new(me, self.detector.hostname().to_string()),
          };
          info!(id = me, "we are the master");
          self.transition(ring, st, Phase::Elected, Phase::Normal);
        }
        Phase::Elected => fatal!("ELECTED for {} while we are elected, masters diverge", master_id),
        _ => fatal!("ELECTED for {} received in {:?}", master_id, phase),
      },
      ElectionMsg::Introduction(Introduction { master_id }) => {
        if phase != Phase::NoMaster {
          return;
        }
        if let Some(master) = ring.get(master_id) {
          st.master = master.clone();
          info!(id = master_id, host = st.master.hostname.as_str(), "introduced to master");
          self.transition(ring, st, Phase::NoMaster, Phase::Normal);
        }
      }
      ElectionMsg::Proposal => {
        info!("received proposal, restarting election");
        st.highest_initiator_id = 0;
        st.outbox.clear();
        self.enqueue_to_successor(ring, st, uuid, ElectionMsg::Proposal);
        self.transition(ring, st, phase, Phase::ElectionWait);
      }
    }
  }

  fn tick(&self, now: u64) {
    self.detector.run_atomically(|ring| {
      let mut st = self.state.lock();
      if !self.timer.lock().tick(now) {
        return;
      }
      let phase = st.phase;
      match phase {
        Phase::ElectionWait => {
          debug!("membership stabilized, initiating election");
          self.transition(ring, &mut st, Phase::ElectionWait, Phase::ElectionInit);
        }
        Phase::Electing | Phase::Elected => {
          info!(?phase, "election timed out, proposing a restart");
          st.highest_initiator_id = 0;
          let uuid = Self::fresh_uuid(&mut st);
          self.enqueue_to_successor(ring, &mut st, uuid, ElectionMsg::Proposal);
          self.transition(ring, &mut st, phase, Phase::ElectionWait);
        }
        _ => fatal!("timer fired in {:?}", phase),
      }
    });
  }

  fn on_member_lost(&self, member: &Member) {
    self.detector.run_atomically(|ring| {
      let mut st = self.state.lock();
      let phase = st.phase;
      match phase {
        Phase::Normal if member.id == st.master.id => {
          info!(id = member.id, "master lost, beginning election process");
          st.highest_initiator_id = 0;
          self.transition(ring, &mut st, Phase::Normal, Phase::ElectionWait);
        }
        Phase::NoMaster => {
          debug!(id = member.id, "member lost before we learned the master");
        }
        _ => {}
      }
    });
  }

  fn on_member_joined(&self, member: &Member) {
    let me = self.me();
    self.detector.run_atomically(|_| {
      let mut st = self.state.lock();
      if st.phase == Phase::Normal && st.master.id == me && member.id != me {
        let uuid = Self::fresh_uuid(&mut st);
        let intro = ElectionMsg::Introduction(Introduction { master_id: me });
        self.enqueue(&mut st, &member.hostname, uuid, intro);
      }
    });
  }

  async fn send_pending(&self) {
    let batch = self.state.lock().outbox.pop();
    let me = self.me();
    for out in batch {
      let bytes = out.msg.encode(me, out.uuid);
      if let Err(e) = self.transport.send(&out.dest, self.port, &bytes).await {
        debug!(dest = out.dest.as_str(), error = %e, "election send failed");
      }
    }
  }
}
