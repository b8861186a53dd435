use crate::core::{now_ms, Member};
use itertools::Itertools;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::debug;

/// Number of predecessors and of successors each node gossips with.
pub const NEIGHBORS_PER_SIDE: usize = 2;

/// The members a node heartbeats and watches.
pub type Neighbors = SmallVec<[Member; 2 * NEIGHBORS_PER_SIDE]>;

/// The known members ordered by ID. The successor of the highest ID is the lowest ID.
///
/// Holds no lock of its own; the failure detector keeps it behind its state mutex.
pub struct RingDirectory {
  ring: BTreeMap<u32, Member>,
  local_hostname: String,
  new_member_slack: u64,
}
impl RingDirectory {
  /// `new_member_slack` (ms) is added to the heartbeat stamp of every inserted member, so it
  /// is not failed before its first heartbeat can arrive.
  pub fn new(local_hostname: String, new_member_slack: u64) -> RingDirectory {
    RingDirectory {
      ring: BTreeMap::new(),
      local_hostname: local_hostname,
      new_member_slack: new_member_slack,
    }
  }

  /// Returns false if the ID was already present.
  pub fn add(&mut self, hostname: &str, id: u32) -> bool {
    if self.ring.contains_key(&id) {
      return false;
    }
    let mut member = Member::new(id, hostname.to_string());
    member.last_heartbeat = now_ms() + self.new_member_slack;
    self.ring.insert(id, member);
    debug!(id, host = hostname, "added member");
    true
  }

  /// Members that become our neighbors through the removal get a fresh heartbeat stamp.
  pub fn remove(&mut self, id: u32) -> Option<Member> {
    let before = self.neighbors();
    let removed = self.ring.remove(&id)?;
    debug!(id, host = removed.hostname.as_str(), "removed member");
    // Members that just moved into our window start with a fresh stamp, otherwise one
    // failure would cascade onto the next node we had not been watching.
    let fresh = self
      .neighbors()
      .into_iter()
      .filter(|m| before.iter().all(|b| b.id != m.id))
      .map(|m| m.id)
      .collect_vec();
    for id in fresh {
      self.update_heartbeat(id);
    }
    Some(removed)
  }

  /// Stamps `id` with the current time. Unknown IDs are ignored.
  pub fn update_heartbeat(&mut self, id: u32) {
    if let Some(member) = self.ring.get_mut(&id) {
      member.last_heartbeat = now_ms();
    }
  }

  /// The member with `id`.
  pub fn get(&self, id: u32) -> Option<&Member> {
    self.ring.get(&id)
  }

  /// Whether `id` is in the ring.
  pub fn contains(&self, id: u32) -> bool {
    self.ring.contains_key(&id)
  }

  /// The local node's own entry, once it has joined.
  pub fn local(&self) -> Option<&Member> {
    self.ring.values().find(|m| m.hostname == self.local_hostname)
  }

  /// Up to two predecessors followed by up to two successors of the local node, nearest first.
  /// With five or fewer members this is every member but ourselves, in ID order. Empty until
  /// the local node is in the ring.
  pub fn neighbors(&self) -> Neighbors {
    let us = match self.local() {
      Some(m) => m.id,
      None => return Neighbors::new(),
    };
    if self.ring.len() <= 2 * NEIGHBORS_PER_SIDE + 1 {
      return self.ring.values().filter(|m| m.id != us).cloned().collect();
    }
    let predecessors = self
      .ring
      .range(..us)
      .rev()
      .chain(self.ring.range((Excluded(us), Unbounded)).rev())
      .take(NEIGHBORS_PER_SIDE);
    let successors = self
      .ring
      .range((Excluded(us), Unbounded))
      .chain(self.ring.range(..us))
      .take(NEIGHBORS_PER_SIDE);
    predecessors.chain(successors).map(|(_, m)| m.clone()).collect()
  }

  /// The next member after `id`, wrapping around. `None` if `id` is not in the ring.
  pub fn successor_of(&self, id: u32) -> Option<&Member> {
    if !self.ring.contains_key(&id) {
      return None;
    }
    self
      .ring
      .range((Excluded(id), Unbounded))
      .map(|(_, m)| m)
      .next()
      .or_else(|| self.ring.values().next())
  }

  /// Every member in ID order.
  pub fn all(&self) -> Vec<Member> {
    self.ring.values().cloned().collect()
  }

  /// Number of members.
  pub fn count(&self) -> usize {
    self.ring.len()
  }
}

#[cfg(test)]
fn ring_of(ids: &[u32], local: u32) -> RingDirectory {
  let mut ring = RingDirectory::new(format!("h{}", local), 0);
  for id in ids {
    ring.add(&format!("h{}", id), *id);
  }
  ring
}

#[cfg(test)]
fn ids(members: &[Member]) -> Vec<u32> {
  members.iter().map(|m| m.id).collect()
}

#[test]
fn test_ring_neighbors_small() {
  assert!(ring_of(&[], 10).neighbors().is_empty());
  assert!(ring_of(&[20, 30], 10).neighbors().is_empty());
  assert!(ring_of(&[10], 10).neighbors().is_empty());
  assert_eq!(ids(&ring_of(&[10, 30, 20], 10).neighbors()), vec![20, 30]);
  assert_eq!(ids(&ring_of(&[50, 10, 40, 30, 20], 30).neighbors()), vec![10, 20, 40, 50]);
}

#[test]
fn test_ring_neighbors_wrap() {
  let all = [10, 20, 30, 40, 50, 60, 70];
  assert_eq!(ids(&ring_of(&all, 40).neighbors()), vec![30, 20, 50, 60]);
  assert_eq!(ids(&ring_of(&all, 10).neighbors()), vec![70, 60, 20, 30]);
  assert_eq!(ids(&ring_of(&all, 20).neighbors()), vec![10, 70, 30, 40]);
  assert_eq!(ids(&ring_of(&all, 70).neighbors()), vec![60, 50, 10, 20]);
}

#[test]
fn test_ring_neighbor_bound() {
  for k in 1..=12u32 {
    let all = (1..=k).map(|x| x * 100).collect_vec();
    for local in all.iter() {
      let ring = ring_of(&all, *local);
      let n = ring.neighbors();
      assert_eq!(n.len(), std::cmp::min(4, k as usize - 1));
      assert!(n.iter().all(|m| m.id != *local));
      assert_eq!(n.iter().map(|m| m.id).unique().count(), n.len());
      let pos = all.iter().position(|x| x == local).unwrap();
      let at = |offset: isize| all[(pos as isize + offset).rem_euclid(k as isize) as usize];
      if k > 5 {
        assert_eq!(ids(&n), vec![at(-1), at(-2), at(1), at(2)]);
      }
    }
  }
}

#[test]
fn test_ring_add_remove_successor() {
  let mut ring = ring_of(&[10, 20, 30], 10);
  assert!(!ring.add("elsewhere", 20));
  assert_eq!(ring.get(20).map(|m| m.hostname.as_str()), Some("h20"));
  assert_eq!(ring.count(), 3);
  assert_eq!(ring.successor_of(10).map(|m| m.id), Some(20));
  assert_eq!(ring.successor_of(30).map(|m| m.id), Some(10));
  assert!(ring.successor_of(25).is_none());
  assert_eq!(ring.remove(20).map(|m| m.id), Some(20));
  assert!(ring.remove(20).is_none());
  assert_eq!(ring.successor_of(10).map(|m| m.id), Some(30));
  assert_eq!(ids(&ring.all()), vec![10, 30]);

  let alone = ring_of(&[10], 10);
  assert_eq!(alone.successor_of(10).map(|m| m.id), Some(10));
}

#[test]
fn test_ring_removal_refreshes_new_neighbors() {
  let all = [10, 20, 30, 40, 50, 60, 70];
  let mut ring = ring_of(&all, 40);
  for m in ring.ring.values_mut() {
    m.last_heartbeat = u64::MAX;
  }
  ring.remove(50);
  // 70 slid into the window, 60 was already watched.
  assert!(ring.get(70).unwrap().last_heartbeat < u64::MAX);
  assert_eq!(ring.get(60).unwrap().last_heartbeat, u64::MAX);
  assert_eq!(ring.get(30).unwrap().last_heartbeat, u64::MAX);
}
