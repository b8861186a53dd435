use crate as ringmaster;
use crate::Wire;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use wyhash::WyHash;

/// A process taking part in the group.
///
/// Only `id` and `hostname` travel on the wire. `last_heartbeat` is local bookkeeping for the
/// failure detector, in milliseconds of [`now_ms`].
#[derive(Serialize, Deserialize, Wire, Clone, Debug, Default)]
pub struct Member {
  /// Derived once when the member joins. `0` means "no member".
  pub id: u32,
  /// The host the member's services listen on.
  pub hostname: String,
  /// When we last heard from the member. Never sent.
  #[serde(skip)]
  #[wire(skip)]
  pub last_heartbeat: u64,
}
impl Member {
  /// A member with no heartbeat recorded yet.
  pub fn new(id: u32, hostname: String) -> Member {
    Member {
      id: id,
      hostname: hostname,
      last_heartbeat: 0,
    }
  }

  /// The sentinel returned where there is no member to speak of.
  pub fn is_empty(&self) -> bool {
    self.id == 0
  }

  /// Mixes the hostname with the join time so a host rejoining gets a fresh identity.
  pub fn derive_id(hostname: &str, joined_at_ms: u64) -> u32 {
    let mut hasher = WyHash::with_seed(joined_at_ms);
    hostname.hash(&mut hasher);
    let hash = hasher.finish();
    match (hash ^ (hash >> 32)) as u32 {
      0 => 1,
      id => id,
    }
  }
}
impl PartialEq for Member {
  fn eq(&self, other: &Self) -> bool {
    // The heartbeat stamp changes constantly and says nothing about identity.
    self.id == other.id && self.hostname == other.hostname
  }
}
impl Eq for Member {}

/// Milliseconds on a monotonic clock local to this process.
pub fn now_ms() -> u64 {
  static START: OnceLock<Instant> = OnceLock::new();
  START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Milliseconds since the unix epoch, used as the seed of [`Member::derive_id`].
pub fn wall_clock_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

#[test]
fn test_member_identity() {
  let a = Member::derive_id("h0", 1_000);
  let b = Member::derive_id("h0", 1_001);
  let c = Member::derive_id("h1", 1_000);
  assert_ne!(a, 0);
  assert_ne!(a, b);
  assert_ne!(a, c);
  assert_eq!(a, Member::derive_id("h0", 1_000));

  let mut stale = Member::new(a, "h0".to_string());
  let fresh = stale.clone();
  stale.last_heartbeat = 12_345;
  assert_eq!(stale, fresh);
  assert!(Member::default().is_empty());
}
