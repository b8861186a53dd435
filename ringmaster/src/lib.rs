#![warn(missing_docs)]

//! Self-healing cluster membership and leader election for a small group of peers talking over
//! a lossy, unordered datagram transport.
//!
//! Every participating process runs two services. The [`FailureDetector`](cluster::FailureDetector)
//! answers "who is alive?" by gossiping heartbeats and join/leave/fail events between ring
//! neighbors. The [`Election`](cluster::Election) answers "who leads?" by running a ring
//! election over the detector's current successor relation whenever the leader disappears.
//! [`Node`](cluster::Node) wires the two together from a single
//! [`NodeConfig`](cluster::NodeConfig).
//!
//! Nothing here is reliable by itself: every message is sent a bounded number of times and
//! receivers suppress the duplicates. See [`RedundantQueue`](core::RedundantQueue).

extern crate ringmaster_macros;

// Protocol invariant violations. Logged, then the process is brought down (release builds
// abort on panic).
macro_rules! fatal {
  ($($arg:tt)*) => {{
    ::tracing::error!($($arg)*);
    panic!($($arg)*);
  }};
}

pub mod cluster;
pub mod core;
pub mod error;
pub mod testkit;

pub use error::{Error, Result};
pub use ringmaster_macros::Wire;
