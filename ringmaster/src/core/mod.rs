//! Building blocks shared by both protocols: members and the ring they form, redundant delivery,
//! the datagram codec and the transports it travels over.

mod member;
mod redundant_queue;
mod ring;
mod transport;
mod udp;
mod wire;

#[rustfmt::skip]
pub use {
  member::Member,
  member::now_ms,
  member::wall_clock_ms,
  redundant_queue::RedundantQueue,
  ring::Neighbors,
  ring::RingDirectory,
  ring::NEIGHBORS_PER_SIDE,
  transport::DatagramReceiver,
  transport::Transport,
  udp::UdpTransport,
  wire::decode_exact,
  wire::encode_to_vec,
  wire::DecodeError,
  wire::Wire,
};
