use crate::Result;
use async_trait::async_trait;

/// An unreliable datagram service: at most once, possibly reordered, possibly lost.
///
/// Each protocol binds its own port and sends to the same port on other hosts.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Starts receiving on `port` of the local host.
  async fn bind(&self, port: u16) -> Result<Box<dyn DatagramReceiver>>;

  /// Fire and forget. `Ok` says nothing about delivery.
  async fn send(&self, host: &str, port: u16, payload: &[u8]) -> Result<()>;
}

/// The receiving end of a bound port. Dropping it unbinds the port.
#[async_trait]
pub trait DatagramReceiver: Send + 'static {
  /// Waits for the next datagram.
  async fn recv(&mut self) -> Result<Vec<u8>>;
}
