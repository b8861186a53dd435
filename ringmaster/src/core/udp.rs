use crate::core::{DatagramReceiver, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tracing::info;

const MAX_DATAGRAM: usize = 65536;

/// [`Transport`] over real UDP sockets.
///
/// Receivers bind `hostname:port`, so several nodes can share one machine on distinct loopback
/// addresses.
pub struct UdpTransport {
  hostname: String,
}
impl UdpTransport {
  /// A transport whose receivers bind on `hostname`.
  pub fn new(hostname: String) -> UdpTransport {
    UdpTransport { hostname: hostname }
  }

  async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
      .await?
      .find(|a| a.is_ipv4())
      .ok_or_else(|| Error::Unresolved {
        host: host.to_string(),
      })
  }
}
#[async_trait]
impl Transport for UdpTransport {
  async fn bind(&self, port: u16) -> Result<Box<dyn DatagramReceiver>> {
    let addr = Self::resolve(&self.hostname, port).await?;
    let socket = UdpSocket::bind(addr).await?;
    info!(%addr, "bound udp socket");
    Ok(Box::new(UdpReceiver {
      socket: socket,
      buf: vec![0u8; MAX_DATAGRAM],
    }))
  }

  async fn send(&self, host: &str, port: u16, payload: &[u8]) -> Result<()> {
    let addr = Self::resolve(host, port).await?;
    let udp = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).await?;
    udp.send_to(payload, addr).await?;
    Ok(())
  }
}

struct UdpReceiver {
  socket: UdpSocket,
  buf: Vec<u8>,
}
#[async_trait]
impl DatagramReceiver for UdpReceiver {
  async fn recv(&mut self) -> Result<Vec<u8>> {
    let len = self.socket.recv(&mut self.buf[..]).await?;
    Ok(self.buf[..len].to_vec())
  }
}

#[test]
fn test_udp_loopback() {
  tokio_test::block_on(async {
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    let transport = UdpTransport::new("127.0.0.1".to_string());
    let mut recvr = transport.bind(port).await.unwrap();
    transport.send("127.0.0.1", port, b"ping").await.unwrap();
    assert_eq!(recvr.recv().await.unwrap(), b"ping".to_vec());
  });
}
