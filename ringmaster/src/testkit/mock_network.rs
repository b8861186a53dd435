use crate::core::{DatagramReceiver, Transport};
use crate::testkit::FailureConfigMap;
use crate::{Error, Result};
use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::trace;

type Endpoint = (String, u16);

struct Switchboard {
  endpoints: HashMap<Endpoint, (u64, UnboundedSender<Vec<u8>>)>,
  isolated: HashSet<String>,
  failures: FailureConfigMap,
  rng: SmallRng,
}

/// An in-process datagram network for tests.
///
/// Endpoints are `(hostname, port)` pairs. Datagrams to endpoints nobody is bound to vanish, as
/// do datagrams to or from an [`isolate`](MockNetwork::isolate)d host. Everything else is subject
/// to the [`FailureConfigMap`] of the destination host.
#[derive(Clone)]
pub struct MockNetwork {
  inner: Arc<Mutex<Switchboard>>,
  next_id: Arc<AtomicU64>,
}
impl MockNetwork {
  /// A network with no hosts bound yet.
  pub fn new(failures: FailureConfigMap) -> MockNetwork {
    MockNetwork {
      inner: Arc::new(Mutex::new(Switchboard {
        endpoints: HashMap::new(),
        isolated: HashSet::new(),
        failures: failures,
        rng: SmallRng::from_entropy(),
      })),
      next_id: Arc::new(AtomicU64::new(0)),
    }
  }

  /// The view of the network from `hostname`.
  pub fn transport(&self, hostname: &str) -> MockTransport {
    MockTransport {
      network: self.clone(),
      hostname: hostname.to_string(),
    }
  }

  /// Replaces the failure settings for datagrams sent from now on.
  pub fn set_failures(&self, failures: FailureConfigMap) {
    self.inner.lock().failures = failures;
  }

  /// Cuts `host` off in both directions, as if it crashed.
  pub fn isolate(&self, host: &str) {
    self.inner.lock().isolated.insert(host.to_string());
  }

  /// Undoes [`isolate`](MockNetwork::isolate).
  pub fn reconnect(&self, host: &str) {
    self.inner.lock().isolated.remove(host);
  }

  /// Whether a receiver is bound to `host:port`.
  pub fn is_bound(&self, host: &str, port: u16) -> bool {
    self.inner.lock().endpoints.contains_key(&(host.to_string(), port))
  }
}

/// One host's [`Transport`] on a [`MockNetwork`].
pub struct MockTransport {
  network: MockNetwork,
  hostname: String,
}
#[async_trait]
impl Transport for MockTransport {
  async fn bind(&self, port: u16) -> Result<Box<dyn DatagramReceiver>> {
    let endpoint = (self.hostname.clone(), port);
    let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = unbounded_channel();
    let mut board = self.network.inner.lock();
    if board.endpoints.contains_key(&endpoint) {
      return Err(Error::PortInUse {
        host: self.hostname.clone(),
        port: port,
      });
    }
    board.endpoints.insert(endpoint.clone(), (id, tx));
    Ok(Box::new(MockReceiver {
      network: self.network.clone(),
      endpoint: endpoint,
      id: id,
      rx: rx,
    }))
  }

  async fn send(&self, host: &str, port: u16, payload: &[u8]) -> Result<()> {
    let (tx, delay) = {
      let mut board = self.network.inner.lock();
      if board.isolated.contains(&self.hostname) || board.isolated.contains(host) {
        return Ok(());
      }
      let tx = match board.endpoints.get(&(host.to_string(), port)) {
        Some((_, tx)) => tx.clone(),
        None => return Ok(()),
      };
      let cfg = *board.failures.get(host);
      if board.rng.gen::<f64>() < cfg.drop_prob {
        trace!(from = self.hostname.as_str(), to = host, port, "dropped datagram");
        return Ok(());
      }
      let delay = cfg.delay.map(|(min, max)| {
        let range = min.as_millis() as u64..=max.as_millis().max(min.as_millis()) as u64;
        Duration::from_millis(board.rng.gen_range(range))
      });
      (tx, delay)
    };
    let payload = payload.to_vec();
    match delay {
      Some(dur) => {
        tokio::spawn(async move {
          sleep(dur).await;
          let _ = tx.send(payload);
        });
      }
      None => {
        let _ = tx.send(payload);
      }
    }
    Ok(())
  }
}

struct MockReceiver {
  network: MockNetwork,
  endpoint: Endpoint,
  id: u64,
  rx: UnboundedReceiver<Vec<u8>>,
}
#[async_trait]
impl DatagramReceiver for MockReceiver {
  async fn recv(&mut self) -> Result<Vec<u8>> {
    self.rx.recv().await.ok_or_else(|| {
      Error::Io(io::Error::new(io::ErrorKind::NotConnected, "endpoint unbound"))
    })
  }
}
impl Drop for MockReceiver {
  fn drop(&mut self) {
    let mut board = self.network.inner.lock();
    if matches!(board.endpoints.get(&self.endpoint), Some((id, _)) if *id == self.id) {
      board.endpoints.remove(&self.endpoint);
    }
  }
}
