use crate::core::BusTransport;
use crate::testkit::{FailureConfigMap, LogLevel};
use crate::trace;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const LOG_LEVEL: LogLevel = LogLevel::Warn;

/// An in-process broadcast domain. Every joined [`LocalTransport`] receives every datagram,
/// its own included, like a multicast socket with loopback enabled.
#[derive(Default)]
pub struct LocalHub {
  members: Mutex<Vec<(String, UnboundedSender<Vec<u8>>)>>,
  fail_map: RwLock<FailureConfigMap>,
}
impl LocalHub {
  pub fn new() -> Arc<LocalHub> {
    Arc::new(LocalHub::default())
  }

  pub fn with_failures(fail_map: FailureConfigMap) -> Arc<LocalHub> {
    Arc::new(LocalHub { members: Mutex::new(Vec::new()), fail_map: RwLock::new(fail_map) })
  }

  pub fn set_failures(&self, fail_map: FailureConfigMap) {
    *self.fail_map.write() = fail_map;
  }

  /// Creates a transport for `node_id`. It does not receive anything until the bus joins it.
  pub fn transport(self: &Arc<Self>, node_id: impl Into<String>) -> Arc<LocalTransport> {
    let (_, rx) = unbounded_channel();
    Arc::new(LocalTransport {
      hub: self.clone(),
      node_id: node_id.into(),
      rx: tokio::sync::Mutex::new(rx),
    })
  }

  pub fn member_count(&self) -> usize {
    self.members.lock().len()
  }

  fn deliver(&self, datagram: Vec<u8>) {
    let members = self.members.lock().clone();
    let fail_map = self.fail_map.read().clone();
    for (node_id, tx) in members {
      let cfg = *fail_map.get(&node_id);
      if cfg.dropped() {
        trace!(LOG_LEVEL, "hub dropped datagram for {}", node_id);
        continue;
      }
      let bytes = datagram.clone();
      match cfg.sample_delay() {
        Some(delay) => {
          tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(bytes);
          });
        }
        None => {
          let _ = tx.send(bytes);
        }
      }
    }
  }
}

pub struct LocalTransport {
  hub: Arc<LocalHub>,
  node_id: String,
  rx: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
}
#[async_trait]
impl BusTransport for LocalTransport {
  async fn join(&self) -> io::Result<()> {
    let (tx, rx) = unbounded_channel();
    *self.rx.lock().await = rx;
    let mut members = self.hub.members.lock();
    members.retain(|(id, _)| id != &self.node_id);
    members.push((self.node_id.clone(), tx));
    Ok(())
  }

  fn leave(&self) {
    self.hub.members.lock().retain(|(id, _)| id != &self.node_id);
  }

  async fn broadcast(&self, datagram: Vec<u8>) -> io::Result<()> {
    self.hub.deliver(datagram);
    Ok(())
  }

  async fn recv(&self) -> io::Result<Vec<u8>> {
    self.rx.lock().await.recv().await.ok_or_else(|| {
      io::Error::new(io::ErrorKind::NotConnected, format!("{} left the hub", self.node_id))
    })
  }
}
