use crate::core::{BusMsg, Envelope, LogicalClock, Lifecycle, MsgKind, PeerDirectory, Supervisor};
use crate::error::TaskmeshError;
use crate::testkit::LogLevel;
use crate::{debug, trace, warn};
use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub const LOG_LEVEL: LogLevel = LogLevel::Info;
pub const MAX_UDP_PAYLOAD: usize = 65507;
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// The datagram service under a [`GroupBus`]. Delivery is best effort; a transport may drop,
/// duplicate or reorder, and must loop back the node's own datagrams or not, either is fine.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
  async fn join(&self) -> io::Result<()>;
  fn leave(&self);
  async fn broadcast(&self, datagram: Vec<u8>) -> io::Result<()>;
  async fn recv(&self) -> io::Result<Vec<u8>>;
}

pub type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;
pub type Observer = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
  pub sent: u64,
  pub received: u64,
  pub malformed: u64,
  pub unhandled: u64,
}

/// Group messaging among coordinators, with one handler per message kind.
#[derive(Clone)]
pub struct GroupBus {
  inner: Arc<BusInner>,
}

struct BusInner {
  node_id: String,
  clock: Arc<LogicalClock>,
  transport: Arc<dyn BusTransport>,
  max_datagram: usize,
  sup: Supervisor,
  life: Lifecycle,
  outbound: Mutex<Option<UnboundedSender<Vec<u8>>>>,
  handlers: RwLock<HashMap<MsgKind, Handler>>,
  observers: RwLock<Vec<Observer>>,
  peers: PeerDirectory,
  sent: AtomicU64,
  received: AtomicU64,
  malformed: AtomicU64,
  unhandled: AtomicU64,
}

impl GroupBus {
  pub fn new(
    node_id: impl Into<String>,
    clock: Arc<LogicalClock>,
    transport: Arc<dyn BusTransport>,
    sup: Supervisor,
    peer_ttl: Duration,
    max_datagram: usize,
  ) -> GroupBus {
    GroupBus {
      inner: Arc::new(BusInner {
        node_id: node_id.into(),
        clock,
        transport,
        max_datagram: max_datagram.min(MAX_UDP_PAYLOAD),
        sup,
        life: Lifecycle::default(),
        outbound: Mutex::new(None),
        handlers: RwLock::new(HashMap::new()),
        observers: RwLock::new(Vec::new()),
        peers: PeerDirectory::new(peer_ttl),
        sent: AtomicU64::new(0),
        received: AtomicU64::new(0),
        malformed: AtomicU64::new(0),
        unhandled: AtomicU64::new(0),
      }),
    }
  }

  pub fn node_id(&self) -> &str {
    &self.inner.node_id
  }

  pub fn clock(&self) -> &Arc<LogicalClock> {
    &self.inner.clock
  }

  /// Joins the broadcast domain and starts the send and receive loops. Starting a running bus
  /// is a no-op.
  pub async fn start(&self) -> Result<(), TaskmeshError> {
    let token = match self.inner.life.begin(&self.inner.sup) {
      Some(token) => token,
      None => return Ok(()),
    };
    if let Err(e) = self.inner.transport.join().await {
      self.inner.life.end();
      return Err(e.into());
    }
    let (tx, rx) = unbounded_channel();
    *self.inner.outbound.lock() = Some(tx);
    self.inner.sup.spawn(token.clone(), send_loop(self.inner.clone(), rx));
    self.inner.sup.spawn(token, receive_loop(self.inner.clone()));
    debug!(LOG_LEVEL, node = %self.inner.node_id, "group bus started");
    Ok(())
  }

  /// Leaves the broadcast domain. Queued sends are discarded. Idempotent.
  pub fn stop(&self) {
    self.inner.outbound.lock().take();
    if self.inner.life.end() {
      self.inner.transport.leave();
      debug!(LOG_LEVEL, node = %self.inner.node_id, "group bus stopped");
    }
  }

  pub fn running(&self) -> bool {
    self.inner.life.running()
  }

  /// Stamps `msg` with a fresh logical timestamp and queues it for broadcast. Never blocks and
  /// never fails; problems are logged.
  pub fn send(&self, msg: BusMsg) {
    let env = Envelope {
      sender_id: self.inner.node_id.clone(),
      lamport: self.inner.clock.tick(),
      wall_millis: Utc::now().timestamp_millis(),
      msg,
    };
    let kind = env.msg.kind().wire_name();
    let bytes = match env.encode() {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(LOG_LEVEL, "cannot encode {}: {}", kind, e);
        return;
      }
    };
    if bytes.len() > self.inner.max_datagram {
      warn!(
        LOG_LEVEL,
        "{} is {} bytes, over the {} byte datagram limit; not sent",
        kind,
        bytes.len(),
        self.inner.max_datagram
      );
      return;
    }
    let queued = match self.inner.outbound.lock().as_ref() {
      Some(tx) => tx.send(bytes).is_ok(),
      None => false,
    };
    if !queued {
      trace!(LOG_LEVEL, "bus not running, {} discarded", kind);
    }
  }

  /// Registers the handler for `kind`, replacing any previous one.
  pub fn on_message<F>(&self, kind: MsgKind, handler: F)
  where
    F: Fn(Envelope) + Send + Sync + 'static,
  {
    if self.inner.handlers.write().insert(kind, Arc::new(handler)).is_some() {
      trace!(LOG_LEVEL, "handler for {} replaced", kind.wire_name());
    }
  }

  /// Registers a tap that sees every accepted envelope, synchronously, before dispatch.
  pub fn add_observer<F>(&self, observer: F)
  where
    F: Fn(&Envelope) + Send + Sync + 'static,
  {
    self.inner.observers.write().push(Arc::new(observer));
  }

  pub fn live_peers(&self) -> BTreeSet<String> {
    self.inner.peers.live_peers()
  }

  /// Drops peers that went silent for longer than the peer TTL.
  pub fn prune_peers(&self) -> usize {
    let pruned = self.inner.peers.prune();
    for peer in &pruned {
      debug!(LOG_LEVEL, "{} silent for over {:?}, dropped", peer, self.inner.peers.ttl());
    }
    pruned.len()
  }

  pub fn forget_peer(&self, node_id: &str) {
    self.inner.peers.forget(node_id);
  }

  pub fn stats(&self) -> BusStats {
    BusStats {
      sent: self.inner.sent.load(Ordering::Relaxed),
      received: self.inner.received.load(Ordering::Relaxed),
      malformed: self.inner.malformed.load(Ordering::Relaxed),
      unhandled: self.inner.unhandled.load(Ordering::Relaxed),
    }
  }

  /// Runs one datagram through decode and dispatch as if it came off the wire.
  pub fn inject(&self, datagram: &[u8]) {
    self.inner.accept(datagram);
  }
}

impl BusInner {
  fn accept(&self, datagram: &[u8]) {
    let env = match Envelope::decode(datagram) {
      Ok(env) => env,
      Err(TaskmeshError::UnknownMessageKind(tipo)) => {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
        trace!(LOG_LEVEL, "dropping unknown message kind {}", tipo);
        return;
      }
      Err(e) => {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        debug!(LOG_LEVEL, "dropping datagram: {}", e);
        return;
      }
    };
    if env.sender_id == self.node_id {
      return;
    }
    self.clock.observe(env.lamport);
    self.peers.seen(&env.sender_id);
    self.received.fetch_add(1, Ordering::Relaxed);

    let observers = self.observers.read().clone();
    for observer in observers {
      if catch_unwind(AssertUnwindSafe(|| observer(&env))).is_err() {
        warn!(LOG_LEVEL, "bus observer panicked on {}", env.msg.kind().wire_name());
      }
    }

    let kind = env.msg.kind();
    let handler = self.handlers.read().get(&kind).cloned();
    match handler {
      Some(handler) => self.sup.spawn_detached(async move {
        let from = env.sender_id.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(env))).is_err() {
          warn!(LOG_LEVEL, "handler for {} from {} panicked", kind.wire_name(), from);
        }
      }),
      None => {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
        trace!(LOG_LEVEL, "no handler for {} from {}", kind.wire_name(), env.sender_id);
      }
    }
  }
}

async fn send_loop(inner: Arc<BusInner>, mut rx: UnboundedReceiver<Vec<u8>>) {
  while let Some(datagram) = rx.recv().await {
    match inner.transport.broadcast(datagram).await {
      Ok(()) => {
        inner.sent.fetch_add(1, Ordering::Relaxed);
      }
      Err(e) => debug!(LOG_LEVEL, "bus send failed: {}", e),
    }
  }
}

async fn receive_loop(inner: Arc<BusInner>) {
  loop {
    match inner.transport.recv().await {
      Ok(datagram) => inner.accept(&datagram),
      Err(e) => {
        debug!(LOG_LEVEL, "bus receive failed: {}", e);
        tokio::time::sleep(RECV_BACKOFF).await;
      }
    }
  }
}

#[cfg(test)]
use crate::core::{PeerHeartbeat, SyncRequest};
#[cfg(test)]
use crate::testkit::LocalHub;

#[cfg(test)]
fn test_bus(hub: &Arc<LocalHub>, id: &str, sup: &Supervisor) -> GroupBus {
  GroupBus::new(
    id,
    Arc::new(LogicalClock::new()),
    hub.transport(id),
    sup.clone(),
    Duration::from_secs(30),
    MAX_UDP_PAYLOAD,
  )
}

#[tokio::test]
async fn test_dispatch_by_kind_and_clock_folding() {
  let hub = LocalHub::new();
  let sup = Supervisor::new();
  let a = test_bus(&hub, "a", &sup);
  let b = test_bus(&hub, "b", &sup);
  let (tx, mut rx) = unbounded_channel();
  b.on_message(MsgKind::BackupHeartbeat, move |env| {
    let _ = tx.send(env);
  });
  let own = Arc::new(AtomicU64::new(0));
  let own_hits = own.clone();
  a.on_message(MsgKind::BackupHeartbeat, move |_| {
    own_hits.fetch_add(1, Ordering::SeqCst);
  });
  a.start().await.unwrap();
  b.start().await.unwrap();

  for _ in 0..5 {
    a.clock().tick();
  }
  a.send(BusMsg::BackupHeartbeat(PeerHeartbeat { from: "a".to_string(), to: "b".to_string() }));
  let env = rx.recv().await.unwrap();
  assert_eq!(env.sender_id, "a");
  assert_eq!(env.lamport, 6);
  assert!(b.clock().peek() >= 7);
  assert_eq!(b.live_peers(), maplit::btreeset! {"a".to_string()});
  assert_eq!(own.load(Ordering::SeqCst), 0);
  assert!(sup.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_receive_loop() {
  let hub = LocalHub::new();
  let sup = Supervisor::new();
  let a = test_bus(&hub, "a", &sup);
  let b = test_bus(&hub, "b", &sup);
  b.on_message(MsgKind::DataSyncRequest, |_| panic!("boom"));
  let (tx, mut rx) = unbounded_channel();
  b.on_message(MsgKind::HeartbeatResponse, move |env| {
    let _ = tx.send(env.lamport);
  });
  a.start().await.unwrap();
  b.start().await.unwrap();
  a.send(BusMsg::DataSyncRequest(SyncRequest { requester_id: "a".to_string() }));
  a.send(BusMsg::HeartbeatResponse(PeerHeartbeat { from: "a".to_string(), to: "b".to_string() }));
  assert_eq!(rx.recv().await, Some(2));
  assert!(sup.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_last_registration_wins_and_unknown_is_dropped() {
  let hub = LocalHub::new();
  let sup = Supervisor::new();
  let b = test_bus(&hub, "b", &sup);
  let (tx1, mut rx1) = unbounded_channel::<u8>();
  let (tx2, mut rx2) = unbounded_channel::<u8>();
  b.on_message(MsgKind::DataSyncRequest, move |_| {
    let _ = tx1.send(1);
  });
  b.on_message(MsgKind::DataSyncRequest, move |_| {
    let _ = tx2.send(2);
  });
  b.inject(br#"{"remetenteId":"x","tipo":"FILE_LOCK","dados":{},"timestampLamport":3}"#);
  b.inject(b"garbage");
  b.inject(br#"{"remetenteId":"x","tipo":"DATA_SYNC_REQUEST","dados":{"solicitanteId":"x"},"timestampLamport":4}"#);
  assert_eq!(rx2.recv().await, Some(2));
  assert!(rx1.try_recv().is_err());
  let stats = b.stats();
  assert_eq!(stats.received, 1);
  assert_eq!(stats.malformed, 1);
  assert_eq!(stats.unhandled, 1);
  assert_eq!(b.clock().peek(), 5);
  assert!(sup.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_silences_sends() {
  let hub = LocalHub::new();
  let sup = Supervisor::new();
  let a = test_bus(&hub, "a", &sup);
  a.start().await.unwrap();
  assert_eq!(hub.member_count(), 1);
  a.stop();
  a.stop();
  assert!(!a.running());
  assert_eq!(hub.member_count(), 0);
  a.send(BusMsg::DataSyncRequest(SyncRequest { requester_id: "a".to_string() }));
  a.start().await.unwrap();
  assert!(a.running());
  assert_eq!(hub.member_count(), 1);
  assert!(sup.shutdown(Duration::from_secs(1)).await);
}
