use crate::cluster::DetectorConfig;
use crate::core::{Lifecycle, Supervisor};
use crate::testkit::LogLevel;
use crate::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

/// Sends one heartbeat to one peer. Returns false if it could not even be handed off.
pub trait HeartbeatProbe<P>: Send + Sync {
  fn probe(&self, peer: &P) -> bool;
}

pub type FailureHandler<P> = Arc<dyn Fn(P) + Send + Sync>;

pub trait PeerId: Clone + Ord + Debug + Display + Send + Sync + 'static {}
impl<T: Clone + Ord + Debug + Display + Send + Sync + 'static> PeerId for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
  /// Registered, nothing heard yet. The registration time counts as the last heartbeat.
  Waiting,
  Receiving,
  /// Failure reported; stays here until the peer answers again.
  Down,
}

struct PeerEntry {
  last_heartbeat_at: Instant,
  state: PeerState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectorStats {
  pub sent: u64,
  pub received: u64,
  pub failures: u64,
  pub monitored: usize,
}

/// Timeout-based heartbeat failure detection over a set of peers.
///
/// Failure is edge-triggered: the handler runs once when a peer crosses the timeout, and again
/// only after the peer has answered in between.
pub struct FailureDetector<P: PeerId> {
  inner: Arc<DetectorInner<P>>,
}
impl<P: PeerId> Clone for FailureDetector<P> {
  fn clone(&self) -> Self {
    FailureDetector { inner: self.inner.clone() }
  }
}

struct DetectorInner<P: PeerId> {
  name: &'static str,
  config: DetectorConfig,
  probe: Arc<dyn HeartbeatProbe<P>>,
  on_failure: FailureHandler<P>,
  peers: Mutex<BTreeMap<P, PeerEntry>>,
  sup: Supervisor,
  life: Lifecycle,
  sent: AtomicU64,
  received: AtomicU64,
  failures: AtomicU64,
}

impl<P: PeerId> FailureDetector<P> {
  pub fn new(
    name: &'static str,
    config: DetectorConfig,
    probe: Arc<dyn HeartbeatProbe<P>>,
    on_failure: FailureHandler<P>,
    sup: Supervisor,
  ) -> FailureDetector<P> {
    FailureDetector {
      inner: Arc::new(DetectorInner {
        name,
        config,
        probe,
        on_failure,
        peers: Mutex::new(BTreeMap::new()),
        sup,
        life: Lifecycle::default(),
        sent: AtomicU64::new(0),
        received: AtomicU64::new(0),
        failures: AtomicU64::new(0),
      }),
    }
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.inner.config
  }

  pub fn register_peer(&self, peer: P) {
    let mut peers = self.inner.peers.lock();
    peers
      .entry(peer)
      .and_modify(|e| {
        e.last_heartbeat_at = Instant::now();
        e.state = PeerState::Waiting;
      })
      .or_insert(PeerEntry { last_heartbeat_at: Instant::now(), state: PeerState::Waiting });
  }

  pub fn unregister_peer(&self, peer: &P) -> bool {
    self.inner.peers.lock().remove(peer).is_some()
  }

  pub fn clear(&self) {
    self.inner.peers.lock().clear();
  }

  /// Records an answer from `peer`. Unknown peers are ignored.
  pub fn record_response(&self, peer: &P) -> bool {
    let recovered = {
      let mut peers = self.inner.peers.lock();
      let entry = match peers.get_mut(peer) {
        Some(entry) => entry,
        None => {
          trace!(LOG_LEVEL, "{}: response from unmonitored {}", self.inner.name, peer);
          return false;
        }
      };
      let recovered = entry.state == PeerState::Down;
      entry.last_heartbeat_at = Instant::now();
      entry.state = PeerState::Receiving;
      recovered
    };
    self.inner.received.fetch_add(1, Ordering::Relaxed);
    if recovered {
      warn!(LOG_LEVEL, "{}: {} is responding again", self.inner.name, peer);
    }
    true
  }

  pub fn state(&self, peer: &P) -> Option<PeerState> {
    self.inner.peers.lock().get(peer).map(|e| e.state)
  }

  pub fn peers(&self) -> Vec<P> {
    self.inner.peers.lock().keys().cloned().collect()
  }

  /// Probes every registered peer once. Returns how many probes were handed off.
  pub fn send_heartbeats(&self) -> usize {
    let peers = self.peers();
    let sent = peers.iter().filter(|p| self.inner.probe.probe(p)).count();
    self.inner.sent.fetch_add(sent as u64, Ordering::Relaxed);
    if sent < peers.len() {
      debug!(LOG_LEVEL, "{}: {} of {} heartbeats not sent", self.inner.name, peers.len() - sent, peers.len());
    }
    sent
  }

  /// Reports every peer that has just crossed the timeout. Returns those peers.
  pub fn check_timeouts(&self) -> Vec<P> {
    let now = Instant::now();
    let timeout = self.inner.config.timeout;
    let failed = {
      let mut peers = self.inner.peers.lock();
      peers
        .iter_mut()
        .filter(|(_, e)| e.state != PeerState::Down && now.duration_since(e.last_heartbeat_at) > timeout)
        .map(|(p, e)| {
          e.state = PeerState::Down;
          p.clone()
        })
        .collect::<Vec<_>>()
    };
    for peer in &failed {
      self.inner.failures.fetch_add(1, Ordering::Relaxed);
      warn!(LOG_LEVEL, "{}: {} missed heartbeats for over {:?}", self.inner.name, peer, timeout);
      let handler = self.inner.on_failure.clone();
      let p = peer.clone();
      if catch_unwind(AssertUnwindSafe(|| handler(p))).is_err() {
        warn!(LOG_LEVEL, "{}: failure handler panicked for {}", self.inner.name, peer);
      }
    }
    failed
  }

  /// Starts the heartbeat and scan timers. No-op if already running.
  pub fn start(&self) {
    let token = match self.inner.life.begin(&self.inner.sup) {
      Some(token) => token,
      None => return,
    };
    let cfg = self.inner.config.clone();
    let hb = self.clone();
    self.inner.sup.spawn(token.clone(), async move {
      sleep(cfg.initial_delay).await;
      let mut ticker = interval(cfg.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        hb.send_heartbeats();
      }
    });
    let cfg = self.inner.config.clone();
    let scan = self.clone();
    self.inner.sup.spawn(token, async move {
      sleep(cfg.initial_delay).await;
      let mut ticker = interval(cfg.scan_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        scan.check_timeouts();
      }
    });
    debug!(LOG_LEVEL, "{}: started", self.inner.name);
  }

  /// Stops both timers. Idempotent; monitored peers are kept.
  pub fn stop(&self) {
    if self.inner.life.end() {
      debug!(LOG_LEVEL, "{}: stopped", self.inner.name);
    }
  }

  pub fn running(&self) -> bool {
    self.inner.life.running()
  }

  pub fn stats(&self) -> DetectorStats {
    DetectorStats {
      sent: self.inner.sent.load(Ordering::Relaxed),
      received: self.inner.received.load(Ordering::Relaxed),
      failures: self.inner.failures.load(Ordering::Relaxed),
      monitored: self.inner.peers.lock().len(),
    }
  }
}

#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
struct CountingProbe(AtomicU64);
#[cfg(test)]
impl HeartbeatProbe<String> for CountingProbe {
  fn probe(&self, _: &String) -> bool {
    self.0.fetch_add(1, Ordering::SeqCst);
    true
  }
}

#[cfg(test)]
fn detector(sup: &Supervisor) -> (FailureDetector<String>, Arc<Mutex<Vec<String>>>, Arc<CountingProbe>) {
  let fired = Arc::new(Mutex::new(Vec::new()));
  let sink = fired.clone();
  let probe = Arc::new(CountingProbe(AtomicU64::new(0)));
  let cfg = DetectorConfig {
    interval: Duration::from_secs(1),
    timeout: Duration::from_secs(5),
    scan_interval: Duration::from_secs(1),
    initial_delay: Duration::ZERO,
  };
  let fd = FailureDetector::new(
    "test",
    cfg,
    probe.clone(),
    Arc::new(move |p: String| sink.lock().push(p)),
    sup.clone(),
  );
  (fd, fired, probe)
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_edge_triggered() {
  let sup = Supervisor::new();
  let (fd, fired, _) = detector(&sup);
  fd.register_peer("w1".to_string());
  tokio::time::advance(Duration::from_secs(6)).await;
  assert_eq!(fd.check_timeouts(), vec!["w1".to_string()]);
  assert!(fd.check_timeouts().is_empty());
  tokio::time::advance(Duration::from_secs(30)).await;
  assert!(fd.check_timeouts().is_empty());
  assert_eq!(fired.lock().len(), 1);

  assert!(fd.record_response(&"w1".to_string()));
  assert_eq!(fd.state(&"w1".to_string()), Some(PeerState::Receiving));
  tokio::time::advance(Duration::from_secs(4)).await;
  assert!(fd.check_timeouts().is_empty());
  tokio::time::advance(Duration::from_secs(2)).await;
  assert_eq!(fd.check_timeouts().len(), 1);
  assert_eq!(*fired.lock(), vec!["w1".to_string(), "w1".to_string()]);
  assert_eq!(fd.stats().failures, 2);
  assert_eq!(fd.stats().received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timers_send_heartbeats_and_detect() {
  let sup = Supervisor::new();
  let (fd, fired, probe) = detector(&sup);
  fd.register_peer("a".to_string());
  fd.register_peer("b".to_string());
  fd.start();
  fd.start();
  for _ in 0..4 {
    tokio::time::sleep(Duration::from_secs(1)).await;
    fd.record_response(&"a".to_string());
  }
  for _ in 0..4 {
    tokio::time::sleep(Duration::from_secs(1)).await;
    fd.record_response(&"a".to_string());
  }
  assert_eq!(*fired.lock(), vec!["b".to_string()]);
  assert_eq!(fd.state(&"a".to_string()), Some(PeerState::Receiving));
  assert!(probe.0.load(Ordering::SeqCst) >= 14);
  assert!(fd.stats().sent >= 14);

  fd.stop();
  fd.stop();
  assert!(!fd.running());
  let sent = fd.stats().sent;
  tokio::time::sleep(Duration::from_secs(20)).await;
  assert_eq!(fd.stats().sent, sent);
  assert_eq!(fired.lock().len(), 1);
  assert!(sup.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_unregistered_peers() {
  let sup = Supervisor::new();
  let (fd, fired, _) = detector(&sup);
  assert!(!fd.record_response(&"ghost".to_string()));
  fd.register_peer("w1".to_string());
  assert!(fd.unregister_peer(&"w1".to_string()));
  tokio::time::advance(Duration::from_secs(60)).await;
  assert!(fd.check_timeouts().is_empty());
  assert!(fired.lock().is_empty());
  assert_eq!(fd.stats().monitored, 0);
}
