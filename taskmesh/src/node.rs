use crate::cluster::{
  DetectorStats, FailureDetector, FileSyncStats, FileSyncer, HealthReport, HeartbeatProbe,
  LeadershipCoordinator, LeadershipStats, PromotionStep, ReplicationStats, Role, RoleHooks,
  SnapshotCoordinator, SnapshotStats, StateReplicator,
};
use crate::config::{NodeRole, OrchestratorConfig};
use crate::core::{
  BusMsg, BusStats, BusTransport, GroupBus, Lifecycle, LogicalClock, MsgKind, PeerHeartbeat,
  Presence, Socket, Supervisor,
};
use crate::error::TaskmeshError;
use crate::tasks::{
  leader_change, Task, TaskStats, TaskStore, WorkDistributor, WorkerEvents, WorkerLinks,
  WorkerListener,
};
use crate::testkit::LogLevel;
use crate::{debug, error, info, warn};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;
const REDIRECT_GRACE: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq)]
pub struct NodeStats {
  pub node_id: String,
  pub role: Role,
  pub leader_id: String,
  pub tasks: TaskStats,
  pub workers: Vec<String>,
  pub live_peers: Vec<String>,
  pub bus: BusStats,
  pub worker_detector: DetectorStats,
  pub primary_detector: DetectorStats,
  pub leadership: LeadershipStats,
  pub replication: ReplicationStats,
  pub snapshots: SnapshotStats,
  pub file_sync: FileSyncStats,
}

/// One orchestrator process: the group bus, the worker surface and every coordination component,
/// wired together and supervised under one cancellation token.
#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<NodeInner>,
}

struct WorkerSurface {
  token: CancellationToken,
  addr: SocketAddr,
}

struct NodeInner {
  config: OrchestratorConfig,
  sup: Supervisor,
  clock: Arc<LogicalClock>,
  bus: GroupBus,
  distributor: Arc<WorkDistributor>,
  store: TaskStore,
  links: Arc<WorkerLinks>,
  worker_detector: FailureDetector<String>,
  primary_detector: FailureDetector<String>,
  leadership: LeadershipCoordinator,
  replicator: StateReplicator,
  snapshots: SnapshotCoordinator,
  file_sync: FileSyncer,
  surface: tokio::sync::Mutex<Option<WorkerSurface>>,
  surface_addr: Mutex<Option<SocketAddr>>,
  presence: Lifecycle,
}

/// Standby-to-leader heartbeats ride the group bus.
struct BusProbe {
  bus: GroupBus,
}
impl HeartbeatProbe<String> for BusProbe {
  fn probe(&self, peer: &String) -> bool {
    self.bus.send(BusMsg::BackupHeartbeat(PeerHeartbeat {
      from: self.bus.node_id().to_string(),
      to: peer.clone(),
    }));
    true
  }
}

struct NodeEvents {
  distributor: Arc<WorkDistributor>,
  detector: FailureDetector<String>,
}
impl WorkerEvents for NodeEvents {
  fn registered(&self, worker_id: &str) {
    self.detector.register_peer(worker_id.to_string());
    self.distributor.register_worker(worker_id);
  }

  fn completed(&self, worker_id: &str, task_id: &str) {
    self.distributor.complete(task_id, worker_id);
  }

  fn heartbeat(&self, worker_id: &str) {
    self.detector.record_response(&worker_id.to_string());
  }

  fn disconnected(&self, worker_id: &str) {
    self.detector.unregister_peer(&worker_id.to_string());
    self.distributor.worker_lost(worker_id);
  }
}

struct NodeHooks {
  node: Weak<NodeInner>,
}

#[async_trait]
impl RoleHooks for NodeHooks {
  async fn run_step(&self, step: PromotionStep) -> Result<(), TaskmeshError> {
    let node = match self.node.upgrade() {
      Some(node) => node,
      None => return Ok(()),
    };
    match step {
      PromotionStep::StopPrimaryWatch => {
        node.primary_detector.stop();
        node.primary_detector.clear();
        Ok(())
      }
      PromotionStep::StartWorkerSurface => node.start_worker_surface().await.map(|_| ()),
      PromotionStep::AdoptReplica => node.adopt_replica(),
      PromotionStep::Announce => Ok(()),
    }
  }

  async fn demoted(&self, new_leader: Option<&str>, endpoint: Option<&Socket>) {
    let node = match self.node.upgrade() {
      Some(node) => node,
      None => return,
    };
    if let (Some(leader), Some(endpoint)) = (new_leader, endpoint) {
      let sent = node.links.broadcast(&leader_change(leader, endpoint));
      info!(LOG_LEVEL, "redirected {} workers to {} at {}", sent, leader, endpoint);
      sleep(REDIRECT_GRACE).await;
    }
    node.stop_worker_surface().await;
  }

  fn follow_leader(&self, leader_id: &str) {
    if let Some(node) = self.node.upgrade() {
      node.watch_leader(leader_id);
    }
  }

  fn health(&self) -> HealthReport {
    match self.node.upgrade() {
      Some(node) => HealthReport {
        worker_surface_up: node.surface_addr.lock().is_some(),
        workers_connected: node.links.count(),
        pending_tasks: node.distributor.stats().pending,
      },
      None => HealthReport::default(),
    }
  }

  fn maintain(&self) {
    if let Some(node) = self.node.upgrade() {
      let reclaimed = node.distributor.reclaim_unregistered();
      if reclaimed > 0 {
        info!(LOG_LEVEL, "reclaimed {} tasks held by unregistered workers", reclaimed);
      }
    }
  }

  fn announced(&self, endpoint: &Socket) {
    if let Some(node) = self.node.upgrade() {
      let me = node.bus.node_id().to_string();
      node.distributor.set_leader(&me);
      let sent = node.links.broadcast(&leader_change(&me, endpoint));
      debug!(LOG_LEVEL, "leader change sent to {} connected workers", sent);
    }
  }
}

impl Orchestrator {
  /// Builds every component. Nothing runs until [`start`](Orchestrator::start).
  pub fn new(config: OrchestratorConfig, transport: Arc<dyn BusTransport>) -> Orchestrator {
    let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| {
      let sup = Supervisor::new();
      let clock = Arc::new(LogicalClock::new());
      let node_id = config.node_id.clone();
      let bus = GroupBus::new(
        node_id.clone(),
        clock.clone(),
        transport,
        sup.clone(),
        config.bus.peer_ttl,
        config.bus.max_datagram,
      );

      let (initial, leader) = match config.role {
        NodeRole::Primary => (Role::Active, node_id.clone()),
        NodeRole::Backup => (Role::Standby, config.primary_id.clone()),
      };
      let priority = crate::cluster::derive_priority(&node_id, config.priority);
      let leadership = LeadershipCoordinator::new(
        bus.clone(),
        priority,
        initial,
        leader.clone(),
        config.workers.advertise.clone(),
        config.election.clone(),
        sup.clone(),
      );

      let store = TaskStore::new(config.task_file.clone());
      let distributor = Arc::new(
        WorkDistributor::new(clock.clone(), leader).with_store(TaskStore::with_backup(store.path())),
      );
      let links = WorkerLinks::new();
      distributor.set_dispatch(links.clone());

      let node = weak.clone();
      let worker_detector = FailureDetector::new(
        "worker-detector",
        config.worker_detector.clone(),
        links.clone(),
        Arc::new(move |worker: String| {
          if let Some(node) = node.upgrade() {
            node.worker_failed(&worker);
          }
        }),
        sup.clone(),
      );

      let watcher = leadership.clone();
      let primary_detector = FailureDetector::new(
        "primary-detector",
        config.primary_detector.clone(),
        Arc::new(BusProbe { bus: bus.clone() }),
        Arc::new(move |primary: String| watcher.on_primary_failure(&primary)),
        sup.clone(),
      );

      let replicator = StateReplicator::new(
        bus.clone(),
        leadership.role_cell(),
        leadership.leader_cell(),
        distributor.clone(),
        config.replication.clone(),
        sup.clone(),
      );
      let snapshots = SnapshotCoordinator::new(
        bus.clone(),
        leadership.role_cell(),
        distributor.clone(),
        config.snapshot.clone(),
        sup.clone(),
      );

      let file_sync = FileSyncer::new(
        bus.clone(),
        leadership.role_cell(),
        leadership.leader_cell(),
        config.task_file.clone(),
        config.file_sync.clone(),
        sup.clone(),
      );

      NodeInner {
        config,
        sup,
        clock,
        bus,
        distributor,
        store,
        links,
        worker_detector,
        primary_detector,
        leadership,
        replicator,
        snapshots,
        file_sync,
        surface: tokio::sync::Mutex::new(None),
        surface_addr: Mutex::new(None),
        presence: Lifecycle::default(),
      }
    });

    inner.leadership.set_hooks(Arc::new(NodeHooks { node: Arc::downgrade(&inner) }));
    inner.leadership.install();
    inner.replicator.install();
    inner.snapshots.install();
    inner.file_sync.install();
    inner.install_handlers();
    Orchestrator { inner }
  }

  /// Joins the bus and brings the node up in its configured role. A primary that cannot bind
  /// its worker listener fails here, with everything it already started stopped again. An
  /// unusable task file is not fatal.
  pub async fn start(&self) -> Result<(), TaskmeshError> {
    let node = &self.inner;
    node.bus.start().await?;
    if let Err(e) = node.bring_up().await {
      error!(LOG_LEVEL, "{} failed to start: {}", node.bus.node_id(), e);
      node.stop_components().await;
      return Err(e);
    }
    info!(LOG_LEVEL, "{} started as {:?}", node.bus.node_id(), node.leadership.role());
    Ok(())
  }

  /// Stops every component and waits, bounded, for background tasks. Returns false if some task
  /// outlived the timeout.
  pub async fn shutdown(&self) -> bool {
    let node = &self.inner;
    node.stop_components().await;
    let clean = node.sup.shutdown(node.config.shutdown_timeout).await;
    if clean {
      info!(LOG_LEVEL, "{} shut down", node.bus.node_id());
    } else {
      warn!(LOG_LEVEL, "{} shut down with tasks still running", node.bus.node_id());
    }
    clean
  }

  /// Accepts a task. Only the active coordinator takes submissions.
  pub fn submit(
    &self,
    title: impl Into<String>,
    description: impl Into<String>,
  ) -> Result<Task, TaskmeshError> {
    if !self.inner.leadership.is_active() {
      return Err(TaskmeshError::NotLeader { node: self.node_id().to_string() });
    }
    Ok(self.inner.distributor.submit(title, description))
  }

  pub fn tasks(&self) -> Vec<Task> {
    self.inner.distributor.tasks()
  }

  pub fn cleanup_done(&self) -> usize {
    self.inner.distributor.cleanup_done()
  }

  pub fn initiate_snapshot(&self) -> bool {
    self.inner.snapshots.initiate()
  }

  /// Hands leadership to `new_leader` by operator decision.
  pub async fn demote(&self, new_leader: Option<&str>, endpoint: Option<&Socket>) -> bool {
    self.inner.leadership.demote(new_leader, endpoint).await
  }

  pub fn stats(&self) -> NodeStats {
    let node = &self.inner;
    NodeStats {
      node_id: node.bus.node_id().to_string(),
      role: node.leadership.role(),
      leader_id: node.leadership.leader_id(),
      tasks: node.distributor.stats(),
      workers: node.distributor.workers(),
      live_peers: node.bus.live_peers().into_iter().collect(),
      bus: node.bus.stats(),
      worker_detector: node.worker_detector.stats(),
      primary_detector: node.primary_detector.stats(),
      leadership: node.leadership.stats(),
      replication: node.replicator.stats(),
      snapshots: node.snapshots.stats(),
      file_sync: node.file_sync.stats(),
    }
  }

  pub fn node_id(&self) -> &str {
    self.inner.bus.node_id()
  }

  pub fn role(&self) -> Role {
    self.inner.leadership.role()
  }

  pub fn is_active(&self) -> bool {
    self.inner.leadership.is_active()
  }

  pub fn leader_id(&self) -> String {
    self.inner.leadership.leader_id()
  }

  /// Where the worker listener is bound, while it is up.
  pub fn worker_addr(&self) -> Option<SocketAddr> {
    *self.inner.surface_addr.lock()
  }

  pub fn clock(&self) -> &Arc<LogicalClock> {
    &self.inner.clock
  }

  pub fn bus(&self) -> &GroupBus {
    &self.inner.bus
  }

  pub fn distributor(&self) -> &Arc<WorkDistributor> {
    &self.inner.distributor
  }

  pub fn leadership(&self) -> &LeadershipCoordinator {
    &self.inner.leadership
  }

  pub fn replicator(&self) -> &StateReplicator {
    &self.inner.replicator
  }

  pub fn snapshots(&self) -> &SnapshotCoordinator {
    &self.inner.snapshots
  }

  pub fn file_sync(&self) -> &FileSyncer {
    &self.inner.file_sync
  }

  pub fn primary_detector(&self) -> &FailureDetector<String> {
    &self.inner.primary_detector
  }

  pub fn worker_detector(&self) -> &FailureDetector<String> {
    &self.inner.worker_detector
  }
}

impl NodeInner {
  fn install_handlers(self: &Arc<Self>) {
    let node = Arc::downgrade(self);
    self.bus.on_message(MsgKind::BackupHeartbeat, move |env| {
      let node = match node.upgrade() {
        Some(node) => node,
        None => return,
      };
      if let BusMsg::BackupHeartbeat(hb) = env.msg {
        let me = node.bus.node_id();
        if hb.to == me && node.leadership.is_active() {
          node.bus.send(BusMsg::HeartbeatResponse(PeerHeartbeat { from: me.to_string(), to: hb.from }));
        }
      }
    });

    let node = Arc::downgrade(self);
    self.bus.on_message(MsgKind::HeartbeatResponse, move |env| {
      let node = match node.upgrade() {
        Some(node) => node,
        None => return,
      };
      if let BusMsg::HeartbeatResponse(hb) = env.msg {
        if hb.to == node.bus.node_id() {
          node.primary_detector.record_response(&hb.from);
        }
      }
    });

    let node = Arc::downgrade(self);
    self.bus.on_message(MsgKind::Presence, move |env| {
      if let Some(node) = node.upgrade() {
        if let BusMsg::Presence(p) = &env.msg {
          node.check_presence(&env.sender_id, p);
        }
        node.bus.send(BusMsg::PresenceReply(node.presence()));
      }
    });
    // the bus already refreshed the sender's last-seen time
    let node = Arc::downgrade(self);
    self.bus.on_message(MsgKind::PresenceReply, move |env| {
      if let (Some(node), BusMsg::PresenceReply(p)) = (node.upgrade(), &env.msg) {
        node.check_presence(&env.sender_id, p);
      }
    });
  }

  async fn bring_up(self: &Arc<Self>) -> Result<(), TaskmeshError> {
    self.replicator.start();
    self.snapshots.start();
    self.file_sync.start();
    self.start_presence();
    match self.config.role {
      NodeRole::Primary => {
        if self.store.exists() || self.store.backup_path().exists() {
          self.distributor.load(self.store.load_or_recover());
        }
        self.distributor.set_leader(self.bus.node_id());
        self.start_worker_surface().await?;
        self.leadership.start_health_checks();
        self.leadership.announce();
      }
      NodeRole::Backup => {
        self.watch_leader(&self.config.primary_id);
        self.replicator.pull_on_demand();
      }
    }
    Ok(())
  }

  async fn stop_components(&self) {
    self.leadership.stop();
    self.snapshots.stop();
    self.file_sync.stop();
    self.replicator.stop();
    self.primary_detector.stop();
    self.presence.end();
    self.stop_worker_surface().await;
    self.bus.stop();
  }

  fn check_presence(&self, sender: &str, presence: &Presence) {
    if presence.role == Role::Active {
      self.leadership.active_peer_seen(sender);
    }
  }

  fn presence(&self) -> Presence {
    Presence { role: self.leadership.role(), known_leader: self.leadership.leader_id() }
  }

  fn start_presence(self: &Arc<Self>) {
    let token = match self.presence.begin(&self.sup) {
      Some(token) => token,
      None => return,
    };
    let node = Arc::downgrade(self);
    let period = self.config.bus.presence_interval;
    self.sup.spawn(token, async move {
      let mut ticker = interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        match node.upgrade() {
          Some(node) => {
            node.bus.prune_peers();
            node.bus.send(BusMsg::Presence(node.presence()));
          }
          None => break,
        }
      }
    });
  }

  /// Points the standby-to-leader detector at `leader_id`.
  fn watch_leader(&self, leader_id: &str) {
    if self.leadership.is_active() || leader_id == self.bus.node_id() {
      return;
    }
    let peers = self.primary_detector.peers();
    if peers.len() != 1 || peers[0] != leader_id {
      self.primary_detector.clear();
      self.primary_detector.register_peer(leader_id.to_string());
      debug!(LOG_LEVEL, "watching {} for liveness", leader_id);
    }
    self.primary_detector.start();
  }

  async fn start_worker_surface(self: &Arc<Self>) -> Result<SocketAddr, TaskmeshError> {
    let mut surface = self.surface.lock().await;
    if let Some(up) = surface.as_ref() {
      return Ok(up.addr);
    }
    let listener = WorkerListener::bind(self.config.workers.listen).await?;
    let addr = listener.local_addr();
    let token = self.sup.child_token();
    let events = Arc::new(NodeEvents {
      distributor: self.distributor.clone(),
      detector: self.worker_detector.clone(),
    });
    self.sup.spawn(
      token.clone(),
      listener.serve(self.links.clone(), events, self.sup.clone(), token.clone()),
    );
    self.worker_detector.start();
    *surface = Some(WorkerSurface { token, addr });
    *self.surface_addr.lock() = Some(addr);
    Ok(addr)
  }

  async fn stop_worker_surface(&self) {
    let surface = self.surface.lock().await.take();
    if let Some(surface) = surface {
      surface.token.cancel();
      self.links.drop_all();
      self.worker_detector.stop();
      self.worker_detector.clear();
      self.distributor.clear_workers();
      *self.surface_addr.lock() = None;
      info!(LOG_LEVEL, "worker listener on {} closed", surface.addr);
    }
  }

  fn worker_failed(&self, worker_id: &str) {
    self.links.drop_worker(worker_id);
    self.worker_detector.unregister_peer(&worker_id.to_string());
    let moved = self.distributor.worker_lost(worker_id);
    info!(LOG_LEVEL, "worker {} failed, {} tasks moved", worker_id, moved);
  }

  fn adopt_replica(&self) -> Result<(), TaskmeshError> {
    match self.replicator.latest_replica() {
      Ok(table) => {
        let count = table.tasks.len();
        self.distributor.load(table);
        info!(LOG_LEVEL, "adopted replica with {} tasks", count);
        Ok(())
      }
      Err(TaskmeshError::MissingReplica) => {
        warn!(LOG_LEVEL, "no replica received before promotion, starting with an empty table");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
use crate::testkit::{fast_config, LocalHub};

#[tokio::test]
async fn test_primary_accepts_and_backup_refuses() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let primary = Orchestrator::new(
    fast_config(dir.path(), "orchestrator-principal", NodeRole::Primary),
    hub.transport("orchestrator-principal"),
  );
  let backup = Orchestrator::new(
    fast_config(dir.path(), "orchestrator-backup-1", NodeRole::Backup),
    hub.transport("orchestrator-backup-1"),
  );
  primary.start().await.unwrap();
  backup.start().await.unwrap();

  assert!(primary.worker_addr().is_some());
  assert!(backup.worker_addr().is_none());
  let task = primary.submit("A", "").unwrap();
  assert_eq!(task.assigned_worker_id, None);
  assert!(matches!(backup.submit("B", ""), Err(TaskmeshError::NotLeader { .. })));
  assert_eq!(backup.leader_id(), "orchestrator-principal");
  assert_eq!(backup.primary_detector().peers(), vec!["orchestrator-principal".to_string()]);

  assert!(primary.shutdown().await);
  assert!(backup.shutdown().await);
}

#[tokio::test]
async fn test_primary_reloads_task_file() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let cfg = fast_config(dir.path(), "orchestrator-principal", NodeRole::Primary);
  {
    let first = Orchestrator::new(cfg.clone(), hub.transport("orchestrator-principal"));
    first.start().await.unwrap();
    first.submit("A", "").unwrap();
    first.submit("B", "").unwrap();
    first.shutdown().await;
  }
  let second = Orchestrator::new(cfg, hub.transport("orchestrator-principal"));
  second.start().await.unwrap();
  let titles = second.tasks().into_iter().map(|t| t.title).collect::<Vec<_>>();
  assert_eq!(titles.len(), 2);
  assert!(titles.contains(&"A".to_string()) && titles.contains(&"B".to_string()));
  let next = second.submit("C", "").unwrap();
  assert!(second.tasks().iter().filter(|t| t.id == next.id).count() == 1);
  second.shutdown().await;
}

#[tokio::test]
async fn test_bind_failure_is_fatal_for_primary() {
  let dir = tempfile::tempdir().unwrap();
  let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let mut cfg = fast_config(dir.path(), "orchestrator-principal", NodeRole::Primary);
  cfg.workers.listen = taken.local_addr().unwrap();
  let node = Orchestrator::new(cfg, LocalHub::new().transport("orchestrator-principal"));
  assert!(matches!(node.start().await, Err(TaskmeshError::Bind { .. })));
  assert!(!node.bus().running());
}

#[tokio::test]
async fn test_corrupt_task_file_starts_from_backup() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let cfg = fast_config(dir.path(), "orchestrator-principal", NodeRole::Primary);
  {
    let first = Orchestrator::new(cfg.clone(), hub.transport("orchestrator-principal"));
    first.start().await.unwrap();
    first.submit("A", "").unwrap();
    first.submit("B", "").unwrap();
    first.shutdown().await;
  }
  std::fs::write(&cfg.task_file, "{not json").unwrap();

  let second = Orchestrator::new(cfg.clone(), hub.transport("orchestrator-principal"));
  second.start().await.unwrap();
  assert!(second.is_active() && second.bus().running());
  // the backup lags the file by one write
  assert_eq!(second.tasks().iter().map(|t| t.title.as_str()).collect::<Vec<_>>(), vec!["A"]);
  second.shutdown().await;

  std::fs::write(&cfg.task_file, "{not json").unwrap();
  std::fs::remove_file(TaskStore::new(&cfg.task_file).backup_path()).unwrap();
  let third = Orchestrator::new(cfg, hub.transport("orchestrator-principal"));
  third.start().await.unwrap();
  assert!(third.tasks().is_empty());
  assert!(third.submit("C", "").is_ok());
  third.shutdown().await;
}
