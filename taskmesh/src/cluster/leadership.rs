use crate::cluster::ElectionConfig;
use crate::core::{
  BusMsg, ElectionBallot, GroupBus, LeaderAnnouncement, LeaderConfirmed, Lifecycle, MsgKind,
  Socket, Supervisor,
};
use crate::error::TaskmeshError;
use crate::testkit::LogLevel;
use crate::{debug, error, info, warn};
use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
  #[serde(rename = "STANDBY")]
  Standby,
  #[serde(rename = "ELECTING")]
  Electing,
  #[serde(rename = "ACTIVE")]
  Active,
}
impl Role {
  fn from_u8(v: u8) -> Role {
    match v {
      1 => Role::Electing,
      2 => Role::Active,
      _ => Role::Standby,
    }
  }
}

/// Shared, lock-free view of a node's role. Transitions are compare-and-set.
#[derive(Clone, Debug)]
pub struct RoleCell(Arc<AtomicU8>);
impl RoleCell {
  pub fn new(role: Role) -> RoleCell {
    RoleCell(Arc::new(AtomicU8::new(role as u8)))
  }

  pub fn get(&self) -> Role {
    Role::from_u8(self.0.load(Ordering::SeqCst))
  }

  pub fn is(&self, role: Role) -> bool {
    self.get() == role
  }

  pub fn transition(&self, from: Role, to: Role) -> bool {
    self.0.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst).is_ok()
  }
}

/// Shared view of the leader this node currently follows, or itself while active.
#[derive(Clone, Debug, Default)]
pub struct LeaderCell(Arc<RwLock<String>>);
impl LeaderCell {
  pub fn new(leader_id: impl Into<String>) -> LeaderCell {
    LeaderCell(Arc::new(RwLock::new(leader_id.into())))
  }

  pub fn get(&self) -> String {
    self.0.read().clone()
  }

  pub fn is(&self, node_id: &str) -> bool {
    *self.0.read() == node_id
  }

  /// Returns whether the leader changed.
  pub fn set(&self, leader_id: &str) -> bool {
    let mut current = self.0.write();
    let changed = *current != leader_id;
    *current = leader_id.to_string();
    changed
  }
}

/// Promotion entry actions the coordinator asks the node to perform, in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PromotionStep {
  StopPrimaryWatch,
  StartWorkerSurface,
  AdoptReplica,
  Announce,
}
impl PromotionStep {
  pub const ORDER: [PromotionStep; 4] = [
    PromotionStep::StopPrimaryWatch,
    PromotionStep::StartWorkerSurface,
    PromotionStep::AdoptReplica,
    PromotionStep::Announce,
  ];
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
  pub worker_surface_up: bool,
  pub workers_connected: usize,
  pub pending_tasks: usize,
}
impl HealthReport {
  pub fn problems(&self) -> Vec<&'static str> {
    let mut problems = Vec::new();
    if !self.worker_surface_up {
      problems.push("worker listener is down");
    }
    if self.pending_tasks > 0 && self.workers_connected == 0 {
      problems.push("tasks pending with no worker connected");
    }
    problems
  }

  pub fn healthy(&self) -> bool {
    self.problems().is_empty()
  }
}

/// What the node does when leadership changes hands. The coordinator only sequences these.
#[async_trait]
pub trait RoleHooks: Send + Sync + 'static {
  /// Runs one promotion step. `Announce` is performed by the coordinator and never passed here.
  async fn run_step(&self, step: PromotionStep) -> Result<(), TaskmeshError>;
  /// This node is no longer active; `new_leader` and its worker endpoint, if known.
  async fn demoted(&self, new_leader: Option<&str>, endpoint: Option<&Socket>);
  /// A standby learned who leads now.
  fn follow_leader(&self, leader_id: &str);
  fn health(&self) -> HealthReport;
  /// Periodic upkeep while active.
  fn maintain(&self) {}
  /// The leader announcement went out on the bus.
  fn announced(&self, _endpoint: &Socket) {}
}

/// Priority used on ballots: an explicit value, else the numeric suffix of ids shaped like
/// `orchestrator-backup-<millis>` (earlier starters win), else a hash of the id.
pub fn derive_priority(node_id: &str, explicit: Option<u64>) -> u64 {
  explicit
    .or_else(|| node_id.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()))
    .unwrap_or_else(|| wyhash::wyhash(node_id.as_bytes(), 0))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LeadershipStats {
  pub elections_started: u64,
  pub elections_won: u64,
  pub elections_lost: u64,
  /// Elections joined because a worse-ranked standby started one.
  pub elections_joined: u64,
  pub duplicate_leaders: u64,
  pub failed_steps: Vec<String>,
}

/// The standby/electing/active state machine.
#[derive(Clone)]
pub struct LeadershipCoordinator {
  inner: Arc<LeaderInner>,
}

struct LeaderInner {
  ballot: ElectionBallot,
  role: RoleCell,
  leader: LeaderCell,
  last_announcement: RwLock<Option<LeaderAnnouncement>>,
  advertise: Socket,
  bus: GroupBus,
  config: ElectionConfig,
  hooks: RwLock<Option<Arc<dyn RoleHooks>>>,
  round: AtomicU64,
  failed_steps: Mutex<BTreeSet<PromotionStep>>,
  duplicates_seen: Mutex<BTreeSet<String>>,
  sup: Supervisor,
  health: Lifecycle,
  started: AtomicU64,
  won: AtomicU64,
  lost: AtomicU64,
  joined: AtomicU64,
  duplicates: AtomicU64,
}

impl LeadershipCoordinator {
  pub fn new(
    bus: GroupBus,
    priority: u64,
    initial: Role,
    leader_id: impl Into<String>,
    advertise: Socket,
    config: ElectionConfig,
    sup: Supervisor,
  ) -> LeadershipCoordinator {
    let ballot = ElectionBallot { candidate_id: bus.node_id().to_string(), priority };
    LeadershipCoordinator {
      inner: Arc::new(LeaderInner {
        ballot,
        role: RoleCell::new(initial),
        leader: LeaderCell::new(leader_id),
        last_announcement: RwLock::new(None),
        advertise,
        bus,
        config,
        hooks: RwLock::new(None),
        round: AtomicU64::new(0),
        failed_steps: Mutex::new(BTreeSet::new()),
        duplicates_seen: Mutex::new(BTreeSet::new()),
        sup,
        health: Lifecycle::default(),
        started: AtomicU64::new(0),
        won: AtomicU64::new(0),
        lost: AtomicU64::new(0),
        joined: AtomicU64::new(0),
        duplicates: AtomicU64::new(0),
      }),
    }
  }

  pub fn set_hooks(&self, hooks: Arc<dyn RoleHooks>) {
    *self.inner.hooks.write() = Some(hooks);
  }

  /// Registers the election and announcement handlers on the bus.
  pub fn install(&self) {
    let me = self.clone();
    self.inner.bus.on_message(MsgKind::Candidacy, move |env| {
      if let BusMsg::Candidacy(ballot) = env.msg {
        me.on_candidacy(ballot);
      }
    });
    let me = self.clone();
    self.inner.bus.on_message(MsgKind::LeaderConfirmed, move |env| {
      if let BusMsg::LeaderConfirmed(lc) = env.msg {
        me.on_leader_claim(&lc.leader_id, lc.priority, None);
      }
    });
    let me = self.clone();
    self.inner.bus.on_message(MsgKind::NewPrimary, move |env| {
      if let BusMsg::NewPrimary(ann) = env.msg {
        let priority = derive_priority(&ann.leader_id, None);
        let leader = ann.leader_id.clone();
        me.on_leader_claim(&leader, priority, Some(ann));
      }
    });
  }

  pub fn role(&self) -> Role {
    self.inner.role.get()
  }

  pub fn role_cell(&self) -> RoleCell {
    self.inner.role.clone()
  }

  pub fn is_active(&self) -> bool {
    self.inner.role.is(Role::Active)
  }

  pub fn leader_id(&self) -> String {
    self.inner.leader.get()
  }

  pub fn leader_cell(&self) -> LeaderCell {
    self.inner.leader.clone()
  }

  pub fn ballot(&self) -> &ElectionBallot {
    &self.inner.ballot
  }

  pub fn last_announcement(&self) -> Option<LeaderAnnouncement> {
    self.inner.last_announcement.read().clone()
  }

  /// Failure callback of the standby-to-primary detector.
  pub fn on_primary_failure(&self, primary: &str) {
    if !self.inner.leader.is(primary) {
      debug!(LOG_LEVEL, "ignoring failure of {}, not the known leader", primary);
      return;
    }
    warn!(LOG_LEVEL, "primary {} unresponsive, starting election", primary);
    self.trigger_election();
  }

  /// STANDBY -> ELECTING. Returns false if this node is not a standby; at most one election runs
  /// at a time.
  pub fn trigger_election(&self) -> bool {
    if !self.inner.role.transition(Role::Standby, Role::Electing) {
      debug!(LOG_LEVEL, "election not started, role is {:?}", self.role());
      return false;
    }
    let round = self.inner.round.fetch_add(1, Ordering::SeqCst) + 1;
    self.inner.started.fetch_add(1, Ordering::Relaxed);
    info!(
      LOG_LEVEL,
      "{} standing for election with priority {}", self.inner.ballot.candidate_id, self.inner.ballot.priority
    );
    self.inner.bus.send(BusMsg::Candidacy(self.inner.ballot.clone()));
    let me = self.clone();
    let window = self.inner.config.settle_window;
    self.inner.sup.spawn_detached(async move {
      sleep(window).await;
      me.settle(round).await;
    });
    true
  }

  async fn settle(&self, round: u64) {
    if self.inner.round.load(Ordering::SeqCst) != round {
      return;
    }
    if !self.inner.role.transition(Role::Electing, Role::Active) {
      debug!(LOG_LEVEL, "settle window closed as {:?}", self.role());
      return;
    }
    self.inner.won.fetch_add(1, Ordering::Relaxed);
    info!(LOG_LEVEL, "{} won the election", self.inner.ballot.candidate_id);
    self.promote().await;
  }

  fn on_candidacy(&self, ballot: ElectionBallot) {
    if ballot.candidate_id == self.inner.ballot.candidate_id {
      return;
    }
    let mine = &self.inner.ballot;
    match self.role() {
      Role::Active => {
        debug!(LOG_LEVEL, "{} is campaigning while we lead, reasserting", ballot.candidate_id);
        self.confirm();
      }
      Role::Electing if ballot.beats(mine) => {
        if self.inner.role.transition(Role::Electing, Role::Standby) {
          self.inner.lost.fetch_add(1, Ordering::Relaxed);
          info!(
            LOG_LEVEL,
            "yielding to {} (priority {} < {})", ballot.candidate_id, ballot.priority, mine.priority
          );
          self.watch_yield(self.leader_id());
        }
      }
      Role::Electing => {
        self.inner.bus.send(BusMsg::Candidacy(mine.clone()));
      }
      // our own detector may not have fired yet; a better ballot must still be on the table
      Role::Standby if mine.beats(&ballot) => {
        debug!(
          LOG_LEVEL,
          "joining election of {} (priority {}): ours is {}, {} not yet failed here",
          ballot.candidate_id,
          ballot.priority,
          mine.priority,
          self.leader_id()
        );
        if self.trigger_election() {
          self.inner.joined.fetch_add(1, Ordering::Relaxed);
        }
      }
      Role::Standby => {}
    }
  }

  /// If the candidate we yielded to never announces itself, stand again.
  fn watch_yield(&self, stale_leader: String) {
    let me = self.clone();
    let cfg = &self.inner.config;
    let patience = cfg.settle_window * 2 + cfg.announce_delay;
    self.inner.sup.spawn_detached(async move {
      sleep(patience).await;
      if me.role() == Role::Standby && me.leader_id() == stale_leader {
        warn!(LOG_LEVEL, "no leader announced after yielding, standing again");
        me.trigger_election();
      }
    });
  }

  fn on_leader_claim(&self, leader: &str, priority: u64, ann: Option<LeaderAnnouncement>) {
    if leader == self.inner.ballot.candidate_id {
      return;
    }
    if let Some(ann) = ann {
      *self.inner.last_announcement.write() = Some(ann);
    }
    match self.role() {
      Role::Active => self.duplicate_leader(leader, priority),
      Role::Electing => {
        if self.inner.role.transition(Role::Electing, Role::Standby) {
          self.inner.lost.fetch_add(1, Ordering::Relaxed);
          info!(LOG_LEVEL, "{} confirmed as leader, abandoning election", leader);
        }
        self.follow(leader);
      }
      Role::Standby => self.follow(leader),
    }
  }

  /// Presence from `peer` says it is active too.
  pub fn active_peer_seen(&self, peer: &str) {
    if peer != self.inner.ballot.candidate_id && self.is_active() {
      self.duplicate_leader(peer, derive_priority(peer, None));
    }
  }

  /// Both stay active; resolving it is left to an operator through [`demote`](Self::demote).
  fn duplicate_leader(&self, leader: &str, priority: u64) {
    if !self.inner.duplicates_seen.lock().insert(leader.to_string()) {
      return;
    }
    self.inner.duplicates.fetch_add(1, Ordering::Relaxed);
    error!(
      LOG_LEVEL,
      "duplicate leader: {} (priority {}) claims leadership while {} (priority {}) is active; operator intervention required",
      leader,
      priority,
      self.inner.ballot.candidate_id,
      self.inner.ballot.priority
    );
  }

  fn follow(&self, leader: &str) {
    if self.inner.leader.set(leader) {
      info!(LOG_LEVEL, "now following {}", leader);
    }
    if let Some(hooks) = self.hooks() {
      hooks.follow_leader(leader);
    }
  }

  fn confirm(&self) {
    self.inner.bus.send(BusMsg::LeaderConfirmed(LeaderConfirmed {
      leader_id: self.inner.ballot.candidate_id.clone(),
      priority: self.inner.ballot.priority,
    }));
  }

  /// Broadcasts the new-leader announcement and confirmation.
  pub fn announce(&self) {
    self.inner.bus.send(BusMsg::NewPrimary(LeaderAnnouncement {
      leader_id: self.inner.ballot.candidate_id.clone(),
      host: self.inner.advertise.host.to_string(),
      port: self.inner.advertise.port,
    }));
    self.confirm();
    if let Some(hooks) = self.hooks() {
      hooks.announced(&self.inner.advertise);
    }
  }

  fn hooks(&self) -> Option<Arc<dyn RoleHooks>> {
    self.inner.hooks.read().clone()
  }

  async fn promote(&self) {
    self.inner.leader.set(&self.inner.ballot.candidate_id);
    for step in PromotionStep::ORDER.iter().copied() {
      if step == PromotionStep::Announce {
        sleep(self.inner.config.announce_delay).await;
        if !self.is_active() {
          return;
        }
        self.announce();
        continue;
      }
      self.run_step(step).await;
    }
    self.start_health_checks();
  }

  async fn run_step(&self, step: PromotionStep) -> bool {
    let result = match self.hooks() {
      Some(hooks) => hooks.run_step(step).await,
      None => Ok(()),
    };
    match result {
      Ok(()) => {
        self.inner.failed_steps.lock().remove(&step);
        debug!(LOG_LEVEL, "promotion step {:?} done", step);
        true
      }
      Err(e) => {
        self.inner.failed_steps.lock().insert(step);
        error!(LOG_LEVEL, "promotion step {:?} failed: {}", step, e);
        false
      }
    }
  }

  /// Starts the periodic self-check. No-op if running.
  pub fn start_health_checks(&self) {
    let token = match self.inner.health.begin(&self.inner.sup) {
      Some(token) => token,
      None => return,
    };
    let me = self.clone();
    let cfg = self.inner.config.clone();
    self.inner.sup.spawn(token, async move {
      sleep(cfg.health_initial_delay).await;
      let mut ticker = interval(cfg.health_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        me.health_check().await;
      }
    });
  }

  /// Retries failed promotion steps, runs upkeep and logs anything unhealthy.
  pub async fn health_check(&self) -> HealthReport {
    if !self.is_active() {
      return HealthReport::default();
    }
    let retry = self.inner.failed_steps.lock().iter().copied().collect_vec();
    for step in retry {
      info!(LOG_LEVEL, "retrying promotion step {:?}", step);
      self.run_step(step).await;
    }
    let hooks = match self.hooks() {
      Some(hooks) => hooks,
      None => return HealthReport::default(),
    };
    hooks.maintain();
    let report = hooks.health();
    let problems = report.problems();
    if problems.is_empty() {
      debug!(LOG_LEVEL, "health ok: {:?}", report);
    } else {
      warn!(LOG_LEVEL, "health check: {}", problems.join("; "));
    }
    report
  }

  /// ACTIVE -> STANDBY, administrative only.
  pub async fn demote(&self, new_leader: Option<&str>, endpoint: Option<&Socket>) -> bool {
    if !self.inner.role.transition(Role::Active, Role::Standby) {
      return false;
    }
    self.inner.health.end();
    self.inner.duplicates_seen.lock().clear();
    warn!(LOG_LEVEL, "{} demoted, new leader {:?}", self.inner.ballot.candidate_id, new_leader);
    if let Some(hooks) = self.hooks() {
      hooks.demoted(new_leader, endpoint).await;
    }
    if let Some(leader) = new_leader {
      self.follow(leader);
    }
    true
  }

  pub fn stop(&self) {
    self.inner.health.end();
    self.inner.round.fetch_add(1, Ordering::SeqCst);
  }

  pub fn stats(&self) -> LeadershipStats {
    LeadershipStats {
      elections_started: self.inner.started.load(Ordering::Relaxed),
      elections_won: self.inner.won.load(Ordering::Relaxed),
      elections_lost: self.inner.lost.load(Ordering::Relaxed),
      elections_joined: self.inner.joined.load(Ordering::Relaxed),
      duplicate_leaders: self.inner.duplicates.load(Ordering::Relaxed),
      failed_steps: self.inner.failed_steps.lock().iter().map(|s| format!("{:?}", s)).collect(),
    }
  }
}

#[test]
fn test_derive_priority() {
  assert_eq!(derive_priority("orchestrator-backup-1700000000000", None), 1_700_000_000_000);
  assert_eq!(derive_priority("anything", Some(3)), 3);
  let hashed = derive_priority("orchestrator-principal", None);
  assert_eq!(hashed, derive_priority("orchestrator-principal", None));
  assert_ne!(hashed, derive_priority("orchestrator-secundario", None));
}

#[test]
fn test_role_cell_cas() {
  let role = RoleCell::new(Role::Standby);
  assert!(role.transition(Role::Standby, Role::Electing));
  assert!(!role.transition(Role::Standby, Role::Electing));
  assert!(role.is(Role::Electing));
  assert!(role.transition(Role::Electing, Role::Active));
  assert_eq!(role.get(), Role::Active);
}

#[test]
fn test_health_problems() {
  let ok = HealthReport { worker_surface_up: true, workers_connected: 0, pending_tasks: 0 };
  assert!(ok.healthy());
  let starving = HealthReport { pending_tasks: 3, ..ok.clone() };
  assert_eq!(starving.problems(), vec!["tasks pending with no worker connected"]);
  let down = HealthReport { worker_surface_up: false, ..ok };
  assert!(!down.healthy());
}

#[cfg(test)]
use crate::testkit::LocalHub;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn standby_coordinator(priority: u64) -> LeadershipCoordinator {
  let sup = Supervisor::new();
  let bus = GroupBus::new(
    "orchestrator-backup-5",
    Arc::new(crate::core::LogicalClock::new()),
    LocalHub::new().transport("orchestrator-backup-5"),
    sup.clone(),
    Duration::from_secs(30),
    65507,
  );
  LeadershipCoordinator::new(
    bus,
    priority,
    Role::Standby,
    "orchestrator-principal",
    "127.0.0.1:8080".parse().unwrap(),
    ElectionConfig::default(),
    sup,
  )
}

#[tokio::test]
async fn test_standby_joins_only_against_worse_ballots() {
  let coord = standby_coordinator(5);
  coord.on_candidacy(ElectionBallot { candidate_id: "orchestrator-backup-2".to_string(), priority: 2 });
  assert_eq!(coord.role(), Role::Standby);
  assert_eq!(coord.stats().elections_joined, 0);

  coord.on_candidacy(ElectionBallot { candidate_id: "orchestrator-backup-9".to_string(), priority: 9 });
  assert_eq!(coord.role(), Role::Electing);
  assert_eq!(coord.stats().elections_joined, 1);
  assert_eq!(coord.stats().elections_started, 1);
  assert_eq!(coord.leader_id(), "orchestrator-principal");
}
