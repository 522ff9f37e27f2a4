use crate::cluster::{LeaderCell, ReplicationConfig, Role, RoleCell};
use crate::core::{BusMsg, FullState, GroupBus, Lifecycle, MsgKind, Supervisor, SyncRequest};
use crate::error::TaskmeshError;
use crate::tasks::{TaskStore, TaskTable, WorkDistributor};
use crate::testkit::LogLevel;
use crate::{debug, info, trace, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicationStats {
  pub pushed: u64,
  pub pulled: u64,
  pub accepted: u64,
  pub rejected: u64,
  pub stale: u64,
}

/// Ships the task table from the active coordinator to standbys and keeps the last good copy.
#[derive(Clone)]
pub struct StateReplicator {
  inner: Arc<ReplInner>,
}

struct ReplInner {
  bus: GroupBus,
  role: RoleCell,
  leader: LeaderCell,
  distributor: Arc<WorkDistributor>,
  replica: TaskStore,
  latest: RwLock<Option<TaskTable>>,
  config: ReplicationConfig,
  sup: Supervisor,
  life: Lifecycle,
  pushed: AtomicU64,
  pulled: AtomicU64,
  accepted: AtomicU64,
  rejected: AtomicU64,
  stale: AtomicU64,
}

impl StateReplicator {
  pub fn new(
    bus: GroupBus,
    role: RoleCell,
    leader: LeaderCell,
    distributor: Arc<WorkDistributor>,
    config: ReplicationConfig,
    sup: Supervisor,
  ) -> StateReplicator {
    let replica = TaskStore::with_backup(config.replica_file.clone());
    StateReplicator {
      inner: Arc::new(ReplInner {
        bus,
        role,
        leader,
        distributor,
        replica,
        latest: RwLock::new(None),
        config,
        sup,
        life: Lifecycle::default(),
        pushed: AtomicU64::new(0),
        pulled: AtomicU64::new(0),
        accepted: AtomicU64::new(0),
        rejected: AtomicU64::new(0),
        stale: AtomicU64::new(0),
      }),
    }
  }

  pub fn install(&self) {
    let me = self.clone();
    self.inner.bus.on_message(MsgKind::DataSync, move |env| {
      if let BusMsg::DataSync(state) = env.msg {
        me.on_full_state(&env.sender_id, state);
      }
    });
    let me = self.clone();
    self.inner.bus.on_message(MsgKind::SyncNow, move |env| {
      if let BusMsg::SyncNow(state) = env.msg {
        me.on_full_state(&env.sender_id, state);
      }
    });
    let me = self.clone();
    self.inner.bus.on_message(MsgKind::DataSyncRequest, move |env| {
      if me.inner.role.is(Role::Active) {
        debug!(LOG_LEVEL, "state requested by {}", env.sender_id);
        me.push_full();
      }
    });
  }

  /// Starts the periodic push/pull timer and the push-on-mutation watcher.
  pub fn start(&self) {
    let token = match self.inner.life.begin(&self.inner.sup) {
      Some(token) => token,
      None => return,
    };
    let me = self.clone();
    self.inner.sup.spawn(token.clone(), async move {
      let mut push = interval(me.inner.config.push_interval);
      let mut pull = interval(me.inner.config.pull_interval);
      push.set_missed_tick_behavior(MissedTickBehavior::Delay);
      pull.set_missed_tick_behavior(MissedTickBehavior::Delay);
      push.tick().await;
      pull.tick().await;
      loop {
        tokio::select! {
          _ = push.tick() => {
            me.push_full();
          }
          _ = pull.tick() => {
            me.pull_on_demand();
          }
        }
      }
    });
    let me = self.clone();
    let mut changes = self.inner.distributor.subscribe();
    self.inner.sup.spawn(token, async move {
      while changes.changed().await.is_ok() {
        sleep(me.inner.config.immediate_debounce).await;
        changes.borrow_and_update();
        me.push_now();
      }
    });
  }

  pub fn stop(&self) {
    self.inner.life.end();
  }

  fn state(&self) -> FullState {
    FullState { leader_id: self.inner.bus.node_id().to_string(), table: self.inner.distributor.table() }
  }

  /// Broadcasts the full table. Only the active coordinator pushes; elsewhere returns false.
  pub fn push_full(&self) -> bool {
    if !self.inner.role.is(Role::Active) {
      return false;
    }
    let state = self.state();
    trace!(LOG_LEVEL, "pushing {} tasks", state.table.tasks.len());
    self.inner.bus.send(BusMsg::DataSync(state));
    self.inner.pushed.fetch_add(1, Ordering::Relaxed);
    true
  }

  /// Immediate push after a mutation.
  pub fn push_now(&self) -> bool {
    if !self.inner.role.is(Role::Active) {
      return false;
    }
    self.inner.bus.send(BusMsg::SyncNow(self.state()));
    self.inner.pushed.fetch_add(1, Ordering::Relaxed);
    true
  }

  /// Asks the active coordinator for a push. Only standbys ask.
  pub fn pull_on_demand(&self) -> bool {
    if self.inner.role.is(Role::Active) {
      return false;
    }
    self.inner.bus.send(BusMsg::DataSyncRequest(SyncRequest {
      requester_id: self.inner.bus.node_id().to_string(),
    }));
    self.inner.pulled.fetch_add(1, Ordering::Relaxed);
    true
  }

  /// Accepts a pushed table on a standby. Invalid tables are rejected and the previous replica
  /// is kept. A standby only takes tables from the leader it follows, so a former primary cannot
  /// overwrite the replica. While this node is being promoted the table also goes straight into
  /// the distributor.
  pub fn on_full_state(&self, sender: &str, state: FullState) -> bool {
    let role = self.inner.role.get();
    if role == Role::Active {
      debug!(LOG_LEVEL, "ignoring state from {} while active", sender);
      return false;
    }
    if state.leader_id != sender || (role == Role::Standby && !self.inner.leader.is(sender)) {
      self.inner.stale.fetch_add(1, Ordering::Relaxed);
      debug!(
        LOG_LEVEL,
        "ignoring state from {} (claims {}), following {}",
        sender,
        state.leader_id,
        self.inner.leader.get()
      );
      return false;
    }
    if let Err(e) = state.table.validate() {
      self.inner.rejected.fetch_add(1, Ordering::Relaxed);
      warn!(LOG_LEVEL, "data integrity: state from {} rejected, keeping previous replica: {}", sender, e);
      return false;
    }
    if let Err(e) = self.inner.replica.save(&state.table) {
      warn!(LOG_LEVEL, "cannot write replica {}: {}", self.inner.replica.path().display(), e);
    }
    let count = state.table.tasks.len();
    *self.inner.latest.write() = Some(state.table.clone());
    self.inner.accepted.fetch_add(1, Ordering::Relaxed);
    debug!(LOG_LEVEL, "replica updated from {}: {} tasks", sender, count);
    if role == Role::Electing {
      info!(LOG_LEVEL, "loading replica from {} during promotion", sender);
      self.inner.distributor.load(state.table);
    }
    true
  }

  /// The last accepted table, from memory or else from the replica file.
  pub fn latest_replica(&self) -> Result<TaskTable, TaskmeshError> {
    if let Some(table) = self.inner.latest.read().clone() {
      return Ok(table);
    }
    if !self.inner.replica.exists() {
      return Err(TaskmeshError::MissingReplica);
    }
    let table = self.inner.replica.load()?;
    table.validate()?;
    Ok(table)
  }

  pub fn stats(&self) -> ReplicationStats {
    ReplicationStats {
      pushed: self.inner.pushed.load(Ordering::Relaxed),
      pulled: self.inner.pulled.load(Ordering::Relaxed),
      accepted: self.inner.accepted.load(Ordering::Relaxed),
      rejected: self.inner.rejected.load(Ordering::Relaxed),
      stale: self.inner.stale.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
use crate::core::LogicalClock;
#[cfg(test)]
use crate::testkit::LocalHub;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn standby(dir: &std::path::Path) -> (StateReplicator, Arc<WorkDistributor>, RoleCell) {
  let clock = Arc::new(LogicalClock::new());
  let sup = Supervisor::new();
  let bus = GroupBus::new("b", clock.clone(), LocalHub::new().transport("b"), sup.clone(), Duration::from_secs(30), 65507);
  let dist = Arc::new(WorkDistributor::new(clock, "p"));
  let role = RoleCell::new(Role::Standby);
  let cfg = ReplicationConfig { replica_file: dir.join("tarefas_backup.json"), ..ReplicationConfig::default() };
  (StateReplicator::new(bus, role.clone(), LeaderCell::new("p"), dist.clone(), cfg, sup), dist, role)
}

#[cfg(test)]
fn table_with(titles: &[&str]) -> TaskTable {
  let source = WorkDistributor::new(Arc::new(LogicalClock::new()), "p");
  for t in titles {
    source.submit(*t, "");
  }
  source.table()
}

#[test]
fn test_invalid_state_keeps_previous_replica() {
  let dir = tempfile::tempdir().unwrap();
  let (repl, dist, _) = standby(dir.path());
  assert!(matches!(repl.latest_replica(), Err(TaskmeshError::MissingReplica)));

  let good = table_with(&["A", "B"]);
  assert!(repl.on_full_state("p", FullState { leader_id: "p".to_string(), table: good.clone() }));
  assert_eq!(repl.latest_replica().unwrap(), good);

  let mut bad = table_with(&["C"]);
  bad.tasks[0].title.clear();
  assert!(!repl.on_full_state("p", FullState { leader_id: "p".to_string(), table: bad }));
  assert_eq!(repl.latest_replica().unwrap(), good);
  assert_eq!(TaskStore::new(dir.path().join("tarefas_backup.json")).load().unwrap(), good);
  assert_eq!(repl.stats().rejected, 1);
  assert_eq!(repl.stats().accepted, 1);
  // a standby only stores the replica
  assert!(dist.tasks().is_empty());
}

#[test]
fn test_replica_survives_restart_and_loads_while_electing() {
  let dir = tempfile::tempdir().unwrap();
  let good = table_with(&["A"]);
  {
    let (repl, _, _) = standby(dir.path());
    repl.on_full_state("p", FullState { leader_id: "p".to_string(), table: good.clone() });
  }
  let (repl, dist, role) = standby(dir.path());
  assert_eq!(repl.latest_replica().unwrap(), good);

  assert!(role.transition(Role::Standby, Role::Electing));
  let newer = table_with(&["A", "B"]);
  assert!(repl.on_full_state("p", FullState { leader_id: "p".to_string(), table: newer }));
  assert_eq!(dist.tasks().len(), 2);
}

#[tokio::test]
async fn test_push_and_pull_respect_role() {
  let dir = tempfile::tempdir().unwrap();
  let (repl, _, role) = standby(dir.path());
  assert!(!repl.push_full());
  assert!(repl.pull_on_demand());
  assert!(role.transition(Role::Standby, Role::Electing));
  assert!(role.transition(Role::Electing, Role::Active));
  assert!(repl.push_full());
  assert!(repl.push_now());
  assert!(!repl.pull_on_demand());
  assert!(!repl.on_full_state("x", FullState { leader_id: "x".to_string(), table: table_with(&["A"]) }));
  assert_eq!(repl.stats(), ReplicationStats { pushed: 2, pulled: 1, accepted: 0, rejected: 0, stale: 0 });
}

#[test]
fn test_standby_ignores_state_from_former_leader() {
  let dir = tempfile::tempdir().unwrap();
  let (repl, _, _) = standby(dir.path());
  let good = table_with(&["A"]);
  assert!(repl.on_full_state("p", FullState { leader_id: "p".to_string(), table: good.clone() }));

  let old = table_with(&["X", "Y"]);
  assert!(!repl.on_full_state("old", FullState { leader_id: "old".to_string(), table: old.clone() }));
  assert!(!repl.on_full_state("old", FullState { leader_id: "p".to_string(), table: old }));
  assert_eq!(repl.latest_replica().unwrap(), good);
  assert_eq!(repl.stats().stale, 2);
  assert_eq!(repl.stats().rejected, 0);
}
