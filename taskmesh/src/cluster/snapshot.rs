use crate::cluster::{Role, RoleCell, SnapshotConfig};
use crate::core::{BusMsg, Envelope, GroupBus, Lifecycle, MsgKind, SnapshotMarker, Supervisor};
use crate::error::TaskmeshError;
use crate::tasks::{TaskStats, WorkDistributor};
use crate::testkit::LogLevel;
use crate::{debug, info, trace, warn};
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::sleep;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;
const RECENT_SNAPSHOTS: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalState {
  #[serde(rename = "nodeId")]
  pub node_id: String,
  #[serde(rename = "lamportClock")]
  pub lamport: u64,
  pub status: Role,
  pub timestamp: NaiveDateTime,
  #[serde(rename = "snapshotId")]
  pub snapshot_id: String,
  pub tasks: TaskStats,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordedMessage {
  #[serde(rename = "remetenteId")]
  pub sender_id: String,
  pub tipo: String,
  #[serde(rename = "timestampLamport")]
  pub lamport: u64,
  pub dados: Value,
}
impl From<&Envelope> for RecordedMessage {
  fn from(env: &Envelope) -> Self {
    RecordedMessage {
      sender_id: env.sender_id.clone(),
      tipo: env.msg.kind().wire_name().to_string(),
      lamport: env.lamport,
      dados: env.msg.payload().unwrap_or(Value::Null),
    }
  }
}

/// What one node contributes to a global snapshot: its own state at the cut plus the messages
/// that were in flight toward it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SnapshotRecord {
  #[serde(rename = "snapshotId")]
  pub snapshot_id: String,
  pub initiator: String,
  #[serde(rename = "localState")]
  pub local_state: LocalState,
  #[serde(rename = "recordedChannelMessages")]
  pub channel_messages: BTreeMap<String, Vec<RecordedMessage>>,
  #[serde(rename = "participantSet")]
  pub participants: BTreeSet<String>,
  #[serde(rename = "incompleteChannels")]
  pub incomplete_channels: BTreeSet<String>,
  #[serde(rename = "completedAt")]
  pub completed_at: NaiveDateTime,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
  pub in_flight: Option<String>,
  pub completed: u64,
  pub incomplete: u64,
  pub last_snapshot: Option<String>,
  pub last_file: Option<PathBuf>,
}

struct InFlight {
  id: String,
  initiator: String,
  local_state: LocalState,
  participants: BTreeSet<String>,
  open: BTreeSet<String>,
  recorded: BTreeMap<String, Vec<RecordedMessage>>,
}

/// Chandy-Lamport snapshots over the group bus. At most one snapshot is in flight per node.
///
/// Markers and channel recording both run on the bus observer path, so a channel closes in the
/// order its messages were received.
#[derive(Clone)]
pub struct SnapshotCoordinator {
  inner: Arc<SnapInner>,
}

struct SnapInner {
  bus: GroupBus,
  role: RoleCell,
  distributor: Arc<WorkDistributor>,
  config: SnapshotConfig,
  sup: Supervisor,
  life: Lifecycle,
  current: Mutex<Option<InFlight>>,
  recent: Mutex<VecDeque<String>>,
  seq: AtomicU64,
  completed: AtomicU64,
  incomplete: AtomicU64,
  last_file: Mutex<Option<PathBuf>>,
}

impl SnapshotCoordinator {
  pub fn new(
    bus: GroupBus,
    role: RoleCell,
    distributor: Arc<WorkDistributor>,
    config: SnapshotConfig,
    sup: Supervisor,
  ) -> SnapshotCoordinator {
    SnapshotCoordinator {
      inner: Arc::new(SnapInner {
        bus,
        role,
        distributor,
        config,
        sup,
        life: Lifecycle::default(),
        current: Mutex::new(None),
        recent: Mutex::new(VecDeque::new()),
        seq: AtomicU64::new(0),
        completed: AtomicU64::new(0),
        incomplete: AtomicU64::new(0),
        last_file: Mutex::new(None),
      }),
    }
  }

  pub fn install(&self) {
    let me = self.clone();
    self.inner.bus.add_observer(move |env| me.observe(env));
    // markers are consumed by the observer above
    self.inner.bus.on_message(MsgKind::Marker, |_| {});
  }

  pub fn start(&self) {
    if self.inner.life.begin(&self.inner.sup).is_some() {
      debug!(LOG_LEVEL, "snapshot coordinator started");
    }
  }

  /// Stops the coordinator and discards any snapshot in flight. Idempotent.
  pub fn stop(&self) {
    if self.inner.life.end() {
      if let Some(snap) = self.inner.current.lock().take() {
        info!(LOG_LEVEL, "snapshot {} abandoned on stop", snap.id);
      }
    }
  }

  pub fn in_flight(&self) -> Option<String> {
    self.inner.current.lock().as_ref().map(|s| s.id.clone())
  }

  /// Starts a global snapshot. Only the active coordinator initiates; returns false otherwise or
  /// when a snapshot is already in flight.
  pub fn initiate(&self) -> bool {
    if !self.inner.life.running() {
      debug!(LOG_LEVEL, "snapshot coordinator not running");
      return false;
    }
    if !self.inner.role.is(Role::Active) {
      debug!(LOG_LEVEL, "only the active coordinator initiates snapshots");
      return false;
    }
    let me = self.inner.bus.node_id().to_string();
    let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
    let id = format!("{}-{}", me, seq);
    if !self.begin(&id, &me, None) {
      return false;
    }
    info!(LOG_LEVEL, "snapshot {} initiated", id);
    self.inner.bus.send(BusMsg::Marker(SnapshotMarker {
      snapshot_id: id.clone(),
      origin: me,
      timestamp: Utc::now().timestamp_millis(),
    }));
    self.finalize_if_closed(&id);
    true
  }

  fn observe(&self, env: &Envelope) {
    match &env.msg {
      BusMsg::Marker(marker) => self.on_marker(&env.sender_id, marker),
      _ => self.record(env),
    }
  }

  fn record(&self, env: &Envelope) {
    let mut current = self.inner.current.lock();
    if let Some(snap) = current.as_mut() {
      if snap.open.contains(&env.sender_id) {
        trace!(LOG_LEVEL, "recording {} from {}", env.msg.kind().wire_name(), env.sender_id);
        snap.recorded.entry(env.sender_id.clone()).or_default().push(env.into());
      }
    }
  }

  /// Handles a marker received from `sender`. The first marker of a snapshot records local state,
  /// closes the sender's channel and relays the marker; later ones close their channel.
  pub fn on_marker(&self, sender: &str, marker: &SnapshotMarker) {
    if !self.inner.life.running() {
      return;
    }
    let id = &marker.snapshot_id;
    if self.inner.recent.lock().iter().any(|done| done == id) {
      trace!(LOG_LEVEL, "late marker for finished snapshot {} from {}", id, sender);
      return;
    }
    let current_id = self.in_flight();
    match current_id {
      Some(current) if &current == id => {
        {
          let mut guard = self.inner.current.lock();
          if let Some(snap) = guard.as_mut() {
            snap.participants.insert(sender.to_string());
            snap.open.remove(sender);
            debug!(LOG_LEVEL, "snapshot {}: channel from {} closed, {} open", id, sender, snap.open.len());
          }
        }
        self.finalize_if_closed(id);
      }
      Some(current) => {
        warn!(LOG_LEVEL, "marker for {} from {} ignored while {} is in flight", id, sender, current);
      }
      None => {
        if !self.begin(id, &marker.origin, Some(sender)) {
          return;
        }
        debug!(LOG_LEVEL, "snapshot {} joined on marker from {}", id, sender);
        self.inner.bus.send(BusMsg::Marker(marker.clone()));
        self.finalize_if_closed(id);
      }
    }
  }

  fn begin(&self, id: &str, initiator: &str, first_sender: Option<&str>) -> bool {
    let token = match self.inner.life.current() {
      Some(token) => token,
      None => return false,
    };
    let me = self.inner.bus.node_id();
    let local_state = LocalState {
      node_id: me.to_string(),
      lamport: self.inner.bus.clock().peek(),
      status: self.inner.role.get(),
      timestamp: Utc::now().naive_utc(),
      snapshot_id: id.to_string(),
      tasks: self.inner.distributor.stats(),
    };
    let mut participants = self.inner.bus.live_peers();
    participants.insert(initiator.to_string());
    participants.extend(first_sender.map(str::to_string));
    participants.remove(me);
    let mut open = participants.clone();
    if let Some(sender) = first_sender {
      open.remove(sender);
    }
    {
      let mut current = self.inner.current.lock();
      if current.is_some() {
        return false;
      }
      *current = Some(InFlight {
        id: id.to_string(),
        initiator: initiator.to_string(),
        local_state,
        participants,
        open,
        recorded: BTreeMap::new(),
      });
    }
    let me = self.clone();
    let id = id.to_string();
    let timeout = self.inner.config.finalize_timeout;
    self.inner.sup.spawn(token, async move {
      sleep(timeout).await;
      if me.in_flight().as_deref() == Some(id.as_str()) {
        warn!(LOG_LEVEL, "snapshot {} timed out with channels still open", id);
        me.force_finalize();
      }
    });
    true
  }

  fn finalize_if_closed(&self, id: &str) {
    let done = {
      let mut current = self.inner.current.lock();
      match current.as_ref() {
        Some(snap) if snap.id == id && snap.open.is_empty() => current.take(),
        _ => None,
      }
    };
    if let Some(snap) = done {
      self.finish(snap);
    }
  }

  /// Finalizes the snapshot in flight now, listing channels still open as incomplete.
  pub fn force_finalize(&self) -> Option<PathBuf> {
    let snap = self.inner.current.lock().take()?;
    self.finish(snap)
  }

  fn finish(&self, snap: InFlight) -> Option<PathBuf> {
    {
      let mut recent = self.inner.recent.lock();
      recent.push_back(snap.id.clone());
      while recent.len() > RECENT_SNAPSHOTS {
        recent.pop_front();
      }
    }
    if !snap.open.is_empty() {
      self.inner.incomplete.fetch_add(1, Ordering::Relaxed);
    }
    let record = SnapshotRecord {
      snapshot_id: snap.id,
      initiator: snap.initiator,
      local_state: snap.local_state,
      channel_messages: snap.recorded,
      participants: snap.participants,
      incomplete_channels: snap.open,
      completed_at: Utc::now().naive_utc(),
    };
    match self.write(&record) {
      Ok(path) => {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        info!(
          LOG_LEVEL,
          "snapshot {} saved to {} ({} incomplete channels)",
          record.snapshot_id,
          path.display(),
          record.incomplete_channels.len()
        );
        *self.inner.last_file.lock() = Some(path.clone());
        Some(path)
      }
      Err(e) => {
        warn!(LOG_LEVEL, "cannot save snapshot {}: {}", record.snapshot_id, e);
        None
      }
    }
  }

  fn write(&self, record: &SnapshotRecord) -> Result<PathBuf, TaskmeshError> {
    fs::create_dir_all(&self.inner.config.dir)?;
    let name = format!(
      "snapshot_{}_{}_{}.json",
      self.inner.bus.node_id(),
      record.snapshot_id,
      record.completed_at.format("%Y%m%d_%H%M%S")
    );
    let path = self.inner.config.dir.join(name);
    fs::write(&path, serde_json::to_vec_pretty(record)?)?;
    Ok(path)
  }

  pub fn stats(&self) -> SnapshotStats {
    SnapshotStats {
      in_flight: self.in_flight(),
      completed: self.inner.completed.load(Ordering::Relaxed),
      incomplete: self.inner.incomplete.load(Ordering::Relaxed),
      last_snapshot: self.inner.recent.lock().back().cloned(),
      last_file: self.inner.last_file.lock().clone(),
    }
  }
}

#[cfg(test)]
use crate::core::{LogicalClock, Presence};
#[cfg(test)]
use crate::testkit::LocalHub;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn coordinator(dir: &std::path::Path, role: Role) -> (SnapshotCoordinator, GroupBus) {
  let clock = Arc::new(LogicalClock::new());
  let sup = Supervisor::new();
  let bus = GroupBus::new("a", clock.clone(), LocalHub::new().transport("a"), sup.clone(), Duration::from_secs(30), 65507);
  let dist = Arc::new(WorkDistributor::new(clock, "a"));
  let cfg = SnapshotConfig { dir: dir.to_path_buf(), finalize_timeout: Duration::from_secs(10) };
  let snaps = SnapshotCoordinator::new(bus.clone(), RoleCell::new(role), dist, cfg, sup);
  snaps.install();
  snaps.start();
  (snaps, bus)
}

#[cfg(test)]
fn datagram(from: &str, msg: BusMsg) -> Vec<u8> {
  Envelope { sender_id: from.to_string(), msg, lamport: 1, wall_millis: 0 }.encode().unwrap()
}

#[cfg(test)]
fn presence(from: &str) -> Vec<u8> {
  datagram(from, BusMsg::Presence(Presence { role: Role::Standby, known_leader: "a".to_string() }))
}

#[cfg(test)]
fn marker(id: &str, origin: &str) -> SnapshotMarker {
  SnapshotMarker { snapshot_id: id.to_string(), origin: origin.to_string(), timestamp: 0 }
}

#[tokio::test]
async fn test_initiate_records_until_every_channel_closes() {
  let dir = tempfile::tempdir().unwrap();
  let (snaps, bus) = coordinator(dir.path(), Role::Active);
  bus.inject(&presence("b"));
  bus.inject(&presence("c"));

  assert!(snaps.initiate());
  assert!(!snaps.initiate());
  let id = snaps.in_flight().unwrap();
  assert_eq!(id, "a-1");

  bus.inject(&presence("b"));
  bus.inject(&datagram("b", BusMsg::Marker(marker(&id, "a"))));
  // b's channel is closed now, only c is still recorded
  bus.inject(&presence("b"));
  bus.inject(&presence("c"));
  assert_eq!(snaps.in_flight(), Some(id.clone()));
  bus.inject(&datagram("c", BusMsg::Marker(marker(&id, "a"))));
  assert_eq!(snaps.in_flight(), None);

  let stats = snaps.stats();
  assert_eq!(stats.completed, 1);
  assert_eq!(stats.incomplete, 0);
  let path = stats.last_file.unwrap();
  let name = path.file_name().unwrap().to_str().unwrap().to_string();
  assert!(name.starts_with("snapshot_a_a-1_"), "{}", name);
  let saved: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
  assert_eq!(saved["participantSet"], serde_json::json!(["b", "c"]));
  assert_eq!(saved["recordedChannelMessages"]["b"].as_array().unwrap().len(), 1);
  assert_eq!(saved["recordedChannelMessages"]["c"].as_array().unwrap().len(), 1);
  assert_eq!(saved["incompleteChannels"], serde_json::json!([]));
  assert_eq!(saved["localState"]["status"], "ACTIVE");
}

#[tokio::test]
async fn test_standby_cannot_initiate_but_joins_on_marker() {
  let dir = tempfile::tempdir().unwrap();
  let (snaps, bus) = coordinator(dir.path(), Role::Standby);
  assert!(!snaps.initiate());
  // only the origin is known, and its marker closes the only channel
  bus.inject(&datagram("p", BusMsg::Marker(marker("p-7", "p"))));
  assert_eq!(snaps.in_flight(), None);
  assert_eq!(snaps.stats().completed, 1);
  assert_eq!(snaps.stats().last_snapshot.as_deref(), Some("p-7"));
  // a relayed copy of the same marker does not start it over
  bus.inject(&datagram("q", BusMsg::Marker(marker("p-7", "p"))));
  assert_eq!(snaps.in_flight(), None);
  assert_eq!(snaps.stats().completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_lists_open_channels() {
  let dir = tempfile::tempdir().unwrap();
  let (snaps, bus) = coordinator(dir.path(), Role::Active);
  bus.inject(&presence("b"));
  assert!(snaps.initiate());
  sleep(Duration::from_secs(11)).await;
  assert_eq!(snaps.in_flight(), None);
  let stats = snaps.stats();
  assert_eq!(stats.incomplete, 1);
  let saved: Value = serde_json::from_slice(&fs::read(stats.last_file.unwrap()).unwrap()).unwrap();
  assert_eq!(saved["incompleteChannels"], serde_json::json!(["b"]));

  snaps.stop();
  snaps.stop();
  assert!(!snaps.initiate());
}
