use crate::cluster::{
  millis, DetectorConfig, ElectionConfig, FileSyncConfig, ReplicationConfig, SnapshotConfig,
};
use crate::core::{Socket, MAX_UDP_PAYLOAD};
use crate::error::TaskmeshError;
use crate::tasks::DEFAULT_LEADER;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

/// How a node comes up. Either may end up active after failover.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
  Primary,
  Backup,
}
impl Default for NodeRole {
  fn default() -> Self {
    NodeRole::Primary
  }
}

/// The coordinator group bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
  /// Multicast rendezvous shared by every coordinator.
  ///
  /// default: `224.0.0.1:4446`
  pub group: Socket,
  /// default: `0.0.0.0`
  pub interface: Ipv4Addr,
  /// Larger datagrams are not sent.
  ///
  /// default: `65507`
  pub max_datagram: usize,
  /// Period of `SIMPLE_HEARTBEAT` presence broadcasts.
  ///
  /// default: `10 seconds`
  #[serde(with = "millis")]
  pub presence_interval: Duration,
  /// A peer not heard from in this long is no longer listed as live.
  ///
  /// default: `30 seconds`
  #[serde(with = "millis")]
  pub peer_ttl: Duration,
}
impl Default for BusConfig {
  fn default() -> Self {
    BusConfig {
      group: Socket::ip(Ipv4Addr::new(224, 0, 0, 1), 4446),
      interface: Ipv4Addr::UNSPECIFIED,
      max_datagram: MAX_UDP_PAYLOAD,
      presence_interval: Duration::from_secs(10),
      peer_ttl: Duration::from_secs(30),
    }
  }
}
impl BusConfig {
  pub fn group_v4(&self) -> Result<SocketAddrV4, TaskmeshError> {
    self.group.multicast_v4().map(|ip| SocketAddrV4::new(ip, self.group.port)).ok_or_else(|| {
      TaskmeshError::Config {
        path: PathBuf::new(),
        reason: format!("bus group {} is not an IPv4 multicast address", self.group),
      }
    })
  }
}

/// The worker-facing surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// default: `0.0.0.0:8080`
  pub listen: SocketAddr,
  /// Endpoint announced to workers and peers when this node becomes leader.
  ///
  /// default: `127.0.0.1:8080`
  pub advertise: Socket,
}
impl Default for WorkerConfig {
  fn default() -> Self {
    WorkerConfig {
      listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
      advertise: Socket::ip(Ipv4Addr::LOCALHOST, 8080),
    }
  }
}

/// Everything an orchestrator node reads at startup. Every field is optional in the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OrchestratorConfig {
  /// default: `orchestrator-principal`
  #[validate(length(min = 1))]
  pub node_id: String,
  pub role: NodeRole,
  /// The leader a backup watches until it hears otherwise.
  ///
  /// default: `orchestrator-principal`
  #[validate(length(min = 1))]
  pub primary_id: String,
  /// Ballot priority; lower wins. Derived from the node id when absent.
  pub priority: Option<u64>,
  pub bus: BusConfig,
  pub workers: WorkerConfig,
  pub worker_detector: DetectorConfig,
  /// default: see [`DetectorConfig::coordinator`]
  pub primary_detector: DetectorConfig,
  pub election: ElectionConfig,
  pub replication: ReplicationConfig,
  pub snapshot: SnapshotConfig,
  /// Mirroring of the task file to standbys.
  pub file_sync: FileSyncConfig,
  /// default: `tarefas.json`
  pub task_file: PathBuf,
  /// Bound on waiting for background tasks at shutdown.
  ///
  /// default: `5 seconds`
  #[serde(with = "millis")]
  pub shutdown_timeout: Duration,
}
impl Default for OrchestratorConfig {
  fn default() -> Self {
    OrchestratorConfig {
      node_id: DEFAULT_LEADER.to_string(),
      role: NodeRole::Primary,
      primary_id: DEFAULT_LEADER.to_string(),
      priority: None,
      bus: BusConfig::default(),
      workers: WorkerConfig::default(),
      worker_detector: DetectorConfig::default(),
      primary_detector: DetectorConfig::coordinator(),
      election: ElectionConfig::default(),
      replication: ReplicationConfig::default(),
      snapshot: SnapshotConfig::default(),
      file_sync: FileSyncConfig::default(),
      task_file: PathBuf::from("tarefas.json"),
      shutdown_timeout: Duration::from_secs(5),
    }
  }
}
impl OrchestratorConfig {
  /// Reads a JSON config file. Missing fields take their defaults.
  pub fn from_file(path: impl AsRef<Path>) -> Result<OrchestratorConfig, TaskmeshError> {
    let path = path.as_ref();
    let fail = |reason: String| TaskmeshError::Config { path: path.to_path_buf(), reason };
    let text = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    let config: OrchestratorConfig = serde_json::from_str(&text).map_err(|e| fail(e.to_string()))?;
    config.validate().map_err(|e| fail(e.to_string()))?;
    let detectors = [("worker_detector", &config.worker_detector), ("primary_detector", &config.primary_detector)];
    for (name, det) in detectors.iter() {
      if det.timeout <= det.interval {
        return Err(fail(format!("{}: timeout must exceed interval", name)));
      }
    }
    Ok(config)
  }

  /// A backup with this id, watching the default primary.
  pub fn backup(node_id: impl Into<String>) -> OrchestratorConfig {
    OrchestratorConfig { node_id: node_id.into(), role: NodeRole::Backup, ..Default::default() }
  }
}

#[cfg(test)]
use std::io::Write;
#[cfg(test)]
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_defaults() {
  let cfg = OrchestratorConfig::default();
  assert_eq!(cfg.bus.group.to_string(), "224.0.0.1:4446");
  assert_eq!(cfg.bus.group_v4().unwrap().port(), 4446);
  assert_eq!(cfg.workers.listen.port(), 8080);
  assert_eq!(cfg.primary_detector.initial_delay, Duration::from_secs(30));
  assert_eq!(cfg.task_file, PathBuf::from("tarefas.json"));
  assert_eq!(OrchestratorConfig::backup("b-1").role, NodeRole::Backup);
}

#[test]
fn test_from_file_partial() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  write!(
    file,
    r#"{{"node_id": "orchestrator-backup-5", "role": "Backup", "bus": {{"group": "239.1.2.3:5000"}},
       "election": {{"settle_window": 500}}, "shutdown_timeout": 1000}}"#
  )
  .unwrap();
  let cfg = assert_ok!(OrchestratorConfig::from_file(file.path()));
  assert_eq!(cfg.node_id, "orchestrator-backup-5");
  assert_eq!(cfg.role, NodeRole::Backup);
  assert_eq!(cfg.bus.group_v4().unwrap(), "239.1.2.3:5000".parse().unwrap());
  assert_eq!(cfg.bus.peer_ttl, Duration::from_secs(30));
  assert_eq!(cfg.election.settle_window, Duration::from_millis(500));
  assert_eq!(cfg.election.announce_delay, Duration::from_secs(2));
  assert_eq!(cfg.shutdown_timeout, Duration::from_secs(1));
}

#[test]
fn test_from_file_rejects_bad_input() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  write!(file, r#"{{"node_id": ""}}"#).unwrap();
  assert!(matches!(OrchestratorConfig::from_file(file.path()), Err(TaskmeshError::Config { .. })));

  let mut file = tempfile::NamedTempFile::new().unwrap();
  write!(file, r#"{{"worker_detector": {{"interval": 5000, "timeout": 5000}}}}"#).unwrap();
  assert_err!(OrchestratorConfig::from_file(file.path()));

  assert_err!(OrchestratorConfig::from_file("/nonexistent/taskmesh.json"));
  let unicast = BusConfig { group: "10.0.0.1:4446".parse().unwrap(), ..Default::default() };
  assert_err!(unicast.group_v4());
}
