use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Durations in configuration files are plain millisecond counts.
pub mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

/// Configures a [`FailureDetector`](crate::cluster::FailureDetector).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
  /// How often a heartbeat is sent to every monitored peer.
  ///
  /// default: `10 seconds`
  #[serde(with = "millis")]
  pub interval: Duration,
  /// How long a peer may go without answering before it is declared failed. Must exceed
  /// [`interval`](#structfield.interval) or healthy peers will be declared failed.
  ///
  /// default: `45 seconds`
  #[serde(with = "millis")]
  pub timeout: Duration,
  /// How often peers are checked against the timeout.
  ///
  /// default: `10 seconds`
  #[serde(with = "millis")]
  pub scan_interval: Duration,
  /// Delay before the first heartbeat and the first scan after `start`.
  ///
  /// default: `0`
  #[serde(with = "millis")]
  pub initial_delay: Duration,
}
impl Default for DetectorConfig {
  #[inline]
  fn default() -> Self {
    DetectorConfig {
      interval: Duration::from_secs(10),
      timeout: Duration::from_secs(45),
      scan_interval: Duration::from_secs(10),
      initial_delay: Duration::ZERO,
    }
  }
}
impl DetectorConfig {
  /// Standby-to-primary defaults: slower than worker monitoring, with a startup grace.
  pub fn coordinator() -> DetectorConfig {
    DetectorConfig {
      interval: Duration::from_secs(15),
      timeout: Duration::from_secs(60),
      scan_interval: Duration::from_secs(15),
      initial_delay: Duration::from_secs(30),
    }
  }
}

/// Configures a [`LeadershipCoordinator`](crate::cluster::LeadershipCoordinator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
  /// How long a candidate waits for better ballots before promoting itself.
  ///
  /// default: `3 seconds`
  #[serde(with = "millis")]
  pub settle_window: Duration,
  /// Pause between finishing the promotion steps and announcing the new leader, so the worker
  /// listener is accepting by the time anyone is redirected to it.
  ///
  /// default: `2 seconds`
  #[serde(with = "millis")]
  pub announce_delay: Duration,
  /// Delay before the first health check after becoming active.
  ///
  /// default: `30 seconds`
  #[serde(with = "millis")]
  pub health_initial_delay: Duration,
  /// default: `60 seconds`
  #[serde(with = "millis")]
  pub health_interval: Duration,
}
impl Default for ElectionConfig {
  #[inline]
  fn default() -> Self {
    ElectionConfig {
      settle_window: Duration::from_secs(3),
      announce_delay: Duration::from_secs(2),
      health_initial_delay: Duration::from_secs(30),
      health_interval: Duration::from_secs(60),
    }
  }
}

/// Configures a [`StateReplicator`](crate::cluster::StateReplicator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
  /// Full-state push period on the active coordinator.
  ///
  /// default: `2 minutes`
  #[serde(with = "millis")]
  pub push_interval: Duration,
  /// Pull period on standbys.
  ///
  /// default: `2 minutes`
  #[serde(with = "millis")]
  pub pull_interval: Duration,
  /// Coalescing delay between a task mutation and the immediate push it causes.
  ///
  /// default: `100 milliseconds`
  #[serde(with = "millis")]
  pub immediate_debounce: Duration,
  /// Local-only replica file written by standbys. The previous copy is kept as `<file>.bak`.
  ///
  /// default: `tarefas_backup.json`
  pub replica_file: PathBuf,
}
impl Default for ReplicationConfig {
  #[inline]
  fn default() -> Self {
    ReplicationConfig {
      push_interval: Duration::from_secs(120),
      pull_interval: Duration::from_secs(120),
      immediate_debounce: Duration::from_millis(100),
      replica_file: PathBuf::from("tarefas_backup.json"),
    }
  }
}

/// Configures a [`SnapshotCoordinator`](crate::cluster::SnapshotCoordinator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
  /// default: `snapshots`
  pub dir: PathBuf,
  /// A snapshot whose channels have not all closed by then is finalized anyway, with the open
  /// channels listed as incomplete.
  ///
  /// default: `10 seconds`
  #[serde(with = "millis")]
  pub finalize_timeout: Duration,
}
impl Default for SnapshotConfig {
  #[inline]
  fn default() -> Self {
    SnapshotConfig { dir: PathBuf::from("snapshots"), finalize_timeout: Duration::from_secs(10) }
  }
}

/// Configures a [`FileSyncer`](crate::cluster::FileSyncer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSyncConfig {
  /// default: `true`
  pub enabled: bool,
  /// How often the active coordinator looks for changes in its task file.
  ///
  /// default: `1 second`
  #[serde(with = "millis")]
  pub check_interval: Duration,
  /// Wait between noticing a change and reading the file to send it.
  ///
  /// default: `500 milliseconds`
  #[serde(with = "millis")]
  pub settle_delay: Duration,
}
impl Default for FileSyncConfig {
  #[inline]
  fn default() -> Self {
    FileSyncConfig {
      enabled: true,
      check_interval: Duration::from_secs(1),
      settle_delay: Duration::from_millis(500),
    }
  }
}

#[test]
fn test_partial_config_takes_defaults() {
  let cfg: DetectorConfig = serde_json::from_str(r#"{"timeout": 2500}"#).unwrap();
  assert_eq!(cfg.timeout, Duration::from_millis(2500));
  assert_eq!(cfg.interval, DetectorConfig::default().interval);
  let back = serde_json::to_value(&cfg).unwrap();
  assert_eq!(back["timeout"], 2500);
  assert!(DetectorConfig::coordinator().timeout > DetectorConfig::coordinator().interval);
}
