use crate::cluster::DetectorConfig;
use crate::config::{NodeRole, OrchestratorConfig};
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// A config with every timer scaled down to milliseconds and every file under `dir`. The worker
/// listener binds an ephemeral loopback port.
pub fn fast_config(dir: &Path, node_id: &str, role: NodeRole) -> OrchestratorConfig {
  let mut cfg = OrchestratorConfig { node_id: node_id.to_string(), role, ..Default::default() };
  let detector = DetectorConfig {
    interval: Duration::from_millis(100),
    timeout: Duration::from_millis(500),
    scan_interval: Duration::from_millis(100),
    initial_delay: Duration::ZERO,
  };
  cfg.bus.presence_interval = Duration::from_millis(200);
  cfg.bus.peer_ttl = Duration::from_secs(1);
  cfg.workers.listen = ([127, 0, 0, 1], 0).into();
  cfg.worker_detector = detector.clone();
  cfg.primary_detector = detector;
  cfg.election.settle_window = Duration::from_millis(300);
  cfg.election.announce_delay = Duration::from_millis(100);
  cfg.election.health_initial_delay = Duration::from_secs(1);
  cfg.election.health_interval = Duration::from_secs(1);
  cfg.replication.push_interval = Duration::from_secs(2);
  cfg.replication.pull_interval = Duration::from_secs(2);
  cfg.replication.immediate_debounce = Duration::from_millis(10);
  cfg.replication.replica_file = dir.join(format!("{}-tarefas_backup.json", node_id));
  cfg.snapshot.dir = dir.join("snapshots");
  cfg.snapshot.finalize_timeout = Duration::from_secs(1);
  cfg.file_sync.check_interval = Duration::from_millis(100);
  cfg.file_sync.settle_delay = Duration::from_millis(20);
  cfg.task_file = dir.join(format!("{}-tarefas.json", node_id));
  cfg.shutdown_timeout = Duration::from_secs(1);
  cfg
}

/// Polls `cond` every 10ms until it holds or `limit` passes. Returns whether it held.
pub async fn wait_until<F>(limit: Duration, mut cond: F) -> bool
where
  F: FnMut() -> bool,
{
  let deadline = Instant::now() + limit;
  loop {
    if cond() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    sleep(Duration::from_millis(10)).await;
  }
}
