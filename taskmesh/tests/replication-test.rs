use chrono::Utc;
use std::time::Duration;
use taskmesh::config::NodeRole;
use taskmesh::core::{BusMsg, Envelope, FullState};
use taskmesh::testkit::{fast_config, wait_until, LocalHub};
use taskmesh::Orchestrator;

const PRIMARY: &str = "orchestrator-principal";
const BACKUP: &str = "orchestrator-backup-1";

#[tokio::test(start_paused = true)]
async fn late_backup_pulls_current_state() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let primary = Orchestrator::new(fast_config(dir.path(), PRIMARY, NodeRole::Primary), hub.transport(PRIMARY));
  primary.start().await.unwrap();
  for title in &["A", "B", "C"] {
    primary.submit(*title, "").unwrap();
  }

  let backup = Orchestrator::new(fast_config(dir.path(), BACKUP, NodeRole::Backup), hub.transport(BACKUP));
  backup.start().await.unwrap();
  // well before the periodic push
  assert!(
    wait_until(Duration::from_millis(500), || {
      backup.replicator().latest_replica().map(|t| t.tasks.len() == 3).unwrap_or(false)
    })
    .await
  );
  assert!(primary.stats().replication.pushed >= 1);
  assert!(backup.stats().replication.pulled >= 1);
  assert!(dir.path().join("orchestrator-backup-1-tarefas_backup.json").exists());
  primary.shutdown().await;
  backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_push_keeps_previous_replica() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let primary = Orchestrator::new(fast_config(dir.path(), PRIMARY, NodeRole::Primary), hub.transport(PRIMARY));
  let backup = Orchestrator::new(fast_config(dir.path(), BACKUP, NodeRole::Backup), hub.transport(BACKUP));
  primary.start().await.unwrap();
  backup.start().await.unwrap();
  primary.submit("A", "").unwrap();
  assert!(
    wait_until(Duration::from_secs(1), || {
      backup.replicator().latest_replica().map(|t| t.tasks.len() == 1).unwrap_or(false)
    })
    .await
  );
  let good = backup.replicator().latest_replica().unwrap();

  let mut bad = primary.distributor().table();
  bad.tasks[0].id.clear();
  let forged = Envelope {
    sender_id: PRIMARY.to_string(),
    msg: BusMsg::DataSync(FullState { leader_id: PRIMARY.to_string(), table: bad }),
    lamport: primary.clock().peek() + 1,
    wall_millis: Utc::now().timestamp_millis(),
  };
  backup.bus().inject(&forged.encode().unwrap());
  assert!(wait_until(Duration::from_secs(1), || backup.stats().replication.rejected == 1).await);
  // periodic pushes may refresh the table metadata meanwhile
  let kept = backup.replicator().latest_replica().unwrap();
  assert_eq!(kept.tasks, good.tasks);
  assert!(!kept.tasks[0].id.is_empty());

  // a pushed table never reaches the distributor of a standby
  assert!(backup.tasks().is_empty());
  primary.shutdown().await;
  backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn task_file_is_mirrored_to_standbys() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let primary_cfg = fast_config(dir.path(), PRIMARY, NodeRole::Primary);
  let backup_cfg = fast_config(dir.path(), BACKUP, NodeRole::Backup);
  let (primary_file, backup_file) = (primary_cfg.task_file.clone(), backup_cfg.task_file.clone());
  let primary = Orchestrator::new(primary_cfg, hub.transport(PRIMARY));
  let backup = Orchestrator::new(backup_cfg, hub.transport(BACKUP));
  primary.start().await.unwrap();
  backup.start().await.unwrap();

  primary.submit("A", "").unwrap();
  primary.submit("B", "").unwrap();
  assert!(
    wait_until(Duration::from_secs(2), || {
      let sent = std::fs::read(&primary_file).ok();
      sent.is_some() && sent == std::fs::read(&backup_file).ok()
    })
    .await
  );
  assert!(primary.stats().file_sync.sent >= 1);
  assert!(backup.stats().file_sync.received >= 1);
  assert_eq!(backup.stats().file_sync.mismatched, 0);
  primary.shutdown().await;
  backup.shutdown().await;
}
