use std::time::Duration;
use taskmesh::cluster::Role;
use taskmesh::config::NodeRole;
use taskmesh::testkit::{fast_config, wait_until, LocalHub};
use taskmesh::Orchestrator;

const PRIMARY: &str = "orchestrator-principal";
const EARLY: &str = "orchestrator-backup-5";
const LATE: &str = "orchestrator-backup-9";

#[tokio::test(start_paused = true)]
async fn lowest_priority_wins_and_the_rest_follow() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let primary = Orchestrator::new(fast_config(dir.path(), PRIMARY, NodeRole::Primary), hub.transport(PRIMARY));
  let early = Orchestrator::new(fast_config(dir.path(), EARLY, NodeRole::Backup), hub.transport(EARLY));
  let late = Orchestrator::new(fast_config(dir.path(), LATE, NodeRole::Backup), hub.transport(LATE));
  primary.start().await.unwrap();
  early.start().await.unwrap();
  late.start().await.unwrap();
  assert_eq!(early.leadership().ballot().priority, 5);
  assert_eq!(late.leadership().ballot().priority, 9);

  let task = primary.submit("A", "").unwrap();
  assert!(
    wait_until(Duration::from_secs(2), || {
      late.replicator().latest_replica().map(|t| t.tasks.len() == 1).unwrap_or(false)
    })
    .await
  );

  primary.shutdown().await;
  assert!(wait_until(Duration::from_secs(5), || early.is_active()).await);
  assert!(wait_until(Duration::from_secs(2), || late.leader_id() == EARLY).await);
  tokio::time::sleep(Duration::from_secs(2)).await;
  assert_eq!(late.role(), Role::Standby);
  assert!(early.is_active());
  assert_eq!(late.primary_detector().peers(), vec![EARLY.to_string()]);
  assert!(early.tasks().iter().any(|t| t.id == task.id));

  // the survivor watches the new leader and takes over from it too
  early.shutdown().await;
  assert!(wait_until(Duration::from_secs(5), || late.is_active()).await);
  assert!(wait_until(Duration::from_secs(1), || late.worker_addr().is_some()).await);
  assert!(late.tasks().iter().any(|t| t.id == task.id));
  late.shutdown().await;
}
