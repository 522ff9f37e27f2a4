use std::time::Duration;
use taskmesh::cluster::Role;
use taskmesh::config::NodeRole;
use taskmesh::testkit::{fast_config, wait_until, FailureConfigMap, LocalHub};
use taskmesh::{Orchestrator, TaskmeshError};

const PRIMARY: &str = "orchestrator-principal";
const BACKUP: &str = "orchestrator-backup-1";

async fn pair(dir: &std::path::Path, hub: &std::sync::Arc<LocalHub>) -> (Orchestrator, Orchestrator) {
  let primary = Orchestrator::new(fast_config(dir, PRIMARY, NodeRole::Primary), hub.transport(PRIMARY));
  let backup = Orchestrator::new(fast_config(dir, BACKUP, NodeRole::Backup), hub.transport(BACKUP));
  primary.start().await.unwrap();
  backup.start().await.unwrap();
  (primary, backup)
}

#[tokio::test(start_paused = true)]
async fn backup_takes_over_with_replicated_tasks() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let (primary, backup) = pair(dir.path(), &hub).await;

  let a = primary.submit("A", "first").unwrap();
  let b = primary.submit("B", "second").unwrap();
  assert!(
    wait_until(Duration::from_secs(2), || {
      backup.replicator().latest_replica().map(|t| t.tasks.len() == 2).unwrap_or(false)
    })
    .await
  );
  // heartbeats are answered while the primary is up
  tokio::time::sleep(Duration::from_secs(2)).await;
  assert_eq!(backup.role(), Role::Standby);
  assert!(backup.primary_detector().stats().received > 0);

  primary.shutdown().await;
  assert!(wait_until(Duration::from_secs(5), || backup.is_active()).await);
  assert!(wait_until(Duration::from_secs(1), || backup.worker_addr().is_some()).await);

  let ids = backup.tasks().into_iter().map(|t| t.id).collect::<Vec<_>>();
  assert!(ids.contains(&a.id) && ids.contains(&b.id));
  let stats = backup.stats();
  assert_eq!(stats.leader_id, BACKUP);
  assert_eq!(stats.leadership.elections_won, 1);
  assert!(stats.leadership.failed_steps.is_empty());
  assert!(backup.primary_detector().peers().is_empty());

  let c = backup.submit("C", "").unwrap();
  assert!(backup.tasks().iter().any(|t| t.id == c.id));
  backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn active_leader_reasserts_against_a_candidate() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let (primary, backup) = pair(dir.path(), &hub).await;

  assert!(backup.leadership().trigger_election());
  assert!(!backup.leadership().trigger_election());
  assert!(wait_until(Duration::from_secs(2), || backup.role() == Role::Standby).await);
  tokio::time::sleep(Duration::from_secs(1)).await;

  assert!(primary.is_active());
  assert_eq!(backup.role(), Role::Standby);
  assert_eq!(backup.leader_id(), PRIMARY);
  assert_eq!(backup.stats().leadership.elections_lost, 1);
  assert!(matches!(backup.submit("X", ""), Err(TaskmeshError::NotLeader { .. })));
  primary.shutdown().await;
  backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn healed_partition_leaves_two_leaders_until_demoted() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let (primary, backup) = pair(dir.path(), &hub).await;

  let mut partition = FailureConfigMap::default();
  partition.isolate(PRIMARY);
  hub.set_failures(partition);
  assert!(wait_until(Duration::from_secs(5), || backup.is_active()).await);

  hub.set_failures(FailureConfigMap::default());
  assert!(
    wait_until(Duration::from_secs(2), || {
      primary.stats().leadership.duplicate_leaders > 0 && backup.stats().leadership.duplicate_leaders > 0
    })
    .await
  );
  assert!(primary.is_active() && backup.is_active());
  // seen once per peer, not once per presence beat
  tokio::time::sleep(Duration::from_secs(1)).await;
  assert_eq!(primary.stats().leadership.duplicate_leaders, 1);

  let endpoint = "127.0.0.1:8080".parse().unwrap();
  assert!(primary.demote(Some(BACKUP), Some(&endpoint)).await);
  assert!(!primary.demote(Some(BACKUP), Some(&endpoint)).await);
  assert_eq!(primary.role(), Role::Standby);
  assert_eq!(primary.leader_id(), BACKUP);
  assert!(primary.worker_addr().is_none());
  assert_eq!(primary.primary_detector().peers(), vec![BACKUP.to_string()]);
  assert!(matches!(primary.submit("X", ""), Err(TaskmeshError::NotLeader { .. })));

  primary.shutdown().await;
  backup.shutdown().await;
}
