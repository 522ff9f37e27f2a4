use std::time::Duration;
use taskmesh::config::NodeRole;
use taskmesh::tasks::{TaskStatus, WorkerMsg};
use taskmesh::testkit::{fast_config, wait_until, LocalHub, TestWorker};
use taskmesh::Orchestrator;

const PRIMARY: &str = "orchestrator-principal";
const LIMIT: Duration = Duration::from_secs(5);

async fn primary(dir: &std::path::Path) -> Orchestrator {
  let mut cfg = fast_config(dir, PRIMARY, NodeRole::Primary);
  cfg.worker_detector.timeout = Duration::from_secs(5);
  let node = Orchestrator::new(cfg, LocalHub::new().transport(PRIMARY));
  node.start().await.unwrap();
  node
}

async fn next_task(worker: &mut TestWorker) -> String {
  match worker.next(LIMIT).await {
    Some(WorkerMsg::Assign { tarefa }) => tarefa.title,
    other => panic!("{} expected a task, got {:?}", worker.id(), other),
  }
}

#[tokio::test]
async fn queued_tasks_go_to_the_first_worker_in_order() {
  let dir = tempfile::tempdir().unwrap();
  let node = primary(dir.path()).await;
  let addr = node.worker_addr().unwrap();

  let a = node.submit("A", "").unwrap();
  let b = node.submit("B", "").unwrap();
  assert!(node.tasks().iter().all(|t| t.is_pending() && t.is_unassigned()));

  let mut w1 = TestWorker::connect(addr, "w1").await.unwrap();
  assert_eq!(next_task(&mut w1).await, "A");
  assert_eq!(next_task(&mut w1).await, "B");
  let tasks = node.tasks();
  assert!(tasks.iter().all(|t| t.held_by("w1")));

  w1.complete(&a.id).await.unwrap();
  assert!(wait_until(LIMIT, || node.distributor().task(&a.id).unwrap().status == TaskStatus::Done).await);
  assert_eq!(node.distributor().task(&b.id).unwrap().status, TaskStatus::Pending);

  // completions for ids the node does not track are ignored
  w1.complete("task-0-0").await.unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(node.stats().tasks.done, 1);
  assert_eq!(node.cleanup_done(), 1);
  node.shutdown().await;
}

#[tokio::test]
async fn departing_worker_hands_its_tasks_to_the_others() {
  let dir = tempfile::tempdir().unwrap();
  let node = primary(dir.path()).await;
  let addr = node.worker_addr().unwrap();

  let mut w1 = TestWorker::connect(addr, "w1").await.unwrap();
  assert!(wait_until(LIMIT, || node.stats().workers.len() == 1).await);
  let w2 = TestWorker::connect(addr, "w2").await.unwrap();
  assert!(wait_until(LIMIT, || node.stats().workers.len() == 2).await);

  for title in &["A", "B", "C", "D"] {
    node.submit(*title, "").unwrap();
  }
  assert_eq!(next_task(&mut w1).await, "A");
  assert_eq!(next_task(&mut w1).await, "C");
  assert_eq!(node.stats().tasks.pending_by_worker.get("w2"), Some(&2));

  w2.disconnect().await.unwrap();
  assert!(wait_until(LIMIT, || node.stats().workers == vec!["w1".to_string()]).await);
  let mut moved = vec![next_task(&mut w1).await, next_task(&mut w1).await];
  moved.sort();
  assert_eq!(moved, vec!["B", "D"]);
  let tasks = node.tasks();
  assert!(tasks.iter().all(|t| t.held_by("w1")));
  assert_eq!(tasks.iter().filter(|t| t.reassign_count == 1).count(), 2);
  assert_eq!(node.stats().tasks.reassigned, 2);
  node.shutdown().await;
}

#[tokio::test]
async fn demotion_redirects_connected_workers() {
  let dir = tempfile::tempdir().unwrap();
  let node = primary(dir.path()).await;
  let mut w1 = TestWorker::connect(node.worker_addr().unwrap(), "w1").await.unwrap();
  assert!(wait_until(LIMIT, || node.stats().workers.len() == 1).await);

  let endpoint = "10.0.0.7:9090".parse().unwrap();
  assert!(node.demote(Some("orchestrator-backup-3"), Some(&endpoint)).await);
  match w1.next(LIMIT).await {
    Some(WorkerMsg::LeaderChange { leader_id, host, port }) => {
      assert_eq!(leader_id, "orchestrator-backup-3");
      assert_eq!(host, "10.0.0.7");
      assert_eq!(port, 9090);
    }
    other => panic!("expected a leader change, got {:?}", other),
  }
  assert!(node.worker_addr().is_none());
  assert_eq!(w1.next(Duration::from_secs(1)).await, None);
  node.shutdown().await;
}

#[tokio::test]
async fn repromoted_node_waits_for_fresh_workers() {
  let dir = tempfile::tempdir().unwrap();
  let node = primary(dir.path()).await;
  let mut w1 = TestWorker::connect(node.worker_addr().unwrap(), "w1").await.unwrap();
  assert!(wait_until(LIMIT, || node.stats().workers.len() == 1).await);
  let a = node.submit("A", "").unwrap();
  assert_eq!(next_task(&mut w1).await, "A");

  let endpoint = "10.0.0.7:9090".parse().unwrap();
  assert!(node.demote(Some("orchestrator-backup-3"), Some(&endpoint)).await);
  assert!(node.stats().workers.is_empty());
  let released = node.distributor().task(&a.id).unwrap();
  assert!(released.is_pending() && released.is_unassigned());

  // the named leader never shows up, so the node campaigns again
  node.leadership().trigger_election();
  assert!(wait_until(LIMIT, || node.is_active() && node.worker_addr().is_some()).await);
  let x = node.submit("X", "").unwrap();
  assert_eq!(x.assigned_worker_id, None);
  assert!(node.stats().workers.is_empty());

  let mut w2 = TestWorker::connect(node.worker_addr().unwrap(), "w2").await.unwrap();
  let mut got = vec![next_task(&mut w2).await, next_task(&mut w2).await];
  got.sort();
  assert_eq!(got, vec!["A", "X"]);
  assert!(node.tasks().iter().all(|t| t.held_by("w2")));
  node.shutdown().await;
}
