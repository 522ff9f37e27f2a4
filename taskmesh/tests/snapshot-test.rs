use std::fs;
use std::time::Duration;
use taskmesh::config::NodeRole;
use taskmesh::testkit::{fast_config, wait_until, LocalHub};
use taskmesh::Orchestrator;

#[tokio::test(start_paused = true)]
async fn snapshot_completes_on_every_node() {
  let dir = tempfile::tempdir().unwrap();
  let hub = LocalHub::new();
  let ids = ["orchestrator-principal", "orchestrator-backup-1", "orchestrator-backup-2"];
  let mut nodes = Vec::new();
  for (i, id) in ids.iter().enumerate() {
    let role = if i == 0 { NodeRole::Primary } else { NodeRole::Backup };
    let node = Orchestrator::new(fast_config(dir.path(), id, role), hub.transport(*id));
    node.start().await.unwrap();
    nodes.push(node);
  }
  assert!(wait_until(Duration::from_secs(2), || nodes.iter().all(|n| n.stats().live_peers.len() == 2)).await);
  nodes[0].submit("A", "").unwrap();

  assert!(!nodes[1].initiate_snapshot());
  assert!(nodes[0].initiate_snapshot());
  assert!(wait_until(Duration::from_secs(2), || nodes.iter().all(|n| n.snapshots().stats().completed == 1)).await);
  for node in &nodes {
    let stats = node.snapshots().stats();
    assert_eq!(stats.incomplete, 0, "{}", node.node_id());
    assert_eq!(stats.last_snapshot.as_deref(), Some("orchestrator-principal-1"));
  }

  let files = fs::read_dir(dir.path().join("snapshots"))
    .unwrap()
    .map(|e| e.unwrap().file_name().into_string().unwrap())
    .collect::<Vec<_>>();
  assert_eq!(files.len(), 3);
  for id in &ids {
    let prefix = format!("snapshot_{}_orchestrator-principal-1_", id);
    assert!(files.iter().any(|f| f.starts_with(&prefix)), "{:?}", files);
  }

  let path = nodes[0].snapshots().stats().last_file.unwrap();
  let record: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
  assert_eq!(record["initiator"], "orchestrator-principal");
  assert_eq!(record["localState"]["tasks"]["total"], 1);
  assert_eq!(
    record["participantSet"],
    serde_json::json!(["orchestrator-backup-1", "orchestrator-backup-2"])
  );

  for node in &nodes {
    node.shutdown().await;
  }
}
