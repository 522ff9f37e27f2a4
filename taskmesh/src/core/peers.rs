use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// Last time each coordinator was heard from on the bus. Peers silent for longer than the TTL
/// are pruned.
pub struct PeerDirectory {
  ttl: Duration,
  seen: Mutex<im::OrdMap<String, Instant>>,
}
impl PeerDirectory {
  pub fn new(ttl: Duration) -> PeerDirectory {
    PeerDirectory { ttl, seen: Mutex::new(im::OrdMap::new()) }
  }

  pub fn seen(&self, node_id: &str) {
    self.seen.lock().insert(node_id.to_string(), Instant::now());
  }

  pub fn forget(&self, node_id: &str) {
    self.seen.lock().remove(node_id);
  }

  /// Drops every peer not heard from within the TTL and returns them.
  pub fn prune(&self) -> Vec<String> {
    let now = Instant::now();
    let mut seen = self.seen.lock();
    let expired = seen
      .iter()
      .filter(|(_, at)| now.duration_since(**at) > self.ttl)
      .map(|(id, _)| id.clone())
      .collect::<Vec<_>>();
    for id in &expired {
      seen.remove(id);
    }
    expired
  }

  /// Peers heard from within the TTL, sorted.
  pub fn live_peers(&self) -> BTreeSet<String> {
    self.prune();
    self.seen.lock().keys().cloned().collect()
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub fn count(&self) -> usize {
    self.seen.lock().len()
  }
}

#[tokio::test(start_paused = true)]
async fn test_peers_expire_after_ttl() {
  let dir = PeerDirectory::new(Duration::from_secs(30));
  dir.seen("b");
  tokio::time::advance(Duration::from_secs(20)).await;
  dir.seen("a");
  assert_eq!(dir.live_peers(), maplit::btreeset! {"a".to_string(), "b".to_string()});
  tokio::time::advance(Duration::from_secs(15)).await;
  assert_eq!(dir.live_peers(), maplit::btreeset! {"a".to_string()});
  dir.forget("a");
  assert!(dir.live_peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_peers_are_pruned() {
  let dir = PeerDirectory::new(Duration::from_secs(30));
  dir.seen("a");
  dir.seen("b");
  tokio::time::advance(Duration::from_secs(25)).await;
  dir.seen("b");
  assert!(dir.prune().is_empty());
  tokio::time::advance(Duration::from_secs(10)).await;
  assert_eq!(dir.prune(), vec!["a".to_string()]);
  assert_eq!(dir.count(), 1);
  // a pruned peer comes back on its next message
  dir.seen("a");
  assert_eq!(dir.count(), 2);
}
