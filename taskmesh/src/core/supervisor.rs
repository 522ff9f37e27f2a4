use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The set of background tasks owned by one node. Every loop and handler invocation is spawned
/// here so shutdown can cancel them through one token and wait for them with a bound.
#[derive(Clone, Default)]
pub struct Supervisor {
  token: CancellationToken,
  tracker: TaskTracker,
}
impl Supervisor {
  pub fn new() -> Supervisor {
    Supervisor::default()
  }

  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Runs `fut` until it finishes or `token` is cancelled.
  pub fn spawn<F>(&self, token: CancellationToken, fut: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.tracker.spawn(async move {
      tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = fut => {}
      }
    });
  }

  /// Runs a short-lived task that only stops early on node shutdown.
  pub fn spawn_detached<F>(&self, fut: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.spawn(self.token.clone(), fut);
  }

  /// Cancels everything and waits at most `timeout` for tasks to unwind. Returns false if some
  /// task was still running when the timeout hit.
  pub async fn shutdown(&self, timeout: Duration) -> bool {
    self.token.cancel();
    self.tracker.close();
    tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
  }
}

/// Start/stop bookkeeping for a restartable component: holds the token of the current run.
#[derive(Default)]
pub struct Lifecycle {
  current: Mutex<Option<CancellationToken>>,
}
impl Lifecycle {
  /// Returns a fresh token if the component was stopped, `None` if it is already running.
  pub fn begin(&self, sup: &Supervisor) -> Option<CancellationToken> {
    let mut current = self.current.lock();
    if current.as_ref().map_or(false, |t| !t.is_cancelled()) {
      return None;
    }
    let token = sup.child_token();
    *current = Some(token.clone());
    Some(token)
  }

  /// Cancels the current run. Idempotent; returns whether anything was running.
  pub fn end(&self) -> bool {
    match self.current.lock().take() {
      Some(token) => {
        let was_running = !token.is_cancelled();
        token.cancel();
        was_running
      }
      None => false,
    }
  }

  pub fn running(&self) -> bool {
    self.current.lock().as_ref().map_or(false, |t| !t.is_cancelled())
  }

  /// The token of the current run, for tasks spawned after `begin`.
  pub fn current(&self) -> Option<CancellationToken> {
    self.current.lock().as_ref().filter(|t| !t.is_cancelled()).cloned()
  }
}

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::Arc;

#[tokio::test]
async fn test_lifecycle_restart_and_idempotent_stop() {
  let sup = Supervisor::new();
  let life = Lifecycle::default();
  let first = life.begin(&sup).unwrap();
  assert!(life.begin(&sup).is_none());
  assert!(life.end());
  assert!(first.is_cancelled());
  assert!(!life.end());
  assert!(!life.running());
  assert!(life.begin(&sup).is_some());
  assert!(life.running());
  assert!(sup.shutdown(Duration::from_secs(1)).await);
  assert!(!life.running());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_loops() {
  let sup = Supervisor::new();
  let ticks = Arc::new(AtomicUsize::new(0));
  let counter = ticks.clone();
  sup.spawn(sup.child_token(), async move {
    let mut interval = tokio::time::interval(Duration::from_millis(10));
    loop {
      interval.tick().await;
      counter.fetch_add(1, Ordering::SeqCst);
    }
  });
  tokio::time::sleep(Duration::from_millis(55)).await;
  assert!(sup.shutdown(Duration::from_secs(1)).await);
  let seen = ticks.load(Ordering::SeqCst);
  assert!(seen >= 5);
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(ticks.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn test_cancelled_token_wins_over_ready_work() {
  let sup = Supervisor::new();
  let ran = Arc::new(AtomicUsize::new(0));
  for _ in 0..20 {
    let token = sup.child_token();
    token.cancel();
    let hits = ran.clone();
    sup.spawn(token, async move {
      hits.fetch_add(1, Ordering::SeqCst);
    });
  }
  assert!(sup.shutdown(Duration::from_secs(1)).await);
  assert_eq!(ran.load(Ordering::SeqCst), 0);
}
