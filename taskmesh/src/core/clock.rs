use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

/// A per-node Lamport counter.
///
/// All three operations are single atomic instructions on the same word, so they are atomic with
/// respect to each other and the clock can be shared behind an `Arc` without a lock.
#[derive(Debug, Default)]
pub struct LogicalClock {
  counter: AtomicU64,
}
impl LogicalClock {
  pub fn new() -> LogicalClock {
    LogicalClock::default()
  }

  pub fn starting_at(value: u64) -> LogicalClock {
    LogicalClock { counter: AtomicU64::new(value) }
  }

  /// Local event: increments and returns the new value.
  pub fn tick(&self) -> u64 {
    self.counter.fetch_add(1, SeqCst) + 1
  }

  /// Folds in a received timestamp, setting the counter to `max(local, received) + 1`.
  pub fn observe(&self, received: u64) -> u64 {
    let prev = self
      .counter
      .fetch_update(SeqCst, SeqCst, |local| Some(local.max(received) + 1))
      .unwrap_or_else(|local| local);
    prev.max(received) + 1
  }

  pub fn peek(&self) -> u64 {
    self.counter.load(SeqCst)
  }
}

/// Total order over `(timestamp, node id)` pairs. Equal timestamps are ordered by node id.
pub fn causal_cmp(a: (u64, &str), b: (u64, &str)) -> Ordering {
  a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

#[cfg(test)]
use std::sync::Arc;

#[test]
fn test_tick_and_observe() {
  let clock = LogicalClock::new();
  assert_eq!(clock.peek(), 0);
  assert_eq!(clock.tick(), 1);
  assert_eq!(clock.tick(), 2);
  assert_eq!(clock.observe(10), 11);
  assert_eq!(clock.observe(3), 12);
  assert_eq!(clock.peek(), 12);
}

#[test]
fn test_observe_exceeds_both_sides() {
  let clock = LogicalClock::starting_at(7);
  let mut last = clock.peek();
  for received in [0u64, 7, 8, 3, 100, 50, 101].iter().copied() {
    let before = clock.peek();
    let now = clock.observe(received);
    assert!(now > before.max(received));
    assert!(now >= last);
    last = now;
    let t = clock.tick();
    assert!(t > last);
    last = t;
  }
}

#[test]
fn test_concurrent_ticks_are_unique() {
  let clock = Arc::new(LogicalClock::new());
  let handles = (0..8)
    .map(|_| {
      let clock = clock.clone();
      std::thread::spawn(move || (0..1000).map(|_| clock.tick()).collect::<Vec<_>>())
    })
    .collect::<Vec<_>>();
  let mut all = handles.into_iter().flat_map(|h| h.join().unwrap()).collect::<Vec<_>>();
  all.sort_unstable();
  all.dedup();
  assert_eq!(all.len(), 8000);
  assert_eq!(clock.peek(), 8000);
}

#[test]
fn test_causal_cmp_breaks_ties_by_id() {
  assert_eq!(causal_cmp((3, "b"), (4, "a")), Ordering::Less);
  assert_eq!(causal_cmp((4, "a"), (4, "b")), Ordering::Less);
  assert_eq!(causal_cmp((4, "b"), (4, "b")), Ordering::Equal);
}
