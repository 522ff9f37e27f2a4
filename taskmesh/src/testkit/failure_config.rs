use im::HashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Network misbehavior applied to bus traffic in tests.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  /// Probability in `[0, 1]` that a datagram is silently lost.
  pub drop_prob: f64,
  /// Inclusive range a delivery delay is drawn from, if any.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub const RELIABLE: FailureConfig = FailureConfig { drop_prob: 0.0, delay: None };

  pub fn dropped(&self) -> bool {
    self.drop_prob > 0.0 && rand::random::<f64>() < self.drop_prob
  }

  pub fn sample_delay(&self) -> Option<Duration> {
    self.delay.map(|(min, max)| {
      let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
      if hi <= lo {
        return min;
      }
      Duration::from_millis(SmallRng::from_entropy().gen_range(lo..=hi))
    })
  }
}

/// Per-receiver overrides on top of a bus-wide default.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  pub bus_wide: FailureConfig,
  pub node_wide: HashMap<String, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, node_id: &str) -> &FailureConfig {
    self.node_wide.get(node_id).unwrap_or(&self.bus_wide)
  }

  pub fn isolate(&mut self, node_id: impl Into<String>) {
    self.node_wide.insert(node_id.into(), FailureConfig { drop_prob: 1.0, delay: None });
  }
}

#[test]
fn test_failure_config_lookup() {
  let mut map = FailureConfigMap::default();
  map.isolate("backup-1");
  assert_eq!(map.get("backup-1").drop_prob, 1.0);
  assert_eq!(*map.get("primary"), FailureConfig::RELIABLE);
  assert!(map.get("backup-1").dropped());
  assert!(!map.get("primary").dropped());
}

#[test]
fn test_delay_sampling_stays_in_range() {
  let cfg = FailureConfig {
    drop_prob: 0.0,
    delay: Some((Duration::from_millis(5), Duration::from_millis(20))),
  };
  for _ in 0..50 {
    let d = cfg.sample_delay().unwrap_or_default();
    assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(20));
  }
  assert_eq!(FailureConfig::RELIABLE.sample_delay(), None);
}
