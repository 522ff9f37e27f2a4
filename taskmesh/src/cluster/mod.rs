//! Coordination between orchestrator nodes: liveness, leadership, state replication, task file
//! mirroring and global snapshots. Everything here talks over a
//! [`GroupBus`](crate::core::GroupBus) and shares the node's [`RoleCell`].

mod failure_detector;
mod file_sync;
mod leadership;
mod replicator;
mod snapshot;
mod utils;

#[rustfmt::skip]
pub use {
  failure_detector::DetectorStats,
  failure_detector::FailureDetector,
  failure_detector::FailureHandler,
  failure_detector::HeartbeatProbe,
  failure_detector::PeerId,
  failure_detector::PeerState,
  file_sync::file_digest,
  file_sync::FileSyncStats,
  file_sync::FileSyncer,
  leadership::derive_priority,
  leadership::HealthReport,
  leadership::LeaderCell,
  leadership::LeadershipCoordinator,
  leadership::LeadershipStats,
  leadership::PromotionStep,
  leadership::Role,
  leadership::RoleCell,
  leadership::RoleHooks,
  replicator::ReplicationStats,
  replicator::StateReplicator,
  snapshot::LocalState,
  snapshot::RecordedMessage,
  snapshot::SnapshotCoordinator,
  snapshot::SnapshotRecord,
  snapshot::SnapshotStats,
  utils::millis,
  utils::DetectorConfig,
  utils::ElectionConfig,
  utils::FileSyncConfig,
  utils::ReplicationConfig,
  utils::SnapshotConfig,
};
