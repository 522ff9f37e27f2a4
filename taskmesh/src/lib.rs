//! `taskmesh` is the coordination layer of a primary/backup task orchestrator. One node is the
//! active coordinator: it accepts tasks, hands them to connected workers in round-robin order and
//! pushes its task table to every standby. Standbys watch the active node and elect a replacement
//! when it stops answering.
//!
//! ### Components
//! - [`LogicalClock`](crate::core::LogicalClock): Lamport timestamps on every bus message and
//!   every task.
//! - [`GroupBus`](crate::core::GroupBus): best-effort broadcast among coordinators, dispatching
//!   typed [`BusMsg`](crate::core::BusMsg) values by kind. It runs over UDP multicast in
//!   production and over an in-process [`LocalHub`](crate::testkit::LocalHub) in tests.
//! - [`FailureDetector`](crate::cluster::FailureDetector): timeout-based heartbeats, used twice:
//!   active node to workers, and standby to active node.
//! - [`LeadershipCoordinator`](crate::cluster::LeadershipCoordinator): the
//!   standby/electing/active state machine. Lower ballot priority wins.
//! - [`WorkDistributor`](crate::tasks::WorkDistributor): the task table, the worker set and the
//!   persisted rotation cursor.
//! - [`StateReplicator`](crate::cluster::StateReplicator): periodic and on-mutation full-state
//!   pushes, validated and kept as a local replica on standbys.
//! - [`SnapshotCoordinator`](crate::cluster::SnapshotCoordinator): Chandy-Lamport snapshots
//!   over the bus, written one file per node per snapshot.
//!
//! [`Orchestrator`](crate::node::Orchestrator) wires all of them together.
//!
//! ### Running a Node
//! ```ignore
//! let config = OrchestratorConfig::from_file("orchestrator.json")?;
//! let group = config.bus.group_v4()?;
//! let transport = MulticastTransport::bind(group, config.bus.interface, config.bus.max_datagram)?;
//! let node = Orchestrator::new(config, Arc::new(transport));
//! node.start().await?;
//! let task = node.submit("resize images", "bucket 7")?;
//! ```
//!
//! ### Failover
//! A backup registers the configured primary with its primary detector and sends
//! `BACKUP_HEARTBEAT` over the bus. When the primary misses heartbeats for longer than the
//! detector timeout, the backup broadcasts its ballot and waits out the settle window. If no
//! better ballot shows up it becomes active, then:
//! 1. stops watching the old primary,
//! 2. binds the worker listener,
//! 3. loads the last replicated task table and restores the rotation cursor,
//! 4. announces itself with `NOVO_ORQUESTRADOR_PRINCIPAL` and `NOVO_LIDER_CONFIRMADO`.
//!
//! Steps that fail are retried by the periodic health check.
//!
//! ### Logging
//! Every module declares a `LOG_LEVEL` floor and logs through the crate's `trace!` ... `error!`
//! macros, which forward to [`tracing`]. Install a subscriber with
//! [`init_logging`](crate::testkit::init_logging) or bring your own.

pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod node;
pub mod tasks;
pub mod testkit;

#[rustfmt::skip]
pub use {
  config::OrchestratorConfig,
  error::TaskmeshError,
  node::NodeStats,
  node::Orchestrator,
};
