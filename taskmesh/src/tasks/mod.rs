//! Task bookkeeping: the task table and its file, the round-robin distributor, and the
//! line-protocol surface workers connect to.

mod distributor;
mod store;
mod task;
mod worker_link;

#[rustfmt::skip]
pub use {
  distributor::TaskDispatch,
  distributor::WorkDistributor,
  store::decode_table,
  store::TaskStore,
  task::RotationState,
  task::TableMeta,
  task::Task,
  task::TaskStats,
  task::TaskStatus,
  task::TaskTable,
  task::DEFAULT_LEADER,
  worker_link::leader_change,
  worker_link::TaskPayload,
  worker_link::WorkerEvents,
  worker_link::WorkerLinks,
  worker_link::WorkerListener,
  worker_link::WorkerMsg,
};
