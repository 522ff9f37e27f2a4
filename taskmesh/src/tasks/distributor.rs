use crate::core::LogicalClock;
use crate::tasks::{RotationState, Task, TaskStats, TaskStatus, TaskStore, TaskTable, TableMeta};
use crate::testkit::LogLevel;
use crate::{debug, info, warn};
use chrono::Utc;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

/// Pushes task payloads to connected workers.
pub trait TaskDispatch: Send + Sync {
  /// Returns false if `worker_id` has no live connection.
  fn push_task(&self, worker_id: &str, task: &Task) -> bool;
}

struct DistState {
  tasks: im::OrdMap<String, Task>,
  workers: BTreeSet<String>,
  cursor: usize,
  next_seq: u64,
  version: u64,
  leader_id: String,
}
impl DistState {
  /// Selects `workers[cursor % n]` and advances the cursor past it.
  fn pick(&mut self) -> Option<String> {
    if self.workers.is_empty() {
      return None;
    }
    let idx = self.cursor % self.workers.len();
    let chosen = self.workers.iter().nth(idx).cloned();
    self.cursor = (idx + 1) % self.workers.len();
    chosen
  }

  /// Pending task ids matching `pred`, in submission order.
  fn pending_in_order<F: Fn(&Task) -> bool>(&self, pred: F) -> Vec<String> {
    self
      .tasks
      .values()
      .filter(|t| pred(t))
      .sorted_by(|a, b| {
        (a.logical_timestamp, a.id.as_str()).cmp(&(b.logical_timestamp, b.id.as_str()))
      })
      .map(|t| t.id.clone())
      .collect()
  }

  /// Assigns every unassigned pending task, oldest first.
  fn assign_unassigned(&mut self, clock: &LogicalClock, out: &mut Vec<(String, Task)>) {
    for id in self.pending_in_order(Task::is_unassigned) {
      let worker = match self.pick() {
        Some(worker) => worker,
        None => return,
      };
      if let Some(task) = self.tasks.get_mut(&id) {
        task.assigned_worker_id = Some(worker.clone());
        clock.tick();
        out.push((worker, task.clone()));
      }
    }
  }

  fn meta(&self) -> TableMeta {
    TableMeta {
      cursor_index: self.cursor,
      workers_connected: self.workers.len(),
      worker_ids: self.workers.iter().cloned().collect(),
      updated_at: Some(Utc::now().naive_utc()),
      leader_id: self.leader_id.clone(),
    }
  }
}

/// A consistent copy of the table taken under the lock, written and published after it.
struct Commit {
  version: u64,
  tasks: im::OrdMap<String, Task>,
  meta: TableMeta,
}
impl Commit {
  fn into_table(self) -> TaskTable {
    let mut tasks = self.tasks.values().cloned().collect_vec();
    tasks.sort_by(|a, b| (a.logical_timestamp, &a.id).cmp(&(b.logical_timestamp, &b.id)));
    TaskTable { meta: self.meta, tasks }
  }
}

/// Round-robin work distribution over the registered workers.
///
/// Submission, assignment, completion and reassignment each run under one lock. File writes and
/// pushes to workers happen after it is released, in that order, so the rotation cursor is on
/// disk before a worker ever sees the task.
pub struct WorkDistributor {
  clock: Arc<LogicalClock>,
  state: Mutex<DistState>,
  dispatch: RwLock<Option<Arc<dyn TaskDispatch>>>,
  store: Option<TaskStore>,
  changes: watch::Sender<u64>,
}
impl WorkDistributor {
  pub fn new(clock: Arc<LogicalClock>, leader_id: impl Into<String>) -> WorkDistributor {
    let (changes, _) = watch::channel(0);
    WorkDistributor {
      clock,
      state: Mutex::new(DistState {
        tasks: im::OrdMap::new(),
        workers: BTreeSet::new(),
        cursor: 0,
        next_seq: 1,
        version: 0,
        leader_id: leader_id.into(),
      }),
      dispatch: RwLock::new(None),
      store: None,
      changes,
    }
  }

  pub fn with_store(mut self, store: TaskStore) -> WorkDistributor {
    self.store = Some(store);
    self
  }

  pub fn set_dispatch(&self, dispatch: Arc<dyn TaskDispatch>) {
    *self.dispatch.write() = Some(dispatch);
  }

  pub fn set_leader(&self, leader_id: &str) {
    self.state.lock().leader_id = leader_id.to_string();
  }

  /// Receives the table version after every mutation.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.changes.subscribe()
  }

  /// Accepts a task. Never fails: with no workers the task waits, unassigned, for the next
  /// registration or submission.
  pub fn submit(&self, title: impl Into<String>, description: impl Into<String>) -> Task {
    let mut pushes = Vec::new();
    let (mut task, commit) = {
      let mut st = self.state.lock();
      let id = format!("task-{}-{}", Utc::now().timestamp_millis(), st.next_seq);
      st.next_seq += 1;
      let task = Task::new(id.clone(), title.into(), description.into(), self.clock.tick());
      st.tasks.insert(id, task.clone());
      st.assign_unassigned(&self.clock, &mut pushes);
      (task, self.commit(&mut st))
    };
    task.assigned_worker_id =
      pushes.iter().find(|(_, t)| t.id == task.id).map(|(worker, _)| worker.clone());
    if task.assigned_worker_id.is_none() {
      info!(LOG_LEVEL, "no worker available, {} queued", task.id);
    }
    self.finish(commit, pushes);
    task
  }

  /// Adds a worker and hands it any tasks that were waiting. Returns how many were assigned.
  pub fn register_worker(&self, worker_id: &str) -> usize {
    let mut pushes = Vec::new();
    let commit = {
      let mut st = self.state.lock();
      if !st.workers.insert(worker_id.to_string()) {
        debug!(LOG_LEVEL, "worker {} registered again", worker_id);
      }
      st.assign_unassigned(&self.clock, &mut pushes);
      self.commit(&mut st)
    };
    let assigned = pushes.len();
    info!(LOG_LEVEL, "worker {} registered, {} waiting tasks assigned", worker_id, assigned);
    self.finish(commit, pushes);
    assigned
  }

  /// Drops a failed or departed worker and redistributes its pending tasks starting at the
  /// current cursor. Returns how many tasks moved.
  pub fn worker_lost(&self, worker_id: &str) -> usize {
    let mut pushes = Vec::new();
    let (moved, orphaned, commit) = {
      let mut st = self.state.lock();
      st.workers.remove(worker_id);
      let held = st.pending_in_order(|t| t.held_by(worker_id));
      let mut orphaned = 0;
      for id in &held {
        let next = st.pick();
        if let Some(task) = st.tasks.get_mut(id) {
          task.mark_reassigned();
          task.assigned_worker_id = next.clone();
          self.clock.tick();
          match next {
            Some(worker) => pushes.push((worker, task.clone())),
            None => orphaned += 1,
          }
        }
      }
      (held.len(), orphaned, self.commit(&mut st))
    };
    if moved > 0 {
      warn!(
        LOG_LEVEL,
        "worker {} lost: {} tasks reassigned, {} waiting for a worker",
        worker_id,
        moved - orphaned,
        orphaned
      );
    } else {
      info!(LOG_LEVEL, "worker {} removed, held no pending tasks", worker_id);
    }
    self.finish(commit, pushes);
    moved
  }

  /// Reassigns pending tasks held by workers that are not registered here, such as tasks
  /// inherited from a previous leader whose workers never reconnected.
  pub fn reclaim_unregistered(&self) -> usize {
    let mut pushes = Vec::new();
    let commit = {
      let mut st = self.state.lock();
      if st.workers.is_empty() {
        return 0;
      }
      let stray = {
        let workers = &st.workers;
        st.pending_in_order(|t| {
          t.assigned_worker_id.as_ref().map_or(false, |w| !workers.contains(w)) && t.is_pending()
        })
      };
      for id in &stray {
        let next = st.pick();
        if let Some(task) = st.tasks.get_mut(id) {
          task.mark_reassigned();
          task.assigned_worker_id = next.clone();
          if let Some(worker) = next {
            pushes.push((worker, task.clone()));
          }
        }
      }
      if stray.is_empty() {
        return 0;
      }
      self.commit(&mut st)
    };
    let reclaimed = pushes.len();
    warn!(LOG_LEVEL, "reclaimed {} tasks held by unknown workers", reclaimed);
    self.finish(commit, pushes);
    reclaimed
  }

  /// Forgets every worker at once, as when the worker listener closes. Their pending tasks wait
  /// unassigned for the next registration. Returns how many tasks were released.
  pub fn clear_workers(&self) -> usize {
    let (released, commit) = {
      let mut st = self.state.lock();
      if st.workers.is_empty() {
        return 0;
      }
      let held = {
        let workers = &st.workers;
        st.pending_in_order(|t| {
          t.is_pending() && t.assigned_worker_id.as_ref().map_or(false, |w| workers.contains(w))
        })
      };
      st.workers.clear();
      for id in &held {
        if let Some(task) = st.tasks.get_mut(id) {
          task.mark_reassigned();
          task.assigned_worker_id = None;
          self.clock.tick();
        }
      }
      (held.len(), self.commit(&mut st))
    };
    info!(LOG_LEVEL, "all workers released, {} tasks waiting for a worker", released);
    self.finish(commit, Vec::new());
    released
  }

  /// Marks a task done. Unknown ids are logged and ignored.
  pub fn complete(&self, task_id: &str, worker_id: &str) -> bool {
    let commit = {
      let mut st = self.state.lock();
      let task = match st.tasks.get_mut(task_id) {
        Some(task) => task,
        None => {
          warn!(LOG_LEVEL, "completion from {} for unknown task {}", worker_id, task_id);
          return false;
        }
      };
      if task.status == TaskStatus::Done {
        debug!(LOG_LEVEL, "{} already done", task_id);
        return true;
      }
      if task.assigned_worker_id.as_deref() != Some(worker_id) {
        debug!(
          LOG_LEVEL,
          "{} completed by {} while assigned to {:?}",
          task_id,
          worker_id,
          task.assigned_worker_id
        );
      }
      task.status = TaskStatus::Done;
      self.clock.tick();
      self.commit(&mut st)
    };
    info!(LOG_LEVEL, "task {} completed by {}", task_id, worker_id);
    self.finish(commit, Vec::new());
    true
  }

  /// Loads a persisted cursor, normalized modulo the live worker count when there are live
  /// workers. Returns the resulting cursor.
  pub fn restore_rotation(&self, cursor_index: usize, worker_ids: &[String]) -> usize {
    let (cursor, commit) = {
      let mut st = self.state.lock();
      st.cursor = normalize(cursor_index, st.workers.len());
      debug!(
        LOG_LEVEL,
        "rotation restored: cursor {} (persisted {} over {} workers, {} live)",
        st.cursor,
        cursor_index,
        worker_ids.len(),
        st.workers.len()
      );
      (st.cursor, self.commit(&mut st))
    };
    self.finish(commit, Vec::new());
    cursor
  }

  /// Replaces the task table with `table`, keeping the registered workers.
  pub fn load(&self, table: TaskTable) {
    let RotationState { cursor_index, last_known_worker_ids } = table.rotation();
    let count = table.tasks.len();
    {
      let mut st = self.state.lock();
      let max_seq = table.tasks.iter().filter_map(Task::id_sequence).max().unwrap_or(0);
      st.next_seq = st.next_seq.max(max_seq + 1);
      if let Some(max_ts) = table.tasks.iter().map(|t| t.logical_timestamp).max() {
        self.clock.observe(max_ts);
      }
      st.tasks = table.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
    }
    info!(LOG_LEVEL, "loaded {} tasks", count);
    self.restore_rotation(cursor_index, &last_known_worker_ids);
  }

  /// Removes finished tasks. Returns how many were removed.
  pub fn cleanup_done(&self) -> usize {
    let (removed, commit) = {
      let mut st = self.state.lock();
      let done = st
        .tasks
        .iter()
        .filter(|(_, t)| t.status == TaskStatus::Done)
        .map(|(id, _)| id.clone())
        .collect::<Vec<_>>();
      for id in &done {
        st.tasks.remove(id);
      }
      let removed = done.len();
      if removed == 0 {
        return 0;
      }
      (removed, self.commit(&mut st))
    };
    info!(LOG_LEVEL, "cleanup removed {} finished tasks", removed);
    self.finish(commit, Vec::new());
    removed
  }

  pub fn task(&self, task_id: &str) -> Option<Task> {
    self.state.lock().tasks.get(task_id).cloned()
  }

  /// All tasks in submission order.
  pub fn tasks(&self) -> Vec<Task> {
    self.table().tasks
  }

  pub fn table(&self) -> TaskTable {
    let (tasks, meta) = {
      let st = self.state.lock();
      (st.tasks.clone(), st.meta())
    };
    Commit { version: 0, tasks, meta }.into_table()
  }

  pub fn rotation(&self) -> RotationState {
    let st = self.state.lock();
    RotationState {
      cursor_index: st.cursor,
      last_known_worker_ids: st.workers.iter().cloned().collect(),
    }
  }

  pub fn cursor(&self) -> usize {
    self.state.lock().cursor
  }

  pub fn workers(&self) -> Vec<String> {
    self.state.lock().workers.iter().cloned().collect()
  }

  pub fn stats(&self) -> TaskStats {
    let tasks = self.state.lock().tasks.clone();
    let mut stats = TaskStats { total: tasks.len(), ..TaskStats::default() };
    for task in tasks.values() {
      match task.status {
        TaskStatus::Done => stats.done += 1,
        TaskStatus::Pending => {
          stats.pending += 1;
          match &task.assigned_worker_id {
            Some(w) => *stats.pending_by_worker.entry(w.clone()).or_insert(0) += 1,
            None => stats.unassigned += 1,
          }
        }
      }
      if task.reassign_count > 0 {
        stats.reassigned += 1;
      }
    }
    stats
  }

  fn commit(&self, st: &mut DistState) -> Commit {
    st.version += 1;
    Commit { version: st.version, tasks: st.tasks.clone(), meta: st.meta() }
  }

  fn finish(&self, commit: Commit, pushes: Vec<(String, Task)>) {
    let version = commit.version;
    if let Some(store) = &self.store {
      if let Err(e) = store.save_version(version, &commit.into_table()) {
        warn!(LOG_LEVEL, "cannot persist task table v{}: {}", version, e);
      }
    }
    self.changes.send_replace(version);
    if pushes.is_empty() {
      return;
    }
    let dispatch = self.dispatch.read().clone();
    for (worker, task) in pushes {
      let delivered = dispatch.as_ref().map_or(false, |d| d.push_task(&worker, &task));
      if !delivered {
        warn!(LOG_LEVEL, "could not push {} to {}", task.id, worker);
      }
    }
  }
}

fn normalize(cursor: usize, live: usize) -> usize {
  if live == 0 {
    cursor
  } else {
    cursor % live
  }
}

#[cfg(test)]
use maplit::btreeset;

#[cfg(test)]
#[derive(Default)]
struct RecordingDispatch {
  pushed: Mutex<Vec<(String, String)>>,
}
#[cfg(test)]
impl TaskDispatch for RecordingDispatch {
  fn push_task(&self, worker_id: &str, task: &Task) -> bool {
    self.pushed.lock().push((worker_id.to_string(), task.title.clone()));
    true
  }
}

#[cfg(test)]
fn distributor_with(workers: &[&str]) -> (WorkDistributor, Arc<RecordingDispatch>) {
  let dist = WorkDistributor::new(Arc::new(LogicalClock::new()), "orchestrator-principal");
  let dispatch = Arc::new(RecordingDispatch::default());
  dist.set_dispatch(dispatch.clone());
  for w in workers {
    dist.register_worker(w);
  }
  (dist, dispatch)
}

#[test]
fn test_round_robin_fairness() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tarefas.json");
  let (dist, _) = distributor_with(&[]);
  let dist = dist.with_store(TaskStore::new(&path));
  for w in &["w3", "w1", "w2"] {
    dist.register_worker(w);
  }
  let assigned = (0..5)
    .map(|i| dist.submit(format!("t{}", i), "").assigned_worker_id.unwrap())
    .collect_vec();
  assert_eq!(assigned, vec!["w1", "w2", "w3", "w1", "w2"]);
  assert_eq!(dist.cursor(), 2);
  let persisted = TaskStore::new(&path).load().unwrap();
  assert_eq!(persisted.meta.cursor_index, 2);
  assert_eq!(persisted.meta.worker_ids, vec!["w1", "w2", "w3"]);
  assert_eq!(persisted.tasks.len(), 5);
}

#[test]
fn test_reassignment_moves_every_task_once() {
  let (dist, dispatch) = distributor_with(&["w1", "w2", "w3"]);
  let ids = (0..5).map(|i| dist.submit(format!("t{}", i), "").id).collect_vec();
  let on_w2 = ids
    .iter()
    .filter(|id| dist.task(id).unwrap().assigned_worker_id.as_deref() == Some("w2"))
    .cloned()
    .collect_vec();
  assert_eq!(on_w2.len(), 2);
  dispatch.pushed.lock().clear();

  assert_eq!(dist.worker_lost("w2"), 2);
  for id in &on_w2 {
    let task = dist.task(id).unwrap();
    assert!(["w1", "w3"].contains(&task.assigned_worker_id.as_deref().unwrap()));
    assert_eq!(task.reassign_count, 1);
  }
  assert_eq!(dispatch.pushed.lock().len(), 2);
  let all = dist.tasks();
  assert_eq!(all.len(), 5);
  assert_eq!(all.iter().map(|t| t.id.clone()).collect::<BTreeSet<_>>().len(), 5);
  assert!(all.iter().all(|t| t.assigned_worker_id.as_deref() != Some("w2")));
  assert_eq!(dist.workers(), vec!["w1", "w3"]);
}

#[test]
fn test_reassignment_continues_from_cursor() {
  let (dist, _) = distributor_with(&["w1", "w2", "w3"]);
  let a = dist.submit("a", "");
  let b = dist.submit("b", "");
  assert_eq!(b.assigned_worker_id.as_deref(), Some("w2"));
  assert_eq!(dist.cursor(), 2);
  dist.worker_lost("w2");
  // survivors [w1, w3], cursor 2 % 2 = 0
  assert_eq!(dist.task(&b.id).unwrap().assigned_worker_id.as_deref(), Some("w1"));
  assert_eq!(dist.task(&a.id).unwrap().reassign_count, 0);
  assert_eq!(dist.cursor(), 1);
}

#[test]
fn test_lost_worker_with_no_survivors_orphans_tasks() {
  let (dist, _) = distributor_with(&["w1"]);
  let t = dist.submit("a", "");
  assert_eq!(dist.worker_lost("w1"), 1);
  let orphan = dist.task(&t.id).unwrap();
  assert_eq!(orphan.assigned_worker_id, None);
  assert_eq!(orphan.reassign_count, 1);
  assert_eq!(dist.register_worker("w9"), 1);
  assert_eq!(dist.task(&t.id).unwrap().assigned_worker_id.as_deref(), Some("w9"));
}

#[test]
fn test_restore_rotation_normalizes() {
  let (dist, _) = distributor_with(&["w1", "w2", "w3"]);
  let persisted = (1..=6).map(|i| format!("w{}", i)).collect_vec();
  assert_eq!(dist.restore_rotation(5, &persisted), 2);
  assert_eq!(dist.cursor(), 2);

  let (empty, _) = distributor_with(&[]);
  assert_eq!(empty.restore_rotation(5, &persisted), 5);
  empty.register_worker("a");
  empty.register_worker("b");
  assert_eq!(empty.submit("x", "").assigned_worker_id.as_deref(), Some("b"));
}

#[test]
fn test_submit_without_workers_then_register() {
  let (dist, dispatch) = distributor_with(&[]);
  let a = dist.submit("A", "");
  let b = dist.submit("B", "");
  assert!(a.assigned_worker_id.is_none() && b.assigned_worker_id.is_none());
  assert_eq!(dist.stats().unassigned, 2);
  assert_eq!(dist.register_worker("w1"), 2);
  assert_eq!(
    *dispatch.pushed.lock(),
    vec![("w1".to_string(), "A".to_string()), ("w1".to_string(), "B".to_string())]
  );
  assert!(dist.complete(&a.id, "w1"));
  assert_eq!(dist.task(&a.id).unwrap().status, TaskStatus::Done);
  assert_eq!(dist.task(&b.id).unwrap().status, TaskStatus::Pending);
  assert!(!dist.complete("task-0-999", "w1"));
}

#[test]
fn test_cleanup_and_stats() {
  let (dist, _) = distributor_with(&["w1", "w2"]);
  let a = dist.submit("a", "");
  dist.submit("b", "");
  dist.submit("c", "");
  dist.complete(&a.id, "w1");
  let stats = dist.stats();
  assert_eq!((stats.total, stats.pending, stats.done), (3, 2, 1));
  assert_eq!(
    stats.pending_by_worker.keys().cloned().collect::<BTreeSet<_>>(),
    btreeset! {"w1".to_string(), "w2".to_string()}
  );
  assert_eq!(dist.cleanup_done(), 1);
  assert_eq!(dist.cleanup_done(), 0);
  assert_eq!(dist.stats().total, 2);
}

#[test]
fn test_load_resumes_sequence_and_reclaims() {
  let (old, _) = distributor_with(&["w1", "w2", "w3"]);
  for i in 0..4 {
    old.submit(format!("t{}", i), "");
  }
  let table = old.table();
  let max_seq = table.tasks.iter().filter_map(Task::id_sequence).max().unwrap();

  let (new, _) = distributor_with(&["w1", "w9"]);
  new.load(table);
  assert_eq!(new.cursor(), 1);
  let fresh = new.submit("after", "");
  assert_eq!(fresh.id_sequence(), Some(max_seq + 1));
  assert!(fresh.logical_timestamp > new.tasks()[3].logical_timestamp);
  // tasks on w2/w3 are stray here
  let reclaimed = new.reclaim_unregistered();
  assert_eq!(reclaimed, 2);
  assert!(new
    .tasks()
    .iter()
    .all(|t| ["w1", "w9"].contains(&t.assigned_worker_id.as_deref().unwrap())));
}

#[tokio::test]
async fn test_mutations_publish_versions() {
  let (dist, _) = distributor_with(&[]);
  let mut rx = dist.subscribe();
  dist.submit("a", "");
  rx.changed().await.unwrap();
  let v1 = *rx.borrow();
  dist.register_worker("w1");
  rx.changed().await.unwrap();
  assert!(*rx.borrow() > v1);
}

#[test]
fn test_clear_workers_releases_held_tasks() {
  let dist = WorkDistributor::new(Arc::new(LogicalClock::new()), "p");
  dist.register_worker("w1");
  dist.register_worker("w2");
  let a = dist.submit("A", "");
  let b = dist.submit("B", "");
  dist.complete(&a.id, "w1");
  assert_eq!(dist.clear_workers(), 1);
  assert!(dist.workers().is_empty());
  let released = dist.task(&b.id).unwrap();
  assert_eq!(released.assigned_worker_id, None);
  assert_eq!(released.reassign_count, 1);
  assert_eq!(dist.task(&a.id).unwrap().status, TaskStatus::Done);
  assert_eq!(dist.clear_workers(), 0);

  // a fresh registration picks the released task up
  dist.register_worker("w3");
  assert_eq!(dist.task(&b.id).unwrap().assigned_worker_id.as_deref(), Some("w3"));
}
