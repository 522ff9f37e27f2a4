use crate::error::TaskmeshError;
use crate::tasks::{Task, TaskTable};
use crate::testkit::LogLevel;
use crate::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

/// The persisted task file. Reads both the wrapped `{metadados, tarefas}` document and the legacy
/// bare task list; always writes the wrapped form.
pub struct TaskStore {
  path: PathBuf,
  keep_backup: bool,
  last_version: Mutex<Option<u64>>,
}
impl TaskStore {
  pub fn new(path: impl Into<PathBuf>) -> TaskStore {
    TaskStore { path: path.into(), keep_backup: false, last_version: Mutex::new(None) }
  }

  /// A store that copies the previous file to `<path>.bak` before each overwrite.
  pub fn with_backup(path: impl Into<PathBuf>) -> TaskStore {
    TaskStore { keep_backup: true, ..TaskStore::new(path) }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn backup_path(&self) -> PathBuf {
    suffixed(&self.path, ".bak")
  }

  pub fn exists(&self) -> bool {
    self.path.exists()
  }

  /// A missing or empty file is an empty table.
  pub fn load(&self) -> Result<TaskTable, TaskmeshError> {
    if !self.path.exists() {
      return Ok(TaskTable::default());
    }
    let text = fs::read_to_string(&self.path)?;
    if text.trim().is_empty() {
      return Ok(TaskTable::default());
    }
    let table = decode_table(serde_json::from_str(&text)?)?;
    debug!(
      LOG_LEVEL,
      "loaded {} tasks from {}",
      table.tasks.len(),
      self.path.display()
    );
    Ok(table)
  }

  /// Loads the file and checks every task.
  pub fn load_valid(&self) -> Result<TaskTable, TaskmeshError> {
    let table = self.load()?;
    table.validate()?;
    Ok(table)
  }

  /// Startup load that never fails: an unusable file is moved aside to `<path>.corrupt` and the
  /// `.bak` copy is tried, then an empty table.
  pub fn load_or_recover(&self) -> TaskTable {
    let err = match self.load_valid() {
      Ok(table) => return table,
      Err(e) => e,
    };
    warn!(LOG_LEVEL, "task file {} unusable: {}", self.path.display(), err);
    let aside = suffixed(&self.path, ".corrupt");
    if let Err(e) = fs::rename(&self.path, &aside) {
      warn!(LOG_LEVEL, "cannot move {} aside: {}", self.path.display(), e);
    }
    let backup = self.backup_path();
    if backup.exists() {
      match TaskStore::new(&backup).load_valid() {
        Ok(table) => {
          warn!(LOG_LEVEL, "recovered {} tasks from {}", table.tasks.len(), backup.display());
          return table;
        }
        Err(e) => warn!(LOG_LEVEL, "backup {} unusable too: {}", backup.display(), e),
      }
    }
    warn!(LOG_LEVEL, "starting with an empty task table");
    TaskTable::default()
  }

  pub fn save(&self, table: &TaskTable) -> Result<(), TaskmeshError> {
    let mut last = self.last_version.lock();
    self.write(table)?;
    *last = None;
    Ok(())
  }

  /// Writes `table` unless a newer version has already been written. Concurrent mutators each
  /// persist their own snapshot; this keeps an older one from landing last.
  pub fn save_version(&self, version: u64, table: &TaskTable) -> Result<bool, TaskmeshError> {
    let mut last = self.last_version.lock();
    if last.map_or(false, |v| v >= version) {
      return Ok(false);
    }
    self.write(table)?;
    *last = Some(version);
    Ok(true)
  }

  fn write(&self, table: &TaskTable) -> Result<(), TaskmeshError> {
    if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
      fs::create_dir_all(dir)?;
    }
    if self.keep_backup && self.path.exists() {
      fs::copy(&self.path, self.backup_path())?;
    }
    let tmp = suffixed(&self.path, ".tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(table)?)?;
    fs::rename(&tmp, &self.path)?;
    Ok(())
  }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push(suffix);
  PathBuf::from(name)
}

/// Accepts the wrapped document or a legacy bare list of tasks.
pub fn decode_table(value: Value) -> Result<TaskTable, TaskmeshError> {
  match value {
    Value::Array(_) => {
      let tasks: Vec<Task> = serde_json::from_value(value)?;
      Ok(TaskTable { tasks, ..TaskTable::default() })
    }
    other => Ok(serde_json::from_value(other)?),
  }
}

#[cfg(test)]
use crate::tasks::TaskStatus;
#[cfg(test)]
use itertools::Itertools;

#[cfg(test)]
fn sample_table() -> TaskTable {
  let mut a = Task::new("task-1-1".to_string(), "A".to_string(), "first".to_string(), 3);
  a.assigned_worker_id = Some("w1".to_string());
  let mut b = Task::new("task-1-2".to_string(), "B".to_string(), String::new(), 4);
  b.status = TaskStatus::Done;
  b.reassign_count = 2;
  b.assigned_worker_id = Some("w2".to_string());
  let mut table = TaskTable { tasks: vec![a, b], ..TaskTable::default() };
  table.meta.cursor_index = 1;
  table.meta.worker_ids = vec!["w1".to_string(), "w2".to_string()];
  table.meta.workers_connected = 2;
  table
}

#[test]
fn test_round_trip_keeps_ids_titles_statuses_and_counts() {
  let dir = tempfile::tempdir().unwrap();
  let store = TaskStore::new(dir.path().join("tarefas.json"));
  let table = sample_table();
  store.save(&table).unwrap();
  let loaded = store.load().unwrap();
  let key = |t: &TaskTable| {
    t.tasks
      .iter()
      .map(|t| (t.id.clone(), t.title.clone(), t.status, t.reassign_count))
      .sorted()
      .collect_vec()
  };
  assert_eq!(key(&loaded), key(&table));
  assert_eq!(loaded, table);
}

#[test]
fn test_legacy_list_equals_wrapped_with_default_meta() {
  let dir = tempfile::tempdir().unwrap();
  let table = TaskTable { tasks: sample_table().tasks, ..TaskTable::default() };

  let legacy = TaskStore::new(dir.path().join("legacy.json"));
  fs::write(legacy.path(), serde_json::to_vec(&table.tasks).unwrap()).unwrap();
  let wrapped = TaskStore::new(dir.path().join("wrapped.json"));
  wrapped.save(&table).unwrap();

  let from_legacy = legacy.load().unwrap();
  assert_eq!(from_legacy, wrapped.load().unwrap());
  assert_eq!(from_legacy.meta.leader_id, "orchestrator-principal");
  assert_eq!(from_legacy.meta.cursor_index, 0);
}

#[test]
fn test_missing_and_empty_files_load_empty() {
  let dir = tempfile::tempdir().unwrap();
  let store = TaskStore::new(dir.path().join("nope.json"));
  assert_eq!(store.load().unwrap(), TaskTable::default());
  fs::write(store.path(), "  \n").unwrap();
  assert_eq!(store.load().unwrap(), TaskTable::default());
  fs::write(store.path(), "{not json").unwrap();
  assert!(store.load().is_err());
}

#[test]
fn test_stale_versions_are_not_written() {
  let dir = tempfile::tempdir().unwrap();
  let store = TaskStore::new(dir.path().join("v.json"));
  let newer = sample_table();
  assert!(store.save_version(5, &newer).unwrap());
  assert!(!store.save_version(4, &TaskTable::default()).unwrap());
  assert_eq!(store.load().unwrap(), newer);
}

#[test]
fn test_backup_keeps_previous_replica() {
  let dir = tempfile::tempdir().unwrap();
  let store = TaskStore::with_backup(dir.path().join("tarefas_backup.json"));
  let first = TaskTable::default();
  store.save(&first).unwrap();
  assert!(!store.backup_path().exists());
  store.save(&sample_table()).unwrap();
  let previous = TaskStore::new(store.backup_path()).load().unwrap();
  assert_eq!(previous, first);
}

#[test]
fn test_unusable_file_falls_back_to_backup() {
  let dir = tempfile::tempdir().unwrap();
  let store = TaskStore::with_backup(dir.path().join("tarefas.json"));
  let first = sample_table();
  store.save(&first).unwrap();
  store.save(&TaskTable::default()).unwrap();
  fs::write(store.path(), "{not json").unwrap();

  assert_eq!(store.load_or_recover(), first);
  assert!(!store.exists());
  assert!(dir.path().join("tarefas.json.corrupt").exists());

  // an invalid table is as unusable as a broken one
  let mut bad = sample_table();
  bad.tasks[0].title.clear();
  let plain = TaskStore::new(dir.path().join("plain.json"));
  plain.save(&bad).unwrap();
  assert!(matches!(plain.load_valid(), Err(TaskmeshError::InvalidState(_))));
  assert_eq!(plain.load_or_recover(), TaskTable::default());
}
