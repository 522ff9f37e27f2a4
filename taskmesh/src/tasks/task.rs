use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

pub const DEFAULT_LEADER: &str = "orchestrator-principal";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
  #[serde(rename = "PENDENTE", alias = "PENDING")]
  Pending,
  #[serde(rename = "FINALIZADA", alias = "DONE")]
  Done,
}
impl Default for TaskStatus {
  fn default() -> Self {
    TaskStatus::Pending
  }
}

/// A unit of work. Field names on the wire match the persisted task file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Task {
  #[validate(length(min = 1))]
  pub id: String,
  #[serde(rename = "titulo")]
  #[validate(length(min = 1))]
  pub title: String,
  #[serde(rename = "descricao", default)]
  pub description: String,
  #[serde(rename = "horario_recebimento")]
  pub created_at: NaiveDateTime,
  #[serde(rename = "clock_lamport", default)]
  pub logical_timestamp: u64,
  #[serde(default)]
  pub status: TaskStatus,
  #[serde(rename = "worker_responsavel", default)]
  pub assigned_worker_id: Option<String>,
  #[serde(rename = "realocada", default)]
  pub reassigned: bool,
  #[serde(rename = "vezes_realocada", default)]
  pub reassign_count: u32,
}
impl Task {
  pub fn new(id: String, title: String, description: String, logical_timestamp: u64) -> Task {
    Task {
      id,
      title,
      description,
      created_at: Utc::now().naive_utc(),
      logical_timestamp,
      status: TaskStatus::Pending,
      assigned_worker_id: None,
      reassigned: false,
      reassign_count: 0,
    }
  }

  /// Counts one move away from a lost worker.
  pub fn mark_reassigned(&mut self) {
    self.reassigned = true;
    self.reassign_count += 1;
  }

  pub fn is_pending(&self) -> bool {
    self.status == TaskStatus::Pending
  }

  /// Pending with nobody working on it.
  pub fn is_unassigned(&self) -> bool {
    self.is_pending() && self.assigned_worker_id.is_none()
  }

  pub fn held_by(&self, worker_id: &str) -> bool {
    self.is_pending() && self.assigned_worker_id.as_deref() == Some(worker_id)
  }

  /// The `<seq>` part of ids shaped `task-<millis>-<seq>`.
  pub fn id_sequence(&self) -> Option<u64> {
    let mut parts = self.id.split('-');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some("task"), Some(_), Some(seq), None) => seq.parse().ok(),
      _ => None,
    }
  }
}

/// Round-robin cursor and the worker ids it was computed against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RotationState {
  pub cursor_index: usize,
  pub last_known_worker_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
  #[serde(rename = "roundRobinIndex", default)]
  pub cursor_index: usize,
  #[serde(rename = "workersConectados", default)]
  pub workers_connected: usize,
  #[serde(rename = "workerIds", default)]
  pub worker_ids: Vec<String>,
  #[serde(rename = "ultimaAtualizacao", default)]
  pub updated_at: Option<NaiveDateTime>,
  #[serde(rename = "liderAtual", default = "default_leader")]
  pub leader_id: String,
}
impl Default for TableMeta {
  fn default() -> Self {
    TableMeta {
      cursor_index: 0,
      workers_connected: 0,
      worker_ids: Vec::new(),
      updated_at: None,
      leader_id: default_leader(),
    }
  }
}

fn default_leader() -> String {
  DEFAULT_LEADER.to_string()
}

/// The task table plus rotation metadata. This is both the persisted document and the payload of
/// full-state replication.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTable {
  #[serde(rename = "metadados", default)]
  pub meta: TableMeta,
  #[serde(rename = "tarefas", default)]
  pub tasks: Vec<Task>,
}
impl TaskTable {
  pub fn rotation(&self) -> RotationState {
    RotationState {
      cursor_index: self.meta.cursor_index,
      last_known_worker_ids: self.meta.worker_ids.clone(),
    }
  }

  /// Every task must carry a non-empty id and title.
  pub fn validate(&self) -> Result<(), ValidationErrors> {
    self.tasks.iter().try_for_each(|t| t.validate())
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
  pub total: usize,
  pub pending: usize,
  pub done: usize,
  pub unassigned: usize,
  pub reassigned: usize,
  pub pending_by_worker: std::collections::BTreeMap<String, usize>,
}

#[cfg(test)]
fn task(id: &str, title: &str) -> Task {
  Task::new(id.to_string(), title.to_string(), String::new(), 1)
}

#[test]
fn test_id_sequence() {
  assert_eq!(task("task-1700000000000-42", "a").id_sequence(), Some(42));
  assert_eq!(task("task-1-x", "a").id_sequence(), None);
  assert_eq!(task("other", "a").id_sequence(), None);
  assert_eq!(task("task-1-2-3", "a").id_sequence(), None);
}

#[test]
fn test_validate_rejects_blank_fields() {
  let mut table = TaskTable::default();
  table.tasks.push(task("task-1-1", "A"));
  assert!(table.validate().is_ok());
  table.tasks.push(task("task-1-2", ""));
  assert!(table.validate().is_err());
  table.tasks[1].title = "B".to_string();
  table.tasks[1].id = String::new();
  assert!(table.validate().is_err());
}

#[test]
fn test_status_accepts_both_spellings() {
  let s: TaskStatus = serde_json::from_str("\"DONE\"").unwrap();
  assert_eq!(s, TaskStatus::Done);
  let s: TaskStatus = serde_json::from_str("\"PENDENTE\"").unwrap();
  assert_eq!(s, TaskStatus::Pending);
  assert_eq!(serde_json::to_string(&TaskStatus::Done).unwrap(), "\"FINALIZADA\"");
}
