use crate::cluster::HeartbeatProbe;
use crate::core::{Socket, Supervisor};
use crate::error::TaskmeshError;
use crate::tasks::{Task, TaskDispatch};
use crate::testkit::LogLevel;
use crate::{debug, info, trace, warn};
use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// The task as a worker sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
  pub id: String,
  pub title: String,
  pub description: String,
  pub timestamp: u64,
}
impl From<&Task> for TaskPayload {
  fn from(task: &Task) -> Self {
    TaskPayload {
      id: task.id.clone(),
      title: task.title.clone(),
      description: task.description.clone(),
      timestamp: task.logical_timestamp,
    }
  }
}

/// One line of the worker protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tipo")]
pub enum WorkerMsg {
  #[serde(rename = "REGISTRO")]
  Register {
    #[serde(rename = "workerId")]
    worker_id: String,
  },
  #[serde(rename = "TAREFA")]
  Assign { tarefa: TaskPayload },
  #[serde(rename = "CONCLUSAO")]
  Completion {
    #[serde(rename = "workerId")]
    worker_id: String,
    #[serde(rename = "tarefaId")]
    task_id: String,
  },
  #[serde(rename = "HEARTBEAT")]
  Heartbeat { timestamp: i64 },
  #[serde(rename = "HEARTBEAT_RESPONSE")]
  HeartbeatResponse {
    #[serde(rename = "workerId", default)]
    worker_id: Option<String>,
    #[serde(default)]
    timestamp: i64,
  },
  #[serde(rename = "MUDANCA_ORQUESTRADOR")]
  LeaderChange {
    #[serde(rename = "novoOrquestradorId")]
    leader_id: String,
    #[serde(rename = "novoHost")]
    host: String,
    #[serde(rename = "novaPorta")]
    port: u16,
  },
  #[serde(rename = "DESCONEXAO")]
  Disconnect {
    #[serde(rename = "workerId")]
    worker_id: String,
  },
}
impl WorkerMsg {
  pub fn to_line(&self) -> Result<String, TaskmeshError> {
    Ok(serde_json::to_string(self)?)
  }
}

/// What the worker surface reports upward.
pub trait WorkerEvents: Send + Sync {
  fn registered(&self, worker_id: &str);
  fn completed(&self, worker_id: &str, task_id: &str);
  fn heartbeat(&self, worker_id: &str);
  /// The connection closed on its own or the worker said goodbye. Not called for connections
  /// dropped through [`WorkerLinks::drop_worker`].
  fn disconnected(&self, worker_id: &str);
}

struct Link {
  conn_id: u64,
  tx: UnboundedSender<String>,
  cancel: CancellationToken,
}

/// Outgoing halves of every registered worker connection.
#[derive(Default)]
pub struct WorkerLinks {
  links: Mutex<HashMap<String, Link>>,
  next_conn: AtomicU64,
}
impl WorkerLinks {
  pub fn new() -> Arc<WorkerLinks> {
    Arc::new(WorkerLinks::default())
  }

  fn attach(&self, worker_id: &str, tx: UnboundedSender<String>, cancel: CancellationToken) -> u64 {
    let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
    let old = self.links.lock().insert(worker_id.to_string(), Link { conn_id, tx, cancel });
    if let Some(old) = old {
      debug!(LOG_LEVEL, "worker {} reconnected, closing previous connection", worker_id);
      old.cancel.cancel();
    }
    conn_id
  }

  /// Removes the link if it still belongs to `conn_id`.
  fn detach(&self, worker_id: &str, conn_id: u64) -> bool {
    let mut links = self.links.lock();
    match links.get(worker_id) {
      Some(link) if link.conn_id == conn_id => {
        links.remove(worker_id);
        true
      }
      _ => false,
    }
  }

  pub fn send(&self, worker_id: &str, msg: &WorkerMsg) -> bool {
    let line = match msg.to_line() {
      Ok(line) => line,
      Err(e) => {
        warn!(LOG_LEVEL, "cannot encode line for {}: {}", worker_id, e);
        return false;
      }
    };
    match self.links.lock().get(worker_id) {
      Some(link) => link.tx.send(line).is_ok(),
      None => false,
    }
  }

  /// Sends `msg` to every connected worker; returns how many accepted it.
  pub fn broadcast(&self, msg: &WorkerMsg) -> usize {
    self.connected().iter().filter(|w| self.send(w, msg)).count()
  }

  /// Closes a worker's connection without raising a disconnect event.
  pub fn drop_worker(&self, worker_id: &str) -> bool {
    match self.links.lock().remove(worker_id) {
      Some(link) => {
        link.cancel.cancel();
        true
      }
      None => false,
    }
  }

  pub fn drop_all(&self) {
    for (_, link) in self.links.lock().drain() {
      link.cancel.cancel();
    }
  }

  pub fn connected(&self) -> Vec<String> {
    let mut ids = self.links.lock().keys().cloned().collect::<Vec<_>>();
    ids.sort();
    ids
  }

  pub fn count(&self) -> usize {
    self.links.lock().len()
  }
}
impl TaskDispatch for WorkerLinks {
  fn push_task(&self, worker_id: &str, task: &Task) -> bool {
    self.send(worker_id, &WorkerMsg::Assign { tarefa: TaskPayload::from(task) })
  }
}
impl HeartbeatProbe<String> for WorkerLinks {
  fn probe(&self, worker_id: &String) -> bool {
    self.send(worker_id, &WorkerMsg::Heartbeat { timestamp: Utc::now().timestamp_millis() })
  }
}

/// Builds the leader-change notice pushed to workers.
pub fn leader_change(leader_id: &str, endpoint: &Socket) -> WorkerMsg {
  WorkerMsg::LeaderChange {
    leader_id: leader_id.to_string(),
    host: endpoint.host.to_string(),
    port: endpoint.port,
  }
}

/// The worker-facing TCP listener.
pub struct WorkerListener {
  listener: TcpListener,
  local: SocketAddr,
}
impl WorkerListener {
  /// Failure here is fatal for a node that has to serve workers.
  pub async fn bind(addr: SocketAddr) -> Result<WorkerListener, TaskmeshError> {
    let listener =
      TcpListener::bind(addr).await.map_err(|source| TaskmeshError::Bind { addr, source })?;
    let local = listener.local_addr()?;
    info!(LOG_LEVEL, "worker listener bound on {}", local);
    Ok(WorkerListener { listener, local })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local
  }

  /// Accepts connections until `token` is cancelled.
  pub async fn serve(
    self,
    links: Arc<WorkerLinks>,
    events: Arc<dyn WorkerEvents>,
    sup: Supervisor,
    token: CancellationToken,
  ) {
    loop {
      let accepted = tokio::select! {
        _ = token.cancelled() => break,
        accepted = self.listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, peer)) => {
          trace!(LOG_LEVEL, "connection from {}", peer);
          let conn_token = token.child_token();
          sup.spawn(
            conn_token.clone(),
            connection(stream, peer, links.clone(), events.clone(), sup.clone(), conn_token),
          );
        }
        Err(e) => {
          debug!(LOG_LEVEL, "accept failed: {}", e);
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
      }
    }
    debug!(LOG_LEVEL, "worker listener on {} stopped", self.local);
  }
}

async fn connection(
  stream: TcpStream,
  peer: SocketAddr,
  links: Arc<WorkerLinks>,
  events: Arc<dyn WorkerEvents>,
  sup: Supervisor,
  token: CancellationToken,
) {
  let (read, write) = stream.into_split();
  let mut lines = BufReader::new(read).lines();

  let worker_id = match tokio::time::timeout(REGISTER_TIMEOUT, lines.next_line()).await {
    Ok(Ok(Some(line))) => match serde_json::from_str::<WorkerMsg>(&line) {
      Ok(WorkerMsg::Register { worker_id }) if !worker_id.is_empty() => worker_id,
      _ => {
        debug!(LOG_LEVEL, "{} did not open with REGISTRO, closing", peer);
        return;
      }
    },
    _ => {
      debug!(LOG_LEVEL, "{} never registered", peer);
      return;
    }
  };

  let (tx, rx) = unbounded_channel();
  let conn_id = links.attach(&worker_id, tx, token.clone());
  sup.spawn(token.clone(), writer(write, rx));
  info!(LOG_LEVEL, "worker {} connected from {}", worker_id, peer);
  events.registered(&worker_id);

  loop {
    let line = tokio::select! {
      _ = token.cancelled() => break,
      line = lines.next_line() => line,
    };
    let line = match line {
      Ok(Some(line)) => line,
      Ok(None) => break,
      Err(e) => {
        debug!(LOG_LEVEL, "read from {} failed: {}", worker_id, e);
        break;
      }
    };
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str::<WorkerMsg>(&line) {
      Ok(WorkerMsg::Completion { task_id, .. }) => events.completed(&worker_id, &task_id),
      Ok(WorkerMsg::HeartbeatResponse { .. }) => events.heartbeat(&worker_id),
      Ok(WorkerMsg::Disconnect { .. }) => {
        info!(LOG_LEVEL, "worker {} disconnecting", worker_id);
        break;
      }
      Ok(other) => debug!(LOG_LEVEL, "ignoring {:?} from {}", other, worker_id),
      Err(e) => debug!(LOG_LEVEL, "bad line from {}: {}", worker_id, e),
    }
  }

  token.cancel();
  if links.detach(&worker_id, conn_id) {
    events.disconnected(&worker_id);
  }
}

async fn writer(mut write: tokio::net::tcp::OwnedWriteHalf, mut rx: UnboundedReceiver<String>) {
  while let Some(mut line) = rx.recv().await {
    line.push('\n');
    if let Err(e) = write.write_all(line.as_bytes()).await {
      debug!(LOG_LEVEL, "write to worker failed: {}", e);
      break;
    }
  }
  let _ = write.shutdown().await;
}

#[test]
fn test_line_format() {
  let line = WorkerMsg::Register { worker_id: "w1".to_string() }.to_line().unwrap();
  assert_eq!(line, r#"{"tipo":"REGISTRO","workerId":"w1"}"#);
  let done: WorkerMsg =
    serde_json::from_str(r#"{"tipo":"CONCLUSAO","workerId":"w1","tarefaId":"task-1-1"}"#).unwrap();
  assert_eq!(
    done,
    WorkerMsg::Completion { worker_id: "w1".to_string(), task_id: "task-1-1".to_string() }
  );
  let hb: WorkerMsg =
    serde_json::from_str(r#"{"tipo":"HEARTBEAT_RESPONSE","workerId":"w1","timestamp":9}"#).unwrap();
  assert!(matches!(hb, WorkerMsg::HeartbeatResponse { .. }));
  let notice = leader_change("b-1", &"10.0.0.2:8080".parse().unwrap()).to_line().unwrap();
  assert_eq!(
    notice,
    r#"{"tipo":"MUDANCA_ORQUESTRADOR","novoOrquestradorId":"b-1","novoHost":"10.0.0.2","novaPorta":8080}"#
  );
}

#[test]
fn test_task_line_shape() {
  let task = Task::new("task-1-1".to_string(), "A".to_string(), "d".to_string(), 4);
  let line = WorkerMsg::Assign { tarefa: TaskPayload::from(&task) }.to_line().unwrap();
  assert_eq!(
    line,
    r#"{"tipo":"TAREFA","tarefa":{"id":"task-1-1","title":"A","description":"d","timestamp":4}}"#
  );
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
  let first = WorkerListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  let taken = first.local_addr();
  match WorkerListener::bind(taken).await {
    Err(TaskmeshError::Bind { addr, .. }) => assert_eq!(addr, taken),
    other => panic!("expected bind error, got {:?}", other.map(|l| l.local_addr())),
  }
}
