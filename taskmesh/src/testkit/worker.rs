use crate::error::TaskmeshError;
use crate::tasks::WorkerMsg;
use crate::testkit::LogLevel;
use crate::trace;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;

pub const LOG_LEVEL: LogLevel = LogLevel::Debug;

/// A scripted worker speaking the line protocol. Heartbeats are answered automatically; every
/// other line from the coordinator is queued for [`next`](TestWorker::next).
pub struct TestWorker {
  worker_id: String,
  write: Arc<Mutex<OwnedWriteHalf>>,
  inbox: UnboundedReceiver<WorkerMsg>,
}
impl TestWorker {
  pub async fn connect(addr: SocketAddr, worker_id: &str) -> Result<TestWorker, TaskmeshError> {
    let stream = TcpStream::connect(addr).await?;
    let (read, write) = stream.into_split();
    let write = Arc::new(Mutex::new(write));
    let (tx, inbox) = unbounded_channel();
    let replies = write.clone();
    let id = worker_id.to_string();
    tokio::spawn(async move {
      let mut lines = BufReader::new(read).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<WorkerMsg>(&line) {
          Ok(WorkerMsg::Heartbeat { .. }) => {
            let reply = WorkerMsg::HeartbeatResponse {
              worker_id: Some(id.clone()),
              timestamp: Utc::now().timestamp_millis(),
            };
            if write_line(&replies, &reply).await.is_err() {
              break;
            }
          }
          Ok(msg) => {
            if tx.send(msg).is_err() {
              break;
            }
          }
          Err(e) => trace!(LOG_LEVEL, "test worker {} got bad line: {}", id, e),
        }
      }
    });
    let worker = TestWorker { worker_id: worker_id.to_string(), write, inbox };
    worker.send(&WorkerMsg::Register { worker_id: worker_id.to_string() }).await?;
    Ok(worker)
  }

  pub fn id(&self) -> &str {
    &self.worker_id
  }

  pub async fn send(&self, msg: &WorkerMsg) -> Result<(), TaskmeshError> {
    write_line(&self.write, msg).await
  }

  /// The next non-heartbeat message, or `None` if nothing arrives within `limit` or the
  /// connection closed.
  pub async fn next(&mut self, limit: Duration) -> Option<WorkerMsg> {
    tokio::time::timeout(limit, self.inbox.recv()).await.ok().flatten()
  }

  pub async fn complete(&self, task_id: &str) -> Result<(), TaskmeshError> {
    self
      .send(&WorkerMsg::Completion { worker_id: self.worker_id.clone(), task_id: task_id.to_string() })
      .await
  }

  pub async fn disconnect(self) -> Result<(), TaskmeshError> {
    self.send(&WorkerMsg::Disconnect { worker_id: self.worker_id.clone() }).await
  }
}

async fn write_line(write: &Mutex<OwnedWriteHalf>, msg: &WorkerMsg) -> Result<(), TaskmeshError> {
  let mut line = msg.to_line()?;
  line.push('\n');
  write.lock().await.write_all(line.as_bytes()).await?;
  Ok(())
}
