use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskmeshError {
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json codec error: {0}")]
  Codec(#[from] serde_json::Error),

  /// The worker-facing listener could not be bound. Fatal at startup.
  #[error("cannot bind worker listener on {addr}: {source}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },

  #[error("malformed envelope: {0}")]
  MalformedEnvelope(String),

  #[error("unknown message kind {0:?}")]
  UnknownMessageKind(String),

  #[error("replicated state rejected: {0}")]
  InvalidState(#[from] validator::ValidationErrors),

  #[error("no replicated state available")]
  MissingReplica,

  #[error("cannot read config {path}: {reason}")]
  Config { path: PathBuf, reason: String },

  #[error("{node} is not the active coordinator")]
  NotLeader { node: String },
}

pub type Result<T, E = TaskmeshError> = std::result::Result<T, E>;
