use crate::cluster::{FileSyncConfig, LeaderCell, Role, RoleCell};
use crate::core::{BusMsg, FileSync, GroupBus, Lifecycle, MsgKind, Supervisor};
use crate::error::TaskmeshError;
use crate::testkit::LogLevel;
use crate::{debug, info, trace, warn};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

/// Base64 SHA-256 of `bytes`, as carried in `FILE_SYNC`.
pub fn file_digest(bytes: &[u8]) -> String {
  STANDARD.encode(Sha256::digest(bytes))
}

fn hash_file(path: &Path) -> Option<String> {
  fs::read(path).ok().map(|bytes| file_digest(&bytes))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TaskmeshError> {
  if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
    fs::create_dir_all(dir)?;
  }
  let mut tmp = path.as_os_str().to_owned();
  tmp.push(".sync");
  let tmp = PathBuf::from(tmp);
  fs::write(&tmp, bytes)?;
  fs::rename(&tmp, path)?;
  Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileSyncStats {
  pub sent: u64,
  pub received: u64,
  pub mismatched: u64,
  /// Wall-clock millis of the last file sent or mirrored, 0 if none.
  pub last_sync: i64,
}

/// Mirrors the active coordinator's task file onto standbys byte for byte. The active node
/// watches its file and broadcasts it whenever the digest changes; standbys check the digest
/// before writing.
#[derive(Clone)]
pub struct FileSyncer {
  inner: Arc<SyncInner>,
}

struct SyncInner {
  bus: GroupBus,
  role: RoleCell,
  leader: LeaderCell,
  path: PathBuf,
  config: FileSyncConfig,
  sup: Supervisor,
  life: Lifecycle,
  last_hash: Mutex<Option<String>>,
  sent: AtomicU64,
  received: AtomicU64,
  mismatched: AtomicU64,
  last_sync: AtomicI64,
}

impl FileSyncer {
  pub fn new(
    bus: GroupBus,
    role: RoleCell,
    leader: LeaderCell,
    path: impl Into<PathBuf>,
    config: FileSyncConfig,
    sup: Supervisor,
  ) -> FileSyncer {
    let path = path.into();
    let last_hash = hash_file(&path);
    FileSyncer {
      inner: Arc::new(SyncInner {
        bus,
        role,
        leader,
        path,
        config,
        sup,
        life: Lifecycle::default(),
        last_hash: Mutex::new(last_hash),
        sent: AtomicU64::new(0),
        received: AtomicU64::new(0),
        mismatched: AtomicU64::new(0),
        last_sync: AtomicI64::new(0),
      }),
    }
  }

  pub fn install(&self) {
    let me = self.clone();
    self.inner.bus.on_message(MsgKind::FileSync, move |env| {
      if let BusMsg::FileSync(sync) = env.msg {
        me.on_file_sync(&env.sender_id, &sync);
      }
    });
  }

  /// Starts polling the task file. No-op when disabled or already running.
  pub fn start(&self) {
    if !self.inner.config.enabled {
      return;
    }
    let token = match self.inner.life.begin(&self.inner.sup) {
      Some(token) => token,
      None => return,
    };
    let me = self.clone();
    self.inner.sup.spawn(token, async move {
      let mut ticker = interval(me.inner.config.check_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        me.check_file().await;
      }
    });
  }

  pub fn stop(&self) {
    self.inner.life.end();
  }

  /// Sends the task file if its digest moved since the last send or mirror. Only the active
  /// coordinator sends.
  pub async fn check_file(&self) -> bool {
    if !self.inner.role.is(Role::Active) {
      return false;
    }
    let current = match hash_file(&self.inner.path) {
      Some(hash) => hash,
      None => return false,
    };
    if self.inner.last_hash.lock().as_deref() == Some(current.as_str()) {
      return false;
    }
    sleep(self.inner.config.settle_delay).await;
    self.send_file()
  }

  /// Reads the task file and broadcasts it as it is now.
  pub fn send_file(&self) -> bool {
    if !self.inner.role.is(Role::Active) {
      return false;
    }
    let bytes = match fs::read(&self.inner.path) {
      Ok(bytes) => bytes,
      Err(e) => {
        debug!(LOG_LEVEL, "cannot read {}: {}", self.inner.path.display(), e);
        return false;
      }
    };
    let hash = file_digest(&bytes);
    self.inner.bus.send(BusMsg::FileSync(FileSync {
      sender_id: self.inner.bus.node_id().to_string(),
      file_hash: hash.clone(),
      file_content: STANDARD.encode(&bytes),
      timestamp: Utc::now().timestamp_millis(),
    }));
    trace!(LOG_LEVEL, "sent {} ({} bytes)", self.inner.path.display(), bytes.len());
    *self.inner.last_hash.lock() = Some(hash);
    self.inner.sent.fetch_add(1, Ordering::Relaxed);
    self.inner.last_sync.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    true
  }

  /// Mirrors a received file on a standby. Content that does not match its digest is logged and
  /// dropped, leaving the local file as it was.
  pub fn on_file_sync(&self, sender: &str, sync: &FileSync) -> bool {
    if sync.sender_id == self.inner.bus.node_id() {
      return false;
    }
    if self.inner.role.is(Role::Active) {
      debug!(LOG_LEVEL, "ignoring task file from {} while active", sender);
      return false;
    }
    if !self.inner.leader.is(sender) {
      debug!(LOG_LEVEL, "ignoring task file from {}, following {}", sender, self.inner.leader.get());
      return false;
    }
    let bytes = match STANDARD.decode(&sync.file_content) {
      Ok(bytes) => bytes,
      Err(e) => {
        self.inner.mismatched.fetch_add(1, Ordering::Relaxed);
        warn!(LOG_LEVEL, "task file from {} is not valid base64: {}", sender, e);
        return false;
      }
    };
    let actual = file_digest(&bytes);
    if actual != sync.file_hash {
      self.inner.mismatched.fetch_add(1, Ordering::Relaxed);
      warn!(
        LOG_LEVEL,
        "hash mismatch on file sync from {}: announced {}, content hashes to {}",
        sender,
        sync.file_hash,
        actual
      );
      return false;
    }
    if self.inner.last_hash.lock().as_deref() == Some(actual.as_str()) {
      return false;
    }
    if let Err(e) = write_atomic(&self.inner.path, &bytes) {
      warn!(LOG_LEVEL, "cannot write {}: {}", self.inner.path.display(), e);
      return false;
    }
    *self.inner.last_hash.lock() = Some(actual);
    self.inner.received.fetch_add(1, Ordering::Relaxed);
    self.inner.last_sync.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    info!(LOG_LEVEL, "task file synchronized from {}", sender);
    true
  }

  pub fn stats(&self) -> FileSyncStats {
    FileSyncStats {
      sent: self.inner.sent.load(Ordering::Relaxed),
      received: self.inner.received.load(Ordering::Relaxed),
      mismatched: self.inner.mismatched.load(Ordering::Relaxed),
      last_sync: self.inner.last_sync.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
use crate::core::LogicalClock;
#[cfg(test)]
use crate::testkit::LocalHub;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn syncer(path: &Path, role: Role) -> FileSyncer {
  let sup = Supervisor::new();
  let bus = GroupBus::new(
    "b",
    Arc::new(LogicalClock::new()),
    LocalHub::new().transport("b"),
    sup.clone(),
    Duration::from_secs(30),
    65507,
  );
  FileSyncer::new(bus, RoleCell::new(role), LeaderCell::new("p"), path, FileSyncConfig::default(), sup)
}

#[cfg(test)]
fn file_from(sender: &str, bytes: &[u8]) -> FileSync {
  FileSync {
    sender_id: sender.to_string(),
    file_hash: file_digest(bytes),
    file_content: STANDARD.encode(bytes),
    timestamp: 0,
  }
}

#[test]
fn test_digest_matches_sha256() {
  // sha256("abc")
  assert_eq!(file_digest(b"abc"), "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
  assert_ne!(file_digest(b"abc"), file_digest(b"abd"));
}

#[test]
fn test_standby_mirrors_matching_file() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tarefas.json");
  let sync = syncer(&path, Role::Standby);

  assert!(sync.on_file_sync("p", &file_from("p", br#"{"tarefas": []}"#)));
  assert_eq!(fs::read(&path).unwrap(), br#"{"tarefas": []}"#.to_vec());
  // the same content again is not rewritten
  assert!(!sync.on_file_sync("p", &file_from("p", br#"{"tarefas": []}"#)));
  assert_eq!(sync.stats().received, 1);

  // only the followed leader is mirrored
  assert!(!sync.on_file_sync("old", &file_from("old", b"[]")));
  assert_eq!(fs::read(&path).unwrap(), br#"{"tarefas": []}"#.to_vec());
}

#[test]
fn test_hash_mismatch_keeps_local_file() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tarefas.json");
  fs::write(&path, b"[]").unwrap();
  let sync = syncer(&path, Role::Standby);

  let mut tampered = file_from("p", br#"{"tarefas": [1]}"#);
  tampered.file_hash = file_digest(b"something else");
  assert!(!sync.on_file_sync("p", &tampered));
  let mut garbled = file_from("p", b"[]");
  garbled.file_content = "not base64 !".to_string();
  assert!(!sync.on_file_sync("p", &garbled));

  assert_eq!(fs::read(&path).unwrap(), b"[]".to_vec());
  assert_eq!(sync.stats().mismatched, 2);
  assert_eq!(sync.stats().received, 0);
}

#[tokio::test]
async fn test_only_active_sends_changed_file() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tarefas.json");
  fs::write(&path, b"[]").unwrap();
  let standby = syncer(&path, Role::Standby);
  assert!(!standby.send_file());

  let active = syncer(&path, Role::Active);
  assert!(!active.check_file().await);
  fs::write(&path, br#"[{"id": "task-1-1"}]"#).unwrap();
  assert!(active.check_file().await);
  assert!(!active.check_file().await);
  assert_eq!(active.stats().sent, 1);
  assert!(!active.on_file_sync("p", &file_from("p", b"[]")));
}
