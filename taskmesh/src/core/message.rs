use crate::cluster::Role;
use crate::error::TaskmeshError;
use crate::tasks::TaskTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `CANDIDATURA_LIDER`: a standby's bid for leadership. Lower priority wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionBallot {
  #[serde(rename = "candidatoId")]
  pub candidate_id: String,
  #[serde(rename = "prioridade")]
  pub priority: u64,
}
impl ElectionBallot {
  /// True if `self` beats `other`: strictly lower priority, ties broken by lexicographic id.
  pub fn beats(&self, other: &ElectionBallot) -> bool {
    (self.priority, self.candidate_id.as_str()) < (other.priority, other.candidate_id.as_str())
  }
}

/// `NOVO_LIDER_CONFIRMADO`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderConfirmed {
  #[serde(rename = "liderId")]
  pub leader_id: String,
  #[serde(rename = "prioridade")]
  pub priority: u64,
}

/// `NOVO_ORQUESTRADOR_PRINCIPAL`: where workers and standbys should look for the new leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAnnouncement {
  #[serde(rename = "novoOrquestradorId")]
  pub leader_id: String,
  #[serde(rename = "novoHost")]
  pub host: String,
  #[serde(rename = "novaPorta")]
  pub port: u16,
}

/// `SIMPLE_HEARTBEAT` and `SIMPLE_HEARTBEAT_RESPONSE`: presence beacons feeding the peer
/// directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
  #[serde(rename = "papel")]
  pub role: Role,
  #[serde(rename = "liderConhecido")]
  pub known_leader: String,
}

/// `BACKUP_HEARTBEAT` and `HEARTBEAT_RESPONSE` between a standby and the active coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHeartbeat {
  #[serde(rename = "origem")]
  pub from: String,
  #[serde(rename = "destino")]
  pub to: String,
}

/// `DATA_SYNC` and `SYNC_TAREFAS_IMEDIATA`: the authoritative task table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FullState {
  #[serde(rename = "liderAtual")]
  pub leader_id: String,
  #[serde(rename = "estado")]
  pub table: TaskTable,
}

/// `DATA_SYNC_REQUEST`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
  #[serde(rename = "solicitanteId")]
  pub requester_id: String,
}

/// `SNAPSHOT_MARKER`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMarker {
  #[serde(rename = "snapshotId")]
  pub snapshot_id: String,
  #[serde(rename = "origem")]
  pub origin: String,
  pub timestamp: i64,
}

/// `FILE_SYNC`: the active coordinator's task file as raw bytes, base64 encoded, with the
/// base64 SHA-256 digest of those bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSync {
  #[serde(rename = "senderId")]
  pub sender_id: String,
  #[serde(rename = "fileHash")]
  pub file_hash: String,
  #[serde(rename = "fileContent")]
  pub file_content: String,
  pub timestamp: i64,
}

macro_rules! bus_messages {
  ($($variant:ident($payload:ty) => $wire:literal,)+) => {
    /// Every message kind carried by the group bus, decoded once at the bus boundary.
    #[derive(Clone, Debug, PartialEq)]
    pub enum BusMsg {
      $($variant($payload),)+
    }

    /// Dispatch key of a [`BusMsg`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub enum MsgKind {
      $($variant,)+
    }
    impl MsgKind {
      pub const ALL: &'static [MsgKind] = &[$(MsgKind::$variant,)+];

      pub fn wire_name(self) -> &'static str {
        match self {
          $(MsgKind::$variant => $wire,)+
        }
      }

      pub fn from_wire(tipo: &str) -> Option<MsgKind> {
        match tipo {
          $($wire => Some(MsgKind::$variant),)+
          _ => None,
        }
      }
    }

    impl BusMsg {
      pub fn kind(&self) -> MsgKind {
        match self {
          $(BusMsg::$variant(_) => MsgKind::$variant,)+
        }
      }

      pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
          $(BusMsg::$variant(p) => serde_json::to_value(p),)+
        }
      }

      fn from_payload(kind: MsgKind, dados: Value) -> serde_json::Result<BusMsg> {
        match kind {
          $(MsgKind::$variant => serde_json::from_value(dados).map(BusMsg::$variant),)+
        }
      }
    }
  };
}

bus_messages! {
  Candidacy(ElectionBallot) => "CANDIDATURA_LIDER",
  LeaderConfirmed(LeaderConfirmed) => "NOVO_LIDER_CONFIRMADO",
  NewPrimary(LeaderAnnouncement) => "NOVO_ORQUESTRADOR_PRINCIPAL",
  Presence(Presence) => "SIMPLE_HEARTBEAT",
  PresenceReply(Presence) => "SIMPLE_HEARTBEAT_RESPONSE",
  BackupHeartbeat(PeerHeartbeat) => "BACKUP_HEARTBEAT",
  HeartbeatResponse(PeerHeartbeat) => "HEARTBEAT_RESPONSE",
  DataSync(FullState) => "DATA_SYNC",
  DataSyncRequest(SyncRequest) => "DATA_SYNC_REQUEST",
  SyncNow(FullState) => "SYNC_TAREFAS_IMEDIATA",
  Marker(SnapshotMarker) => "SNAPSHOT_MARKER",
  FileSync(FileSync) => "FILE_SYNC",
}

/// A stamped bus message as seen by handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
  pub sender_id: String,
  pub msg: BusMsg,
  pub lamport: u64,
  pub wall_millis: i64,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
  #[serde(rename = "remetenteId")]
  sender_id: String,
  tipo: String,
  #[serde(default)]
  dados: Value,
  #[serde(rename = "timestampLamport")]
  lamport: u64,
  #[serde(rename = "timestampFisico", default)]
  wall_millis: i64,
}

impl Envelope {
  pub fn encode(&self) -> Result<Vec<u8>, TaskmeshError> {
    let wire = WireEnvelope {
      sender_id: self.sender_id.clone(),
      tipo: self.msg.kind().wire_name().to_string(),
      dados: self.msg.payload()?,
      lamport: self.lamport,
      wall_millis: self.wall_millis,
    };
    Ok(serde_json::to_vec(&wire)?)
  }

  /// Decodes a datagram. Unknown kinds are reported separately from malformed input so the bus
  /// can log them at a lower level.
  pub fn decode(bytes: &[u8]) -> Result<Envelope, TaskmeshError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)
      .map_err(|e| TaskmeshError::MalformedEnvelope(e.to_string()))?;
    if wire.sender_id.is_empty() {
      return Err(TaskmeshError::MalformedEnvelope("empty remetenteId".to_string()));
    }
    let kind = MsgKind::from_wire(&wire.tipo)
      .ok_or_else(|| TaskmeshError::UnknownMessageKind(wire.tipo.clone()))?;
    let msg = BusMsg::from_payload(kind, wire.dados).map_err(|e| {
      TaskmeshError::MalformedEnvelope(format!("{} payload: {}", kind.wire_name(), e))
    })?;
    Ok(Envelope {
      sender_id: wire.sender_id,
      msg,
      lamport: wire.lamport,
      wall_millis: wire.wall_millis,
    })
  }
}

#[cfg(test)]
use serde_json::json;

#[test]
fn test_wire_field_names() {
  let env = Envelope {
    sender_id: "orchestrator-backup-17".to_string(),
    msg: BusMsg::Candidacy(ElectionBallot {
      candidate_id: "orchestrator-backup-17".to_string(),
      priority: 17,
    }),
    lamport: 42,
    wall_millis: 1_700_000_000_000,
  };
  let value: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
  assert_eq!(
    value,
    json!({
      "remetenteId": "orchestrator-backup-17",
      "tipo": "CANDIDATURA_LIDER",
      "dados": {"candidatoId": "orchestrator-backup-17", "prioridade": 17},
      "timestampLamport": 42,
      "timestampFisico": 1_700_000_000_000i64,
    })
  );
}

#[test]
fn test_decode_marker() {
  let raw = json!({
    "remetenteId": "orchestrator-principal",
    "tipo": "SNAPSHOT_MARKER",
    "dados": {"snapshotId": "orchestrator-principal-1", "origem": "orchestrator-principal", "timestamp": 5},
    "timestampLamport": 9,
    "timestampFisico": 0,
  });
  let env = Envelope::decode(raw.to_string().as_bytes()).unwrap();
  assert_eq!(env.msg.kind(), MsgKind::Marker);
  assert_eq!(env.lamport, 9);
  match env.msg {
    BusMsg::Marker(m) => assert_eq!(m.snapshot_id, "orchestrator-principal-1"),
    other => panic!("unexpected {:?}", other),
  }
}

#[test]
fn test_decode_faults() {
  let unknown = json!({"remetenteId": "a", "tipo": "FILE_LOCK", "dados": {}, "timestampLamport": 1});
  assert!(matches!(
    Envelope::decode(unknown.to_string().as_bytes()),
    Err(TaskmeshError::UnknownMessageKind(t)) if t == "FILE_LOCK"
  ));

  let missing = json!({"remetenteId": "a", "tipo": "BACKUP_HEARTBEAT", "dados": {"origem": "a"}, "timestampLamport": 1});
  assert!(matches!(
    Envelope::decode(missing.to_string().as_bytes()),
    Err(TaskmeshError::MalformedEnvelope(_))
  ));

  assert!(matches!(Envelope::decode(b"not json"), Err(TaskmeshError::MalformedEnvelope(_))));
}

#[test]
fn test_wire_names_are_distinct() {
  for kind in MsgKind::ALL {
    assert_eq!(MsgKind::from_wire(kind.wire_name()), Some(*kind));
  }
}

#[test]
fn test_ballot_ordering() {
  let a = ElectionBallot { candidate_id: "b-1".to_string(), priority: 1 };
  let b = ElectionBallot { candidate_id: "a-2".to_string(), priority: 2 };
  let c = ElectionBallot { candidate_id: "a-1".to_string(), priority: 1 };
  assert!(a.beats(&b));
  assert!(!b.beats(&a));
  assert!(c.beats(&a));
  assert!(!a.beats(&a));
}
