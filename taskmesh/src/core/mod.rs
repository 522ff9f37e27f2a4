//! Node-local primitives: the Lamport clock, addressing, the bus message types and the group bus
//! itself, plus the supervisor every background task is spawned on.

mod bus;
mod clock;
mod message;
mod multicast;
mod peers;
mod remoting;
mod supervisor;

#[rustfmt::skip]
pub use {
  bus::BusStats,
  bus::BusTransport,
  bus::GroupBus,
  bus::Handler,
  bus::Observer,
  bus::MAX_UDP_PAYLOAD,
  clock::causal_cmp,
  clock::LogicalClock,
  message::BusMsg,
  message::ElectionBallot,
  message::Envelope,
  message::FileSync,
  message::FullState,
  message::LeaderAnnouncement,
  message::LeaderConfirmed,
  message::MsgKind,
  message::PeerHeartbeat,
  message::Presence,
  message::SnapshotMarker,
  message::SyncRequest,
  multicast::MulticastTransport,
  peers::PeerDirectory,
  remoting::Host,
  remoting::Socket,
  supervisor::Lifecycle,
  supervisor::Supervisor,
};
