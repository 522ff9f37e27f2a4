use crate::core::BusTransport;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// UDP multicast rendezvous shared by every coordinator on the segment.
pub struct MulticastTransport {
  socket: UdpSocket,
  group: SocketAddrV4,
  interface: Ipv4Addr,
  max_datagram: usize,
}
impl MulticastTransport {
  /// Binds the group port with address reuse so several nodes can share a host. Must be called
  /// inside a tokio runtime.
  pub fn bind(
    group: SocketAddrV4,
    interface: Ipv4Addr,
    max_datagram: usize,
  ) -> io::Result<MulticastTransport> {
    if !group.ip().is_multicast() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} is not a multicast address", group.ip()),
      ));
    }
    let raw = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    raw.set_reuse_address(true)?;
    raw.set_nonblocking(true)?;
    raw.set_multicast_loop_v4(true)?;
    raw.set_multicast_ttl_v4(1)?;
    let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()));
    raw.bind(&local.into())?;
    let socket = UdpSocket::from_std(raw.into())?;
    Ok(MulticastTransport { socket, group, interface, max_datagram })
  }
}
#[async_trait]
impl BusTransport for MulticastTransport {
  async fn join(&self) -> io::Result<()> {
    match self.socket.join_multicast_v4(*self.group.ip(), self.interface) {
      Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(()),
      other => other,
    }
  }

  fn leave(&self) {
    let _ = self.socket.leave_multicast_v4(*self.group.ip(), self.interface);
  }

  async fn broadcast(&self, datagram: Vec<u8>) -> io::Result<()> {
    self.socket.send_to(&datagram, SocketAddr::V4(self.group)).await.map(|_| ())
  }

  async fn recv(&self) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; self.max_datagram];
    let (len, _) = self.socket.recv_from(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
  }
}
