use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::{fmt, io, str::FromStr};
use tokio::net::lookup_host;

/// The DNS name or IP address of a machine taking part in the deployment.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}
impl fmt::Display for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Host::DNS(s) => write!(f, "{}", s),
      Host::IP(ip) => write!(f, "{}", ip),
    }
  }
}

/// A host and port, written `host:port` in configuration files and in leader-change notices.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
#[serde(try_from = "String", into = "String")]
pub struct Socket {
  pub host: Host,
  pub port: u16,
}
impl Socket {
  pub fn new(host: Host, port: u16) -> Socket {
    Socket { host, port }
  }

  pub fn ip(ip: impl Into<IpAddr>, port: u16) -> Socket {
    Socket { host: Host::IP(ip.into()), port }
  }

  /// Resolves this socket to IPv4 addresses. Only performs a lookup for DNS hosts.
  pub async fn as_addrs(&self) -> io::Result<Vec<SocketAddr>> {
    match &self.host {
      Host::IP(ip) => Ok(vec![SocketAddr::new(*ip, self.port)]),
      Host::DNS(s) => {
        lookup_host((s.as_str(), self.port)).await.map(|x| x.filter(|a| a.is_ipv4()).collect())
      }
    }
  }

  pub fn multicast_v4(&self) -> Option<Ipv4Addr> {
    match self.host {
      Host::IP(IpAddr::V4(ip)) if ip.is_multicast() => Some(ip),
      _ => None,
    }
  }
}
impl fmt::Display for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}
impl FromStr for Socket {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| format!("missing port in {:?}", s))?;
    let port = port.parse::<u16>().map_err(|e| format!("bad port in {:?}: {}", s, e))?;
    if host.is_empty() {
      return Err(format!("missing host in {:?}", s));
    }
    Ok(Socket::new(Host::from(host.to_string()), port))
  }
}
impl TryFrom<String> for Socket {
  type Error = String;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}
impl From<Socket> for String {
  fn from(s: Socket) -> String {
    s.to_string()
  }
}
impl Default for Socket {
  fn default() -> Self {
    Socket::ip(Ipv4Addr::UNSPECIFIED, 0)
  }
}

#[test]
fn test_socket_parse_and_display() {
  let s: Socket = "224.0.0.1:4446".parse().unwrap();
  assert_eq!(s, Socket::ip(Ipv4Addr::new(224, 0, 0, 1), 4446));
  assert_eq!(s.multicast_v4(), Some(Ipv4Addr::new(224, 0, 0, 1)));
  assert_eq!(s.to_string(), "224.0.0.1:4446");

  let d: Socket = "orchestrator.local:8080".parse().unwrap();
  assert_eq!(d.host, Host::DNS("orchestrator.local".to_string()));
  assert_eq!(d.multicast_v4(), None);

  assert!("nohost".parse::<Socket>().is_err());
  assert!(":80".parse::<Socket>().is_err());
  assert!("h:99999".parse::<Socket>().is_err());
}

#[test]
fn test_socket_serde_as_string() {
  let s = Socket::ip(Ipv4Addr::LOCALHOST, 8080);
  let json = serde_json::to_string(&s).unwrap();
  assert_eq!(json, "\"127.0.0.1:8080\"");
  assert_eq!(serde_json::from_str::<Socket>(&json).unwrap(), s);
}
