use crate::error::BuildError;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

/// Identity of the node this worker runs on.
///
/// Tags process and result records and decides which node allow-lists apply here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
  pub hostname: String,
  pub ip: IpAddr,
}

impl NodeIdentity {
  pub fn new(hostname: impl Into<String>, ip: IpAddr) -> Self {
    Self {
      hostname: hostname.into(),
      ip,
    }
  }

  /// Discovers the hostname and the primary outbound IPv4 address.
  ///
  /// Either part can be overridden; a missing override is discovered.
  pub fn discover(hostname: Option<&str>, ip: Option<IpAddr>) -> Result<Self, BuildError> {
    let hostname = match hostname {
      Some(name) if !name.is_empty() => name.to_string(),
      _ => hostname::get()
        .map_err(|e| BuildError::NodeIdentity(e.to_string()))?
        .to_string_lossy()
        .into_owned(),
    };
    let ip = match ip {
      Some(ip) => ip,
      None => outbound_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    };
    debug!(%hostname, %ip, "Resolved node identity.");
    Ok(Self { hostname, ip })
  }

  /// The `ip:hostname` form used in process keys and once-run keys.
  pub fn id(&self) -> String {
    format!("{}:{}", self.ip, self.hostname)
  }

  /// Whether this node is named by `allowed`. An empty list allows every node.
  pub fn matches(&self, allowed: &[String]) -> bool {
    if allowed.is_empty() {
      return true;
    }
    let ip = self.ip.to_string();
    let id = self.id();
    allowed
      .iter()
      .map(|n| n.trim())
      .any(|n| n == self.hostname || n == ip || n == id)
  }

  /// Low 16 bits of the IPv4 address (or the last two bytes of an IPv6 one).
  pub fn machine_id(&self) -> u16 {
    match self.ip {
      IpAddr::V4(v4) => {
        let [_, _, c, d] = v4.octets();
        u16::from_be_bytes([c, d])
      }
      IpAddr::V6(v6) => {
        let octets = v6.octets();
        u16::from_be_bytes([octets[14], octets[15]])
      }
    }
  }
}

impl fmt::Display for NodeIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.id())
  }
}

// No packet is sent; connecting a UDP socket only selects the route.
fn outbound_ip() -> Option<IpAddr> {
  let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
  socket.connect("8.8.8.8:80").ok()?;
  socket.local_addr().ok().map(|addr| addr.ip())
}
