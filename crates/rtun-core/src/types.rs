use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conn-id scoped to one [`ClientSession`](crate::transport::Connection): unique for the
/// lifetime of the session, never reused.
pub type ConnId = Uuid;

/// Name of a routing group. Private Clients register under a `GroupId`; the Gateway
/// dispatches inbound proxy requests to whichever group the request names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    pub const MAX_LEN: usize = 255;

    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidGroupId> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(InvalidGroupId { value: raw });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GroupId {
    type Error = InvalidGroupId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GroupId> for String {
    fn from(value: GroupId) -> Self {
        value.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct InvalidGroupId {
    pub value: String,
}

impl fmt::Display for InvalidGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group id {:?} must be 1..={} bytes", self.value, GroupId::MAX_LEN)
    }
}

impl std::error::Error for InvalidGroupId {}

/// Identifies one connected Private Client process within a group. Unique within the
/// lifetime of the Gateway process; clients reconnecting after a drop are assigned a
/// fresh id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generates a fresh random id, as a client does at startup before handshaking.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-layer protocol of a virtual connection or forwarded port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// The destination a `CONNECT` frame asks a Private Client to dial, or the local bind
/// target of a forwarded port. Mirrors the three address forms a SOCKS5/CONNECT request
/// can carry: a hostname to resolve, or a literal IPv4/IPv6 address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetAddr {
    Domain(String, u16),
    IPv4(Ipv4Addr, u16),
    IPv6(Ipv6Addr, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Domain(_, port) => *port,
            TargetAddr::IPv4(_, port) => *port,
            TargetAddr::IPv6(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            TargetAddr::Domain(host, _) => host.clone(),
            TargetAddr::IPv4(ip, _) => ip.to_string(),
            TargetAddr::IPv6(ip, _) => ip.to_string(),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
            TargetAddr::IPv4(ip, port) => write!(f, "{ip}:{port}"),
            TargetAddr::IPv6(ip, port) => write!(f, "[{ip}]:{port}"),
        }
    }
}

impl From<(Ipv4Addr, u16)> for TargetAddr {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        TargetAddr::IPv4(ip, port)
    }
}

impl From<(Ipv6Addr, u16)> for TargetAddr {
    fn from((ip, port): (Ipv6Addr, u16)) -> Self {
        TargetAddr::IPv6(ip, port)
    }
}

/// Specifies one reverse-forwarded port a Private Client has asked the Gateway to open
/// on its behalf (component H).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPortSpec {
    pub remote_port: u16,
    pub protocol: Protocol,
    pub local_host: String,
    pub local_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_rejects_empty_and_oversized() {
        assert!(GroupId::new("").is_err());
        assert!(GroupId::new("a".repeat(256)).is_err());
        assert!(GroupId::new("ok").is_ok());
    }

    #[test]
    fn target_addr_display() {
        assert_eq!(TargetAddr::Domain("example.com".into(), 443).to_string(), "example.com:443");
        assert_eq!(
            TargetAddr::IPv6(Ipv6Addr::LOCALHOST, 22).to_string(),
            "[::1]:22"
        );
    }
}
