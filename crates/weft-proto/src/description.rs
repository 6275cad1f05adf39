//! Connection descriptions.
//!
//! A description says how to reach a node: the transport, the address and a
//! bandwidth hint. Descriptions travel in handshake packets and are read
//! from the `[[listen]]` configuration section.

use std::fmt;

use bytes::BufMut;

use crate::error::{ProtocolError, Result};
use crate::wire::{WireDecode, WireEncode};

/// Transport of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u32)]
pub enum ConnectionType {
    /// TCP/IP stream socket.
    #[default]
    Tcp = 0,
    /// In-process byte pipe.
    Pipe = 1,
    /// Multicast group; described but not connectable.
    Multicast = 2,
}

impl ConnectionType {
    /// Parse the raw wire value.
    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Tcp),
            1 => Ok(Self::Pipe),
            2 => Ok(Self::Multicast),
            other => Err(ProtocolError::InvalidValue {
                field: "connection_type",
                value: u64::from(other),
            }),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Pipe => "pipe",
            Self::Multicast => "multicast",
        })
    }
}

/// A multicast group address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MulticastGroup {
    /// Group address.
    pub address: String,
    /// Group port.
    pub port: u16,
}

/// How to reach one endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionDescription {
    /// Transport.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub connection_type: ConnectionType,
    /// Host name or address.
    pub hostname: String,
    /// Port; zero lets the OS choose when listening.
    pub port: u16,
    /// Bandwidth hint in KB/s.
    pub bandwidth: u32,
    /// Multicast group shared with other nodes, if any.
    pub multicast: Option<MulticastGroup>,
}

impl Default for ConnectionDescription {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Tcp,
            hostname: "127.0.0.1".to_string(),
            port: 0,
            bandwidth: 102_400,
            multicast: None,
        }
    }
}

impl ConnectionDescription {
    /// A TCP description for `hostname:port`.
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ..Self::default()
        }
    }

    /// A pipe description.
    pub fn pipe() -> Self {
        Self {
            connection_type: ConnectionType::Pipe,
            hostname: String::new(),
            ..Self::default()
        }
    }

    /// `host:port` for socket APIs.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Whether two descriptions name the same multicast group.
    pub fn same_group(&self, other: &Self) -> bool {
        match (&self.multicast, &other.multicast) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.connection_type, self.hostname, self.port)?;
        if let Some(group) = &self.multicast {
            write!(f, " mc {}:{}", group.address, group.port)?;
        }
        Ok(())
    }
}

impl WireEncode for MulticastGroup {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.address.encode(buf);
        self.port.encode(buf);
    }
}

impl WireDecode for MulticastGroup {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            address: String::decode(buf)?,
            port: u16::decode(buf)?,
        })
    }
}

impl WireEncode for ConnectionDescription {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        (self.connection_type as u32).encode(buf);
        self.hostname.encode(buf);
        self.port.encode(buf);
        self.bandwidth.encode(buf);
        self.multicast.encode(buf);
    }
}

impl WireDecode for ConnectionDescription {
    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            connection_type: ConnectionType::from_u32(u32::decode(buf)?)?,
            hostname: String::decode(buf)?,
            port: u16::decode(buf)?,
            bandwidth: u32::decode(buf)?,
            multicast: Option::<MulticastGroup>::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mut desc = ConnectionDescription::tcp("10.0.0.1", 4242);
        assert_eq!(desc.to_string(), "tcp://10.0.0.1:4242");
        desc.multicast = Some(MulticastGroup {
            address: "239.255.42.43".into(),
            port: 4343,
        });
        assert_eq!(desc.to_string(), "tcp://10.0.0.1:4242 mc 239.255.42.43:4343");
    }

    #[test]
    fn test_same_group() {
        let group = MulticastGroup {
            address: "239.0.0.1".into(),
            port: 1,
        };
        let mut a = ConnectionDescription::tcp("a", 1);
        let mut b = ConnectionDescription::tcp("b", 2);
        assert!(!a.same_group(&b));
        a.multicast = Some(group.clone());
        b.multicast = Some(group);
        assert!(a.same_group(&b));
    }

    #[test]
    fn test_wire_round_trip_keeps_group() {
        let mut desc = ConnectionDescription::pipe();
        desc.multicast = Some(MulticastGroup {
            address: "239.1.2.3".into(),
            port: 9,
        });
        let bytes = desc.to_wire();
        let mut slice = bytes.as_slice();
        assert_eq!(ConnectionDescription::decode(&mut slice).unwrap(), desc);
    }

    #[test]
    fn test_bad_connection_type() {
        assert!(ConnectionType::from_u32(9).is_err());
    }
}
