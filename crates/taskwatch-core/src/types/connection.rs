//! Network socket items.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketFamily {
    Ipv4,
    Ipv6,
}

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

/// Socket state as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Listen,
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Closing,
    Unknown,
}

impl ConnectionState {
    /// Label used in connection descriptors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Listen => "listen",
            Self::Established => "established",
            Self::SynSent => "syn_sent",
            Self::SynRecv => "syn_recv",
            Self::FinWait1 => "fin_wait1",
            Self::FinWait2 => "fin_wait2",
            Self::TimeWait => "time_wait",
            Self::Close => "close",
            Self::CloseWait => "close_wait",
            Self::LastAck => "last_ack",
            Self::Closing => "closing",
            Self::Unknown => "unknown",
        }
    }
}

/// An open socket owned by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Local bind address
    pub local_addr: IpAddr,
    /// Local port
    pub local_port: u16,
    /// Remote peer address (unspecified for listeners)
    pub remote_addr: IpAddr,
    /// Remote peer port (0 for listeners)
    pub remote_port: u16,
    /// IPv4 or IPv6
    pub family: SocketFamily,
    /// TCP or UDP
    pub transport: Transport,
    /// Kernel socket state
    pub state: ConnectionState,
    /// Socket inode, used to join fd targets with the socket tables
    pub inode: u64,
}

impl Connection {
    /// Build from a pair of socket addresses; family follows the local side.
    #[must_use]
    pub const fn new(
        local: SocketAddr,
        remote: SocketAddr,
        transport: Transport,
        state: ConnectionState,
        inode: u64,
    ) -> Self {
        let family = if local.is_ipv4() {
            SocketFamily::Ipv4
        } else {
            SocketFamily::Ipv6
        };
        Self {
            local_addr: local.ip(),
            local_port: local.port(),
            remote_addr: remote.ip(),
            remote_port: remote.port(),
            family,
            transport,
            state,
            inode,
        }
    }

    /// Whether a remote peer is attached.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        !self.remote_addr.is_unspecified() || self.remote_port != 0
    }

    /// Human-readable descriptor, e.g. `tcp 10.0.0.2:51234 -> 1.1.1.1:443 (established)`.
    #[must_use]
    pub fn descriptor(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match (self.transport, self.family) {
            (Transport::Tcp, SocketFamily::Ipv4) => "tcp",
            (Transport::Tcp, SocketFamily::Ipv6) => "tcp6",
            (Transport::Udp, SocketFamily::Ipv4) => "udp",
            (Transport::Udp, SocketFamily::Ipv6) => "udp6",
        };
        write!(
            f,
            "{proto} {}",
            SocketAddr::new(self.local_addr, self.local_port)
        )?;
        if self.has_remote() {
            write!(
                f,
                " -> {}",
                SocketAddr::new(self.remote_addr, self.remote_port)
            )?;
        }
        write!(f, " ({})", self.state.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_for_listener_omits_remote() {
        let c = Connection::new(
            "0.0.0.0:22".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
            Transport::Tcp,
            ConnectionState::Listen,
            42,
        );
        assert_eq!(c.descriptor(), "tcp 0.0.0.0:22 (listen)");
        assert_eq!(c.family, SocketFamily::Ipv4);
    }

    #[test]
    fn descriptor_for_established_ipv6() {
        let c = Connection::new(
            "[::1]:5000".parse().unwrap(),
            "[::1]:443".parse().unwrap(),
            Transport::Tcp,
            ConnectionState::Established,
            7,
        );
        assert_eq!(c.descriptor(), "tcp6 [::1]:5000 -> [::1]:443 (established)");
    }
}
