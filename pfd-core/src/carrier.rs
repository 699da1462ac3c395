//! Boundary to the peer network transport (carrier): value types and the traits the host implements.
//!
//! The agent never performs network I/O itself. The host wires a transport library behind
//! [`Connector`], [`Carrier`], [`SessionManager`] and [`Session`], and delivers the transport's
//! asynchronous callbacks back through [`crate::PeerRegistry`]'s `on_*` methods.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::BootstrapNode;
use crate::error::ErrorCode;

/// Stable opaque identity of a network peer.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Availability reported by the peer itself. `None` means available.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum PresenceStatus {
    #[default]
    None,
    Away,
    Busy,
}

/// Transport-level reachability.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

/// Immutable snapshot of a friend as reported by the transport.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FriendInfo {
    pub id: PeerId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub presence: PresenceStatus,
    #[serde(default)]
    pub connection: ConnectionStatus,
}

impl FriendInfo {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            presence: PresenceStatus::None,
            connection: ConnectionStatus::Disconnected,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_presence(mut self, presence: PresenceStatus) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionStatus) -> Self {
        self.connection = connection;
        self
    }

    /// Online means transport-connected and present.
    pub fn is_online(&self) -> bool {
        self.connection == ConnectionStatus::Connected && self.presence == PresenceStatus::None
    }
}

/// Local identity as stored by the transport.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
}

/// Stream states reported by the transport.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum StreamState {
    Raw,
    Initialized,
    TransportReady,
    Connecting,
    Connected,
    Deactivated,
    Closed,
    Error,
}

/// Handle of a stream inside a session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct StreamId(pub i32);

/// Handle of an open port-forwarding tunnel on a stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TunnelId(pub i32);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreamOptions {
    pub multiplexing: bool,
    pub port_forwarding: bool,
    pub reliable: bool,
}

impl StreamOptions {
    /// Multiplexed, reliable, forwarding-capable stream.
    pub fn port_forwarding() -> Self {
        Self {
            multiplexing: true,
            port_forwarding: true,
            reliable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PortForwardingProtocol {
    Tcp,
}

/// Options used to construct the network client.
#[derive(Debug, Clone, Default)]
pub struct CarrierOptions {
    pub persistent_location: std::path::PathBuf,
    pub udp_enabled: bool,
    pub bootstraps: Vec<BootstrapNode>,
}

/// Builds the network client. Implemented by the host.
pub trait Connector: Send + Sync {
    fn connect(&self, options: &CarrierOptions) -> Result<Arc<dyn Carrier>, ErrorCode>;
}

/// Network client: identity, friends, and access to sessions.
pub trait Carrier: Send + Sync {
    /// Begin connecting; the transport retries internally every `interval_ms`.
    fn start(&self, interval_ms: u32) -> Result<(), ErrorCode>;
    fn self_info(&self) -> Result<UserInfo, ErrorCode>;
    fn set_self_info(&self, info: &UserInfo) -> Result<(), ErrorCode>;
    fn is_friend(&self, peer: &PeerId) -> bool;
    fn add_friend(&self, peer: &PeerId, hello: &str) -> Result<(), ErrorCode>;
    fn remove_friend(&self, peer: &PeerId) -> Result<(), ErrorCode>;
    fn session_manager(&self) -> Result<Arc<dyn SessionManager>, ErrorCode>;
    fn kill(&self);
}

pub trait SessionManager: Send + Sync {
    fn new_session(&self, peer: &PeerId) -> Result<Box<dyn Session>, ErrorCode>;
    /// Release every session the manager still tracks.
    fn cleanup(&self);
}

/// One negotiated session to a peer. Owned exclusively by a single peer record.
///
/// Stream state changes and request completion are asynchronous and arrive through
/// [`crate::PeerRegistry::on_stream_state_changed`] and
/// [`crate::PeerRegistry::on_session_request_complete`].
pub trait Session: Send {
    fn add_stream(&mut self, options: StreamOptions) -> Result<StreamId, ErrorCode>;
    fn request(&mut self) -> Result<(), ErrorCode>;
    fn start(&mut self, sdp: &str) -> Result<(), ErrorCode>;
    fn open_port_forwarding(
        &mut self,
        stream: StreamId,
        service: &str,
        protocol: PortForwardingProtocol,
        host: &str,
        port: u16,
    ) -> Result<TunnelId, ErrorCode>;
    fn close_port_forwarding(&mut self, stream: StreamId, tunnel: TunnelId)
        -> Result<(), ErrorCode>;
    /// Closes the session, its streams and every tunnel on them.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_requires_connected_and_available() {
        let info = FriendInfo::new("peer-a");
        assert!(!info.is_online());
        let info = info.with_connection(ConnectionStatus::Connected);
        assert!(info.is_online());
        let info = info.with_presence(PresenceStatus::Away);
        assert!(!info.is_online());
    }

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let id = PeerId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
