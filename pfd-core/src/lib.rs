//! Peer-to-peer port-forwarding agent.
//! Host-driven: the host implements the transport traits and feeds transport callbacks in;
//! the agent drives sessions, tunnels and persisted selection, and broadcasts status events.

pub mod agent;
pub mod carrier;
pub mod config;
pub mod error;
pub mod events;
pub mod ffi;
pub mod hash;
pub mod prefs;
pub mod server;

#[cfg(test)]
mod mock;

pub use agent::PeerRegistry;
pub use carrier::{
    Carrier, ConnectionStatus, Connector, FriendInfo, PeerId, PresenceStatus, Session,
    SessionManager, StreamId, StreamState, TunnelId, UserInfo,
};
pub use config::{AgentOptions, BootstrapConfig, BootstrapNode};
pub use error::{AgentError, ErrorClass, ErrorCode};
pub use events::{AgentEvent, ForwardingStatus, AGENT_READY};
pub use hash::hash_password;
pub use prefs::{FilePreferences, MemoryPreferences, PreferenceStore};
pub use server::{PeerRecord, PeerSnapshot};
