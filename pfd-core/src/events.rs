//! Broadcast notifications consumed by UI components.

use tokio::sync::broadcast;

use crate::carrier::PeerId;
use crate::error::ErrorCode;

/// `AgentStatusChanged` status meaning ready/normal.
pub const AGENT_READY: i32 = 0;

/// Per-peer forwarding status.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ForwardingStatus {
    Ready,
    InProgress,
    Offline,
    SessionRefused,
    Error(ErrorCode),
}

impl ForwardingStatus {
    pub const READY: i32 = 0;
    pub const IN_PROGRESS: i32 = 1;
    pub const OFFLINE: i32 = 2;
    pub const SESSION_REFUSED: i32 = 3;

    /// Wire value: `0..=3` or the raw transport error code.
    pub fn code(self) -> i32 {
        match self {
            ForwardingStatus::Ready => Self::READY,
            ForwardingStatus::InProgress => Self::IN_PROGRESS,
            ForwardingStatus::Offline => Self::OFFLINE,
            ForwardingStatus::SessionRefused => Self::SESSION_REFUSED,
            ForwardingStatus::Error(code) => code.code(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AgentEvent {
    /// `status` is [`AGENT_READY`] or a negative transport error code.
    /// `on_ready` is set only on the event sent when the transport handshake completes,
    /// so listeners can tell first readiness apart from later re-announcements.
    AgentStatusChanged { status: i32, on_ready: bool },
    ServerListChanged,
    ServerInfoChanged { peer: PeerId },
    ServerStatusChanged { peer: PeerId, status: ForwardingStatus },
}

/// Fan-out of [`AgentEvent`]s. Sending never blocks; events without subscribers are dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        tracing::debug!("event {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn agent_status(&self, status: i32, on_ready: bool) {
        self.emit(AgentEvent::AgentStatusChanged { status, on_ready });
    }

    pub fn server_list_changed(&self) {
        self.emit(AgentEvent::ServerListChanged);
    }

    pub fn server_info_changed(&self, peer: &PeerId) {
        self.emit(AgentEvent::ServerInfoChanged { peer: peer.clone() });
    }

    pub fn server_status(&self, peer: &PeerId, status: ForwardingStatus) {
        self.emit(AgentEvent::ServerStatusChanged {
            peer: peer.clone(),
            status,
        });
    }
}
