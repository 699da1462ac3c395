//! Error taxonomy: transport error codes, their classes, and agent-level errors.

use std::fmt;

use crate::carrier::PeerId;

/// Raw error code reported by the transport library.
///
/// Codes live in the general facility (`0x81xxxxxx`), so they are negative as `i32`.
/// They reach UI components unchanged through status notifications.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ErrorCode(pub i32);

const fn general(code: u32) -> ErrorCode {
    ErrorCode((0x8100_0000u32 | code) as i32)
}

impl ErrorCode {
    pub const INVALID_ARGS: ErrorCode = general(0x01);
    pub const OUT_OF_MEMORY: ErrorCode = general(0x02);
    pub const NOT_READY: ErrorCode = general(0x09);
    pub const NOT_EXIST: ErrorCode = general(0x0A);
    /// Friend request to this peer was already sent and is pending.
    pub const ALREADY_REQUESTED: ErrorCode = general(0x0C);
    pub const WRONG_STATE: ErrorCode = general(0x0F);
    pub const BUSY: ErrorCode = general(0x10);
    pub const PORT_ALLOC: ErrorCode = general(0x17);
    pub const TIMEOUT: ErrorCode = general(0x1B);
    pub const BAD_ADDRESS: ErrorCode = general(0x1E);
    pub const UNREACHABLE: ErrorCode = general(0x23);
    pub const PEER_OFFLINE: ErrorCode = general(0x24);
    pub const UNKNOWN: ErrorCode = general(0x7F);

    pub fn code(self) -> i32 {
        self.0
    }

    /// How a call site should react to this code.
    pub fn class(self) -> ErrorClass {
        match self {
            Self::NOT_READY | Self::BUSY | Self::TIMEOUT => ErrorClass::Retryable,
            Self::NOT_EXIST | Self::UNREACHABLE | Self::PEER_OFFLINE => ErrorClass::PeerOffline,
            _ => ErrorClass::FatalToSession,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0 as u32)
    }
}

impl std::error::Error for ErrorCode {}

/// Classification of transport errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorClass {
    /// Transient; the same call may succeed later without tearing anything down.
    Retryable,
    /// The remote peer cannot be reached right now.
    PeerOffline,
    /// The session (and its stream and tunnel) is unusable.
    FatalToSession,
}

/// Errors returned synchronously by the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("network initialization failed: {0}")]
    NetworkInit(String),
    #[error("agent not initialized")]
    NotInitialized,
    #[error("peer already paired")]
    AlreadyPaired,
    #[error("friend request failed ({0})")]
    Auth(ErrorCode),
    #[error("invalid forwarding port {0}")]
    InvalidPort(u16),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("transport error ({0})")]
    Transport(ErrorCode),
    #[error("agent storage: {0}")]
    Storage(#[from] std::io::Error),
}

impl From<ErrorCode> for AgentError {
    fn from(code: ErrorCode) -> Self {
        AgentError::Transport(code)
    }
}
