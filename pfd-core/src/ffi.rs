//! C ABI for linking pfd-core as a static library from Android (NDK) or other C/C++ hosts.
//! The JNI glue fills a [`PfdCarrierVTable`] with its transport binding, forwards transport
//! callbacks through the `pfd_agent_on_*` functions and drains notifications with
//! [`pfd_agent_poll_event`].
//!
//! Conventions: transport functions return `>= 0` on success and a negative transport error
//! code otherwise. Exported functions return -1 on null or malformed arguments.

use std::ffi::{c_char, c_void, CStr, CString};
use std::os::raw::c_int;
use std::slice;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::carrier::{
    Carrier, CarrierOptions, ConnectionStatus, Connector, FriendInfo, PeerId,
    PortForwardingProtocol, PresenceStatus, Session, SessionManager, StreamId, StreamOptions,
    StreamState, TunnelId, UserInfo,
};
use crate::config::AgentOptions;
use crate::error::{AgentError, ErrorCode};
use crate::events::AgentEvent;
use crate::hash::hash_password;
use crate::prefs::FilePreferences;
use crate::PeerRegistry;

/// Stream option bits passed to `add_stream`.
pub const PFD_STREAM_MULTIPLEXING: u32 = 0x01;
pub const PFD_STREAM_PORT_FORWARDING: u32 = 0x02;
pub const PFD_STREAM_RELIABLE: u32 = 0x04;

/// Event kinds written by [`pfd_agent_poll_event`].
pub const PFD_EVENT_AGENT_STATUS: c_int = 1;
pub const PFD_EVENT_SERVER_LIST: c_int = 2;
pub const PFD_EVENT_SERVER_INFO: c_int = 3;
pub const PFD_EVENT_SERVER_STATUS: c_int = 4;

const PEER_BUF: usize = 128;

/// Transport binding supplied by the host. `ctx` is passed back on every call and must be
/// usable from any thread.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PfdCarrierVTable {
    pub ctx: *mut c_void,
    /// `bootstraps_json` is a JSON array of `{ipv4, ipv6, port, public_key}`.
    pub create: extern "C" fn(
        ctx: *mut c_void,
        persistent_location: *const c_char,
        udp_enabled: c_int,
        bootstraps_json: *const c_char,
    ) -> c_int,
    pub start: extern "C" fn(ctx: *mut c_void, interval_ms: u32) -> c_int,
    /// Writes the local user id; returns bytes written.
    pub self_id: extern "C" fn(ctx: *mut c_void, out_buf: *mut u8, out_len: usize) -> c_int,
    /// Writes the local display name; returns bytes written.
    pub self_name: extern "C" fn(ctx: *mut c_void, out_buf: *mut u8, out_len: usize) -> c_int,
    pub set_self_name: extern "C" fn(ctx: *mut c_void, name: *const c_char) -> c_int,
    /// 1 if friend, 0 otherwise.
    pub is_friend: extern "C" fn(ctx: *mut c_void, peer: *const c_char) -> c_int,
    pub add_friend:
        extern "C" fn(ctx: *mut c_void, peer: *const c_char, hello: *const c_char) -> c_int,
    pub remove_friend: extern "C" fn(ctx: *mut c_void, peer: *const c_char) -> c_int,
    /// Returns a positive session handle.
    pub new_session: extern "C" fn(ctx: *mut c_void, peer: *const c_char) -> i64,
    /// Returns a positive stream id.
    pub add_stream: extern "C" fn(ctx: *mut c_void, session: i64, options: u32) -> c_int,
    pub session_request: extern "C" fn(ctx: *mut c_void, session: i64) -> c_int,
    pub session_start: extern "C" fn(ctx: *mut c_void, session: i64, sdp: *const c_char) -> c_int,
    /// Returns a positive tunnel id.
    pub open_port_forwarding: extern "C" fn(
        ctx: *mut c_void,
        session: i64,
        stream: c_int,
        service: *const c_char,
        host: *const c_char,
        port: u16,
    ) -> c_int,
    pub close_port_forwarding:
        extern "C" fn(ctx: *mut c_void, session: i64, stream: c_int, tunnel: c_int) -> c_int,
    pub session_close: extern "C" fn(ctx: *mut c_void, session: i64),
    pub cleanup: extern "C" fn(ctx: *mut c_void),
    pub kill: extern "C" fn(ctx: *mut c_void),
}

/// Notification copied out to the host.
#[repr(C)]
pub struct PfdEvent {
    pub kind: c_int,
    pub status: c_int,
    pub on_ready: c_int,
    /// NUL-terminated peer id (empty when the event has none).
    pub peer: [u8; PEER_BUF],
}

#[derive(Clone, Copy)]
struct HostTransport {
    vt: PfdCarrierVTable,
}

// The host guarantees that `ctx` and every vtable function are thread-safe.
unsafe impl Send for HostTransport {}
unsafe impl Sync for HostTransport {}

fn check(rc: c_int) -> Result<c_int, ErrorCode> {
    if rc < 0 {
        Err(ErrorCode(rc))
    } else {
        Ok(rc)
    }
}

fn c_string(s: &str) -> Result<CString, ErrorCode> {
    CString::new(s).map_err(|_| ErrorCode::INVALID_ARGS)
}

impl HostTransport {
    fn read_string(
        &self,
        f: extern "C" fn(*mut c_void, *mut u8, usize) -> c_int,
    ) -> Result<String, ErrorCode> {
        let mut buf = vec![0u8; 256];
        let n = check(f(self.vt.ctx, buf.as_mut_ptr(), buf.len()))? as usize;
        buf.truncate(n.min(256));
        String::from_utf8(buf).map_err(|_| ErrorCode::INVALID_ARGS)
    }
}

impl Connector for HostTransport {
    fn connect(&self, options: &CarrierOptions) -> Result<Arc<dyn Carrier>, ErrorCode> {
        let location = c_string(&options.persistent_location.to_string_lossy())?;
        let bootstraps = serde_json::to_string(&options.bootstraps)
            .map_err(|_| ErrorCode::INVALID_ARGS)
            .and_then(|s| c_string(&s))?;
        check((self.vt.create)(
            self.vt.ctx,
            location.as_ptr(),
            options.udp_enabled as c_int,
            bootstraps.as_ptr(),
        ))?;
        Ok(Arc::new(*self))
    }
}

impl Carrier for HostTransport {
    fn start(&self, interval_ms: u32) -> Result<(), ErrorCode> {
        check((self.vt.start)(self.vt.ctx, interval_ms)).map(drop)
    }

    fn self_info(&self) -> Result<UserInfo, ErrorCode> {
        Ok(UserInfo {
            id: self.read_string(self.vt.self_id)?,
            name: self.read_string(self.vt.self_name)?,
        })
    }

    fn set_self_info(&self, info: &UserInfo) -> Result<(), ErrorCode> {
        let name = c_string(&info.name)?;
        check((self.vt.set_self_name)(self.vt.ctx, name.as_ptr())).map(drop)
    }

    fn is_friend(&self, peer: &PeerId) -> bool {
        match c_string(peer.as_str()) {
            Ok(p) => (self.vt.is_friend)(self.vt.ctx, p.as_ptr()) == 1,
            Err(_) => false,
        }
    }

    fn add_friend(&self, peer: &PeerId, hello: &str) -> Result<(), ErrorCode> {
        let p = c_string(peer.as_str())?;
        let h = c_string(hello)?;
        check((self.vt.add_friend)(self.vt.ctx, p.as_ptr(), h.as_ptr())).map(drop)
    }

    fn remove_friend(&self, peer: &PeerId) -> Result<(), ErrorCode> {
        let p = c_string(peer.as_str())?;
        check((self.vt.remove_friend)(self.vt.ctx, p.as_ptr())).map(drop)
    }

    fn session_manager(&self) -> Result<Arc<dyn SessionManager>, ErrorCode> {
        Ok(Arc::new(*self))
    }

    fn kill(&self) {
        (self.vt.kill)(self.vt.ctx)
    }
}

impl SessionManager for HostTransport {
    fn new_session(&self, peer: &PeerId) -> Result<Box<dyn Session>, ErrorCode> {
        let p = c_string(peer.as_str())?;
        let handle = (self.vt.new_session)(self.vt.ctx, p.as_ptr());
        if handle <= 0 {
            return Err(ErrorCode(i32::try_from(handle).unwrap_or(ErrorCode::UNKNOWN.code())));
        }
        Ok(Box::new(HostSession {
            host: *self,
            handle,
        }))
    }

    fn cleanup(&self) {
        (self.vt.cleanup)(self.vt.ctx)
    }
}

struct HostSession {
    host: HostTransport,
    handle: i64,
}

impl Session for HostSession {
    fn add_stream(&mut self, options: StreamOptions) -> Result<StreamId, ErrorCode> {
        let mut bits = 0;
        if options.multiplexing {
            bits |= PFD_STREAM_MULTIPLEXING;
        }
        if options.port_forwarding {
            bits |= PFD_STREAM_PORT_FORWARDING;
        }
        if options.reliable {
            bits |= PFD_STREAM_RELIABLE;
        }
        let vt = &self.host.vt;
        check((vt.add_stream)(vt.ctx, self.handle, bits)).map(StreamId)
    }

    fn request(&mut self) -> Result<(), ErrorCode> {
        let vt = &self.host.vt;
        check((vt.session_request)(vt.ctx, self.handle)).map(drop)
    }

    fn start(&mut self, sdp: &str) -> Result<(), ErrorCode> {
        let vt = &self.host.vt;
        let sdp = c_string(sdp)?;
        check((vt.session_start)(vt.ctx, self.handle, sdp.as_ptr())).map(drop)
    }

    fn open_port_forwarding(
        &mut self,
        stream: StreamId,
        service: &str,
        _protocol: PortForwardingProtocol,
        host: &str,
        port: u16,
    ) -> Result<TunnelId, ErrorCode> {
        let vt = &self.host.vt;
        let service = c_string(service)?;
        let host = c_string(host)?;
        check((vt.open_port_forwarding)(
            vt.ctx,
            self.handle,
            stream.0,
            service.as_ptr(),
            host.as_ptr(),
            port,
        ))
        .map(TunnelId)
    }

    fn close_port_forwarding(
        &mut self,
        stream: StreamId,
        tunnel: TunnelId,
    ) -> Result<(), ErrorCode> {
        let vt = &self.host.vt;
        check((vt.close_port_forwarding)(vt.ctx, self.handle, stream.0, tunnel.0)).map(drop)
    }

    fn close(&mut self) {
        let vt = &self.host.vt;
        (vt.session_close)(vt.ctx, self.handle)
    }
}

struct AgentHandle {
    registry: Arc<PeerRegistry>,
    events: Mutex<broadcast::Receiver<AgentEvent>>,
}

fn handle<'a>(h: *mut c_void) -> Option<&'a AgentHandle> {
    if h.is_null() {
        return None;
    }
    Some(unsafe { &*(h as *const AgentHandle) })
}

fn text<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(p) }.to_str().ok()
}

fn peer_arg(p: *const c_char) -> Option<PeerId> {
    text(p).map(PeerId::new)
}

fn status_of(result: Result<(), AgentError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(AgentError::Transport(code)) | Err(AgentError::Auth(code)) => code.code(),
        Err(_) => -1,
    }
}

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG` (default `info`).
/// Returns 0, or -1 when a subscriber is already installed.
#[no_mangle]
pub extern "C" fn pfd_logging_init() -> c_int {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// SHA-256 of the password as 64 hex chars (not NUL-terminated). Returns 64, or -1 on error.
#[no_mangle]
pub extern "C" fn pfd_hash_password(
    password: *const u8,
    len: usize,
    out_buf: *mut u8,
    out_len: usize,
) -> c_int {
    if password.is_null() || out_buf.is_null() || out_len < 64 {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(password, len) };
    let Ok(password) = std::str::from_utf8(bytes) else {
        return -1;
    };
    let hex = hash_password(password);
    unsafe {
        out_buf.copy_from_nonoverlapping(hex.as_ptr(), hex.len());
    }
    hex.len() as c_int
}

/// Create an agent. `options_json` is a JSON [`AgentOptions`]; preferences are stored in
/// `<data_dir>/elastos.json`. Returns an opaque handle or null on failure.
#[no_mangle]
pub extern "C" fn pfd_agent_create(
    vtable: *const PfdCarrierVTable,
    options_json: *const c_char,
) -> *mut c_void {
    if vtable.is_null() {
        return std::ptr::null_mut();
    }
    let Some(json) = text(options_json) else {
        return std::ptr::null_mut();
    };
    let options: AgentOptions = match serde_json::from_str(json) {
        Ok(o) => o,
        Err(e) => {
            tracing::error!("invalid agent options: {e}");
            return std::ptr::null_mut();
        }
    };
    let transport = HostTransport {
        vt: unsafe { *vtable },
    };
    let prefs = Arc::new(FilePreferences::open(options.data_dir.join("elastos.json")));
    let registry = Arc::new(PeerRegistry::new(options, Arc::new(transport), prefs));
    let events = Mutex::new(registry.subscribe());
    Box::into_raw(Box::new(AgentHandle { registry, events })) as *mut c_void
}

/// Tear the agent down and free it. No-op if h is null.
#[no_mangle]
pub extern "C" fn pfd_agent_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let agent = unsafe { Box::from_raw(h as *mut AgentHandle) };
    agent.registry.teardown();
}

#[no_mangle]
pub extern "C" fn pfd_agent_initialize(h: *mut c_void) -> c_int {
    let Some(agent) = handle(h) else { return -1 };
    status_of(agent.registry.initialize())
}

#[no_mangle]
pub extern "C" fn pfd_agent_start(h: *mut c_void) -> c_int {
    let Some(agent) = handle(h) else { return -1 };
    agent.registry.start();
    0
}

/// Returns 0 when the request was sent, 1 when already paired, a negative transport code
/// when the request failed, or -1.
#[no_mangle]
pub extern "C" fn pfd_agent_pair(
    h: *mut c_void,
    peer: *const c_char,
    password: *const c_char,
) -> c_int {
    let (Some(agent), Some(peer), Some(password)) = (handle(h), peer_arg(peer), text(password))
    else {
        return -1;
    };
    match agent.registry.pair_peer(&peer, password) {
        Err(AgentError::AlreadyPaired) => 1,
        other => status_of(other),
    }
}

#[no_mangle]
pub extern "C" fn pfd_agent_unpair(h: *mut c_void, peer: *const c_char) -> c_int {
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    status_of(agent.registry.unpair_peer(&peer))
}

#[no_mangle]
pub extern "C" fn pfd_agent_set_active(h: *mut c_void, peer: *const c_char) -> c_int {
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    status_of(agent.registry.set_active_peer(&peer))
}

#[no_mangle]
pub extern "C" fn pfd_agent_set_port(h: *mut c_void, peer: *const c_char, port: u16) -> c_int {
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    status_of(agent.registry.set_port(&peer, port))
}

/// Forwarding port of `peer`: the port, 0 when none is chosen yet, or -1.
#[no_mangle]
pub extern "C" fn pfd_agent_port(h: *mut c_void, peer: *const c_char) -> c_int {
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    match agent.registry.peer(&peer) {
        Some(record) => record.port().map(c_int::from).unwrap_or(0),
        None => -1,
    }
}

/// 1 when the tunnel is open, 0 when setup was (re)started, -1 on error.
#[no_mangle]
pub extern "C" fn pfd_agent_ensure_forwarding(h: *mut c_void, peer: *const c_char) -> c_int {
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    match agent.registry.ensure_forwarding(&peer) {
        Ok(open) => open as c_int,
        Err(_) => -1,
    }
}

/// Write the active peer id (NUL-terminated). Returns its length, 0 when none, -1 on error.
#[no_mangle]
pub extern "C" fn pfd_agent_active_peer(h: *mut c_void, out_buf: *mut u8, out_len: usize) -> c_int {
    let Some(agent) = handle(h) else { return -1 };
    if out_buf.is_null() {
        return -1;
    }
    let Some(active) = agent.registry.active_peer() else {
        return 0;
    };
    let bytes = active.as_str().as_bytes();
    if bytes.len() + 1 > out_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        *out_buf.add(bytes.len()) = 0;
    }
    bytes.len() as c_int
}

/// Copy the next notification into `out`. Returns 1 when an event was written, 0 when the
/// queue is empty, -1 on error.
#[no_mangle]
pub extern "C" fn pfd_agent_poll_event(h: *mut c_void, out: *mut PfdEvent) -> c_int {
    let Some(agent) = handle(h) else { return -1 };
    if out.is_null() {
        return -1;
    }
    let Ok(mut rx) = agent.events.lock() else {
        return -1;
    };
    let event = loop {
        match rx.try_recv() {
            Ok(e) => break e,
            Err(TryRecvError::Lagged(n)) => {
                tracing::warn!("host event queue lagged by {n}");
            }
            Err(_) => return 0,
        }
    };
    let mut raw = PfdEvent {
        kind: 0,
        status: 0,
        on_ready: 0,
        peer: [0; PEER_BUF],
    };
    let peer = match &event {
        AgentEvent::AgentStatusChanged { status, on_ready } => {
            raw.kind = PFD_EVENT_AGENT_STATUS;
            raw.status = *status;
            raw.on_ready = *on_ready as c_int;
            None
        }
        AgentEvent::ServerListChanged => {
            raw.kind = PFD_EVENT_SERVER_LIST;
            None
        }
        AgentEvent::ServerInfoChanged { peer } => {
            raw.kind = PFD_EVENT_SERVER_INFO;
            Some(peer)
        }
        AgentEvent::ServerStatusChanged { peer, status } => {
            raw.kind = PFD_EVENT_SERVER_STATUS;
            raw.status = status.code();
            Some(peer)
        }
    };
    if let Some(peer) = peer {
        let bytes = peer.as_str().as_bytes();
        let n = bytes.len().min(PEER_BUF - 1);
        raw.peer[..n].copy_from_slice(&bytes[..n]);
    }
    unsafe {
        out.write(raw);
    }
    1
}

// Transport callbacks.

/// `status`: 0 = connected, 1 = disconnected.
#[no_mangle]
pub extern "C" fn pfd_agent_on_connection(h: *mut c_void, status: c_int) -> c_int {
    let (Some(agent), Some(status)) = (handle(h), connection_of(status)) else {
        return -1;
    };
    agent.registry.on_connection(status);
    0
}

#[no_mangle]
pub extern "C" fn pfd_agent_on_ready(h: *mut c_void) -> c_int {
    let Some(agent) = handle(h) else { return -1 };
    agent.registry.on_ready();
    0
}

/// `friends_json`: JSON array of `{id, name, presence, connection}`.
#[no_mangle]
pub extern "C" fn pfd_agent_on_friends(h: *mut c_void, friends_json: *const c_char) -> c_int {
    let (Some(agent), Some(json)) = (handle(h), text(friends_json)) else {
        return -1;
    };
    match serde_json::from_str::<Vec<FriendInfo>>(json) {
        Ok(friends) => {
            agent.registry.on_friends(friends);
            0
        }
        Err(e) => {
            tracing::error!("invalid friend list: {e}");
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn pfd_agent_on_friend_added(h: *mut c_void, friend_json: *const c_char) -> c_int {
    let (Some(agent), Some(info)) = (handle(h), friend_arg(friend_json)) else {
        return -1;
    };
    agent.registry.on_friend_added(info);
    0
}

#[no_mangle]
pub extern "C" fn pfd_agent_on_friend_info(
    h: *mut c_void,
    peer: *const c_char,
    friend_json: *const c_char,
) -> c_int {
    let (Some(agent), Some(peer), Some(info)) =
        (handle(h), peer_arg(peer), friend_arg(friend_json))
    else {
        return -1;
    };
    agent.registry.on_friend_info_changed(&peer, info);
    0
}

#[no_mangle]
pub extern "C" fn pfd_agent_on_friend_connection(
    h: *mut c_void,
    peer: *const c_char,
    status: c_int,
) -> c_int {
    let (Some(agent), Some(peer), Some(status)) =
        (handle(h), peer_arg(peer), connection_of(status))
    else {
        return -1;
    };
    agent.registry.on_friend_connection(&peer, status);
    0
}

/// `presence`: 0 = none, 1 = away, 2 = busy.
#[no_mangle]
pub extern "C" fn pfd_agent_on_friend_presence(
    h: *mut c_void,
    peer: *const c_char,
    presence: c_int,
) -> c_int {
    let presence = match presence {
        0 => PresenceStatus::None,
        1 => PresenceStatus::Away,
        2 => PresenceStatus::Busy,
        _ => return -1,
    };
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    agent.registry.on_friend_presence(&peer, presence);
    0
}

#[no_mangle]
pub extern "C" fn pfd_agent_on_friend_removed(h: *mut c_void, peer: *const c_char) -> c_int {
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    agent.registry.on_friend_removed(&peer);
    0
}

/// `state`: 0 raw, 1 initialized, 2 transport ready, 3 connecting, 4 connected,
/// 5 deactivated, 6 closed, 7 error. For 7, `error` carries the transport code.
#[no_mangle]
pub extern "C" fn pfd_agent_on_stream_state(
    h: *mut c_void,
    peer: *const c_char,
    stream: c_int,
    state: c_int,
    error: c_int,
) -> c_int {
    let state = match state {
        0 => StreamState::Raw,
        1 => StreamState::Initialized,
        2 => StreamState::TransportReady,
        3 => StreamState::Connecting,
        4 => StreamState::Connected,
        5 => StreamState::Deactivated,
        6 => StreamState::Closed,
        7 => StreamState::Error,
        _ => return -1,
    };
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    if state == StreamState::Error && error < 0 {
        agent
            .registry
            .on_stream_failed(&peer, StreamId(stream), ErrorCode(error));
    } else {
        agent
            .registry
            .on_stream_state_changed(&peer, StreamId(stream), state);
    }
    0
}

/// `stream` is the stream whose session request completed; completions for a replaced
/// stream are ignored.
#[no_mangle]
pub extern "C" fn pfd_agent_on_session_request_complete(
    h: *mut c_void,
    peer: *const c_char,
    stream: c_int,
    status: c_int,
    reason: *const c_char,
    sdp: *const c_char,
) -> c_int {
    let (Some(agent), Some(peer)) = (handle(h), peer_arg(peer)) else {
        return -1;
    };
    agent.registry.on_session_request_complete(
        &peer,
        StreamId(stream),
        status,
        text(reason).unwrap_or(""),
        text(sdp).unwrap_or(""),
    );
    0
}

fn connection_of(status: c_int) -> Option<ConnectionStatus> {
    match status {
        0 => Some(ConnectionStatus::Connected),
        1 => Some(ConnectionStatus::Disconnected),
        _ => None,
    }
}

fn friend_arg(json: *const c_char) -> Option<FriendInfo> {
    let json = text(json)?;
    match serde_json::from_str(json) {
        Ok(info) => Some(info),
        Err(e) => {
            tracing::error!("invalid friend info: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Host side of the vtable: counts calls and hands out ids.
    struct Host {
        next: AtomicI64,
        stream: AtomicI64,
        calls: Mutex<Vec<String>>,
    }

    fn host<'a>(ctx: *mut c_void) -> &'a Host {
        unsafe { &*(ctx as *const Host) }
    }

    fn log(ctx: *mut c_void, call: String) {
        host(ctx).calls.lock().unwrap().push(call);
    }

    fn next(ctx: *mut c_void) -> i64 {
        host(ctx).next.fetch_add(1, Ordering::SeqCst)
    }

    fn cs(p: *const c_char) -> String {
        unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
    }

    extern "C" fn create(
        ctx: *mut c_void,
        _location: *const c_char,
        udp: c_int,
        _bootstraps: *const c_char,
    ) -> c_int {
        log(ctx, format!("create udp={udp}"));
        0
    }
    extern "C" fn start(ctx: *mut c_void, interval: u32) -> c_int {
        log(ctx, format!("start {interval}"));
        0
    }
    extern "C" fn self_id(_ctx: *mut c_void, out: *mut u8, len: usize) -> c_int {
        let id = b"me";
        if len < id.len() {
            return -1;
        }
        unsafe { out.copy_from_nonoverlapping(id.as_ptr(), id.len()) };
        id.len() as c_int
    }
    extern "C" fn self_name(_ctx: *mut c_void, _out: *mut u8, _len: usize) -> c_int {
        0
    }
    extern "C" fn set_self_name(ctx: *mut c_void, name: *const c_char) -> c_int {
        log(ctx, format!("name {}", cs(name)));
        0
    }
    extern "C" fn is_friend(_ctx: *mut c_void, _peer: *const c_char) -> c_int {
        0
    }
    extern "C" fn add_friend(ctx: *mut c_void, peer: *const c_char, hello: *const c_char) -> c_int {
        log(ctx, format!("add {} {}", cs(peer), cs(hello)));
        0
    }
    extern "C" fn remove_friend(_ctx: *mut c_void, _peer: *const c_char) -> c_int {
        0
    }
    extern "C" fn new_session(ctx: *mut c_void, peer: *const c_char) -> i64 {
        log(ctx, format!("session {}", cs(peer)));
        next(ctx)
    }
    extern "C" fn add_stream(ctx: *mut c_void, _session: i64, options: u32) -> c_int {
        log(ctx, format!("stream {options}"));
        let id = next(ctx);
        host(ctx).stream.store(id, Ordering::SeqCst);
        id as c_int
    }
    extern "C" fn session_request(ctx: *mut c_void, _session: i64) -> c_int {
        log(ctx, "request".to_string());
        0
    }
    extern "C" fn session_start(ctx: *mut c_void, _session: i64, sdp: *const c_char) -> c_int {
        log(ctx, format!("start-session {}", cs(sdp)));
        0
    }
    extern "C" fn open_pf(
        ctx: *mut c_void,
        _session: i64,
        _stream: c_int,
        service: *const c_char,
        host: *const c_char,
        port: u16,
    ) -> c_int {
        log(ctx, format!("open {} {}:{port}", cs(service), cs(host)));
        next(ctx) as c_int
    }
    extern "C" fn close_pf(_ctx: *mut c_void, _s: i64, _st: c_int, _t: c_int) -> c_int {
        0
    }
    extern "C" fn session_close(ctx: *mut c_void, _session: i64) {
        log(ctx, "close".to_string());
    }
    extern "C" fn cleanup(_ctx: *mut c_void) {}
    extern "C" fn kill(ctx: *mut c_void) {
        log(ctx, "kill".to_string());
    }

    fn vtable(host: &Host) -> PfdCarrierVTable {
        PfdCarrierVTable {
            ctx: host as *const Host as *mut c_void,
            create,
            start,
            self_id,
            self_name,
            set_self_name,
            is_friend,
            add_friend,
            remove_friend,
            new_session,
            add_stream,
            session_request,
            session_start,
            open_port_forwarding: open_pf,
            close_port_forwarding: close_pf,
            session_close,
            cleanup,
            kill,
        }
    }

    fn poll(h: *mut c_void) -> Vec<(c_int, c_int, String)> {
        let mut out = Vec::new();
        let mut ev = PfdEvent {
            kind: 0,
            status: 0,
            on_ready: 0,
            peer: [0; PEER_BUF],
        };
        while pfd_agent_poll_event(h, &mut ev) == 1 {
            let end = ev.peer.iter().position(|&b| b == 0).unwrap_or(PEER_BUF);
            let peer = String::from_utf8_lossy(&ev.peer[..end]).into_owned();
            out.push((ev.kind, ev.status, peer));
        }
        out
    }

    #[test]
    fn hash_password_abi() {
        let pw = b"abc";
        let mut out = [0u8; 64];
        assert_eq!(pfd_hash_password(pw.as_ptr(), pw.len(), out.as_mut_ptr(), out.len()), 64);
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(pfd_hash_password(pw.as_ptr(), pw.len(), out.as_mut_ptr(), 10), -1);
    }

    #[test]
    fn null_handles_are_rejected() {
        let peer = CString::new("p").unwrap();
        assert_eq!(pfd_agent_start(std::ptr::null_mut()), -1);
        assert_eq!(pfd_agent_set_active(std::ptr::null_mut(), peer.as_ptr()), -1);
        assert_eq!(pfd_agent_on_ready(std::ptr::null_mut()), -1);
        assert!(pfd_agent_create(std::ptr::null(), std::ptr::null()).is_null());
        pfd_agent_destroy(std::ptr::null_mut());
    }

    #[test]
    fn drive_agent_through_abi() {
        let dir = std::env::temp_dir().join(format!("pfd-ffi-{}", uuid::Uuid::new_v4()));
        let host = Host {
            next: AtomicI64::new(1),
            stream: AtomicI64::new(0),
            calls: Mutex::new(Vec::new()),
        };
        let vt = vtable(&host);
        let options = CString::new(
            serde_json::json!({
                "data_dir": &dir,
                "bootstrap_json": "{\"udp_enabled\": true, \"bootstraps\": []}",
                "device_manufacturer": "Acme",
                "device_model": "One",
            })
            .to_string(),
        )
        .unwrap();
        let h = pfd_agent_create(&vt, options.as_ptr());
        assert!(!h.is_null());
        assert_eq!(pfd_agent_initialize(h), 0);
        assert_eq!(pfd_agent_start(h), 0);

        let friends = CString::new(
            r#"[{"id": "srv", "name": "nas", "presence": "None", "connection": "Connected"}]"#,
        )
        .unwrap();
        assert_eq!(pfd_agent_on_connection(h, 0), 0);
        assert_eq!(pfd_agent_on_friends(h, friends.as_ptr()), 0);
        assert_eq!(pfd_agent_on_ready(h), 0);

        let mut active = [0u8; 32];
        assert_eq!(pfd_agent_active_peer(h, active.as_mut_ptr(), active.len()), 3);
        assert_eq!(&active[..4], b"srv\0");

        let peer = CString::new("srv").unwrap();
        let password = CString::new("abc").unwrap();
        assert_eq!(pfd_agent_pair(h, peer.as_ptr(), password.as_ptr()), 1);

        assert_eq!(pfd_agent_set_port(h, peer.as_ptr(), 0), -1);
        assert_eq!(pfd_agent_set_port(h, peer.as_ptr(), 18081), 0);
        assert_eq!(pfd_agent_ensure_forwarding(h, peer.as_ptr()), 0);
        assert!(host.calls.lock().unwrap().contains(&"stream 7".to_string()));
        let stream = host.stream.load(Ordering::SeqCst) as c_int;
        assert!(stream > 0);
        let sdp = CString::new("v=0").unwrap();
        assert_eq!(pfd_agent_on_stream_state(h, peer.as_ptr(), stream, 1, 0), 0);
        assert_eq!(
            pfd_agent_on_session_request_complete(
                h,
                peer.as_ptr(),
                stream,
                0,
                std::ptr::null(),
                sdp.as_ptr()
            ),
            0
        );
        assert_eq!(pfd_agent_on_stream_state(h, peer.as_ptr(), stream, 4, 0), 0);
        assert_eq!(pfd_agent_ensure_forwarding(h, peer.as_ptr()), 1);
        assert_eq!(pfd_agent_port(h, peer.as_ptr()), 18081);

        let events = poll(h);
        assert!(events.contains(&(PFD_EVENT_AGENT_STATUS, 0, String::new())));
        assert!(events.contains(&(PFD_EVENT_SERVER_STATUS, 0, "srv".to_string())));

        pfd_agent_destroy(h);
        let calls = host.calls.lock().unwrap().clone();
        assert!(calls.contains(&"create udp=1".to_string()));
        assert!(calls.contains(&"name Acme One".to_string()));
        assert!(calls.contains(&"open owncloud 127.0.0.1:18081".to_string()));
        assert!(calls.contains(&"start-session v=0".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("kill"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
