//! Per-peer forwarding record: session/stream state machine and local tunnel lifecycle.
//!
//! State moves `Closed -> Initialized -> TransportReady -> Connecting -> Connected` and falls back
//! to `Closed` on `Deactivated`, `Closed` or `Error`. Handles obey:
//! - a tunnel exists only while `Connected`;
//! - a session exists only while not `Closed`.
//!
//! All tunnel opens and closes for one peer happen under the record's mutex, so they are
//! strictly ordered regardless of which callback thread triggers them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::carrier::{
    ConnectionStatus, FriendInfo, PeerId, PortForwardingProtocol, PresenceStatus, Session,
    SessionManager, StreamId, StreamOptions, StreamState, TunnelId,
};
use crate::error::{ErrorClass, ErrorCode};
use crate::events::{EventBus, ForwardingStatus};
use crate::prefs::{self, PreferenceStore};

/// Tunnels always listen on loopback.
pub const LOCAL_HOST: &str = "127.0.0.1";

struct RecordState {
    info: FriendInfo,
    port: Option<u16>,
    state: StreamState,
    session: Option<Box<dyn Session>>,
    stream: Option<StreamId>,
    tunnel: Option<TunnelId>,
}

/// Point-in-time view of a peer for UI layers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub name: String,
    pub presence: PresenceStatus,
    pub connection: ConnectionStatus,
    pub port: Option<u16>,
    pub state: StreamState,
    pub forwarding: bool,
}

/// One known peer (friend) and its forwarding machinery.
pub struct PeerRecord {
    id: PeerId,
    service_name: String,
    prefs: Arc<dyn PreferenceStore>,
    events: EventBus,
    inner: Mutex<RecordState>,
}

impl PeerRecord {
    pub fn new(
        info: FriendInfo,
        service_name: impl Into<String>,
        prefs: Arc<dyn PreferenceStore>,
        events: EventBus,
    ) -> Self {
        let port = load_port(prefs.as_ref(), &info.id);
        Self {
            id: info.id.clone(),
            service_name: service_name.into(),
            prefs,
            events,
            inner: Mutex::new(RecordState {
                info,
                port,
                state: StreamState::Closed,
                session: None,
                stream: None,
                tunnel: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn host(&self) -> &'static str {
        LOCAL_HOST
    }

    pub fn name(&self) -> String {
        self.lock().info.name.clone()
    }

    pub fn port(&self) -> Option<u16> {
        self.lock().port
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    pub fn is_online(&self) -> bool {
        self.lock().info.is_online()
    }

    pub fn info(&self) -> FriendInfo {
        self.lock().info.clone()
    }

    pub fn tunnel(&self) -> Option<TunnelId> {
        self.lock().tunnel
    }

    pub fn has_session(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let st = self.lock();
        PeerSnapshot {
            id: self.id.clone(),
            name: st.info.name.clone(),
            presence: st.info.presence,
            connection: st.info.connection,
            port: st.port,
            state: st.state,
            forwarding: st.tunnel.is_some(),
        }
    }

    /// Replace the friend snapshot. A persisted port, if any, is reloaded.
    pub fn apply_info(&self, info: FriendInfo) {
        let mut st = self.lock();
        if let Some(port) = load_port(self.prefs.as_ref(), &self.id) {
            st.port = Some(port);
        }
        st.info = FriendInfo {
            id: self.id.clone(),
            ..info
        };
    }

    pub fn set_connection(&self, connection: ConnectionStatus) {
        self.lock().info.connection = connection;
    }

    pub fn set_presence(&self, presence: PresenceStatus) {
        self.lock().info.presence = presence;
    }

    /// Start (or refresh) forwarding to this peer.
    ///
    /// Returns the status that was reported, or `None` when a new negotiation was started
    /// and the outcome will arrive through stream callbacks.
    pub fn setup_forwarding(&self, manager: &dyn SessionManager) -> Option<ForwardingStatus> {
        let mut st = self.lock();
        if !st.info.is_online() {
            return Some(self.report(ForwardingStatus::Offline));
        }
        match st.state {
            StreamState::Initialized | StreamState::TransportReady | StreamState::Connecting => {
                Some(self.report(ForwardingStatus::InProgress))
            }
            StreamState::Connected => Some(self.refresh_tunnel(&mut st, false)),
            _ => {
                self.close_locked(&mut st);
                let mut session = match manager.new_session(&self.id) {
                    Ok(s) => s,
                    Err(code) => {
                        tracing::error!("new session to {} failed ({code})", self.id);
                        return Some(self.report(ForwardingStatus::Error(code)));
                    }
                };
                match session.add_stream(StreamOptions::port_forwarding()) {
                    Ok(stream) => {
                        tracing::info!("session to {} created, stream {:?}", self.id, stream);
                        st.session = Some(session);
                        st.stream = Some(stream);
                        st.state = StreamState::Initialized;
                        None
                    }
                    Err(code) => {
                        tracing::error!("add stream to {} failed ({code})", self.id);
                        session.close();
                        Some(self.report(ForwardingStatus::Error(code)))
                    }
                }
            }
        }
    }

    /// True when a tunnel is open; otherwise kicks off [`Self::setup_forwarding`].
    pub fn ensure_forwarding(&self, manager: &dyn SessionManager) -> bool {
        if self.lock().tunnel.is_some() {
            return true;
        }
        self.setup_forwarding(manager);
        false
    }

    /// Stream state callback. Events for a stream this record no longer owns are dropped.
    pub fn on_stream_state(&self, stream: StreamId, state: StreamState) {
        if state == StreamState::Error {
            self.on_stream_failed(stream, ErrorCode::UNKNOWN);
            return;
        }
        let mut st = self.lock();
        if st.stream != Some(stream) {
            tracing::debug!("{}: ignoring {:?} for stale stream {:?}", self.id, state, stream);
            return;
        }
        tracing::info!("{}: stream {:?} -> {:?}", self.id, stream, state);
        let result = match state {
            StreamState::Initialized => {
                self.close_tunnel(&mut st);
                st.state = StreamState::Initialized;
                match st.session.as_mut() {
                    Some(session) => session.request().map(|()| {
                        tracing::info!("session request to {} sent", self.id);
                    }),
                    None => Err(ErrorCode::WRONG_STATE),
                }
            }
            StreamState::TransportReady => {
                self.close_tunnel(&mut st);
                st.state = StreamState::TransportReady;
                Ok(())
            }
            StreamState::Connecting => {
                self.close_tunnel(&mut st);
                st.state = StreamState::Connecting;
                Ok(())
            }
            StreamState::Connected => {
                st.state = StreamState::Connected;
                self.open_tunnel(&mut st, false).map(|()| {
                    self.report(ForwardingStatus::Ready);
                })
            }
            StreamState::Deactivated | StreamState::Closed => {
                self.close_locked(&mut st);
                Ok(())
            }
            StreamState::Raw | StreamState::Error => Ok(()),
        };
        if let Err(code) = result {
            tracing::error!("{}: stream transition to {:?} failed ({code})", self.id, state);
            self.close_locked(&mut st);
            self.report(ForwardingStatus::Error(code));
        }
    }

    /// The stream entered its error state with `code`.
    pub fn on_stream_failed(&self, stream: StreamId, code: ErrorCode) {
        let mut st = self.lock();
        if st.stream != Some(stream) {
            return;
        }
        tracing::warn!("{}: stream {:?} error ({code})", self.id, stream);
        self.close_locked(&mut st);
        self.report(ForwardingStatus::Error(code));
    }

    /// Completion of the session request sent when `stream` reached `Initialized`.
    /// Completions for a session this record no longer owns are dropped.
    pub fn on_request_complete(&self, stream: StreamId, status: i32, reason: &str, sdp: &str) {
        let mut st = self.lock();
        if st.stream != Some(stream) {
            tracing::debug!(
                "{}: ignoring request completion for stale stream {:?}",
                self.id,
                stream
            );
            return;
        }
        let Some(session) = st.session.as_mut() else {
            tracing::debug!("{}: request completion without session", self.id);
            return;
        };
        if status != 0 {
            tracing::info!("session request to {} refused ({status}: {reason})", self.id);
            self.close_locked(&mut st);
            self.report(ForwardingStatus::SessionRefused);
            return;
        }
        match session.start(sdp) {
            Ok(()) => tracing::info!("session to {} started", self.id),
            Err(code) => {
                tracing::error!("session start to {} failed ({code})", self.id);
                self.close_locked(&mut st);
                let status = match code.class() {
                    ErrorClass::PeerOffline => ForwardingStatus::Offline,
                    _ => ForwardingStatus::Error(code),
                };
                self.report(status);
            }
        }
    }

    /// Change the forwarding port. A live tunnel is closed and reopened on the new port.
    /// Port 0 is not a listening port and is rejected.
    pub fn set_port(&self, port: u16) -> Result<(), ErrorCode> {
        if port == 0 {
            return Err(ErrorCode::INVALID_ARGS);
        }
        let mut st = self.lock();
        if st.port == Some(port) {
            return Ok(());
        }
        st.port = Some(port);
        self.save_port(port);
        self.events.server_info_changed(&self.id);
        if st.state == StreamState::Connected {
            self.refresh_tunnel(&mut st, true);
        }
        Ok(())
    }

    /// Release session, stream and tunnel. Safe to call repeatedly.
    pub fn close(&self) {
        let mut st = self.lock();
        self.close_locked(&mut st);
    }

    /// Forget the persisted port.
    pub fn clear_preferences(&self) {
        if let Err(e) = self.prefs.remove(&prefs::port_key(&self.id)) {
            tracing::warn!("{}: cannot clear port preference: {e}", self.id);
        }
    }

    /// Release the local tunnel, keeping the session.
    fn close_tunnel(&self, st: &mut RecordState) {
        let RecordState {
            session,
            stream,
            tunnel,
            ..
        } = st;
        if let (Some(old), Some(session), Some(stream)) = (tunnel.take(), session.as_mut(), *stream)
        {
            if let Err(code) = session.close_port_forwarding(stream, old) {
                tracing::warn!("closing tunnel {:?} to {} failed ({code})", old, self.id);
            }
        }
    }

    fn close_locked(&self, st: &mut RecordState) {
        if let Some(mut session) = st.session.take() {
            tracing::info!("closing session to {}", self.id);
            session.close();
        }
        st.stream = None;
        st.tunnel = None;
        st.state = StreamState::Closed;
    }

    fn refresh_tunnel(&self, st: &mut RecordState, force: bool) -> ForwardingStatus {
        match self.open_tunnel(st, force) {
            Ok(()) => self.report(ForwardingStatus::Ready),
            Err(code) => {
                tracing::error!("tunnel to {} failed ({code})", self.id);
                if code.class() == ErrorClass::FatalToSession {
                    self.close_locked(st);
                }
                self.report(ForwardingStatus::Error(code))
            }
        }
    }

    fn open_tunnel(&self, st: &mut RecordState, force: bool) -> Result<(), ErrorCode> {
        if st.tunnel.is_some() && !force {
            tracing::info!("tunnel to {} already open", self.id);
            return Ok(());
        }
        if st.session.is_none() || st.stream.is_none() {
            return Err(ErrorCode::WRONG_STATE);
        }
        self.close_tunnel(st);
        let chosen = match st.port {
            Some(p) => p,
            None => find_free_port()?,
        };
        let RecordState {
            session, stream, ..
        } = st;
        let (Some(session), Some(stream)) = (session.as_mut(), *stream) else {
            return Err(ErrorCode::WRONG_STATE);
        };
        let id = session.open_port_forwarding(
            stream,
            &self.service_name,
            PortForwardingProtocol::Tcp,
            LOCAL_HOST,
            chosen,
        )?;
        st.tunnel = Some(id);
        st.port = Some(chosen);
        self.save_port(chosen);
        tracing::info!("tunnel to {} open on {LOCAL_HOST}:{chosen}", self.id);
        Ok(())
    }

    fn save_port(&self, port: u16) {
        if let Err(e) = self.prefs.put(&prefs::port_key(&self.id), &port.to_string()) {
            tracing::warn!("{}: cannot persist port {port}: {e}", self.id);
        }
    }

    fn report(&self, status: ForwardingStatus) -> ForwardingStatus {
        self.events.server_status(&self.id, status);
        status
    }
}

fn load_port(prefs: &dyn PreferenceStore, peer: &PeerId) -> Option<u16> {
    let raw = prefs.get(&prefs::port_key(peer))?;
    match raw.trim().parse::<u16>() {
        Ok(p) if p != 0 => Some(p),
        _ => {
            tracing::warn!("{peer}: ignoring persisted port {raw:?}");
            None
        }
    }
}

/// Ask the OS for an ephemeral loopback port by binding and releasing a listener.
fn find_free_port() -> Result<u16, ErrorCode> {
    let listener =
        std::net::TcpListener::bind((LOCAL_HOST, 0)).map_err(|_| ErrorCode::PORT_ALLOC)?;
    let port = listener
        .local_addr()
        .map_err(|_| ErrorCode::PORT_ALLOC)?
        .port();
    Ok(port)
}
