//! Peer registry: owns the transport client, the peer table and the active-peer selection.
//!
//! Construct one [`PeerRegistry`] when the application starts, share it behind an `Arc` with the
//! UI layer and the transport callback glue, and call [`PeerRegistry::teardown`] when the
//! application ends. All table mutations go through a single mutex; each peer record has its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::carrier::{
    Carrier, CarrierOptions, ConnectionStatus, Connector, FriendInfo, PeerId, PresenceStatus,
    SessionManager, StreamId, StreamState, UserInfo,
};
use crate::config::{AgentOptions, BootstrapConfig};
use crate::error::{AgentError, ErrorCode};
use crate::events::{AgentEvent, EventBus, ForwardingStatus, AGENT_READY};
use crate::hash;
use crate::prefs::{PreferenceStore, CHECKED_SERVER_KEY};
use crate::server::{PeerRecord, PeerSnapshot};

/// Status reported when the agent could not be brought up.
const AGENT_FAILED: i32 = -1;

#[derive(Default)]
struct AgentState {
    carrier: Option<Arc<dyn Carrier>>,
    manager: Option<Arc<dyn SessionManager>>,
    status: ConnectionStatus,
    ready: bool,
    /// Set once the first full friend list has been processed.
    friends_loaded: bool,
    peers: BTreeMap<PeerId, Arc<PeerRecord>>,
    active: Option<PeerId>,
    /// Friend requests sent this run and not yet answered.
    pending_pairs: BTreeSet<PeerId>,
}

impl AgentState {
    fn first_online(&self, except: Option<&PeerId>) -> Option<PeerId> {
        self.peers
            .values()
            .find(|r| Some(r.id()) != except && r.is_online())
            .map(|r| r.id().clone())
    }

    fn connected(&self) -> bool {
        self.ready && self.status == ConnectionStatus::Connected
    }
}

pub struct PeerRegistry {
    options: AgentOptions,
    connector: Arc<dyn Connector>,
    prefs: Arc<dyn PreferenceStore>,
    events: EventBus,
    inner: Mutex<AgentState>,
}

impl PeerRegistry {
    pub fn new(
        options: AgentOptions,
        connector: Arc<dyn Connector>,
        prefs: Arc<dyn PreferenceStore>,
    ) -> Self {
        let events = EventBus::new(options.event_capacity);
        Self {
            options,
            connector,
            prefs,
            events,
            inner: Mutex::new(AgentState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Create persistent storage and the transport client. Reuses an existing client.
    pub fn initialize(&self) -> Result<(), AgentError> {
        let mut st = self.lock();
        if st.carrier.is_some() {
            return Ok(());
        }
        let dir = self.options.carrier_dir();
        std::fs::create_dir_all(&dir).map_err(|e| {
            AgentError::NetworkInit(format!("cannot create {}: {e}", dir.display()))
        })?;

        let bootstrap = BootstrapConfig::from_json(&self.options.bootstrap_json);
        let options = CarrierOptions {
            persistent_location: dir,
            udp_enabled: bootstrap.udp_enabled,
            bootstraps: bootstrap.bootstraps,
        };
        let carrier = self
            .connector
            .connect(&options)
            .map_err(|code| AgentError::NetworkInit(format!("carrier ({code})")))?;
        tracing::info!("agent carrier instance created");
        let manager = match carrier.session_manager() {
            Ok(m) => m,
            Err(code) => {
                carrier.kill();
                return Err(AgentError::NetworkInit(format!("session manager ({code})")));
            }
        };
        tracing::info!("agent session manager created");
        st.carrier = Some(carrier);
        st.manager = Some(manager);
        Ok(())
    }

    /// Begin connecting to the network. Failures are reported as `AgentStatusChanged`.
    pub fn start(&self) {
        if self.lock().carrier.is_none() {
            if let Err(e) = self.initialize() {
                tracing::error!("agent start: {e}");
                self.events.agent_status(AGENT_FAILED, false);
                return;
            }
        }
        let Some(carrier) = self.lock().carrier.clone() else {
            self.events.agent_status(AGENT_FAILED, false);
            return;
        };
        if let Err(code) = carrier.start(self.options.start_interval_ms) {
            tracing::error!("carrier start failed ({code})");
            self.events.agent_status(code.code(), false);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn self_info(&self) -> Result<UserInfo, AgentError> {
        let carrier = self.lock().carrier.clone().ok_or(AgentError::NotInitialized)?;
        Ok(carrier.self_info()?)
    }

    /// Send a friend request authorised by the SHA-256 of `password`.
    pub fn pair_peer(&self, peer: &PeerId, password: &str) -> Result<(), AgentError> {
        let mut st = self.lock();
        let carrier = st.carrier.clone().ok_or(AgentError::NotInitialized)?;
        if st.peers.contains_key(peer) || carrier.is_friend(peer) {
            return Err(AgentError::AlreadyPaired);
        }
        if st.pending_pairs.contains(peer) {
            return Err(AgentError::AlreadyPaired);
        }
        match carrier.add_friend(peer, &hash::hash_password(password)) {
            Ok(()) => {
                tracing::info!("friend request to {peer} sent");
                st.pending_pairs.insert(peer.clone());
                Ok(())
            }
            Err(ErrorCode::ALREADY_REQUESTED) => {
                tracing::info!("friend request to {peer} already pending");
                st.pending_pairs.insert(peer.clone());
                Err(AgentError::AlreadyPaired)
            }
            Err(code) => {
                tracing::warn!("friend request to {peer} failed ({code})");
                Err(AgentError::Auth(code))
            }
        }
    }

    /// Remove `peer` as a friend. No-op when it is not one.
    pub fn unpair_peer(&self, peer: &PeerId) -> Result<(), AgentError> {
        let mut st = self.lock();
        let carrier = st.carrier.clone().ok_or(AgentError::NotInitialized)?;
        st.pending_pairs.remove(peer);
        if carrier.is_friend(peer) {
            carrier.remove_friend(peer)?;
            tracing::info!("removed friend {peer}");
        }
        Ok(())
    }

    /// Make `peer` the one peer that forwards.
    pub fn set_active_peer(&self, peer: &PeerId) -> Result<(), AgentError> {
        let mut st = self.lock();
        let record = st
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| AgentError::UnknownPeer(peer.clone()))?;
        if st.active.as_ref() == Some(peer) {
            return Ok(());
        }
        tracing::info!("active peer changed to {peer}");
        let previous = st.active.take();
        if let Some(prev) = previous.and_then(|id| st.peers.get(&id).cloned()) {
            prev.close();
        }
        st.active = Some(peer.clone());
        self.persist_active(st.active.as_ref());
        if st.connected() {
            self.events.agent_status(AGENT_READY, false);
            if let Some(manager) = st.manager.clone() {
                record.setup_forwarding(manager.as_ref());
            }
        }
        Ok(())
    }

    pub fn active_peer(&self) -> Option<PeerId> {
        self.lock().active.clone()
    }

    pub fn peer(&self, peer: &PeerId) -> Option<Arc<PeerRecord>> {
        self.lock().peers.get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.lock().peers.values().map(|r| r.snapshot()).collect()
    }

    pub fn setup_forwarding(&self, peer: &PeerId) -> Result<Option<ForwardingStatus>, AgentError> {
        let (record, manager) = self.record_and_manager(peer)?;
        Ok(record.setup_forwarding(manager.as_ref()))
    }

    pub fn ensure_forwarding(&self, peer: &PeerId) -> Result<bool, AgentError> {
        let (record, manager) = self.record_and_manager(peer)?;
        Ok(record.ensure_forwarding(manager.as_ref()))
    }

    pub fn set_port(&self, peer: &PeerId, port: u16) -> Result<(), AgentError> {
        let record = self
            .peer(peer)
            .ok_or_else(|| AgentError::UnknownPeer(peer.clone()))?;
        record.set_port(port).map_err(|_| AgentError::InvalidPort(port))
    }

    /// Close every session, drop the peer table and release the transport.
    /// A later [`Self::initialize`] builds everything afresh.
    pub fn teardown(&self) {
        let mut st = self.lock();
        if let Some(active) = st.active.as_ref() {
            self.persist_active(Some(active));
        }
        for record in st.peers.values() {
            record.close();
        }
        if let Some(manager) = st.manager.take() {
            manager.cleanup();
        }
        if let Some(carrier) = st.carrier.take() {
            carrier.kill();
        }
        *st = AgentState::default();
        tracing::info!("agent torn down");
    }

    /// Tear down and wipe the local network identity.
    pub fn logout(&self) -> Result<(), AgentError> {
        self.teardown();
        let dir = self.options.carrier_dir();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)?;
                    } else {
                        std::fs::remove_file(&path)?;
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // Transport callbacks.

    pub fn on_connection(&self, status: ConnectionStatus) {
        let mut st = self.lock();
        tracing::info!("agent connection status changed to {:?}", status);
        st.status = status;
        if st.ready && status == ConnectionStatus::Connected {
            self.events.agent_status(AGENT_READY, false);
        }
    }

    /// Post-handshake: name the local identity and pick an active peer if none is selected.
    pub fn on_ready(&self) {
        let mut st = self.lock();
        let Some(carrier) = st.carrier.clone() else {
            tracing::warn!("ready callback without carrier");
            return;
        };
        if let Err(code) = self.ensure_self_name(carrier.as_ref()) {
            tracing::error!("update current user name error ({code})");
            self.events.agent_status(code.code(), false);
            return;
        }
        tracing::info!("carrier instance is ready");
        // Auto-selection waits for the first friend list so a persisted choice wins.
        if st.active.is_none() && st.friends_loaded {
            st.active = st.first_online(None);
            self.persist_active(st.active.as_ref());
        }
        st.ready = true;
        self.events.agent_status(AGENT_READY, true);
    }

    pub fn on_friends(&self, friends: Vec<FriendInfo>) {
        let mut st = self.lock();
        tracing::info!("received friend list with {} peers", friends.len());
        for info in friends {
            match st.peers.get(&info.id) {
                Some(record) => record.apply_info(info),
                None => {
                    let record = self.new_record(info);
                    st.peers.insert(record.id().clone(), record);
                }
            }
        }
        st.friends_loaded = true;

        let persisted = self
            .prefs
            .get(CHECKED_SERVER_KEY)
            .map(PeerId::new)
            .filter(|id| st.peers.contains_key(id));
        let selected = persisted.or_else(|| match &st.active {
            Some(a) if st.peers.contains_key(a) => Some(a.clone()),
            _ if st.ready => st.first_online(None),
            _ => None,
        });
        if selected != st.active {
            if let Some(prev) = st.active.as_ref().and_then(|id| st.peers.get(id)) {
                prev.close();
            }
            st.active = selected;
            self.persist_active(st.active.as_ref());
        }
        self.events.server_list_changed();
    }

    /// A new friend snapshot. It may change presence and connection too, so the active peer
    /// is re-evaluated the same way as for a status change.
    pub fn on_friend_info_changed(&self, peer: &PeerId, info: FriendInfo) {
        tracing::info!("server {peer} info changed to {:?}", info);
        self.on_friend_status(peer, |r| r.apply_info(info));
    }

    pub fn on_friend_connection(&self, peer: &PeerId, status: ConnectionStatus) {
        tracing::info!("server {peer} connection status changed to {:?}", status);
        self.on_friend_status(peer, |r| r.set_connection(status));
    }

    pub fn on_friend_presence(&self, peer: &PeerId, presence: PresenceStatus) {
        tracing::info!("server {peer} presence changed to {:?}", presence);
        self.on_friend_status(peer, |r| r.set_presence(presence));
    }

    fn on_friend_status(&self, peer: &PeerId, update: impl FnOnce(&PeerRecord)) {
        let st = self.lock();
        let Some(record) = st.peers.get(peer).cloned() else {
            tracing::warn!("status change for unknown peer {peer}");
            return;
        };
        update(&record);
        self.events.server_info_changed(peer);
        if st.active.as_ref() == Some(peer) {
            self.events.agent_status(AGENT_READY, false);
            if record.is_online() {
                if let Some(manager) = st.manager.clone() {
                    record.setup_forwarding(manager.as_ref());
                }
            } else {
                record.close();
            }
        }
        self.events.server_list_changed();
    }

    pub fn on_friend_added(&self, info: FriendInfo) {
        let mut st = self.lock();
        let id = info.id.clone();
        st.pending_pairs.remove(&id);
        match st.peers.get(&id) {
            Some(record) => record.apply_info(info),
            None => {
                let record = self.new_record(info);
                st.peers.insert(id.clone(), record);
            }
        }
        tracing::info!("server {id} added");
        if st.active.is_none() {
            st.active = Some(id);
            self.persist_active(st.active.as_ref());
            self.events.agent_status(AGENT_READY, false);
        }
        self.events.server_list_changed();
    }

    pub fn on_friend_removed(&self, peer: &PeerId) {
        let mut st = self.lock();
        st.pending_pairs.remove(peer);
        let Some(record) = st.peers.remove(peer) else {
            tracing::warn!("removal of unknown peer {peer}");
            return;
        };
        tracing::info!("server {peer} removed");
        record.close();
        record.clear_preferences();
        if st.active.as_ref() == Some(peer) {
            st.active = st.first_online(Some(peer));
            self.persist_active(st.active.as_ref());
            self.events.agent_status(AGENT_READY, false);
        }
        self.events.server_list_changed();
    }

    pub fn on_stream_state_changed(&self, peer: &PeerId, stream: StreamId, state: StreamState) {
        if let Some(record) = self.peer(peer) {
            record.on_stream_state(stream, state);
        }
    }

    pub fn on_stream_failed(&self, peer: &PeerId, stream: StreamId, code: ErrorCode) {
        if let Some(record) = self.peer(peer) {
            record.on_stream_failed(stream, code);
        }
    }

    pub fn on_session_request_complete(
        &self,
        peer: &PeerId,
        stream: StreamId,
        status: i32,
        reason: &str,
        sdp: &str,
    ) {
        if let Some(record) = self.peer(peer) {
            record.on_request_complete(stream, status, reason, sdp);
        }
    }

    fn ensure_self_name(&self, carrier: &dyn Carrier) -> Result<(), ErrorCode> {
        let mut info = carrier.self_info()?;
        if info.name.is_empty() {
            info.name = self.options.default_device_name();
            carrier.set_self_info(&info)?;
        }
        Ok(())
    }

    fn new_record(&self, info: FriendInfo) -> Arc<PeerRecord> {
        Arc::new(PeerRecord::new(
            info,
            self.options.service_name.clone(),
            self.prefs.clone(),
            self.events.clone(),
        ))
    }

    fn record_and_manager(
        &self,
        peer: &PeerId,
    ) -> Result<(Arc<PeerRecord>, Arc<dyn SessionManager>), AgentError> {
        let st = self.lock();
        let manager = st.manager.clone().ok_or(AgentError::NotInitialized)?;
        let record = st
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| AgentError::UnknownPeer(peer.clone()))?;
        Ok((record, manager))
    }

    fn persist_active(&self, active: Option<&PeerId>) {
        let result = match active {
            Some(id) => self.prefs.put(CHECKED_SERVER_KEY, id.as_str()),
            None => self.prefs.remove(CHECKED_SERVER_KEY),
        };
        if let Err(e) = result {
            tracing::warn!("cannot persist active peer: {e}");
        }
    }
}
