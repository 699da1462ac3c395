//! Recording in-process transport for tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once};

use crate::carrier::{
    Carrier, CarrierOptions, Connector, PeerId, PortForwardingProtocol, Session, SessionManager,
    StreamId, StreamOptions, TunnelId, UserInfo,
};
use crate::error::ErrorCode;

static INIT: Once = Once::new();

/// Install a test-writer subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(CarrierLocation),
    CarrierStart(u32),
    SetSelfInfo(UserInfo),
    AddFriend(PeerId, String),
    RemoveFriend(PeerId),
    NewSession(PeerId),
    AddStream(PeerId, StreamId),
    Request(PeerId),
    Start(PeerId, String),
    OpenTunnel {
        peer: PeerId,
        stream: StreamId,
        port: u16,
        tunnel: TunnelId,
    },
    CloseTunnel {
        peer: PeerId,
        tunnel: TunnelId,
    },
    CloseSession(PeerId),
    Cleanup,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierLocation {
    pub udp_enabled: bool,
    pub bootstraps: usize,
}

/// Shared journal and knobs behind every mock handle.
pub struct MockNet {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<&'static str, ErrorCode>>,
    friends: Mutex<BTreeSet<PeerId>>,
    self_info: Mutex<UserInfo>,
    next_id: AtomicI32,
}

impl MockNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            friends: Mutex::new(BTreeSet::new()),
            self_info: Mutex::new(UserInfo {
                id: "self".to_string(),
                name: String::new(),
            }),
            next_id: AtomicI32::new(1),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector { net: self.clone() })
    }

    pub fn manager(self: &Arc<Self>) -> Arc<dyn SessionManager> {
        Arc::new(MockManager { net: self.clone() })
    }

    /// Make the next call to `op` fail with `code`.
    pub fn fail_next(&self, op: &'static str, code: ErrorCode) {
        self.failures.lock().unwrap().insert(op, code);
    }

    pub fn set_friend(&self, peer: &str) {
        self.friends.lock().unwrap().insert(PeerId::new(peer));
    }

    pub fn set_self_name(&self, name: &str) {
        self.self_info.lock().unwrap().name = name.to_string();
    }

    pub fn self_name(&self) -> String {
        self.self_info.lock().unwrap().name.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn last_stream(&self) -> Option<StreamId> {
        self.calls.lock().unwrap().iter().rev().find_map(|c| match c {
            Call::AddStream(_, s) => Some(*s),
            _ => None,
        })
    }

    /// Last stream added for `peer`.
    pub fn stream_of(&self, peer: &str) -> Option<StreamId> {
        self.calls.lock().unwrap().iter().rev().find_map(|c| match c {
            Call::AddStream(p, s) if p.as_str() == peer => Some(*s),
            _ => None,
        })
    }

    pub fn opened_ports(&self) -> Vec<u16> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::OpenTunnel { port, .. } => Some(*port),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, op: &'static str) -> Result<(), ErrorCode> {
        match self.failures.lock().unwrap().remove(op) {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

struct MockConnector {
    net: Arc<MockNet>,
}

impl Connector for MockConnector {
    fn connect(&self, options: &CarrierOptions) -> Result<Arc<dyn Carrier>, ErrorCode> {
        self.net.check("connect")?;
        self.net.record(Call::Connect(CarrierLocation {
            udp_enabled: options.udp_enabled,
            bootstraps: options.bootstraps.len(),
        }));
        Ok(Arc::new(MockCarrier {
            net: self.net.clone(),
        }))
    }
}

struct MockCarrier {
    net: Arc<MockNet>,
}

impl Carrier for MockCarrier {
    fn start(&self, interval_ms: u32) -> Result<(), ErrorCode> {
        self.net.check("start")?;
        self.net.record(Call::CarrierStart(interval_ms));
        Ok(())
    }

    fn self_info(&self) -> Result<UserInfo, ErrorCode> {
        self.net.check("self_info")?;
        Ok(self.net.self_info.lock().unwrap().clone())
    }

    fn set_self_info(&self, info: &UserInfo) -> Result<(), ErrorCode> {
        self.net.check("set_self_info")?;
        self.net.record(Call::SetSelfInfo(info.clone()));
        *self.net.self_info.lock().unwrap() = info.clone();
        Ok(())
    }

    fn is_friend(&self, peer: &PeerId) -> bool {
        self.net.friends.lock().unwrap().contains(peer)
    }

    fn add_friend(&self, peer: &PeerId, hello: &str) -> Result<(), ErrorCode> {
        self.net.check("add_friend")?;
        self.net.record(Call::AddFriend(peer.clone(), hello.to_string()));
        Ok(())
    }

    fn remove_friend(&self, peer: &PeerId) -> Result<(), ErrorCode> {
        self.net.check("remove_friend")?;
        self.net.record(Call::RemoveFriend(peer.clone()));
        self.net.friends.lock().unwrap().remove(peer);
        Ok(())
    }

    fn session_manager(&self) -> Result<Arc<dyn SessionManager>, ErrorCode> {
        self.net.check("session_manager")?;
        Ok(self.net.manager())
    }

    fn kill(&self) {
        self.net.record(Call::Kill);
    }
}

struct MockManager {
    net: Arc<MockNet>,
}

impl SessionManager for MockManager {
    fn new_session(&self, peer: &PeerId) -> Result<Box<dyn Session>, ErrorCode> {
        self.net.check("new_session")?;
        self.net.record(Call::NewSession(peer.clone()));
        Ok(Box::new(MockSession {
            peer: peer.clone(),
            net: self.net.clone(),
        }))
    }

    fn cleanup(&self) {
        self.net.record(Call::Cleanup);
    }
}

struct MockSession {
    peer: PeerId,
    net: Arc<MockNet>,
}

impl Session for MockSession {
    fn add_stream(&mut self, _options: StreamOptions) -> Result<StreamId, ErrorCode> {
        self.net.check("add_stream")?;
        let id = StreamId(self.net.next_id());
        self.net.record(Call::AddStream(self.peer.clone(), id));
        Ok(id)
    }

    fn request(&mut self) -> Result<(), ErrorCode> {
        self.net.check("request")?;
        self.net.record(Call::Request(self.peer.clone()));
        Ok(())
    }

    fn start(&mut self, sdp: &str) -> Result<(), ErrorCode> {
        self.net.check("start_session")?;
        self.net.record(Call::Start(self.peer.clone(), sdp.to_string()));
        Ok(())
    }

    fn open_port_forwarding(
        &mut self,
        stream: StreamId,
        _service: &str,
        _protocol: PortForwardingProtocol,
        _host: &str,
        port: u16,
    ) -> Result<TunnelId, ErrorCode> {
        self.net.check("open_port_forwarding")?;
        let tunnel = TunnelId(self.net.next_id());
        self.net.record(Call::OpenTunnel {
            peer: self.peer.clone(),
            stream,
            port,
            tunnel,
        });
        Ok(tunnel)
    }

    fn close_port_forwarding(
        &mut self,
        _stream: StreamId,
        tunnel: TunnelId,
    ) -> Result<(), ErrorCode> {
        self.net.record(Call::CloseTunnel {
            peer: self.peer.clone(),
            tunnel,
        });
        Ok(())
    }

    fn close(&mut self) {
        self.net.record(Call::CloseSession(self.peer.clone()));
    }
}
