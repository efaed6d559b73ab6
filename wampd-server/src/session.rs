//! Session management.

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use wampd_core::Peer;
use wampd_protocol::codec::jsonl;
use wampd_protocol::{Decoder, Encoder, Message, ProtocolError, Role, MAX_ID};

/// Wire mode of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMode {
    /// Binary framing with JSON payload.
    #[default]
    Binary,
    /// Line-delimited JSON (debug mode).
    Jsonl,
}

impl WireMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireMode::Binary => "binary",
            WireMode::Jsonl => "jsonl",
        }
    }

    /// Returns a decoder for inbound bytes in this mode.
    pub fn reader(&self) -> WireReader {
        match self {
            WireMode::Binary => WireReader::Binary(Decoder::new()),
            WireMode::Jsonl => WireReader::Jsonl(jsonl::LineDecoder::new()),
        }
    }

    /// Encodes one outbound message.
    pub fn encode(&self, message: &Message) -> Result<BytesMut, ProtocolError> {
        match self {
            WireMode::Binary => Encoder::encode_message(message),
            WireMode::Jsonl => Ok(BytesMut::from(&jsonl::encode(message)?[..])),
        }
    }
}

impl std::str::FromStr for WireMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary" => Ok(WireMode::Binary),
            "jsonl" => Ok(WireMode::Jsonl),
            other => Err(format!("unknown wire mode: {other}")),
        }
    }
}

/// Inbound decoder for either wire mode.
pub enum WireReader {
    Binary(Decoder),
    Jsonl(jsonl::LineDecoder),
}

impl WireReader {
    pub fn extend(&mut self, data: &[u8]) {
        match self {
            WireReader::Binary(d) => d.extend(data),
            WireReader::Jsonl(d) => d.extend(data),
        }
    }

    /// Returns the raw fields of the next complete message, if any.
    pub fn decode_raw(&mut self) -> Result<Option<Vec<Value>>, ProtocolError> {
        match self {
            WireReader::Binary(d) => d.decode_raw(),
            WireReader::Jsonl(d) => d.decode_raw(),
        }
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for HELLO.
    Establishing,
    /// WELCOME sent, routing messages.
    Established,
    /// GOODBYE or ABORT exchanged; the connection is about to close.
    Closing,
}

/// A connected client session.
pub struct Session {
    /// Router-assigned session ID.
    pub id: u64,

    /// Remote address.
    pub remote_addr: SocketAddr,

    /// Queue drained by the connection task.
    outbound: mpsc::UnboundedSender<Message>,

    state: Mutex<SessionState>,

    /// Realm joined in HELLO.
    realm: Mutex<Option<String>>,

    /// Announced roles and their features.
    roles: RwLock<HashMap<Role, HashSet<String>>>,

    /// Last router-to-client request id handed out.
    next_request: AtomicU64,

    /// Messages received.
    message_count: AtomicU64,

    created_at: Instant,

    last_activity: Mutex<Instant>,
}

impl Session {
    /// Creates a new session writing into `outbound`.
    pub fn new(id: u64, remote_addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            remote_addr,
            outbound,
            state: Mutex::new(SessionState::Establishing),
            realm: Mutex::new(None),
            roles: RwLock::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            message_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn realm(&self) -> Option<String> {
        self.realm.lock().clone()
    }

    /// Completes the handshake with the roles parsed from HELLO details.
    pub fn complete_handshake(&self, realm: &str, roles: HashMap<Role, HashSet<String>>) {
        *self.realm.lock() = Some(realm.to_string());
        *self.roles.write() = roles;
        self.set_state(SessionState::Established);
    }

    /// Records an inbound message.
    pub fn record_message(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn roles(&self) -> Vec<Role> {
        self.roles.read().keys().copied().collect()
    }
}

/// Extracts client roles and their enabled features from HELLO details.
///
/// Unknown role names and router roles are ignored.
pub fn parse_roles(details: &serde_json::Map<String, Value>) -> HashMap<Role, HashSet<String>> {
    let Some(roles) = details.get("roles").and_then(Value::as_object) else {
        return HashMap::new();
    };
    roles
        .iter()
        .filter_map(|(name, role)| {
            let role_kind = Role::from_name(name).filter(|r| !r.is_router())?;
            let features = role
                .get("features")
                .and_then(Value::as_object)
                .map(|features| {
                    features
                        .iter()
                        .filter(|(_, enabled)| enabled.as_bool().unwrap_or(false))
                        .map(|(feature, _)| feature.clone())
                        .collect()
                })
                .unwrap_or_default();
            Some((role_kind, features))
        })
        .collect()
}

impl Peer for Session {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn has_role(&self, role: Role) -> bool {
        self.roles.read().contains_key(&role)
    }

    fn supports(&self, role: Role, feature: &str) -> bool {
        self.roles
            .read()
            .get(&role)
            .is_some_and(|features| features.contains(feature))
    }

    fn send(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("Session {} is gone, dropping outbound message", self.id);
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed) % MAX_ID + 1
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("realm", &self.realm())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use wampd_protocol::MessageRegistry;

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    fn test_session() -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(42, test_addr(), tx), rx)
    }

    #[test]
    fn test_session_creation() {
        let (session, _rx) = test_session();
        assert_eq!(session.state(), SessionState::Establishing);
        assert_eq!(session.session_id(), 42);
        assert!(session.realm().is_none());
        assert!(!session.has_role(Role::Caller));
    }

    #[test]
    fn test_session_handshake() {
        let (session, _rx) = test_session();
        let details = json!({
            "roles": {
                "caller": {"features": {"call_canceling": true, "call_timeout": false}},
                "callee": {},
                "dealer": {"features": {"call_canceling": true}},
                "juggler": {}
            }
        });
        let roles = parse_roles(details.as_object().unwrap());
        assert_eq!(roles.len(), 2);

        session.complete_handshake("realm1", roles);
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.realm().as_deref(), Some("realm1"));
        assert!(session.has_role(Role::Caller));
        assert!(session.has_role(Role::Callee));
        assert!(!session.has_role(Role::Dealer));
        assert!(session.supports(Role::Caller, "call_canceling"));
        assert!(!session.supports(Role::Caller, "call_timeout"));
        assert!(!session.supports(Role::Callee, "call_canceling"));
    }

    #[test]
    fn test_send_queues_message() {
        let (session, mut rx) = test_session();
        let message = MessageRegistry::standard()
            .parse_value(json!([65, 1, 2]))
            .unwrap();
        session.send(message.clone());
        assert_eq!(rx.try_recv().unwrap(), message);

        // A closed queue drops silently.
        drop(rx);
        session.send(message);
    }

    #[test]
    fn test_request_ids_increase() {
        let (session, _rx) = test_session();
        assert_eq!(session.next_request_id(), 1);
        assert_eq!(session.next_request_id(), 2);
        assert_eq!(session.next_request_id(), 3);
    }

    #[test]
    fn test_wire_mode_roundtrip() {
        let message = MessageRegistry::standard()
            .parse_value(json!([65, 1, 2]))
            .unwrap();
        for mode in [WireMode::Binary, WireMode::Jsonl] {
            let bytes = mode.encode(&message).unwrap();
            let mut reader = mode.reader();
            reader.extend(&bytes);
            assert_eq!(reader.decode_raw().unwrap(), Some(message.serialize()));
            assert_eq!(reader.decode_raw().unwrap(), None);
        }
        assert_eq!("JSONL".parse::<WireMode>(), Ok(WireMode::Jsonl));
        assert!("carrier-pigeon".parse::<WireMode>().is_err());
    }

    #[test]
    fn test_record_message() {
        let (session, _rx) = test_session();
        session.record_message();
        session.record_message();
        assert_eq!(session.message_count(), 2);
        assert!(session.idle_duration() < Duration::from_secs(5));
        assert!(session.age() >= session.idle_duration());
    }
}
