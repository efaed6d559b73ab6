//! Inbound message handling.
//!
//! Owns the session handshake (HELLO/WELCOME/ABORT/GOODBYE) and hands every
//! other message of an established session to the dealer.

use crate::metrics::Metrics;
use crate::session::{parse_roles, Session, SessionState};
use serde_json::{json, Value};
use std::sync::Arc;
use wampd_core::{Dealer, Peer};
use wampd_protocol::{ErrorUri, Message, MessageRegistry, MessageType, ProtocolError};

/// Router identity announced in WELCOME.
#[derive(Debug, Clone)]
pub struct RouterInfo {
    /// The only realm sessions may join.
    pub realm: String,
    pub agent: String,
}

impl Default for RouterInfo {
    fn default() -> Self {
        Self {
            realm: "realm1".to_string(),
            agent: format!("wampd-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// What the connection should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// Flush queued output and close the connection.
    Close,
}

/// Message handler shared by all connections.
pub struct MessageHandler {
    registry: Arc<MessageRegistry>,
    dealer: Arc<Dealer>,
    info: RouterInfo,
    /// Metrics for message tracking.
    metrics: Option<Arc<Metrics>>,
}

impl MessageHandler {
    /// Creates a new handler around `dealer`.
    pub fn new(dealer: Arc<Dealer>, info: RouterInfo) -> Self {
        Self {
            registry: Arc::clone(dealer.registry()),
            dealer,
            info,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dealer(&self) -> &Arc<Dealer> {
        &self.dealer
    }

    pub fn info(&self) -> &RouterInfo {
        &self.info
    }

    /// Returns a reference to the metrics, if set.
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Updates gauge metrics from current dealer state.
    pub fn update_gauge_metrics(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.registrations.set(self.dealer.table().len() as f64);
            metrics
                .pending_invocations
                .set(self.dealer.pending_invocations() as f64);
        }
    }

    /// Validates and handles one decoded message array.
    pub fn handle_raw(&self, session: &Arc<Session>, raw: Vec<Value>) -> Disposition {
        let recovered = MessageRegistry::recover_request(&raw);
        match self.registry.parse(raw) {
            Ok(message) => self.handle(session, message),
            Err(e) => {
                session.record_message();
                self.reject(session, recovered, e)
            }
        }
    }

    /// Handles one validated message.
    pub fn handle(&self, session: &Arc<Session>, message: Message) -> Disposition {
        session.record_message();
        let kind = message.kind();

        let timer = self.metrics.as_ref().map(|m| {
            m.message_duration
                .with_label_values(&[kind.name()])
                .start_timer()
        });

        let disposition = match (session.state(), kind) {
            (SessionState::Closing, _) => Disposition::Close,
            (_, MessageType::Abort) => {
                tracing::info!(
                    "Session {} aborted by peer: {}",
                    session.id,
                    message.uri(1).unwrap_or_default()
                );
                session.set_state(SessionState::Closing);
                Disposition::Close
            }
            (SessionState::Establishing, MessageType::Hello) => self.handle_hello(session, &message),
            (SessionState::Establishing, _) => self.abort(
                session,
                ErrorUri::ProtocolViolation,
                format!("expected HELLO, got {}", kind),
            ),
            (SessionState::Established, MessageType::Hello) => self.abort(
                session,
                ErrorUri::ProtocolViolation,
                "HELLO on an established session",
            ),
            (SessionState::Established, MessageType::Goodbye) => {
                self.handle_goodbye(session, &message)
            }
            (SessionState::Established, _) => self.route(session, message),
        };

        if let Some(ref metrics) = self.metrics {
            metrics.messages_total.with_label_values(&[kind.name()]).inc();
        }
        drop(timer);
        self.update_gauge_metrics();

        disposition
    }

    /// Aborts a session whose byte stream could not be decoded.
    pub fn reject_frame(&self, session: &Session, error: &ProtocolError) -> Disposition {
        self.abort(session, ErrorUri::ProtocolViolation, error.to_string())
    }

    /// Message sent to every open session on shutdown.
    pub fn shutdown_message(&self) -> Option<Message> {
        self.build(
            MessageType::Goodbye,
            vec![
                json!({"message": "router is shutting down"}),
                json!(ErrorUri::SystemShutdown.as_str()),
            ],
        )
    }

    /// Releases everything `session` held in the dealer.
    pub fn close_session(&self, session: &Session) {
        if session.realm().is_some() {
            if let Some(ref metrics) = self.metrics {
                metrics.sessions_active.dec();
            }
        }
        self.dealer.close_session(session.id);
        self.update_gauge_metrics();
    }

    fn build(&self, kind: MessageType, fields: Vec<Value>) -> Option<Message> {
        match self.registry.build(kind, fields) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::error!("Failed to build {}: {}", kind, e);
                None
            }
        }
    }

    fn send(&self, session: &Session, kind: MessageType, fields: Vec<Value>) {
        if let Some(message) = self.build(kind, fields) {
            session.send(message);
        }
    }

    fn record_error(&self, uri: ErrorUri) {
        if let Some(ref metrics) = self.metrics {
            metrics.errors_total.with_label_values(&[uri.as_str()]).inc();
        }
    }

    fn abort(&self, session: &Session, reason: ErrorUri, message: impl Into<String>) -> Disposition {
        let message = message.into();
        tracing::warn!("Aborting session {}: {} ({})", session.id, reason, message);
        self.record_error(reason);
        self.send(
            session,
            MessageType::Abort,
            vec![json!({ "message": message }), json!(reason.as_str())],
        );
        session.set_state(SessionState::Closing);
        Disposition::Close
    }

    /// Answers a structurally invalid message: an ERROR when the request id
    /// can be recovered on an established session, ABORT otherwise.
    fn reject(
        &self,
        session: &Session,
        recovered: Option<(MessageType, u64)>,
        error: ProtocolError,
    ) -> Disposition {
        match (session.state(), recovered) {
            (SessionState::Established, Some((kind, request))) => {
                tracing::debug!(
                    "Rejecting malformed {} {} from session {}: {}",
                    kind,
                    request,
                    session.id,
                    error
                );
                self.record_error(ErrorUri::InvalidArgument);
                self.send(
                    session,
                    MessageType::Error,
                    vec![
                        json!(kind.code()),
                        json!(request),
                        json!({}),
                        json!(ErrorUri::InvalidArgument.as_str()),
                        json!([error.to_string()]),
                    ],
                );
                Disposition::Continue
            }
            _ => self.abort(session, ErrorUri::ProtocolViolation, error.to_string()),
        }
    }

    fn handle_hello(&self, session: &Session, message: &Message) -> Disposition {
        let realm = message.uri(0).unwrap_or_default();
        if realm != self.info.realm {
            return self.abort(session, ErrorUri::NoSuchRealm, format!("no such realm: {realm}"));
        }

        let roles = message.dict(1).map(parse_roles).unwrap_or_default();
        if roles.is_empty() {
            return self.abort(
                session,
                ErrorUri::ProtocolViolation,
                "HELLO announces no client role",
            );
        }

        session.complete_handshake(realm, roles);
        if let Some(ref metrics) = self.metrics {
            metrics.sessions_active.inc();
        }
        tracing::info!(
            "Session {} joined realm {} from {} as {:?}",
            session.id,
            realm,
            session.remote_addr,
            session.roles()
        );

        self.send(
            session,
            MessageType::Welcome,
            vec![
                json!(session.id),
                json!({
                    "agent": self.info.agent,
                    "roles": {
                        "dealer": {"features": self.dealer.features()}
                    }
                }),
            ],
        );
        Disposition::Continue
    }

    fn handle_goodbye(&self, session: &Session, message: &Message) -> Disposition {
        let reason = message.uri(1).unwrap_or_default();
        tracing::info!("Session {} said goodbye: {}", session.id, reason);
        if reason != ErrorUri::GoodbyeAndOut.as_str() {
            self.send(
                session,
                MessageType::Goodbye,
                vec![json!({}), json!(ErrorUri::GoodbyeAndOut.as_str())],
            );
        }
        session.set_state(SessionState::Closing);
        Disposition::Close
    }

    /// Checks the role flow and hands the message to the dealer.
    fn route(&self, session: &Arc<Session>, message: Message) -> Disposition {
        let kind = message.kind();
        let allowed = self.registry.spec(kind).is_some_and(|spec| {
            spec.client_may_send()
                && spec
                    .flows
                    .iter()
                    .any(|flow| !flow.from.is_router() && session.has_role(flow.from))
        });
        if !allowed {
            return self.abort(
                session,
                ErrorUri::ProtocolViolation,
                format!("{} not allowed for roles {:?}", kind, session.roles()),
            );
        }

        let peer: Arc<dyn Peer> = session.clone();
        match self.dealer.handle(&peer, message) {
            Ok(()) => Disposition::Continue,
            Err(e) if e.is_fatal() => self.abort(session, ErrorUri::ProtocolViolation, e.to_string()),
            Err(e) => {
                tracing::warn!("Session {} sent unusable {}: {}", session.id, kind, e);
                Disposition::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::sync::mpsc;
    use wampd_core::NullSink;
    use wampd_protocol::Role;

    fn test_handler() -> MessageHandler {
        let dealer = Dealer::new(Arc::new(MessageRegistry::standard()), Arc::new(NullSink));
        MessageHandler::new(Arc::new(dealer), RouterInfo::default())
            .with_metrics(Arc::new(Metrics::new().unwrap()))
    }

    fn test_session(id: u64) -> (Arc<Session>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000 + id as u16);
        (Arc::new(Session::new(id, addr, tx)), rx)
    }

    fn raw(value: Value) -> Vec<Value> {
        value.as_array().unwrap().clone()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn join(
        handler: &MessageHandler,
        id: u64,
        roles: Value,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Message>) {
        let (session, mut rx) = test_session(id);
        let disposition = handler.handle_raw(&session, raw(json!([1, "realm1", {"roles": roles}])));
        assert_eq!(disposition, Disposition::Continue);
        let welcome = drain(&mut rx);
        assert_eq!(welcome[0].kind(), MessageType::Welcome);
        (session, rx)
    }

    #[test]
    fn test_hello_welcome() {
        let handler = test_handler();
        let (session, mut rx) = test_session(7);

        let disposition = handler.handle_raw(
            &session,
            raw(json!([1, "realm1", {"roles": {"caller": {"features": {"call_canceling": true}}}}])),
        );
        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(session.state(), SessionState::Established);
        assert!(session.supports(Role::Caller, "call_canceling"));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), MessageType::Welcome);
        assert_eq!(sent[0].id(0), Some(7));
        let details = sent[0].dict(1).unwrap();
        assert_eq!(
            details["roles"]["dealer"]["features"]["call_canceling"],
            json!(true)
        );
        assert_eq!(handler.metrics().unwrap().sessions_active.get(), 1.0);
    }

    #[test]
    fn test_unknown_realm_aborts() {
        let handler = test_handler();
        let (session, mut rx) = test_session(1);
        let disposition =
            handler.handle_raw(&session, raw(json!([1, "other.realm", {"roles": {"caller": {}}}])));
        assert_eq!(disposition, Disposition::Close);
        let sent = drain(&mut rx);
        assert_eq!(sent[0].kind(), MessageType::Abort);
        assert_eq!(sent[0].uri(1), Some("wamp.error.no_such_realm"));
    }

    #[test]
    fn test_hello_without_roles_aborts() {
        let handler = test_handler();
        let (session, mut rx) = test_session(1);
        let disposition = handler.handle_raw(&session, raw(json!([1, "realm1", {}])));
        assert_eq!(disposition, Disposition::Close);
        assert_eq!(drain(&mut rx)[0].uri(1), Some("wamp.error.protocol_violation"));
    }

    #[test]
    fn test_message_before_hello_aborts() {
        let handler = test_handler();
        let (session, mut rx) = test_session(1);
        let disposition = handler.handle_raw(&session, raw(json!([48, 1, {}, "com.echo"])));
        assert_eq!(disposition, Disposition::Close);
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(drain(&mut rx)[0].kind(), MessageType::Abort);
    }

    #[test]
    fn test_second_hello_aborts() {
        let handler = test_handler();
        let (session, mut rx) = join(&handler, 1, json!({"caller": {}}));
        let disposition =
            handler.handle_raw(&session, raw(json!([1, "realm1", {"roles": {"caller": {}}}])));
        assert_eq!(disposition, Disposition::Close);
        assert_eq!(drain(&mut rx)[0].uri(1), Some("wamp.error.protocol_violation"));
    }

    #[test]
    fn test_goodbye() {
        let handler = test_handler();
        let (session, mut rx) = join(&handler, 1, json!({"caller": {}}));
        let disposition =
            handler.handle_raw(&session, raw(json!([6, {}, "wamp.close.system_shutdown"])));
        assert_eq!(disposition, Disposition::Close);
        let sent = drain(&mut rx);
        assert_eq!(sent[0].kind(), MessageType::Goodbye);
        assert_eq!(sent[0].uri(1), Some("wamp.close.goodbye_and_out"));

        // A goodbye reply is not answered again.
        let (session, mut rx) = join(&handler, 2, json!({"caller": {}}));
        handler.handle_raw(&session, raw(json!([6, {}, "wamp.close.goodbye_and_out"])));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_router_only_message_aborts() {
        let handler = test_handler();
        let (session, mut rx) = join(&handler, 1, json!({"caller": {}, "callee": {}}));
        let disposition = handler.handle_raw(&session, raw(json!([50, 1, {}])));
        assert_eq!(disposition, Disposition::Close);
        assert_eq!(drain(&mut rx)[0].uri(1), Some("wamp.error.protocol_violation"));
    }

    #[test]
    fn test_unannounced_role_aborts() {
        let handler = test_handler();
        let (session, mut rx) = join(&handler, 1, json!({"caller": {}}));
        let disposition = handler.handle_raw(&session, raw(json!([64, 1, {}, "com.echo"])));
        assert_eq!(disposition, Disposition::Close);
        assert_eq!(drain(&mut rx)[0].kind(), MessageType::Abort);
    }

    #[test]
    fn test_malformed_request_gets_error() {
        let handler = test_handler();
        let (session, mut rx) = join(&handler, 1, json!({"caller": {}}));
        let disposition =
            handler.handle_raw(&session, raw(json!([48, 5, "not-a-dict", "com.echo"])));
        assert_eq!(disposition, Disposition::Continue);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), MessageType::Error);
        assert_eq!(sent[0].int(0), Some(48));
        assert_eq!(sent[0].id(1), Some(5));
        assert_eq!(sent[0].uri(3), Some("wamp.error.invalid_argument"));
    }

    #[test]
    fn test_malformed_without_request_aborts() {
        let handler = test_handler();
        let (session, mut rx) = join(&handler, 1, json!({"caller": {}}));
        assert_eq!(
            handler.handle_raw(&session, raw(json!([999, 1]))),
            Disposition::Close
        );
        assert_eq!(drain(&mut rx)[0].uri(1), Some("wamp.error.protocol_violation"));
    }

    #[test]
    fn test_echo_through_handler() {
        let handler = test_handler();
        let (callee, mut callee_rx) = join(&handler, 1, json!({"callee": {}}));
        let (caller, mut caller_rx) = join(&handler, 2, json!({"caller": {}}));

        handler.handle_raw(&callee, raw(json!([64, 1, {}, "com.echo"])));
        assert_eq!(drain(&mut callee_rx)[0].kind(), MessageType::Registered);
        assert_eq!(handler.metrics().unwrap().registrations.get(), 1.0);

        handler.handle_raw(&caller, raw(json!([48, 9, {}, "com.echo", ["hi"]])));
        let invocation = drain(&mut callee_rx).remove(0);
        assert_eq!(invocation.kind(), MessageType::Invocation);

        let request = invocation.id(0).unwrap();
        handler.handle_raw(&callee, raw(json!([70, request, {}, ["hi"]])));
        let result = drain(&mut caller_rx).remove(0);
        assert_eq!(result.kind(), MessageType::Result);
        assert_eq!(result.list(2), Some(&vec![json!("hi")]));
    }

    #[test]
    fn test_close_session_releases_registrations() {
        let handler = test_handler();
        let (callee, mut callee_rx) = join(&handler, 1, json!({"callee": {}}));
        handler.handle_raw(&callee, raw(json!([64, 1, {}, "com.echo"])));
        drain(&mut callee_rx);

        handler.close_session(&callee);
        assert!(handler.dealer().table().is_empty());
        let metrics = handler.metrics().unwrap();
        assert_eq!(metrics.sessions_active.get(), 0.0);
        assert_eq!(metrics.registrations.get(), 0.0);
    }

    #[test]
    fn test_shutdown_message() {
        let handler = test_handler();
        let goodbye = handler.shutdown_message().unwrap();
        assert_eq!(goodbye.kind(), MessageType::Goodbye);
        assert_eq!(goodbye.uri(1), Some("wamp.error.system_shutdown"));
    }
}
