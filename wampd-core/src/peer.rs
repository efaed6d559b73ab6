//! Collaborator traits: connected sessions and the meta-event broker.

use serde::Serialize;
use serde_json::{json, Value};
use wampd_protocol::{Message, Role};

/// Feature names announced in HELLO/WELCOME role details.
pub mod features {
    pub const PROGRESSIVE_CALL_RESULTS: &str = "progressive_call_results";
    pub const CALL_CANCELING: &str = "call_canceling";
    pub const CALL_TIMEOUT: &str = "call_timeout";
    pub const SHARED_REGISTRATION: &str = "shared_registration";
    pub const PATTERN_BASED_REGISTRATION: &str = "pattern_based_registration";
    pub const CALLER_IDENTIFICATION: &str = "caller_identification";
    pub const REGISTRATION_META_API: &str = "registration_meta_api";

    /// Everything the dealer implements.
    pub const DEALER: [&str; 7] = [
        PROGRESSIVE_CALL_RESULTS,
        CALL_CANCELING,
        CALL_TIMEOUT,
        SHARED_REGISTRATION,
        PATTERN_BASED_REGISTRATION,
        CALLER_IDENTIFICATION,
        REGISTRATION_META_API,
    ];
}

/// A connected peer as seen by the dealer.
///
/// Implemented by the transport layer. `send` must not block: outbound
/// messages are queued and written by the session's own task.
pub trait Peer: Send + Sync {
    fn session_id(&self) -> u64;

    fn has_role(&self, role: Role) -> bool;

    /// Returns whether the peer announced `feature` under `role`.
    fn supports(&self, role: Role, feature: &str) -> bool;

    fn send(&self, message: Message);

    /// Next id for a router-to-peer request, unique within this session.
    fn next_request_id(&self) -> u64;
}

/// Registration lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEventKind {
    Create,
    Register,
    Unregister,
    Delete,
}

impl RegistrationEventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            RegistrationEventKind::Create => "wamp.registration.on_create",
            RegistrationEventKind::Register => "wamp.registration.on_register",
            RegistrationEventKind::Unregister => "wamp.registration.on_unregister",
            RegistrationEventKind::Delete => "wamp.registration.on_delete",
        }
    }
}

/// Public description of a registration entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationDetails {
    pub id: u64,
    pub created: String,
    pub uri: String,
    #[serde(rename = "match")]
    pub match_policy: String,
    pub invoke: String,
}

/// One event published to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationEvent {
    pub kind: RegistrationEventKind,
    pub session: u64,
    /// Entry id the event refers to.
    pub registration: u64,
    /// Present on `Create` only.
    pub details: Option<RegistrationDetails>,
}

impl RegistrationEvent {
    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }

    /// Positional event arguments: `[session, details]` on create,
    /// `[session, registration]` otherwise.
    pub fn args(&self) -> Vec<Value> {
        match &self.details {
            Some(details) => vec![json!(self.session), json!(details)],
            None => vec![json!(self.session), json!(self.registration)],
        }
    }
}

/// Receives registration lifecycle events. Delivery is one-way.
pub trait MetaEventSink: Send + Sync {
    fn publish(&self, event: RegistrationEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetaEventSink for NullSink {
    fn publish(&self, _event: RegistrationEvent) {}
}
