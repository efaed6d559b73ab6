//! Positional wire messages and the message-type table.
//!
//! A message on the wire is a JSON array whose first element is an integer
//! type code, followed by a fixed number of typed fields. One type code may
//! accept several field-count variants (trailing `Arguments`/`ArgumentsKw`
//! are optional, for example). The [`MessageRegistry`] holds, for every type
//! code, the accepted variants and the advisory role flow. It is built once
//! and shared; there is no global table.

use crate::error::ProtocolError;
use crate::uri::{is_valid_id, is_valid_uri};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Welcome,
    Abort,
    Goodbye,
    Error,
    Call,
    Cancel,
    Result,
    Register,
    Registered,
    Unregister,
    Unregistered,
    Invocation,
    Interrupt,
    Yield,
}

impl MessageType {
    pub const ALL: [MessageType; 15] = [
        MessageType::Hello,
        MessageType::Welcome,
        MessageType::Abort,
        MessageType::Goodbye,
        MessageType::Error,
        MessageType::Call,
        MessageType::Cancel,
        MessageType::Result,
        MessageType::Register,
        MessageType::Registered,
        MessageType::Unregister,
        MessageType::Unregistered,
        MessageType::Invocation,
        MessageType::Interrupt,
        MessageType::Yield,
    ];

    pub fn code(&self) -> u64 {
        match self {
            MessageType::Hello => 1,
            MessageType::Welcome => 2,
            MessageType::Abort => 3,
            MessageType::Goodbye => 6,
            MessageType::Error => 8,
            MessageType::Call => 48,
            MessageType::Cancel => 49,
            MessageType::Result => 50,
            MessageType::Register => 64,
            MessageType::Registered => 65,
            MessageType::Unregister => 66,
            MessageType::Unregistered => 67,
            MessageType::Invocation => 68,
            MessageType::Interrupt => 69,
            MessageType::Yield => 70,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Abort => "ABORT",
            MessageType::Goodbye => "GOODBYE",
            MessageType::Error => "ERROR",
            MessageType::Call => "CALL",
            MessageType::Cancel => "CANCEL",
            MessageType::Result => "RESULT",
            MessageType::Register => "REGISTER",
            MessageType::Registered => "REGISTERED",
            MessageType::Unregister => "UNREGISTER",
            MessageType::Unregistered => "UNREGISTERED",
            MessageType::Invocation => "INVOCATION",
            MessageType::Interrupt => "INTERRUPT",
            MessageType::Yield => "YIELD",
        }
    }

    /// Returns whether the message opens a request that the router answers
    /// with a reply or an ERROR carrying the same request id.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::Call
                | MessageType::Cancel
                | MessageType::Register
                | MessageType::Unregister
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Peer roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Callee,
    Publisher,
    Subscriber,
    Dealer,
    Broker,
}

impl Role {
    pub const CLIENT: [Role; 4] = [Role::Caller, Role::Callee, Role::Publisher, Role::Subscriber];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Dealer => "dealer",
            Role::Broker => "broker",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Role::Caller,
            Role::Callee,
            Role::Publisher,
            Role::Subscriber,
            Role::Dealer,
            Role::Broker,
        ]
        .into_iter()
        .find(|r| r.as_str() == name)
    }

    pub fn is_router(&self) -> bool {
        matches!(self, Role::Dealer | Role::Broker)
    }
}

/// One legal sender → receiver direction for a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleFlow {
    pub from: Role,
    pub to: Role,
}

const fn flow(from: Role, to: Role) -> RoleFlow {
    RoleFlow { from, to }
}

/// Field datatypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Uri,
    Id,
    Int,
    String,
    Bool,
    Dict,
    List,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Uri => "uri",
            FieldType::Id => "id",
            FieldType::Int => "integer",
            FieldType::String => "string",
            FieldType::Bool => "bool",
            FieldType::Dict => "dict",
            FieldType::List => "list",
        }
    }

    /// Returns whether `value` satisfies this datatype.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Uri => value.as_str().is_some_and(is_valid_uri),
            FieldType::Id => value.as_u64().is_some_and(is_valid_id),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::String => value.is_string(),
            FieldType::Bool => value.is_boolean(),
            // JSON object keys are always strings, so any object qualifies.
            FieldType::Dict => value.is_object(),
            FieldType::List => value.is_array(),
        }
    }
}

/// A named, typed position in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
}

impl Field {
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty }
    }
}

/// Accepted shapes and role flows of one message type.
#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub kind: MessageType,
    pub variants: Vec<Vec<Field>>,
    pub flows: Vec<RoleFlow>,
}

impl MessageSpec {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            variants: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn variant(mut self, fields: &[Field]) -> Self {
        self.variants.push(fields.to_vec());
        self
    }

    /// Adds `fields` plus the variants with trailing `Arguments` and
    /// `Arguments, ArgumentsKw`.
    pub fn with_payload(mut self, fields: &[Field]) -> Self {
        self.variants.push(fields.to_vec());
        let mut with_args = fields.to_vec();
        with_args.push(ARGUMENTS);
        self.variants.push(with_args.clone());
        with_args.push(ARGUMENTS_KW);
        self.variants.push(with_args);
        self
    }

    pub fn flow(mut self, from: Role, to: Role) -> Self {
        self.flows.push(flow(from, to));
        self
    }

    /// Returns whether a client peer may legally send this message.
    pub fn client_may_send(&self) -> bool {
        self.flows.iter().any(|f| !f.from.is_router())
    }

    /// Returns whether a router may legally send this message.
    pub fn router_may_send(&self) -> bool {
        self.flows.iter().any(|f| f.from.is_router())
    }

    fn check(&self, variant: &[Field], fields: &[Value]) -> Result<(), ProtocolError> {
        for (field, value) in variant.iter().zip(fields) {
            if !field.ty.accepts(value) {
                return Err(ProtocolError::FieldType {
                    kind: self.kind.name(),
                    field: field.name,
                    expected: field.ty.name(),
                });
            }
        }
        Ok(())
    }

    /// Selects the variant for `fields`: by count first, then by datatype
    /// when several variants share the count.
    fn validate(&self, fields: &[Value]) -> Result<usize, ProtocolError> {
        let mut first_error = None;
        for (index, variant) in self.variants.iter().enumerate() {
            if variant.len() != fields.len() {
                continue;
            }
            match self.check(variant, fields) {
                Ok(()) => return Ok(index),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or(ProtocolError::FieldCount {
            kind: self.kind.name(),
            count: fields.len(),
        }))
    }
}

const REQUEST: Field = Field::new("Request", FieldType::Id);
const OPTIONS: Field = Field::new("Options", FieldType::Dict);
const DETAILS: Field = Field::new("Details", FieldType::Dict);
const PROCEDURE: Field = Field::new("Procedure", FieldType::Uri);
const REGISTRATION: Field = Field::new("Registration", FieldType::Id);
const REASON: Field = Field::new("Reason", FieldType::Uri);
const ARGUMENTS: Field = Field::new("Arguments", FieldType::List);
const ARGUMENTS_KW: Field = Field::new("ArgumentsKw", FieldType::Dict);

/// Table of message types, built once and shared by the codec and dealer.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    specs: HashMap<MessageType, MessageSpec>,
}

impl MessageRegistry {
    /// Creates a registry with no message types.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates the registry of session and RPC messages.
    pub fn standard() -> Self {
        use Role::*;

        Self::empty()
            .define(
                MessageSpec::new(MessageType::Hello)
                    .variant(&[Field::new("Realm", FieldType::Uri), DETAILS])
                    .flow(Caller, Dealer)
                    .flow(Callee, Dealer)
                    .flow(Publisher, Broker)
                    .flow(Subscriber, Broker),
            )
            .define(
                MessageSpec::new(MessageType::Welcome)
                    .variant(&[Field::new("Session", FieldType::Id), DETAILS])
                    .flow(Dealer, Caller)
                    .flow(Dealer, Callee)
                    .flow(Broker, Publisher)
                    .flow(Broker, Subscriber),
            )
            .define(
                MessageSpec::new(MessageType::Abort)
                    .variant(&[DETAILS, REASON])
                    .flow(Caller, Dealer)
                    .flow(Callee, Dealer)
                    .flow(Dealer, Caller)
                    .flow(Dealer, Callee),
            )
            .define(
                MessageSpec::new(MessageType::Goodbye)
                    .variant(&[DETAILS, REASON])
                    .flow(Caller, Dealer)
                    .flow(Callee, Dealer)
                    .flow(Dealer, Caller)
                    .flow(Dealer, Callee),
            )
            .define(
                MessageSpec::new(MessageType::Error)
                    .with_payload(&[
                        Field::new("RequestType", FieldType::Int),
                        REQUEST,
                        DETAILS,
                        Field::new("Error", FieldType::Uri),
                    ])
                    .flow(Callee, Dealer)
                    .flow(Dealer, Caller)
                    .flow(Dealer, Callee),
            )
            .define(
                MessageSpec::new(MessageType::Call)
                    .with_payload(&[REQUEST, OPTIONS, PROCEDURE])
                    .flow(Caller, Dealer),
            )
            .define(
                MessageSpec::new(MessageType::Cancel)
                    .variant(&[REQUEST, OPTIONS])
                    .flow(Caller, Dealer),
            )
            .define(
                MessageSpec::new(MessageType::Result)
                    .with_payload(&[REQUEST, DETAILS])
                    .flow(Dealer, Caller),
            )
            .define(
                MessageSpec::new(MessageType::Register)
                    .variant(&[REQUEST, OPTIONS, PROCEDURE])
                    .flow(Callee, Dealer),
            )
            .define(
                MessageSpec::new(MessageType::Registered)
                    .variant(&[REQUEST, REGISTRATION])
                    .flow(Dealer, Callee),
            )
            .define(
                MessageSpec::new(MessageType::Unregister)
                    .variant(&[REQUEST, REGISTRATION])
                    .flow(Callee, Dealer),
            )
            .define(
                MessageSpec::new(MessageType::Unregistered)
                    .variant(&[REQUEST])
                    .variant(&[REQUEST, DETAILS])
                    .flow(Dealer, Callee),
            )
            .define(
                MessageSpec::new(MessageType::Invocation)
                    .with_payload(&[REQUEST, REGISTRATION, DETAILS])
                    .flow(Dealer, Callee),
            )
            .define(
                MessageSpec::new(MessageType::Interrupt)
                    .variant(&[REQUEST, OPTIONS])
                    .flow(Dealer, Callee),
            )
            .define(
                MessageSpec::new(MessageType::Yield)
                    .with_payload(&[REQUEST, OPTIONS])
                    .flow(Callee, Dealer),
            )
    }

    /// Adds or replaces the spec for one message type.
    pub fn define(mut self, spec: MessageSpec) -> Self {
        self.specs.insert(spec.kind, spec);
        self
    }

    pub fn spec(&self, kind: MessageType) -> Option<&MessageSpec> {
        self.specs.get(&kind)
    }

    /// Parses raw fields (`[code, field...]`) into a validated message.
    pub fn parse(&self, raw: Vec<Value>) -> Result<Message, ProtocolError> {
        let mut raw = raw.into_iter();
        let code = raw.next().ok_or(ProtocolError::NotAnArray)?;
        let spec = code
            .as_u64()
            .and_then(MessageType::from_code)
            .and_then(|kind| self.specs.get(&kind))
            .ok_or_else(|| ProtocolError::InvalidTypeCode(code.to_string()))?;

        let fields: Vec<Value> = raw.collect();
        spec.validate(&fields)?;
        Ok(Message {
            kind: spec.kind,
            fields,
        })
    }

    /// Parses a JSON value that must be a message array.
    pub fn parse_value(&self, value: Value) -> Result<Message, ProtocolError> {
        match value {
            Value::Array(raw) => self.parse(raw),
            _ => Err(ProtocolError::NotAnArray),
        }
    }

    /// Builds a message, validating `fields` exactly as [`parse`](Self::parse) would.
    pub fn build(&self, kind: MessageType, fields: Vec<Value>) -> Result<Message, ProtocolError> {
        let spec = self
            .specs
            .get(&kind)
            .ok_or_else(|| ProtocolError::InvalidTypeCode(kind.code().to_string()))?;
        spec.validate(&fields)?;
        Ok(Message { kind, fields })
    }

    /// Extracts `(type, request id)` from raw fields of a request message,
    /// so that a structurally broken request can still be answered.
    pub fn recover_request(raw: &[Value]) -> Option<(MessageType, u64)> {
        let kind = raw.first()?.as_u64().and_then(MessageType::from_code)?;
        let request = raw.get(1)?.as_u64().filter(|id| is_valid_id(*id))?;
        kind.is_request().then_some((kind, request))
    }
}

/// A validated protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageType,
    fields: Vec<Value>,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Fields after the type code.
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }

    pub fn id(&self, index: usize) -> Option<u64> {
        self.field(index).and_then(Value::as_u64)
    }

    pub fn int(&self, index: usize) -> Option<i64> {
        self.field(index).and_then(Value::as_i64)
    }

    pub fn uri(&self, index: usize) -> Option<&str> {
        self.field(index).and_then(Value::as_str)
    }

    pub fn dict(&self, index: usize) -> Option<&Map<String, Value>> {
        self.field(index).and_then(Value::as_object)
    }

    pub fn list(&self, index: usize) -> Option<&Vec<Value>> {
        self.field(index).and_then(Value::as_array)
    }

    /// Returns the raw fields, type code first.
    pub fn serialize(&self) -> Vec<Value> {
        let mut raw = Vec::with_capacity(self.fields.len() + 1);
        raw.push(Value::from(self.kind.code()));
        raw.extend(self.fields.iter().cloned());
        raw
    }

    pub fn into_fields(self) -> Vec<Value> {
        self.fields
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let code = Value::from(self.kind.code());
        serializer.collect_seq(std::iter::once(&code).chain(self.fields.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Vec<Value> {
        value.as_array().unwrap().clone()
    }

    #[test]
    fn test_parse_call_variants() {
        let registry = MessageRegistry::standard();

        let msg = registry.parse(raw(json!([48, 7, {}, "com.echo"]))).unwrap();
        assert_eq!(msg.kind(), MessageType::Call);
        assert_eq!(msg.id(0), Some(7));
        assert_eq!(msg.uri(2), Some("com.echo"));
        assert!(msg.list(3).is_none());

        let msg = registry
            .parse(raw(json!([48, 7, {}, "com.echo", ["hi"], {"k": 1}])))
            .unwrap();
        assert_eq!(msg.list(3).unwrap().len(), 1);
        assert_eq!(msg.dict(4).unwrap()["k"], json!(1));
    }

    #[test]
    fn test_parse_rejects_unknown_code() {
        let registry = MessageRegistry::standard();
        let err = registry.parse(raw(json!([999, 1]))).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTypeCode(_)));

        let err = registry.parse(raw(json!(["CALL", 1]))).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTypeCode(_)));

        let err = registry.parse(Vec::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnArray));
    }

    #[test]
    fn test_parse_rejects_field_count() {
        let registry = MessageRegistry::standard();
        let err = registry.parse(raw(json!([64, 1, {}]))).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FieldCount {
                kind: "REGISTER",
                count: 2
            }
        ));
    }

    #[test]
    fn test_parse_rejects_bad_datatypes() {
        let registry = MessageRegistry::standard();

        // id out of range
        let err = registry.parse(raw(json!([66, 0, 5]))).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldType { field: "Request", .. }));

        let too_big = 1u64 << 56;
        let err = registry.parse(raw(json!([66, 1, too_big]))).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FieldType {
                field: "Registration",
                ..
            }
        ));

        // whitespace in uri
        let err = registry
            .parse(raw(json!([64, 1, {}, "com.bad name"])))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FieldType {
                field: "Procedure",
                ..
            }
        ));

        // options must be a dict
        let err = registry
            .parse(raw(json!([48, 1, [], "com.echo"])))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FieldType { field: "Options", .. }));
    }

    #[test]
    fn test_unregistered_variants_by_count() {
        let registry = MessageRegistry::standard();
        let short = registry.parse(raw(json!([67, 3]))).unwrap();
        assert_eq!(short.fields().len(), 1);
        let long = registry
            .parse(raw(json!([67, 3, {"reason": "revoked"}])))
            .unwrap();
        assert_eq!(long.dict(1).unwrap()["reason"], json!("revoked"));
    }

    #[test]
    fn test_ambiguous_count_falls_back_to_datatypes() {
        let registry = MessageRegistry::empty().define(
            MessageSpec::new(MessageType::Goodbye)
                .variant(&[
                    Field::new("Details", FieldType::Dict),
                    Field::new("Reason", FieldType::Uri),
                ])
                .variant(&[
                    Field::new("Reason", FieldType::Uri),
                    Field::new("Flag", FieldType::Bool),
                ]),
        );

        assert!(registry.parse(raw(json!([6, {}, "wamp.close.normal"]))).is_ok());
        assert!(registry.parse(raw(json!([6, "wamp.close.normal", true]))).is_ok());

        // Count matches both, datatypes match neither: first variant's error.
        let err = registry.parse(raw(json!([6, 1, 2]))).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldType { field: "Details", .. }));
    }

    #[test]
    fn test_build_validates() {
        let registry = MessageRegistry::standard();
        let ok = registry.build(MessageType::Registered, vec![json!(1), json!(2)]);
        assert!(ok.is_ok());

        let bad = registry.build(MessageType::Registered, vec![json!(1), json!("two")]);
        assert!(bad.is_err());

        let missing = MessageRegistry::empty().build(MessageType::Call, vec![]);
        assert!(matches!(missing, Err(ProtocolError::InvalidTypeCode(_))));
    }

    #[test]
    fn test_serialize_is_inverse_of_parse() {
        let registry = MessageRegistry::standard();
        let input = raw(json!([70, 12, {"progress": true}, [1, 2]]));
        let msg = registry.parse(input.clone()).unwrap();
        assert_eq!(msg.serialize(), input);
        assert_eq!(serde_json::to_value(&msg).unwrap(), Value::Array(input));
    }

    #[test]
    fn test_role_flows() {
        let registry = MessageRegistry::standard();
        let call = registry.spec(MessageType::Call).unwrap();
        assert!(call.client_may_send());
        assert!(!call.router_may_send());

        let invocation = registry.spec(MessageType::Invocation).unwrap();
        assert!(!invocation.client_may_send());
        assert!(invocation.router_may_send());

        let error = registry.spec(MessageType::Error).unwrap();
        assert!(error.client_may_send());
        assert!(error.router_may_send());
    }

    #[test]
    fn test_recover_request() {
        let recovered = MessageRegistry::recover_request(&raw(json!([48, 9, "bogus"])));
        assert_eq!(recovered, Some((MessageType::Call, 9)));

        assert_eq!(
            MessageRegistry::recover_request(&raw(json!([70, 9, "bogus"]))),
            None
        );
        assert_eq!(
            MessageRegistry::recover_request(&raw(json!([48, 0, {}]))),
            None
        );
    }

    #[test]
    fn test_every_type_is_defined() {
        let registry = MessageRegistry::standard();
        for kind in MessageType::ALL {
            assert!(registry.spec(kind).is_some(), "{kind} missing");
            assert_eq!(MessageType::from_code(kind.code()), Some(kind));
        }
    }
}
