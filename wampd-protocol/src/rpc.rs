//! Typed views over the RPC messages.
//!
//! [`RpcMessage`] converts a validated positional [`Message`] into named
//! fields, and back again through the [`MessageRegistry`] so that outbound
//! messages are validated the same way inbound ones are.

use crate::error::ProtocolError;
use crate::message::{Message, MessageRegistry, MessageType};
use serde_json::{Map, Value};

pub type Dict = Map<String, Value>;

/// Optional positional and keyword arguments trailing a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Dict>,
}

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn args(args: Vec<Value>) -> Self {
        Self {
            args: Some(args),
            kwargs: None,
        }
    }

    pub fn with_kwargs(mut self, kwargs: Dict) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_none() && self.kwargs.is_none()
    }

    fn append_to(self, fields: &mut Vec<Value>) {
        match (self.args, self.kwargs) {
            (args, Some(kwargs)) => {
                fields.push(Value::Array(args.unwrap_or_default()));
                fields.push(Value::Object(kwargs));
            }
            (Some(args), None) => fields.push(Value::Array(args)),
            (None, None) => {}
        }
    }
}

/// RPC messages with named fields.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Register {
        request: u64,
        options: Dict,
        procedure: String,
    },
    Registered {
        request: u64,
        registration: u64,
    },
    Unregister {
        request: u64,
        registration: u64,
    },
    Unregistered {
        request: u64,
        details: Option<Dict>,
    },
    Call {
        request: u64,
        options: Dict,
        procedure: String,
        payload: Payload,
    },
    Cancel {
        request: u64,
        options: Dict,
    },
    Result {
        request: u64,
        details: Dict,
        payload: Payload,
    },
    Invocation {
        request: u64,
        registration: u64,
        details: Dict,
        payload: Payload,
    },
    Interrupt {
        request: u64,
        options: Dict,
    },
    Yield {
        request: u64,
        options: Dict,
        payload: Payload,
    },
    Error {
        request_type: MessageType,
        request: u64,
        details: Dict,
        error: String,
        payload: Payload,
    },
}

struct Fields(std::vec::IntoIter<Value>);

impl Fields {
    fn id(&mut self, name: &'static str) -> Result<u64, ProtocolError> {
        self.0
            .next()
            .and_then(|v| v.as_u64())
            .ok_or(ProtocolError::MissingField(name))
    }

    fn dict(&mut self, name: &'static str) -> Result<Dict, ProtocolError> {
        match self.0.next() {
            Some(Value::Object(map)) => Ok(map),
            _ => Err(ProtocolError::MissingField(name)),
        }
    }

    fn string(&mut self, name: &'static str) -> Result<String, ProtocolError> {
        match self.0.next() {
            Some(Value::String(s)) => Ok(s),
            _ => Err(ProtocolError::MissingField(name)),
        }
    }

    fn payload(&mut self) -> Payload {
        let args = match self.0.next() {
            Some(Value::Array(args)) => Some(args),
            _ => None,
        };
        let kwargs = match self.0.next() {
            Some(Value::Object(kwargs)) => Some(kwargs),
            _ => None,
        };
        Payload { args, kwargs }
    }
}

impl TryFrom<Message> for RpcMessage {
    type Error = ProtocolError;

    fn try_from(message: Message) -> Result<Self, ProtocolError> {
        let kind = message.kind();
        let mut f = Fields(message.into_fields().into_iter());
        let rpc = match kind {
            MessageType::Register => RpcMessage::Register {
                request: f.id("Request")?,
                options: f.dict("Options")?,
                procedure: f.string("Procedure")?,
            },
            MessageType::Registered => RpcMessage::Registered {
                request: f.id("Request")?,
                registration: f.id("Registration")?,
            },
            MessageType::Unregister => RpcMessage::Unregister {
                request: f.id("Request")?,
                registration: f.id("Registration")?,
            },
            MessageType::Unregistered => RpcMessage::Unregistered {
                request: f.id("Request")?,
                details: f.dict("Details").ok(),
            },
            MessageType::Call => RpcMessage::Call {
                request: f.id("Request")?,
                options: f.dict("Options")?,
                procedure: f.string("Procedure")?,
                payload: f.payload(),
            },
            MessageType::Cancel => RpcMessage::Cancel {
                request: f.id("Request")?,
                options: f.dict("Options")?,
            },
            MessageType::Result => RpcMessage::Result {
                request: f.id("Request")?,
                details: f.dict("Details")?,
                payload: f.payload(),
            },
            MessageType::Invocation => RpcMessage::Invocation {
                request: f.id("Request")?,
                registration: f.id("Registration")?,
                details: f.dict("Details")?,
                payload: f.payload(),
            },
            MessageType::Interrupt => RpcMessage::Interrupt {
                request: f.id("Request")?,
                options: f.dict("Options")?,
            },
            MessageType::Yield => RpcMessage::Yield {
                request: f.id("Request")?,
                options: f.dict("Options")?,
                payload: f.payload(),
            },
            MessageType::Error => {
                let code = f.id("RequestType")?;
                let request_type = MessageType::from_code(code)
                    .ok_or_else(|| ProtocolError::InvalidTypeCode(code.to_string()))?;
                RpcMessage::Error {
                    request_type,
                    request: f.id("Request")?,
                    details: f.dict("Details")?,
                    error: f.string("Error")?,
                    payload: f.payload(),
                }
            }
            other => return Err(ProtocolError::NotRpc(other.name())),
        };
        Ok(rpc)
    }
}

impl RpcMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            RpcMessage::Register { .. } => MessageType::Register,
            RpcMessage::Registered { .. } => MessageType::Registered,
            RpcMessage::Unregister { .. } => MessageType::Unregister,
            RpcMessage::Unregistered { .. } => MessageType::Unregistered,
            RpcMessage::Call { .. } => MessageType::Call,
            RpcMessage::Cancel { .. } => MessageType::Cancel,
            RpcMessage::Result { .. } => MessageType::Result,
            RpcMessage::Invocation { .. } => MessageType::Invocation,
            RpcMessage::Interrupt { .. } => MessageType::Interrupt,
            RpcMessage::Yield { .. } => MessageType::Yield,
            RpcMessage::Error { .. } => MessageType::Error,
        }
    }

    /// Request id the message refers to.
    pub fn request(&self) -> u64 {
        match self {
            RpcMessage::Register { request, .. }
            | RpcMessage::Registered { request, .. }
            | RpcMessage::Unregister { request, .. }
            | RpcMessage::Unregistered { request, .. }
            | RpcMessage::Call { request, .. }
            | RpcMessage::Cancel { request, .. }
            | RpcMessage::Result { request, .. }
            | RpcMessage::Invocation { request, .. }
            | RpcMessage::Interrupt { request, .. }
            | RpcMessage::Yield { request, .. }
            | RpcMessage::Error { request, .. } => *request,
        }
    }

    /// Converts back to a positional message, validated by `registry`.
    pub fn into_message(self, registry: &MessageRegistry) -> Result<Message, ProtocolError> {
        let kind = self.kind();
        let mut fields = Vec::with_capacity(6);
        match self {
            RpcMessage::Register {
                request,
                options,
                procedure,
            } => {
                fields.push(request.into());
                fields.push(Value::Object(options));
                fields.push(procedure.into());
            }
            RpcMessage::Registered {
                request,
                registration,
            }
            | RpcMessage::Unregister {
                request,
                registration,
            } => {
                fields.push(request.into());
                fields.push(registration.into());
            }
            RpcMessage::Unregistered { request, details } => {
                fields.push(request.into());
                if let Some(details) = details {
                    fields.push(Value::Object(details));
                }
            }
            RpcMessage::Call {
                request,
                options,
                procedure,
                payload,
            } => {
                fields.push(request.into());
                fields.push(Value::Object(options));
                fields.push(procedure.into());
                payload.append_to(&mut fields);
            }
            RpcMessage::Cancel { request, options }
            | RpcMessage::Interrupt { request, options } => {
                fields.push(request.into());
                fields.push(Value::Object(options));
            }
            RpcMessage::Result {
                request,
                details,
                payload,
            } => {
                fields.push(request.into());
                fields.push(Value::Object(details));
                payload.append_to(&mut fields);
            }
            RpcMessage::Invocation {
                request,
                registration,
                details,
                payload,
            } => {
                fields.push(request.into());
                fields.push(registration.into());
                fields.push(Value::Object(details));
                payload.append_to(&mut fields);
            }
            RpcMessage::Yield {
                request,
                options,
                payload,
            } => {
                fields.push(request.into());
                fields.push(Value::Object(options));
                payload.append_to(&mut fields);
            }
            RpcMessage::Error {
                request_type,
                request,
                details,
                error,
                payload,
            } => {
                fields.push(request_type.code().into());
                fields.push(request.into());
                fields.push(Value::Object(details));
                fields.push(error.into());
                payload.append_to(&mut fields);
            }
        }
        registry.build(kind, fields)
    }
}
