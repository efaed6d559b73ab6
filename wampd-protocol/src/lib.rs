//! # wampd-protocol
//!
//! Wire message model for the wampd router.
//!
//! This crate provides:
//! - The message-type table with field signatures and role flows
//! - Validated parsing, building and serialization of positional messages
//! - Typed views of the RPC messages
//! - URI and ID validation, option vocabulary, standard error URIs
//! - Binary framing with length prefix and CRC32C, plus a JSONL debug codec

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod options;
pub mod rpc;
pub mod uri;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorUri, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Field, FieldType, Message, MessageRegistry, MessageSpec, MessageType, Role};
pub use options::{CancelMode, InvocationPolicy, MatchPolicy};
pub use rpc::{Dict, Payload, RpcMessage};
pub use uri::MAX_ID;

/// Frame format version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the wampd router.
pub const DEFAULT_PORT: u16 = 8080;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
