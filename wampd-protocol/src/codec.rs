//! Encoder and decoder for framed messages.
//!
//! Decoders hand back the raw field array rather than a validated
//! [`Message`]: validation needs the [`MessageRegistry`](crate::MessageRegistry),
//! and a caller that gets a structural error still wants the raw fields to
//! recover the request id.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use bytes::{Bytes, BytesMut};
use serde_json::Value;

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a frame.
    pub fn encode_message(message: &Message) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(message)?;
        frame.encode()
    }
}

fn raw_fields(payload: &[u8]) -> Result<Vec<Value>, ProtocolError> {
    let json = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    match serde_json::from_str(json)? {
        Value::Array(raw) if !raw.is_empty() => Ok(raw),
        _ => Err(ProtocolError::NotAnArray),
    }
}

/// Decodes frames into raw message fields.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message's raw fields from the buffer.
    pub fn decode_raw(&mut self) -> Result<Option<Vec<Value>>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => raw_fields(&frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Line-delimited JSON codec for debug mode.
pub mod jsonl {
    use super::*;

    /// Encodes a message as a JSON line (no framing).
    pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Line-delimited JSON decoder.
    pub struct LineDecoder {
        buffer: Vec<u8>,
    }

    impl LineDecoder {
        pub fn new() -> Self {
            Self {
                buffer: Vec::with_capacity(4096),
            }
        }

        pub fn extend(&mut self, data: &[u8]) {
            self.buffer.extend_from_slice(data);
        }

        /// Attempts to decode the next line's raw fields. Blank lines are skipped.
        pub fn decode_raw(&mut self) -> Result<Option<Vec<Value>>, ProtocolError> {
            while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return raw_fields(line).map(Some);
            }
            Ok(None)
        }
    }

    impl Default for LineDecoder {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageRegistry, MessageType};
    use serde_json::json;

    fn call_message() -> Message {
        MessageRegistry::standard()
            .parse_value(json!([48, 42, {}, "com.echo", ["hi"]]))
            .unwrap()
    }

    #[test]
    fn test_encoder_decoder_roundtrip() {
        let encoded = Encoder::encode_message(&call_message()).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let raw = decoder.decode_raw().unwrap().unwrap();
        let parsed = MessageRegistry::standard().parse(raw).unwrap();
        assert_eq!(parsed.kind(), MessageType::Call);
        assert_eq!(parsed.id(0), Some(42));
    }

    #[test]
    fn test_partial_frame_decoding() {
        let encoded = Encoder::encode_message(&call_message()).unwrap();
        let mut decoder = Decoder::new();

        decoder.extend(&encoded[..10]);
        assert!(decoder.decode_raw().unwrap().is_none());

        decoder.extend(&encoded[10..]);
        assert!(decoder.decode_raw().unwrap().is_some());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_non_array_payload_rejected() {
        let frame = Frame::new(Bytes::from(r#"{"type":"request"}"#));
        let mut decoder = Decoder::new();
        decoder.extend_bytes(Bytes::from(frame.encode().unwrap().to_vec()));
        assert!(matches!(decoder.decode_raw(), Err(ProtocolError::NotAnArray)));

        let frame = Frame::new(Bytes::from("[]"));
        decoder.extend(&frame.encode().unwrap());
        assert!(matches!(decoder.decode_raw(), Err(ProtocolError::NotAnArray)));
    }

    #[test]
    fn test_decoder_buffered() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_jsonl_roundtrip() {
        let encoded = jsonl::encode(&call_message()).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));

        let mut decoder = jsonl::LineDecoder::new();
        decoder.extend(&encoded);

        let raw = decoder.decode_raw().unwrap().unwrap();
        assert_eq!(raw[0], json!(48));
        assert_eq!(raw[3], json!("com.echo"));
    }

    #[test]
    fn test_jsonl_partial_and_blank_lines() {
        let mut decoder = jsonl::LineDecoder::default();
        decoder.extend(b"\n  \n[70,1,");
        assert!(decoder.decode_raw().unwrap().is_none());

        decoder.extend(b"{}]\n[70,2,{}]\n");
        assert_eq!(decoder.decode_raw().unwrap().unwrap()[1], json!(1));
        assert_eq!(decoder.decode_raw().unwrap().unwrap()[1], json!(2));
        assert!(decoder.decode_raw().unwrap().is_none());
    }
}
