//! Packet type tagging.
//!
//! Every structured message is a JSON object carrying an integer `"type"`
//! field. The field is used only for dispatch; the rest of the schema
//! belongs to the upper layers.

use std::net::SocketAddr;

use serde_json::Value;
use thiserror::Error;

/// Integer packet type code.
pub type PacketType = i64;

/// Key of the type tag in every structured message.
pub const TYPE_KEY: &str = "type";

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no integer 'type' field")]
    MissingType,
}

/// A decoded message ready for a demultiplexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub body: Value,
    /// Remote socket address of the channel the message arrived on, or the
    /// local address for loop-back deliveries.
    pub sender: SocketAddr,
}

impl Packet {
    /// Parse a frame payload.
    pub fn from_bytes(sender: SocketAddr, bytes: &[u8]) -> Result<Self, PacketError> {
        let body: Value = serde_json::from_slice(bytes)?;
        Self::from_value(sender, body)
    }

    /// Wrap an already parsed message.
    pub fn from_value(sender: SocketAddr, body: Value) -> Result<Self, PacketError> {
        let packet_type = packet_type_of(&body).ok_or(PacketError::MissingType)?;
        Ok(Self {
            packet_type,
            body,
            sender,
        })
    }
}

/// Read the type tag of a message.
pub fn packet_type_of(message: &Value) -> Option<PacketType> {
    message.get(TYPE_KEY)?.as_i64()
}

/// Stamp `packet_type` into a JSON object; non-objects are wrapped as `{"type", "body"}`.
pub fn tagged(packet_type: PacketType, message: Value) -> Value {
    match message {
        Value::Object(mut map) => {
            map.insert(TYPE_KEY.to_string(), Value::from(packet_type));
            Value::Object(map)
        }
        other => serde_json::json!({ "type": packet_type, "body": other }),
    }
}
