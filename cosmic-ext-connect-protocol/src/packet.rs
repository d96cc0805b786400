//! Network packets
//!
//! Packets are JSON objects terminated by a single newline:
//!
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: packet type in the form `cconnect.<kind>[.<action>]`
//! - `body`: JSON dictionary of type-specific parameters
//! - `payloadSize` / `payloadTransferInfo`: optional payload negotiation
//!
//! Only the identity and pairing vocabularies are interpreted by this crate.
//! Every other packet type is routed opaquely to subscribers.

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// First packet on every new channel
pub const PACKET_TYPE_IDENTITY: &str = "cconnect.identity";

/// Pairing request, acceptance, rejection and unpair
pub const PACKET_TYPE_PAIR: &str = "cconnect.pair";

/// Protocol version announced in identity packets
pub const PROTOCOL_VERSION: u32 = 8;

/// Oldest peer protocol version accepted during the handshake
pub const MIN_PROTOCOL_VERSION: u32 = 7;

/// Largest frame accepted from a transport
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// A single protocol packet
///
/// ```
/// use cosmic_ext_connect_protocol::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("cconnect.ping", json!({ "message": "hi" }));
/// let bytes = packet.to_bytes().unwrap();
/// assert_eq!(bytes.last(), Some(&b'\n'));
///
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.packet_type, "cconnect.ping");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    ///
    /// Some clients send this as a string.
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    #[serde(rename = "type")]
    pub packet_type: String,

    #[serde(default)]
    pub body: Value,

    /// Payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Create a packet stamped with the current time
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Create a pairing packet
    ///
    /// `pair: true` requests or accepts pairing, `pair: false` rejects a
    /// request or removes an existing pairing.
    pub fn pair(pair: bool) -> Self {
        Self::new(
            PACKET_TYPE_PAIR,
            json!({ "pair": pair, "timestamp": Utc::now().timestamp() }),
        )
    }

    /// Serialize with the newline terminator
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse a packet, accepting `\n`, `\r\n` or no terminator
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })
    }

    /// Check the packet type, treating `cconnect.` and `kdeconnect.` as equal
    pub fn is_type(&self, packet_type: &str) -> bool {
        if self.packet_type == packet_type {
            return true;
        }

        if let Some(rest) = packet_type.strip_prefix("cconnect.") {
            self.packet_type.strip_prefix("kdeconnect.") == Some(rest)
        } else if let Some(rest) = packet_type.strip_prefix("kdeconnect.") {
            self.packet_type.strip_prefix("cconnect.") == Some(rest)
        } else {
            false
        }
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}
