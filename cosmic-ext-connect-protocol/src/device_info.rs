//! Identity packet contents
//!
//! Identity packets (`cconnect.identity`) open every channel and carry:
//! - `deviceId`: fingerprint of the sender's certificate
//! - `deviceName`: 1-32 character display name
//! - `deviceType`: desktop, laptop, phone, tablet, or tv
//! - `protocolVersion`: protocol version spoken by the sender
//! - `incomingCapabilities` / `outgoingCapabilities`: packet types handled
//! - `tcpPort`: listening port, present on LAN announcements only

use crate::{
    Packet, ProtocolError, Result, MIN_PROTOCOL_VERSION, PACKET_TYPE_IDENTITY, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Device categories understood by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(DeviceType::Desktop),
            "laptop" => Ok(DeviceType::Laptop),
            "phone" | "smartphone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            "tv" => Ok(DeviceType::Tv),
            other => Err(ProtocolError::InvalidPacket(format!(
                "Unknown device type: {}",
                other
            ))),
        }
    }
}

/// Identity metadata announced by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Certificate fingerprint of the device
    pub device_id: String,

    /// Human-readable device name (1-32 characters)
    pub device_name: String,

    pub device_type: DeviceType,

    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for LAN connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

impl DeviceInfo {
    /// Create identity metadata for `device_id`
    ///
    /// ```
    /// use cosmic_ext_connect_protocol::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("0a1b2c", "My Computer", DeviceType::Desktop)
    ///     .with_incoming_capability("cconnect.ping");
    /// assert_eq!(info.incoming_capabilities, vec!["cconnect.ping".to_string()]);
    /// ```
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.chars().count() > 32 {
            warn!(
                "Device name should be 1-32 characters, got: {}",
                device_name
            );
        }

        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port: None,
        }
    }

    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    pub fn with_tcp_port(mut self, tcp_port: u16) -> Self {
        self.tcp_port = Some(tcp_port);
        self
    }

    /// Build the identity packet announcing this device
    pub fn to_identity_packet(&self) -> Packet {
        let mut body = json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "deviceType": self.device_type.as_str(),
            "protocolVersion": self.protocol_version,
            "incomingCapabilities": self.incoming_capabilities,
            "outgoingCapabilities": self.outgoing_capabilities,
        });

        if let (Some(port), Some(map)) = (self.tcp_port, body.as_object_mut()) {
            map.insert("tcpPort".to_string(), json!(port));
        }

        Packet::new(PACKET_TYPE_IDENTITY, body)
    }

    /// Parse and validate an identity packet
    ///
    /// Missing mandatory fields and protocol versions older than
    /// [`MIN_PROTOCOL_VERSION`] are protocol errors.
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Expected identity packet, got '{}'",
                packet.packet_type
            )));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing deviceId".to_string()))?;

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing deviceName".to_string()))?;

        let device_type = packet
            .get_body_field::<String>("deviceType")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing deviceType".to_string()))?
            .parse::<DeviceType>()?;

        let protocol_version = packet
            .get_body_field::<u32>("protocolVersion")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing protocolVersion".to_string()))?;

        if protocol_version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::ProtocolVersionMismatch(format!(
                "peer speaks version {}, minimum supported is {}",
                protocol_version, MIN_PROTOCOL_VERSION
            )));
        }

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities: packet
                .get_body_field::<Vec<String>>("incomingCapabilities")
                .unwrap_or_default(),
            outgoing_capabilities: packet
                .get_body_field::<Vec<String>>("outgoingCapabilities")
                .unwrap_or_default(),
            tcp_port: packet.get_body_field::<u16>("tcpPort"),
        })
    }
}
