//! Device State
//!
//! A [`Device`] is one remote endpoint: its announced identity, its pairing
//! state and, while connected, the [`Channel`] it owns.
//!
//! ## Device Lifecycle
//!
//! 1. **Created**: from a persisted record, or on the first channel from an
//!    unknown peer (unpaired)
//! 2. **Connected**: `attach()` takes ownership of a channel
//! 3. **Disconnected**: `detach()` destroys the channel; an unpaired device
//!    becomes evictable
//!
//! ## Pairing
//!
//! ```text
//! Unpaired ──request──▶ Requested ──peer accepts──▶ Paired
//! Unpaired ◀─peer rejects/timeout── Requested
//! Unpaired ──peer asks──▶ RequestedByPeer ──user accepts──▶ Paired
//! Paired ──unpair (either side)──▶ Unpaired
//! ```
//!
//! Pending requests expire after [`PAIRING_TIMEOUT`]. Unpaired devices may
//! only exchange pair packets.
//!
//! The device never touches storage; the device manager persists records
//! after the transitions that need it.

use crate::channel::{Channel, ChannelId};
use crate::storage::DeviceRecord;
use crate::{DeviceInfo, DeviceType, Packet, ProtocolError, Result, PACKET_TYPE_PAIR};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pending pairing requests expire after 30 seconds
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingStatus {
    /// Not paired
    Unpaired,
    /// Pairing request sent, awaiting response
    Requested,
    /// Pairing request received, awaiting user confirmation
    #[serde(rename = "requested_by_peer")]
    RequestedByPeer,
    /// Successfully paired
    Paired,
}

impl PairingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingStatus::Unpaired => "unpaired",
            PairingStatus::Requested => "requested",
            PairingStatus::RequestedByPeer => "requested_by_peer",
            PairingStatus::Paired => "paired",
        }
    }

    fn is_pending(&self) -> bool {
        matches!(
            self,
            PairingStatus::Requested | PairingStatus::RequestedByPeer
        )
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally observable device properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DeviceProperty {
    Name,
    DeviceType,
    Connected,
    Paired,
    PairingState,
    Capabilities,
}

impl DeviceProperty {
    /// Whether a change of this property can change the available actions
    pub fn affects_actions(&self) -> bool {
        matches!(
            self,
            DeviceProperty::Connected | DeviceProperty::Paired | DeviceProperty::PairingState
        )
    }
}

/// Result of [`Device::detach`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// No channel was attached
    NotAttached,
    /// Channel destroyed, the paired device stays known
    Retained,
    /// Channel destroyed and the device is unpaired: evict it
    Evictable,
}

/// Pairing transition caused by a `cconnect.pair` packet from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairTransition {
    /// Nothing changed (duplicate or unexpected packet)
    Unchanged,
    /// The peer asked to pair; the user has to answer
    RequestedByPeer,
    /// The peer accepted our request
    Paired,
    /// The peer refused our request
    Rejected,
    /// The peer withdrew its own request
    Cancelled,
    /// The peer removed an existing pairing
    Unpaired,
}

/// Read-only view of a device for subscribers and exporters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub paired: bool,
    pub connected: bool,
    pub pairing_status: PairingStatus,
    pub incoming_capabilities: Vec<String>,
    pub outgoing_capabilities: Vec<String>,
    /// Service that produced the attached channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub last_seen: i64,
}

impl DeviceSnapshot {
    /// Observable properties that differ from `before`
    pub fn changes_since(&self, before: &DeviceSnapshot) -> Vec<DeviceProperty> {
        let mut changed = Vec::new();
        if self.name != before.name {
            changed.push(DeviceProperty::Name);
        }
        if self.device_type != before.device_type {
            changed.push(DeviceProperty::DeviceType);
        }
        if self.connected != before.connected {
            changed.push(DeviceProperty::Connected);
        }
        if self.paired != before.paired {
            changed.push(DeviceProperty::Paired);
        }
        if self.pairing_status != before.pairing_status {
            changed.push(DeviceProperty::PairingState);
        }
        if self.incoming_capabilities != before.incoming_capabilities
            || self.outgoing_capabilities != before.outgoing_capabilities
        {
            changed.push(DeviceProperty::Capabilities);
        }
        changed
    }
}

/// One remote endpoint
#[derive(Debug)]
pub struct Device {
    info: DeviceInfo,
    pairing_status: PairingStatus,
    /// DER certificate pinned at pairing time
    certificate: Option<Vec<u8>>,
    channel: Option<Channel>,
    pair_requested_at: Option<Instant>,
    last_seen: i64,
}

impl Device {
    /// A device seen for the first time, unpaired
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            pairing_status: PairingStatus::Unpaired,
            certificate: None,
            channel: None,
            pair_requested_at: None,
            last_seen: Utc::now().timestamp(),
        }
    }

    /// Restore a device from storage, disconnected
    pub fn from_record(record: &DeviceRecord) -> Self {
        let info = DeviceInfo::new(record.id.clone(), record.name.clone(), record.device_type)
            .with_incoming_capabilities(record.incoming_capabilities.clone())
            .with_outgoing_capabilities(record.outgoing_capabilities.clone());

        Self {
            info,
            pairing_status: if record.paired {
                PairingStatus::Paired
            } else {
                PairingStatus::Unpaired
            },
            certificate: record.certificate_der(),
            channel: None,
            pair_requested_at: None,
            last_seen: record.last_seen,
        }
    }

    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.info.device_id.clone(),
            name: self.info.device_name.clone(),
            device_type: self.info.device_type,
            paired: self.is_paired(),
            incoming_capabilities: self.info.incoming_capabilities.clone(),
            outgoing_capabilities: self.info.outgoing_capabilities.clone(),
            certificate: self
                .certificate
                .as_deref()
                .map(DeviceRecord::encode_certificate),
            last_seen: self.last_seen,
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.info.device_id.clone(),
            name: self.info.device_name.clone(),
            device_type: self.info.device_type,
            protocol_version: self.info.protocol_version,
            paired: self.is_paired(),
            connected: self.is_connected(),
            pairing_status: self.pairing_status,
            incoming_capabilities: self.info.incoming_capabilities.clone(),
            outgoing_capabilities: self.info.outgoing_capabilities.clone(),
            service: self.channel.as_ref().map(|c| c.service().to_string()),
            last_seen: self.last_seen,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.device_id
    }

    pub fn name(&self) -> &str {
        &self.info.device_name
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn pairing_status(&self) -> PairingStatus {
        self.pairing_status
    }

    pub fn is_paired(&self) -> bool {
        self.pairing_status == PairingStatus::Paired
    }

    /// Connected iff a channel is attached
    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Pinned certificate of a paired device
    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel.as_ref().map(Channel::id)
    }

    pub fn service(&self) -> Option<&str> {
        self.channel.as_ref().map(Channel::service)
    }

    /// Take ownership of a channel. Only legal while disconnected.
    pub fn attach(&mut self, channel: Channel) -> Result<()> {
        debug_assert!(
            self.channel.is_none(),
            "attach on connected device {}",
            self.info.device_id
        );
        if self.channel.is_some() {
            return Err(ProtocolError::AlreadyConnected(self.info.device_id.clone()));
        }

        debug!(
            "Device {} attached channel {} from '{}'",
            self.info.device_id,
            channel.id(),
            channel.service()
        );
        self.last_seen = Utc::now().timestamp();
        self.channel = Some(channel);
        Ok(())
    }

    /// Destroy the attached channel
    ///
    /// A pending pairing request does not survive the disconnect.
    pub fn detach(&mut self) -> Detached {
        let Some(channel) = self.channel.take() else {
            return Detached::NotAttached;
        };
        debug!(
            "Device {} detached channel {}",
            self.info.device_id,
            channel.id()
        );
        drop(channel);

        self.last_seen = Utc::now().timestamp();
        if self.pairing_status.is_pending() {
            self.reset_request();
        }

        if self.is_paired() {
            Detached::Retained
        } else {
            Detached::Evictable
        }
    }

    /// Adopt the identity announced on a new channel
    ///
    /// Returns the properties that changed. The device id never changes.
    pub fn update_identity(&mut self, info: &DeviceInfo) -> Vec<DeviceProperty> {
        let mut changed = Vec::new();

        if self.info.device_name != info.device_name {
            self.info.device_name = info.device_name.clone();
            changed.push(DeviceProperty::Name);
        }
        if self.info.device_type != info.device_type {
            self.info.device_type = info.device_type;
            changed.push(DeviceProperty::DeviceType);
        }
        if self.info.incoming_capabilities != info.incoming_capabilities
            || self.info.outgoing_capabilities != info.outgoing_capabilities
        {
            self.info.incoming_capabilities = info.incoming_capabilities.clone();
            self.info.outgoing_capabilities = info.outgoing_capabilities.clone();
            changed.push(DeviceProperty::Capabilities);
        }
        self.info.protocol_version = info.protocol_version;
        self.info.tcp_port = info.tcp_port;

        changed
    }

    /// Ask the peer to pair
    pub fn request_pairing(&mut self) -> Result<()> {
        match self.pairing_status {
            PairingStatus::Paired => {
                return Err(ProtocolError::AlreadyPaired(self.info.device_id.clone()))
            }
            PairingStatus::Requested => {
                debug!("Pairing with {} already requested", self.info.device_id);
                return Ok(());
            }
            PairingStatus::RequestedByPeer => return self.pair(true),
            PairingStatus::Unpaired => {}
        }

        self.send_pair_packet(true)?;
        self.pairing_status = PairingStatus::Requested;
        self.pair_requested_at = Some(Instant::now());
        info!("Requested pairing with {}", self.info.device_id);
        Ok(())
    }

    /// Local pairing decision
    ///
    /// Accepting pins the channel's certificate and marks the device paired.
    /// Rejecting tells the peer; the caller tears the device down.
    pub fn pair(&mut self, accept: bool) -> Result<()> {
        if !accept {
            if self.channel.is_some() {
                self.send_pair_packet(false)?;
            }
            self.reset_request();
            info!("Rejected pairing with {}", self.info.device_id);
            return Ok(());
        }

        debug_assert!(!self.is_paired(), "double pairing of {}", self.info.device_id);
        if self.is_paired() {
            return Err(ProtocolError::AlreadyPaired(self.info.device_id.clone()));
        }

        self.send_pair_packet(true)?;
        self.set_paired();
        Ok(())
    }

    /// Remove the pairing
    ///
    /// Does not disconnect; the next disconnect evicts the device.
    pub fn unpair(&mut self) -> Result<()> {
        if !self.is_paired() {
            return Err(ProtocolError::NotPaired);
        }

        if self.channel.is_some() {
            if let Err(e) = self.send_pair_packet(false) {
                warn!("Could not notify {} about unpairing: {}", self.info.device_id, e);
            }
        }
        self.pairing_status = PairingStatus::Unpaired;
        self.certificate = None;
        info!("Unpaired {}", self.info.device_id);
        Ok(())
    }

    /// Apply a `cconnect.pair` packet received from the peer
    pub fn handle_pair_packet(&mut self, packet: &Packet) -> PairTransition {
        let Some(pair) = packet.get_body_field::<bool>("pair") else {
            warn!(
                "Pair packet from {} without 'pair' field",
                self.info.device_id
            );
            return PairTransition::Unchanged;
        };

        match (pair, self.pairing_status) {
            (true, PairingStatus::Unpaired) => {
                self.pairing_status = PairingStatus::RequestedByPeer;
                self.pair_requested_at = Some(Instant::now());
                info!("{} requested pairing", self.info.device_id);
                PairTransition::RequestedByPeer
            }
            (true, PairingStatus::Requested) => {
                self.set_paired();
                PairTransition::Paired
            }
            (true, PairingStatus::Paired) => {
                // The peer lost its side of the pairing state; confirm again.
                if let Err(e) = self.send_pair_packet(true) {
                    debug!("Could not re-confirm pairing: {}", e);
                }
                PairTransition::Unchanged
            }
            (true, PairingStatus::RequestedByPeer) => PairTransition::Unchanged,
            (false, PairingStatus::Requested) => {
                self.reset_request();
                info!("{} rejected our pairing request", self.info.device_id);
                PairTransition::Rejected
            }
            (false, PairingStatus::RequestedByPeer) => {
                self.reset_request();
                PairTransition::Cancelled
            }
            (false, PairingStatus::Paired) => {
                self.pairing_status = PairingStatus::Unpaired;
                self.certificate = None;
                info!("{} removed the pairing", self.info.device_id);
                PairTransition::Unpaired
            }
            (false, PairingStatus::Unpaired) => PairTransition::Unchanged,
        }
    }

    /// Drop a pending request older than [`PAIRING_TIMEOUT`]
    ///
    /// Returns true when the request expired.
    pub fn expire_pairing(&mut self, now: Instant) -> bool {
        let expired = self.pairing_status.is_pending()
            && self
                .pair_requested_at
                .is_some_and(|at| now.saturating_duration_since(at) >= PAIRING_TIMEOUT);

        if expired {
            info!("Pairing request with {} timed out", self.info.device_id);
            if self.channel.is_some() {
                let _ = self.send_pair_packet(false);
            }
            self.reset_request();
        }
        expired
    }

    /// Queue a packet on the attached channel
    ///
    /// Unpaired devices only accept pair packets.
    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        if !self.is_paired() && !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::NotPaired);
        }
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| ProtocolError::NotConnected(self.info.device_id.clone()))?;
        channel.send_packet(packet)
    }

    fn send_pair_packet(&self, pair: bool) -> Result<()> {
        self.send_packet(Packet::pair(pair))
    }

    fn set_paired(&mut self) {
        self.pairing_status = PairingStatus::Paired;
        self.pair_requested_at = None;
        if let Some(channel) = &self.channel {
            self.certificate = Some(channel.peer_certificate().to_vec());
        }
        info!("Paired with {} ({})", self.info.device_name, self.info.device_id);
    }

    fn reset_request(&mut self) {
        if !self.is_paired() {
            self.pairing_status = PairingStatus::Unpaired;
        }
        self.pair_requested_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceEvent;
    use crate::transport::{MemoryTransport, Transport};
    use tokio::sync::mpsc;

    fn phone_info() -> DeviceInfo {
        DeviceInfo::new("phone1", "Pixel", DeviceType::Phone)
            .with_incoming_capability("cconnect.ping")
    }

    fn channel() -> (Channel, MemoryTransport, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (local, remote) = MemoryTransport::pair("loopback", None, Some(vec![7, 7, 7]));
        let channel = Channel::spawn("loopback", phone_info(), vec![7, 7, 7], Box::new(local), tx);
        (channel, remote, rx)
    }

    #[test]
    fn test_new_device_is_unpaired_and_disconnected() {
        let device = Device::new(phone_info());
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
        assert!(!device.is_connected());
        assert!(!device.is_paired());
        assert_eq!(device.channel_id(), None);
    }

    #[test]
    fn test_record_round_trip_keeps_trust() {
        let record = DeviceRecord {
            id: "phone1".to_string(),
            name: "Pixel".to_string(),
            device_type: DeviceType::Phone,
            paired: true,
            incoming_capabilities: vec!["cconnect.ping".to_string()],
            outgoing_capabilities: vec![],
            certificate: Some(DeviceRecord::encode_certificate(&[1, 2, 3])),
            last_seen: 42,
        };

        let device = Device::from_record(&record);
        assert!(device.is_paired());
        assert!(!device.is_connected());
        assert_eq!(device.certificate(), Some(&[1u8, 2, 3][..]));
        assert_eq!(device.to_record(), record);
    }

    #[tokio::test]
    async fn test_attach_detach_tracks_connected() {
        let mut device = Device::new(phone_info());
        let (channel, _remote, _events) = channel();
        let channel_id = channel.id();

        device.attach(channel).unwrap();
        assert!(device.is_connected());
        assert_eq!(device.channel_id(), Some(channel_id));
        assert_eq!(device.snapshot().service.as_deref(), Some("loopback"));

        assert_eq!(device.detach(), Detached::Evictable);
        assert!(!device.is_connected());
        assert_eq!(device.detach(), Detached::NotAttached);
    }

    #[tokio::test]
    async fn test_paired_device_is_retained_on_detach() {
        let mut device = Device::new(phone_info());
        let (channel, mut remote, _events) = channel();
        device.attach(channel).unwrap();

        device.pair(true).unwrap();
        let answer = remote.receive_packet().await.unwrap();
        assert_eq!(answer.get_body_field::<bool>("pair"), Some(true));
        assert_eq!(device.certificate(), Some(&[7u8, 7, 7][..]));

        assert_eq!(device.detach(), Detached::Retained);
        assert!(device.is_paired());
    }

    #[tokio::test]
    async fn test_request_accepted_by_peer() {
        let mut device = Device::new(phone_info());
        let (channel, mut remote, _events) = channel();
        device.attach(channel).unwrap();

        device.request_pairing().unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Requested);
        let request = remote.receive_packet().await.unwrap();
        assert!(request.is_type(PACKET_TYPE_PAIR));

        assert_eq!(
            device.handle_pair_packet(&Packet::pair(true)),
            PairTransition::Paired
        );
        assert!(device.is_paired());
    }

    #[tokio::test]
    async fn test_peer_request_then_cancel() {
        let mut device = Device::new(phone_info());
        let (channel, _remote, _events) = channel();
        device.attach(channel).unwrap();

        assert_eq!(
            device.handle_pair_packet(&Packet::pair(true)),
            PairTransition::RequestedByPeer
        );
        assert_eq!(
            device.handle_pair_packet(&Packet::pair(true)),
            PairTransition::Unchanged
        );
        assert_eq!(
            device.handle_pair_packet(&Packet::pair(false)),
            PairTransition::Cancelled
        );
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
    }

    #[tokio::test]
    async fn test_pending_request_expires() {
        let mut device = Device::new(phone_info());
        let (channel, _remote, _events) = channel();
        device.attach(channel).unwrap();
        device.request_pairing().unwrap();

        let now = Instant::now();
        assert!(!device.expire_pairing(now));
        assert!(device.expire_pairing(now + PAIRING_TIMEOUT));
        assert_eq!(device.pairing_status(), PairingStatus::Unpaired);
    }

    #[tokio::test]
    async fn test_unpaired_device_only_sends_pair_packets() {
        let mut device = Device::new(phone_info());
        let (channel, _remote, _events) = channel();
        device.attach(channel).unwrap();

        let ping = Packet::new("cconnect.ping", serde_json::json!({}));
        assert!(matches!(
            device.send_packet(ping),
            Err(ProtocolError::NotPaired)
        ));
        assert!(device.send_packet(Packet::pair(false)).is_ok());
    }

    #[test]
    fn test_unpair_requires_pairing() {
        let mut device = Device::new(phone_info());
        assert!(matches!(device.unpair(), Err(ProtocolError::NotPaired)));
    }

    #[test]
    fn test_update_identity_reports_changes() {
        let mut device = Device::new(phone_info());
        assert!(device.update_identity(&phone_info()).is_empty());

        let renamed = DeviceInfo::new("phone1", "Pixel 9", DeviceType::Tablet)
            .with_incoming_capability("cconnect.ping");
        assert_eq!(
            device.update_identity(&renamed),
            vec![DeviceProperty::Name, DeviceProperty::DeviceType]
        );
        assert_eq!(device.name(), "Pixel 9");
    }
}
