//! Device Manager
//!
//! Top-level orchestrator: owns the device registry and the channel
//! services, routes channels and packets to devices, persists paired
//! devices and publishes lifecycle events.
//!
//! ## Coordinating Loop
//!
//! Services and channels run their I/O in their own tasks and only send
//! [`ServiceEvent`]s. The registry is mutated exclusively by the task that
//! drives [`DeviceManager::run`] (or [`DeviceManager::turn`] in tests).
//! Other tasks talk to the loop through a cloneable [`ManagerHandle`].
//!
//! ## Events
//!
//! Subscribers receive every [`ManagerEvent`] in order. For each device,
//! `DeviceAdded` comes first and `DeviceRemoved` last; a device is never
//! added twice without a removal in between.
//!
//! ## Duplicate Channels
//!
//! When a handshake completes for a device that already holds a channel,
//! the old channel is closed and the new one attached ("last handshake
//! wins"). A peer normally has one reachable path at a time, so the newest
//! handshake is the one that works. The device object is kept and no
//! disconnect is reported in between.

use crate::channel::{Channel, ChannelId};
use crate::device::{Detached, Device, DeviceProperty, DeviceSnapshot, PairTransition};
use crate::identity::{get_or_create_identity, verify_peer, Identity};
use crate::service::{
    split_uri, ChannelService, ServiceContext, ServiceEvent, ServiceFactory, ServiceState,
};
use crate::storage::Storage;
use crate::{
    DeviceInfo, DeviceType, Packet, ProtocolError, Result, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR,
};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often pending pairing requests are checked for expiry
const PAIRING_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Library-side configuration of the device manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Name announced in identity packets
    pub device_name: String,

    pub device_type: DeviceType,

    pub incoming_capabilities: Vec<String>,

    pub outgoing_capabilities: Vec<String>,

    /// Per-service enable flags; services not listed are enabled
    pub services: BTreeMap<String, bool>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            device_name: "COSMIC Computer".to_string(),
            device_type: DeviceType::Desktop,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            services: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn is_service_enabled(&self, name: &str) -> bool {
        self.services.get(name).copied().unwrap_or(true)
    }
}

/// Lifecycle notifications published to subscribers
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A device entered the registry
    DeviceAdded(DeviceSnapshot),

    /// A device left the registry
    DeviceRemoved { device_id: String },

    /// Observable properties of a device changed
    DeviceChanged {
        snapshot: DeviceSnapshot,
        properties: Vec<DeviceProperty>,
    },

    /// The peer asked to pair and awaits a decision
    PairingRequested { device_id: String },

    /// A packet arrived from a paired device
    PacketReceived { device_id: String, packet: Packet },

    ServiceStateChanged { service: String, state: ServiceState },
}

/// Registered channel service and its current state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub enabled: bool,
    pub state: ServiceState,
    /// Where peers can reach the running service
    pub uri: Option<String>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
enum ManagerCommand {
    Identify {
        target: Option<String>,
        reply: Reply<()>,
    },
    RequestPairing {
        device_id: String,
        reply: Reply<()>,
    },
    Pair {
        device_id: String,
        accept: bool,
        reply: Reply<()>,
    },
    Unpair {
        device_id: String,
        reply: Reply<()>,
    },
    SetServiceEnabled {
        service: String,
        enabled: bool,
        reply: Reply<()>,
    },
    SendPacket {
        device_id: String,
        packet: Packet,
        reply: Reply<()>,
    },
    GetDevices {
        reply: Reply<Vec<DeviceSnapshot>>,
    },
    ListServices {
        reply: Reply<Vec<ServiceSummary>>,
    },
}

/// Cloneable access to a running device manager
///
/// Every call is executed on the coordinating loop and fails with
/// `Cancelled` once the loop is gone.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<ManagerCommand>,
}

impl ManagerHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> ManagerCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ProtocolError::Cancelled("device manager stopped".to_string()))?;
        response
            .await
            .map_err(|_| ProtocolError::Cancelled("device manager stopped".to_string()))?
    }

    pub async fn identify(&self, target: Option<String>) -> Result<()> {
        self.call(|reply| ManagerCommand::Identify { target, reply })
            .await
    }

    pub async fn request_pairing(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(|reply| ManagerCommand::RequestPairing { device_id, reply })
            .await
    }

    pub async fn pair_device(&self, device_id: &str, accept: bool) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(|reply| ManagerCommand::Pair {
            device_id,
            accept,
            reply,
        })
        .await
    }

    pub async fn unpair_device(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(|reply| ManagerCommand::Unpair { device_id, reply })
            .await
    }

    pub async fn set_service_enabled(&self, service: &str, enabled: bool) -> Result<()> {
        let service = service.to_string();
        self.call(|reply| ManagerCommand::SetServiceEnabled {
            service,
            enabled,
            reply,
        })
        .await
    }

    pub async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(|reply| ManagerCommand::SendPacket {
            device_id,
            packet,
            reply,
        })
        .await
    }

    pub async fn get_devices(&self) -> Result<Vec<DeviceSnapshot>> {
        self.call(|reply| ManagerCommand::GetDevices { reply }).await
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceSummary>> {
        self.call(|reply| ManagerCommand::ListServices { reply })
            .await
    }
}

#[derive(Debug)]
struct ServiceSlot {
    factory: Arc<dyn ServiceFactory>,
    enabled: bool,
    instance: Option<Box<dyn ChannelService>>,
}

impl ServiceSlot {
    fn state(&self) -> ServiceState {
        self.instance
            .as_ref()
            .map_or(ServiceState::Disabled, |service| service.state())
    }
}

enum Input {
    Service(ServiceEvent),
    Command(ManagerCommand),
}

/// Owner of the device registry and the channel services
#[derive(Debug)]
pub struct DeviceManager {
    storage: Arc<dyn Storage>,
    identity: Arc<Identity>,
    config: ManagerConfig,
    local_info: DeviceInfo,
    devices: BTreeMap<String, Device>,
    /// Attached channel -> owning device
    channel_owners: HashMap<ChannelId, String>,
    services: BTreeMap<String, ServiceSlot>,
    events_tx: mpsc::UnboundedSender<ServiceEvent>,
    events_rx: mpsc::UnboundedReceiver<ServiceEvent>,
    commands_tx: mpsc::UnboundedSender<ManagerCommand>,
    commands_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    subscribers: Vec<mpsc::UnboundedSender<ManagerEvent>>,
    started: bool,
}

impl DeviceManager {
    /// Load or create the local identity and build an idle manager
    pub async fn new(storage: Arc<dyn Storage>, config: ManagerConfig) -> Result<Self> {
        let identity = Arc::new(get_or_create_identity(storage.as_ref()).await?);
        let local_info = DeviceInfo::new(
            identity.device_id(),
            config.device_name.clone(),
            config.device_type,
        )
        .with_incoming_capabilities(config.incoming_capabilities.clone())
        .with_outgoing_capabilities(config.outgoing_capabilities.clone());

        info!(
            "Device manager for {} ({})",
            local_info.device_name, local_info.device_id
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Ok(Self {
            storage,
            identity,
            config,
            local_info,
            devices: BTreeMap::new(),
            channel_owners: HashMap::new(),
            services: BTreeMap::new(),
            events_tx,
            events_rx,
            commands_tx,
            commands_rx,
            subscribers: Vec::new(),
            started: false,
        })
    }

    /// Local device id
    pub fn id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Identity packet contents announced to peers
    pub fn local_info(&self) -> &DeviceInfo {
        &self.local_info
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn get_device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.get(device_id).map(Device::snapshot)
    }

    /// All known devices, sorted by id
    pub fn get_devices(&self) -> Vec<DeviceSnapshot> {
        self.devices.values().map(Device::snapshot).collect()
    }

    /// Register a channel service
    ///
    /// Whether it runs follows the configuration. Services registered after
    /// `start()` are started by the next `start()` or when enabled.
    pub fn register_service(&mut self, factory: Arc<dyn ServiceFactory>) {
        let name = factory.name().to_string();
        let enabled = self.config.is_service_enabled(&name);
        debug!("Registered channel service '{}' (enabled: {})", name, enabled);

        if self
            .services
            .insert(
                name.clone(),
                ServiceSlot {
                    factory,
                    enabled,
                    instance: None,
                },
            )
            .is_some()
        {
            warn!("Channel service '{}' registered twice, keeping the last", name);
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(ServiceSlot::state)
    }

    pub fn services(&self) -> Vec<ServiceSummary> {
        self.services
            .iter()
            .map(|(name, slot)| ServiceSummary {
                name: name.clone(),
                enabled: slot.enabled,
                state: slot.state(),
                uri: slot.instance.as_ref().and_then(|service| service.local_uri()),
            })
            .collect()
    }

    /// Load persisted devices, then start every enabled service
    ///
    /// Every record becomes a device. A loaded device that is neither paired
    /// nor connected is evicted right away, which also deletes its record.
    /// Unreadable records and failing services are logged and skipped.
    pub async fn start(&mut self) {
        match self.storage.load_all_devices().await {
            Ok(records) => {
                let mut loaded = 0;
                for record in records {
                    if self.devices.contains_key(&record.id) {
                        continue;
                    }
                    let device = Device::from_record(&record);
                    let snapshot = device.snapshot();
                    self.devices.insert(record.id.clone(), device);
                    self.emit(ManagerEvent::DeviceAdded(snapshot));
                    loaded += 1;
                }
                info!("Loaded {} device records", loaded);
            }
            Err(e) => warn!("Failed to load device records: {}", e),
        }

        let stale: Vec<String> = self
            .devices
            .values()
            .filter(|device| !device.is_paired() && !device.is_connected())
            .map(|device| device.id().to_string())
            .collect();
        for device_id in stale {
            debug!("Dropping unpaired device {} loaded from storage", device_id);
            self.evict(&device_id).await;
        }

        self.started = true;

        let enabled: Vec<String> = self
            .services
            .iter()
            .filter(|(_, slot)| slot.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        for name in enabled {
            if let Err(e) = self.start_service(&name).await {
                error!("Channel service '{}' failed to start: {}", name, e);
            }
        }
    }

    /// Stop every service; devices stay in the registry, disconnected
    pub async fn stop(&mut self) {
        let names = self.service_names();
        for name in names {
            self.stop_service(&name).await;
        }
        self.started = false;
        info!("Device manager stopped");
    }

    /// Enable or disable a service at runtime
    ///
    /// Unknown names are a configuration error and change nothing.
    pub async fn set_service_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let Some(slot) = self.services.get_mut(name) else {
            return Err(ProtocolError::Configuration(format!(
                "Unknown channel service '{}'",
                name
            )));
        };

        slot.enabled = enabled;
        self.config.services.insert(name.to_string(), enabled);
        info!(
            "Channel service '{}' {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );

        if !self.started {
            return Ok(());
        }
        if enabled {
            self.start_service(name).await
        } else {
            self.stop_service(name).await;
            Ok(())
        }
    }

    /// Ask services to connect to `target`, or re-announce everywhere
    ///
    /// A target URI only reaches the running services whose scheme matches.
    /// A target no running service handles is a configuration error.
    pub async fn identify(&mut self, target: Option<&str>) -> Result<()> {
        let scheme = match target {
            None => None,
            Some(uri) => match split_uri(uri) {
                Some((scheme, _)) => Some(scheme),
                None => {
                    warn!("Cannot identify '{}': not a URI", uri);
                    return Err(ProtocolError::Configuration(format!(
                        "'{}' is not a URI",
                        uri
                    )));
                }
            },
        };

        let mut reached = 0;
        for service in self.services.values_mut().filter_map(|s| s.instance.as_mut()) {
            if scheme.is_some_and(|scheme| scheme != service.uri_scheme()) {
                continue;
            }
            service.identify(target).await;
            reached += 1;
        }

        match target {
            Some(uri) if reached == 0 => {
                warn!("No running channel service handles '{}'", uri);
                Err(ProtocolError::Configuration(format!(
                    "No running channel service handles '{}'",
                    uri
                )))
            }
            None if reached == 0 => {
                debug!("No running service to announce on");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Ask a connected device to pair
    pub async fn request_pairing(&mut self, device_id: &str) -> Result<()> {
        let device = self.device_mut(device_id)?;
        if !device.is_connected() {
            return Err(ProtocolError::NotConnected(device_id.to_string()));
        }
        let before = device.snapshot();
        device.request_pairing()?;
        self.publish_changes(device_id, &before);
        if self.is_paired(device_id) {
            self.persist(device_id).await;
        }
        Ok(())
    }

    /// Accept or reject pairing with a device
    ///
    /// Accepting marks it paired and persists it. Rejecting tears the device
    /// down immediately, connected or not.
    pub async fn pair_device(&mut self, device_id: &str, accept: bool) -> Result<()> {
        let device = self.device_mut(device_id)?;

        if accept {
            if device.is_paired() {
                return Err(ProtocolError::AlreadyPaired(device_id.to_string()));
            }
            let before = device.snapshot();
            device.pair(true)?;
            self.publish_changes(device_id, &before);
            self.persist(device_id).await;
            return Ok(());
        }

        if let Err(e) = device.pair(false) {
            debug!("Could not tell {} about the rejection: {}", device_id, e);
        }
        self.evict(device_id).await;
        Ok(())
    }

    /// Remove the pairing; a disconnected device is evicted right away
    pub async fn unpair_device(&mut self, device_id: &str) -> Result<()> {
        let device = self.device_mut(device_id)?;
        let before = device.snapshot();
        device.unpair()?;
        let connected = device.is_connected();

        self.publish_changes(device_id, &before);
        self.persist(device_id).await;
        if !connected {
            self.evict(device_id).await;
        }
        Ok(())
    }

    /// Queue a packet for a device
    pub fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        self.devices
            .get(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?
            .send_packet(packet)
    }

    /// Wait for the next event or command and apply it
    ///
    /// One turn of the coordinating loop. `run()` calls it until shutdown.
    pub async fn turn(&mut self) {
        let input = self.next_input().await;
        self.dispatch(input).await;
    }

    /// Drive the coordinating loop until `shutdown` resolves, then stop
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut expiry = interval(PAIRING_CHECK_INTERVAL);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let input = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = expiry.tick() => {
                    self.expire_pairing_requests(Instant::now());
                    continue;
                }
                input = self.next_input() => input,
            };
            self.dispatch(input).await;
        }

        info!("Coordinating loop shutting down");
        self.stop().await;
    }

    /// Reset pairing requests older than the pairing timeout
    pub fn expire_pairing_requests(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (id, device) in self.devices.iter_mut() {
            let before = device.snapshot();
            if device.expire_pairing(now) {
                expired.push((id.clone(), before));
            }
        }
        for (id, before) in expired {
            self.publish_changes(&id, &before);
        }
    }

    async fn next_input(&mut self) -> Input {
        // Both queues stay open while the manager holds their senders.
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => Input::Service(event),
            Some(command) = self.commands_rx.recv() => Input::Command(command),
            else => std::future::pending().await,
        }
    }

    async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Service(ServiceEvent::ChannelReady { service, channel }) => {
                self.handle_channel_ready(&service, channel).await
            }
            Input::Service(ServiceEvent::ChannelClosed { channel_id }) => {
                self.handle_channel_closed(channel_id).await
            }
            Input::Service(ServiceEvent::PacketReceived { channel_id, packet }) => {
                self.handle_packet(channel_id, packet).await
            }
            Input::Command(command) => self.handle_command(command).await,
        }
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Identify { target, reply } => {
                let _ = reply.send(self.identify(target.as_deref()).await);
            }
            ManagerCommand::RequestPairing { device_id, reply } => {
                let _ = reply.send(self.request_pairing(&device_id).await);
            }
            ManagerCommand::Pair {
                device_id,
                accept,
                reply,
            } => {
                let _ = reply.send(self.pair_device(&device_id, accept).await);
            }
            ManagerCommand::Unpair { device_id, reply } => {
                let _ = reply.send(self.unpair_device(&device_id).await);
            }
            ManagerCommand::SetServiceEnabled {
                service,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_service_enabled(&service, enabled).await);
            }
            ManagerCommand::SendPacket {
                device_id,
                packet,
                reply,
            } => {
                let _ = reply.send(self.send_packet(&device_id, packet));
            }
            ManagerCommand::GetDevices { reply } => {
                let _ = reply.send(Ok(self.get_devices()));
            }
            ManagerCommand::ListServices { reply } => {
                let _ = reply.send(Ok(self.services()));
            }
        }
    }

    async fn handle_channel_ready(&mut self, service: &str, channel: Channel) {
        let peer = channel.peer().clone();
        let device_id = peer.device_id.clone();

        if channel.is_closed() {
            debug!("Channel {} to {} closed before adoption", channel.id(), device_id);
            return;
        }
        if self.service_state(service) != Some(ServiceState::Listening) {
            debug!("Dropping channel from stopped service '{}'", service);
            return;
        }
        if device_id == self.identity.device_id() {
            warn!("Dropping channel announcing our own device id");
            return;
        }
        if !verify_peer(channel.peer_certificate(), &device_id) {
            warn!("Dropping channel to {}: certificate does not match id", device_id);
            return;
        }

        let channel_id = channel.id();
        let (device, added) = match self.devices.entry(device_id.clone()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => (entry.insert(Device::new(peer.clone())), true),
        };

        if device
            .certificate()
            .is_some_and(|pinned| pinned != channel.peer_certificate())
        {
            warn!("Dropping channel to {}: pinned certificate changed", device_id);
            return;
        }

        let before = device.snapshot();
        if let Some(previous) = device.channel_id() {
            info!(
                "Replacing channel {} of {} with channel {} from '{}'",
                previous, device_id, channel_id, service
            );
            self.channel_owners.remove(&previous);
            device.detach();
        }
        device.update_identity(&peer);

        if let Err(e) = device.attach(channel) {
            error!("Could not attach channel to {}: {}", device_id, e);
            return;
        }
        self.channel_owners.insert(channel_id, device_id.clone());
        let paired = device.is_paired();
        let snapshot = device.snapshot();

        info!(
            "{} ({}) connected via '{}'",
            snapshot.name, snapshot.id, service
        );

        if added {
            self.emit(ManagerEvent::DeviceAdded(snapshot));
        } else {
            let properties = snapshot.changes_since(&before);
            if !properties.is_empty() {
                self.emit(ManagerEvent::DeviceChanged {
                    snapshot,
                    properties,
                });
            }
        }

        if paired {
            self.persist(&device_id).await;
        }
    }

    async fn handle_channel_closed(&mut self, channel_id: ChannelId) {
        let Some(device_id) = self.channel_owners.remove(&channel_id) else {
            debug!("Ignoring close of unattached channel {}", channel_id);
            return;
        };
        let Some(device) = self.devices.get(&device_id) else {
            return;
        };
        if device.channel_id() != Some(channel_id) {
            return;
        }

        info!("{} disconnected", device_id);
        self.detach_device(&device_id).await;
    }

    async fn handle_packet(&mut self, channel_id: ChannelId, packet: Packet) {
        let Some(device_id) = self.channel_owners.get(&channel_id).cloned() else {
            debug!("Dropping packet from unattached channel {}", channel_id);
            return;
        };

        if packet.is_type(PACKET_TYPE_PAIR) {
            self.handle_pair_packet(&device_id, &packet).await;
            return;
        }
        if packet.is_type(PACKET_TYPE_IDENTITY) {
            debug!("Ignoring repeated identity packet from {}", device_id);
            return;
        }
        if !self.is_paired(&device_id) {
            debug!(
                "Dropping '{}' from unpaired device {}",
                packet.packet_type, device_id
            );
            return;
        }

        self.emit(ManagerEvent::PacketReceived { device_id, packet });
    }

    async fn handle_pair_packet(&mut self, device_id: &str, packet: &Packet) {
        let Some(device) = self.devices.get_mut(device_id) else {
            return;
        };
        let before = device.snapshot();
        let transition = device.handle_pair_packet(packet);

        match transition {
            PairTransition::Unchanged => return,
            PairTransition::RequestedByPeer => {
                self.publish_changes(device_id, &before);
                self.emit(ManagerEvent::PairingRequested {
                    device_id: device_id.to_string(),
                });
            }
            PairTransition::Paired | PairTransition::Unpaired => {
                self.publish_changes(device_id, &before);
                self.persist(device_id).await;
            }
            PairTransition::Rejected | PairTransition::Cancelled => {
                self.publish_changes(device_id, &before);
            }
        }
    }

    async fn start_service(&mut self, name: &str) -> Result<()> {
        let context = ServiceContext::new(
            name,
            self.identity.clone(),
            self.local_info.clone(),
            self.events_tx.clone(),
        );
        let slot = self
            .services
            .get_mut(name)
            .ok_or_else(|| ProtocolError::Configuration(format!("Unknown channel service '{}'", name)))?;
        if slot.instance.is_some() {
            return Ok(());
        }

        let mut service = slot.factory.create(context)?;
        service.start().await?;
        let state = service.state();
        slot.instance = Some(service);

        info!("Channel service '{}' {}", name, state);
        self.emit(ManagerEvent::ServiceStateChanged {
            service: name.to_string(),
            state,
        });
        Ok(())
    }

    /// Stop a service and detach every device it connected
    async fn stop_service(&mut self, name: &str) {
        let Some(mut service) = self.services.get_mut(name).and_then(|s| s.instance.take()) else {
            return;
        };
        service.stop().await;
        drop(service);

        let affected: Vec<String> = self
            .devices
            .values()
            .filter(|device| device.service() == Some(name))
            .map(|device| device.id().to_string())
            .collect();
        for device_id in affected {
            self.detach_device(&device_id).await;
        }

        info!("Channel service '{}' disabled", name);
        self.emit(ManagerEvent::ServiceStateChanged {
            service: name.to_string(),
            state: ServiceState::Disabled,
        });
    }

    async fn detach_device(&mut self, device_id: &str) {
        let Some(device) = self.devices.get_mut(device_id) else {
            return;
        };
        if let Some(channel_id) = device.channel_id() {
            self.channel_owners.remove(&channel_id);
        }

        let before = device.snapshot();
        match device.detach() {
            Detached::NotAttached => {}
            Detached::Retained => {
                self.publish_changes(device_id, &before);
                self.persist(device_id).await;
            }
            Detached::Evictable => self.evict(device_id).await,
        }
    }

    /// Remove a device from the registry and from storage
    async fn evict(&mut self, device_id: &str) {
        let Some(mut device) = self.devices.remove(device_id) else {
            return;
        };
        if let Some(channel_id) = device.channel_id() {
            self.channel_owners.remove(&channel_id);
        }
        device.detach();

        if let Err(e) = self.storage.delete_device(device_id).await {
            warn!("Failed to delete record of {}: {}", device_id, e);
        }

        info!("Removed device {}", device_id);
        self.emit(ManagerEvent::DeviceRemoved {
            device_id: device_id.to_string(),
        });
    }

    async fn persist(&self, device_id: &str) {
        let Some(device) = self.devices.get(device_id) else {
            return;
        };
        if let Err(e) = self.storage.save_device(&device.to_record()).await {
            warn!("Failed to save record of {}: {}", device_id, e);
        }
    }

    fn publish_changes(&mut self, device_id: &str, before: &DeviceSnapshot) {
        let Some(snapshot) = self.get_device(device_id) else {
            return;
        };
        let properties = snapshot.changes_since(before);
        if !properties.is_empty() {
            self.emit(ManagerEvent::DeviceChanged {
                snapshot,
                properties,
            });
        }
    }

    fn emit(&mut self, event: ManagerEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn device_mut(&mut self, device_id: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))
    }

    fn is_paired(&self, device_id: &str) -> bool {
        self.devices.get(device_id).is_some_and(Device::is_paired)
    }
}
