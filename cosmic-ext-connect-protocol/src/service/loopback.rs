//! In-process channel service
//!
//! Peers are registered on a shared [`LoopbackHub`] with the identity they
//! announce and the certificate they present. `identify()` runs the regular
//! handshake against them over a [`MemoryTransport`] pair. The hub keeps the
//! remote ends of the channels so the peer side can be driven from outside:
//! send packets, read what the local device sent, or disconnect. Older ends
//! stay open until the local side closes them.
//!
//! URIs have the form `loopback://<device-id>`.

use super::{
    complete_handshake, split_uri, ChannelRegistry, ChannelService, ServiceContext, ServiceFactory,
    ServiceState, STOP_GRACE_PERIOD,
};
use crate::transport::{MemoryTransport, Transport};
use crate::{DeviceInfo, DeviceType, Identity, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// A simulated remote device
#[derive(Debug, Clone)]
pub struct LoopbackPeer {
    /// Identity packet contents the peer announces
    pub info: DeviceInfo,
    /// DER certificate the peer presents
    pub certificate: Vec<u8>,
}

impl LoopbackPeer {
    pub fn new(info: DeviceInfo, certificate: Vec<u8>) -> Self {
        Self { info, certificate }
    }

    /// A well-behaved peer announcing the id that matches its certificate
    pub fn from_identity(identity: &Identity, name: &str, device_type: DeviceType) -> Self {
        Self {
            info: DeviceInfo::new(identity.device_id(), name, device_type),
            certificate: identity.certificate().to_vec(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.info.device_id
    }
}

type RemoteEnd = Arc<tokio::sync::Mutex<MemoryTransport>>;

#[derive(Debug)]
struct RemoteLink {
    service: String,
    end: RemoteEnd,
}

impl RemoteLink {
    fn is_open(&self) -> bool {
        // A locked end is in use by a send or receive, so it is open.
        self.end.try_lock().map_or(true, |end| end.is_open())
    }
}

#[derive(Debug, Default)]
struct HubState {
    peers: BTreeMap<String, LoopbackPeer>,
    /// peer id -> remote ends of its channels, oldest first
    remotes: HashMap<String, Vec<RemoteLink>>,
    running: BTreeSet<String>,
}

/// Shared registry of simulated peers
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // Nothing panics while holding the lock, recover the data if it did.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a peer, replacing any peer announcing the same id
    pub fn add_peer(&self, peer: LoopbackPeer) {
        let mut state = self.lock();
        state.peers.insert(peer.device_id().to_string(), peer);
    }

    pub fn remove_peer(&self, device_id: &str) -> Option<LoopbackPeer> {
        self.lock().peers.remove(device_id)
    }

    /// Whether a service named `service` is currently started
    pub fn is_running(&self, service: &str) -> bool {
        self.lock().running.contains(service)
    }

    /// Whether the newest channel to `device_id` is still open
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.lock()
            .remotes
            .get(device_id)
            .and_then(|links| links.last())
            .is_some_and(RemoteLink::is_open)
    }

    /// Number of channels to `device_id` whose local end is still open
    pub fn open_connections(&self, device_id: &str) -> usize {
        self.lock()
            .remotes
            .get(device_id)
            .map_or(0, |links| links.iter().filter(|link| link.is_open()).count())
    }

    /// Drop the peer side of every channel, as if the peer disconnected
    pub fn disconnect(&self, device_id: &str) -> bool {
        let removed = self.lock().remotes.remove(device_id);
        removed.is_some()
    }

    /// Send a packet from the peer to the local device
    pub async fn send_from_peer(&self, device_id: &str, packet: Packet) -> Result<()> {
        let remote = self
            .remote(device_id)
            .ok_or_else(|| ProtocolError::NotConnected(device_id.to_string()))?;
        let mut end = remote.lock().await;
        end.send_packet(&packet).await
    }

    /// Next packet the local device sent to the peer, waiting up to `wait`
    pub async fn receive_at_peer(&self, device_id: &str, wait: Duration) -> Result<Packet> {
        let remote = self
            .remote(device_id)
            .ok_or_else(|| ProtocolError::NotConnected(device_id.to_string()))?;
        let mut end = remote.lock().await;
        timeout(wait, end.receive_packet())
            .await
            .map_err(|_| ProtocolError::Timeout(format!("waiting for packet to {}", device_id)))?
    }

    /// Remote end of the newest channel
    fn remote(&self, device_id: &str) -> Option<RemoteEnd> {
        self.lock()
            .remotes
            .get(device_id)
            .and_then(|links| links.last())
            .map(|link| link.end.clone())
    }

    fn peers_matching(&self, target: Option<&str>) -> Vec<LoopbackPeer> {
        let state = self.lock();
        match target {
            None => state.peers.values().cloned().collect(),
            Some(id) => state.peers.get(id).cloned().into_iter().collect(),
        }
    }

    fn attach_remote(&self, device_id: &str, service: &str, remote: MemoryTransport) -> RemoteEnd {
        let end = Arc::new(tokio::sync::Mutex::new(remote));
        self.lock()
            .remotes
            .entry(device_id.to_string())
            .or_default()
            .push(RemoteLink {
                service: service.to_string(),
                end: end.clone(),
            });
        end
    }

    fn detach_remote(&self, device_id: &str, remote: &RemoteEnd) {
        let mut state = self.lock();
        if let Some(links) = state.remotes.get_mut(device_id) {
            links.retain(|link| !Arc::ptr_eq(&link.end, remote));
            if links.is_empty() {
                state.remotes.remove(device_id);
            }
        }
    }

    fn set_running(&self, service: &str, running: bool) {
        let mut state = self.lock();
        if running {
            state.running.insert(service.to_string());
        } else {
            state.running.remove(service);
            for links in state.remotes.values_mut() {
                links.retain(|link| link.service != service);
            }
            state.remotes.retain(|_, links| !links.is_empty());
        }
    }
}

/// Creates [`LoopbackService`] instances bound to one hub
#[derive(Debug, Clone)]
pub struct LoopbackServiceFactory {
    name: String,
    hub: LoopbackHub,
}

impl LoopbackServiceFactory {
    pub fn new(hub: LoopbackHub) -> Self {
        Self::with_name("loopback", hub)
    }

    /// Register under a different name (and URI scheme)
    pub fn with_name(name: impl Into<String>, hub: LoopbackHub) -> Self {
        Self {
            name: name.into(),
            hub,
        }
    }
}

impl ServiceFactory for LoopbackServiceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, context: ServiceContext) -> Result<Box<dyn ChannelService>> {
        Ok(Box::new(LoopbackService::new(context, self.hub.clone())))
    }
}

/// Channel service connecting to peers registered on a [`LoopbackHub`]
#[derive(Debug)]
pub struct LoopbackService {
    context: ServiceContext,
    hub: LoopbackHub,
    state: ServiceState,
    handshakes: JoinSet<()>,
    channels: ChannelRegistry,
}

impl LoopbackService {
    pub fn new(context: ServiceContext, hub: LoopbackHub) -> Self {
        Self {
            context,
            hub,
            state: ServiceState::Disabled,
            handshakes: JoinSet::new(),
            channels: ChannelRegistry::new(),
        }
    }

    fn connect(&mut self, peer: LoopbackPeer) {
        let (local, remote) = MemoryTransport::pair(
            self.context.name(),
            Some(self.context.identity().certificate().to_vec()),
            Some(peer.certificate.clone()),
        );

        // Identity packets are queued on unbounded pipes, so the peer's
        // announcement is in place before the local side starts reading.
        let announcement = peer.info.to_identity_packet();
        let peer_id = peer.device_id().to_string();
        let remote = self.hub.attach_remote(&peer_id, self.context.name(), remote);

        let context = self.context.clone();
        let channels = self.channels.clone();
        let hub = self.hub.clone();
        self.handshakes.spawn(async move {
            if let Err(e) = remote.lock().await.send_packet(&announcement).await {
                debug!("Loopback peer {} vanished: {}", peer_id, e);
            }

            if let Err(e) = complete_handshake(&context, Box::new(local), &channels).await {
                warn!("Loopback handshake with {} failed: {}", peer_id, e);
                hub.detach_remote(&peer_id, &remote);
            }
        });
    }
}

#[async_trait]
impl ChannelService for LoopbackService {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn state(&self) -> ServiceState {
        self.state
    }

    async fn start(&mut self) -> Result<()> {
        if self.state == ServiceState::Listening {
            return Ok(());
        }

        self.state = ServiceState::Starting;
        self.hub.set_running(self.context.name(), true);
        self.state = ServiceState::Listening;

        info!("Loopback service '{}' started", self.context.name());
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state == ServiceState::Disabled {
            return;
        }

        self.state = ServiceState::Stopping;
        self.handshakes.shutdown().await;
        self.channels.close_all(STOP_GRACE_PERIOD).await;
        self.hub.set_running(self.context.name(), false);
        self.state = ServiceState::Disabled;

        info!("Loopback service '{}' stopped", self.context.name());
    }

    async fn identify(&mut self, target: Option<&str>) {
        if self.state != ServiceState::Listening {
            debug!(
                "Ignoring identify on {} service '{}'",
                self.state,
                self.context.name()
            );
            return;
        }

        // Reap finished handshakes
        while self.handshakes.try_join_next().is_some() {}

        let device_id = match target {
            None => None,
            Some(uri) => match split_uri(uri) {
                Some((scheme, id)) if scheme == self.uri_scheme() => Some(id),
                _ => {
                    warn!("Loopback service cannot reach '{}'", uri);
                    return;
                }
            },
        };

        let peers = self.hub.peers_matching(device_id);
        if peers.is_empty() {
            debug!("No loopback peers matching {:?}", target);
        }
        for peer in peers {
            self.connect(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceEvent;
    use tokio::sync::mpsc;

    fn service(hub: &LoopbackHub) -> (LoopbackService, mpsc::UnboundedReceiver<ServiceEvent>) {
        let identity = Identity::generate().unwrap();
        let info = DeviceInfo::new(identity.device_id(), "Local", DeviceType::Desktop);
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ServiceContext::new("loopback", Arc::new(identity), info, tx);
        (LoopbackService::new(context, hub.clone()), rx)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let hub = LoopbackHub::new();
        let (mut service, _events) = service(&hub);

        service.start().await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Listening);
        assert!(hub.is_running("loopback"));

        service.stop().await;
        service.stop().await;
        assert_eq!(service.state(), ServiceState::Disabled);
        assert!(!hub.is_running("loopback"));
    }

    #[tokio::test]
    async fn test_identify_produces_channel() {
        let hub = LoopbackHub::new();
        let peer = Identity::generate().unwrap();
        hub.add_peer(LoopbackPeer::from_identity(&peer, "Phone", DeviceType::Phone));
        let (mut service, mut events) = service(&hub);

        service.identify(None).await;
        assert!(events.try_recv().is_err(), "identify before start is ignored");

        service.start().await.unwrap();
        service
            .identify(Some(&format!("loopback://{}", peer.device_id())))
            .await;

        match events.recv().await {
            Some(ServiceEvent::ChannelReady { channel, .. }) => {
                assert_eq!(channel.peer().device_id, peer.device_id());
                assert!(hub.is_connected(peer.device_id()));

                // The peer side sees our identity packet first
                let packet = hub
                    .receive_at_peer(peer.device_id(), Duration::from_secs(1))
                    .await
                    .unwrap();
                assert!(packet.is_type(crate::PACKET_TYPE_IDENTITY));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identify_other_scheme_is_ignored() {
        let hub = LoopbackHub::new();
        let peer = Identity::generate().unwrap();
        hub.add_peer(LoopbackPeer::from_identity(&peer, "Phone", DeviceType::Phone));
        let (mut service, mut events) = service(&hub);
        service.start().await.unwrap();

        service.identify(Some("lan://127.0.0.1:1716")).await;

        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_closes_channels() {
        let hub = LoopbackHub::new();
        let peer = Identity::generate().unwrap();
        hub.add_peer(LoopbackPeer::from_identity(&peer, "Phone", DeviceType::Phone));
        let (mut service, mut events) = service(&hub);
        service.start().await.unwrap();
        service.identify(None).await;

        let channel = match events.recv().await {
            Some(ServiceEvent::ChannelReady { channel, .. }) => channel,
            other => panic!("unexpected event: {:?}", other),
        };

        service.stop().await;

        assert!(channel.is_closed());
        assert!(!hub.is_connected(peer.device_id()));
    }
}
