//! Channel services
//!
//! A channel service is a pluggable transport backend. It discovers peers,
//! runs the identity exchange and certificate check, and hands every
//! resulting [`Channel`] to the coordinating loop as a
//! [`ServiceEvent::ChannelReady`]. Services never touch the device registry.
//!
//! ## Lifecycle
//!
//! ```text
//! Disabled → Starting → Listening → Stopping → Disabled
//! ```
//!
//! `start()` is idempotent. `stop()` aborts in-flight discovery and
//! handshakes and closes every channel the service produced, waiting at most
//! [`STOP_GRACE_PERIOD`] for their I/O to finish.
//!
//! Services are created by a registered [`ServiceFactory`]. Disabling a
//! service drops the instance; enabling it again creates a fresh one.

pub mod lan;
pub mod loopback;

use crate::channel::{Channel, ChannelHandle, ChannelId};
use crate::identity::{device_id_of, verify_peer, Identity};
use crate::transport::Transport;
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

pub use lan::{LanConfig, LanService, LanServiceFactory};
pub use loopback::{LoopbackHub, LoopbackPeer, LoopbackService, LoopbackServiceFactory};

/// Time allowed for the identity exchange on a fresh transport
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time `stop()` waits for produced channels to finish closing
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Lifecycle state of a channel service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Disabled,
    Starting,
    Listening,
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Disabled => "disabled",
            ServiceState::Starting => "starting",
            ServiceState::Listening => "listening",
            ServiceState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered from services and channels to the coordinating loop
#[derive(Debug)]
pub enum ServiceEvent {
    /// A handshake completed; ownership of the channel moves to the receiver
    ChannelReady { service: String, channel: Channel },

    /// A channel's transport closed (peer disconnect, error or local close)
    ChannelClosed { channel_id: ChannelId },

    /// A packet arrived on a channel
    PacketReceived { channel_id: ChannelId, packet: Packet },
}

pub type ServiceEventSender = mpsc::UnboundedSender<ServiceEvent>;

/// Everything a service needs from its owner
#[derive(Debug, Clone)]
pub struct ServiceContext {
    name: String,
    identity: Arc<Identity>,
    local_info: DeviceInfo,
    events: ServiceEventSender,
}

impl ServiceContext {
    pub fn new(
        name: impl Into<String>,
        identity: Arc<Identity>,
        local_info: DeviceInfo,
        events: ServiceEventSender,
    ) -> Self {
        Self {
            name: name.into(),
            identity,
            local_info,
            events,
        }
    }

    /// Name the service was registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Identity packet contents sent to every peer
    pub fn local_info(&self) -> &DeviceInfo {
        &self.local_info
    }

    pub fn events(&self) -> &ServiceEventSender {
        &self.events
    }
}

/// A pluggable transport backend producing channels
#[async_trait]
pub trait ChannelService: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Scheme of the URIs this service understands in `identify`
    fn uri_scheme(&self) -> &str {
        self.name()
    }

    fn state(&self) -> ServiceState;

    /// URI other devices can reach this service at, once listening
    fn local_uri(&self) -> Option<String> {
        None
    }

    /// Begin discovery/advertisement. A no-op when already started.
    async fn start(&mut self) -> Result<()>;

    /// Cancel discovery and handshakes and close every produced channel
    async fn stop(&mut self);

    /// Initiate a handshake toward `target`, or re-announce to every
    /// reachable peer when `target` is `None`
    ///
    /// Success surfaces later as a `ChannelReady` event.
    async fn identify(&mut self, target: Option<&str>);
}

/// Creates service instances for the device manager
pub trait ServiceFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn create(&self, context: ServiceContext) -> Result<Box<dyn ChannelService>>;
}

/// Split `scheme://rest` into its parts
pub fn split_uri(uri: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    Some((scheme, rest.trim_end_matches('/')))
}

/// Live channels produced by one service
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<Vec<(String, ChannelHandle)>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a channel to `peer_id`, forgetting channels that closed
    pub fn track(&self, peer_id: &str, handle: ChannelHandle) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.retain(|(_, h)| !h.is_closed());
            channels.push((peer_id.to_string(), handle));
        }
    }

    /// Whether an open channel to `peer_id` exists
    pub fn is_connected_to(&self, peer_id: &str) -> bool {
        self.channels.lock().is_ok_and(|channels| {
            channels
                .iter()
                .any(|(id, handle)| id == peer_id && !handle.is_closed())
        })
    }

    pub fn open_count(&self) -> usize {
        self.channels.lock().map_or(0, |channels| {
            channels.iter().filter(|(_, h)| !h.is_closed()).count()
        })
    }

    /// Close every tracked channel and wait up to `grace` for their I/O
    pub async fn close_all(&self, grace: Duration) {
        let handles: Vec<ChannelHandle> = match self.channels.lock() {
            Ok(mut channels) => channels.drain(..).map(|(_, handle)| handle).collect(),
            Err(_) => return,
        };
        if handles.is_empty() {
            return;
        }

        for handle in &handles {
            handle.close();
        }

        let count = handles.len();
        let waits = handles.into_iter().map(|mut handle| async move {
            handle.closed().await;
        });
        if timeout(grace, join_all(waits)).await.is_err() {
            warn!("{} channels did not close within {:?}", count, grace);
        } else {
            debug!("Closed {} channels", count);
        }
    }
}

/// Send our identity packet and read the peer's
pub async fn exchange_identity(
    transport: &mut dyn Transport,
    local: &DeviceInfo,
) -> Result<DeviceInfo> {
    transport.send_packet(&local.to_identity_packet()).await?;
    let packet = transport.receive_packet().await?;
    DeviceInfo::from_identity_packet(&packet)
}

/// Authenticate a fresh transport and turn it into a channel
///
/// Runs the identity exchange (bounded by [`HANDSHAKE_TIMEOUT`]), requires a
/// peer certificate whose fingerprint equals the claimed device id, then
/// spawns the channel, tracks it in `channels` and emits `ChannelReady`.
/// Any failure closes the transport and produces no channel.
pub async fn complete_handshake(
    context: &ServiceContext,
    mut transport: Box<dyn Transport>,
    channels: &ChannelRegistry,
) -> Result<DeviceInfo> {
    let verified = authenticate(context, transport.as_mut()).await;
    let (peer, certificate) = match verified {
        Ok(verified) => verified,
        Err(e) => {
            let _ = transport.close().await;
            return Err(e);
        }
    };

    let channel = Channel::spawn(
        context.name(),
        peer.clone(),
        certificate,
        transport,
        context.events().clone(),
    );
    channels.track(&peer.device_id, channel.handle());

    context
        .events()
        .send(ServiceEvent::ChannelReady {
            service: context.name().to_string(),
            channel,
        })
        .map_err(|_| ProtocolError::Cancelled("device manager is gone".to_string()))?;

    Ok(peer)
}

async fn authenticate(
    context: &ServiceContext,
    transport: &mut dyn Transport,
) -> Result<(DeviceInfo, Vec<u8>)> {
    let address = transport.remote_address();
    let peer = timeout(
        HANDSHAKE_TIMEOUT,
        exchange_identity(transport, context.local_info()),
    )
    .await
    .map_err(|_| ProtocolError::Timeout(format!("identity exchange with {}", address)))??;

    if peer.device_id == context.identity().device_id() {
        return Err(ProtocolError::CertificateValidation(format!(
            "{} announced our own device id",
            address
        )));
    }

    let certificate = transport
        .peer_certificate()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            ProtocolError::CertificateValidation(format!("{} presented no certificate", address))
        })?;

    if !verify_peer(&certificate, &peer.device_id) {
        return Err(ProtocolError::CertificateValidation(format!(
            "certificate of {} hashes to {} but it claims to be {}",
            address,
            device_id_of(&certificate),
            peer.device_id
        )));
    }

    debug!(
        "Authenticated {} ({}) at {}",
        peer.device_name, peer.device_id, address
    );
    Ok((peer, certificate))
}
