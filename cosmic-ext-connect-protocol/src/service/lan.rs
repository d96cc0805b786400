//! LAN channel service
//!
//! TLS over TCP with optional UDP broadcast discovery.
//!
//! ## Discovery Protocol
//!
//! 1. **Announce**: broadcast our identity packet (with `tcpPort`) on UDP
//!    port 1716 at start and on every untargeted `identify()`
//! 2. **Listen**: receive announcements from other devices
//! 3. **Connect**: the device with the lexicographically smaller id opens the
//!    TCP connection; the other answers with a unicast announcement so the
//!    smaller one learns about it
//!
//! The TCP side runs the TLS handshake, then the identity exchange and
//! certificate check shared by all services. UDP announcements are only
//! hints and are never trusted.
//!
//! ## Port Configuration
//!
//! - Primary port: 1716 (UDP and TCP)
//! - Fallback range: 1714-1764

use super::{
    complete_handshake, split_uri, ChannelRegistry, ChannelService, ServiceContext, ServiceFactory,
    ServiceState, STOP_GRACE_PERIOD,
};
use crate::transport::{TlsConfig, TlsTransport};
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, UdpSocket};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Default TCP and UDP port
pub const DEFAULT_PORT: u16 = 1716;

/// Port range for fallback when the configured port is unavailable
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// IPv4 limited broadcast
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Back-off after a failing accept/recv, e.g. when out of file descriptors
const SOCKET_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration of the LAN service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanConfig {
    /// TCP listening port, 0 for an ephemeral port
    pub tcp_port: u16,

    /// UDP discovery port
    pub discovery_port: u16,

    /// Whether to announce and listen on UDP
    pub discovery: bool,

    /// Destination of announcements
    pub broadcast_address: Ipv4Addr,

    /// Address the listeners bind to
    pub bind_address: IpAddr,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_PORT,
            discovery_port: DEFAULT_PORT,
            discovery: true,
            broadcast_address: BROADCAST_ADDR,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Creates [`LanService`] instances
#[derive(Debug, Clone, Default)]
pub struct LanServiceFactory {
    config: LanConfig,
}

impl LanServiceFactory {
    pub fn new(config: LanConfig) -> Self {
        Self { config }
    }
}

impl ServiceFactory for LanServiceFactory {
    fn name(&self) -> &str {
        "lan"
    }

    fn create(&self, context: ServiceContext) -> Result<Box<dyn ChannelService>> {
        Ok(Box::new(LanService::new(context, self.config.clone())))
    }
}

/// Channel service for TLS over TCP on the local network
#[derive(Debug)]
pub struct LanService {
    config: LanConfig,
    context: ServiceContext,
    state: ServiceState,
    tls: Option<TlsConfig>,
    socket: Option<Arc<UdpSocket>>,
    local_port: Option<u16>,
    tasks: Vec<JoinHandle<()>>,
    handshakes: JoinSet<()>,
    channels: ChannelRegistry,
}

impl LanService {
    pub fn new(context: ServiceContext, config: LanConfig) -> Self {
        Self {
            config,
            context,
            state: ServiceState::Disabled,
            tls: None,
            socket: None,
            local_port: None,
            tasks: Vec::new(),
            handshakes: JoinSet::new(),
            channels: ChannelRegistry::new(),
        }
    }

    /// TCP port actually listened on, once started
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    async fn listen(&mut self) -> Result<()> {
        let tls = TlsConfig::new(self.context.identity())?;
        let listener = bind_tcp(self.config.bind_address, self.config.tcp_port).await?;
        let tcp_port = listener.local_addr()?.port();
        info!("LAN service listening on TCP port {}", tcp_port);

        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            tls.clone(),
            self.channels.clone(),
        )));

        if self.config.discovery {
            let socket = Arc::new(bind_udp(self.config.bind_address, self.config.discovery_port).await?);
            let discovery = Discovery {
                socket: socket.clone(),
                context: self.context.clone(),
                tls: tls.clone(),
                channels: self.channels.clone(),
                tcp_port,
            };
            self.tasks.push(tokio::spawn(discovery.run()));
            self.socket = Some(socket);
        }

        self.local_port = Some(tcp_port);
        self.tls = Some(tls);
        Ok(())
    }

    fn announcement(&self) -> Result<Vec<u8>> {
        let port = self
            .local_port
            .ok_or_else(|| ProtocolError::Transport("LAN service is not listening".to_string()))?;
        self.context
            .local_info()
            .clone()
            .with_tcp_port(port)
            .to_identity_packet()
            .to_bytes()
    }

    async fn broadcast(&self) {
        let Some(socket) = &self.socket else {
            debug!("UDP discovery disabled, nothing to announce");
            return;
        };

        let destination = SocketAddr::new(
            IpAddr::V4(self.config.broadcast_address),
            self.config.discovery_port,
        );
        match self.announcement() {
            Ok(bytes) => match socket.send_to(&bytes, destination).await {
                Ok(sent) => debug!("Broadcast identity ({} bytes) to {}", sent, destination),
                Err(e) => warn!("Failed to broadcast identity: {}", e),
            },
            Err(e) => warn!("Failed to build announcement: {}", e),
        }
    }

    async fn connect_to(&mut self, target: &str) {
        let Some(tls) = self.tls.clone() else {
            return;
        };

        let address = match split_uri(target) {
            Some((scheme, address)) if scheme == self.uri_scheme() => address.to_string(),
            _ => {
                warn!("LAN service cannot reach '{}'", target);
                return;
            }
        };
        let address = socket_address(&address);

        let context = self.context.clone();
        let channels = self.channels.clone();
        self.handshakes.spawn(async move {
            let addr = match lookup_host(&address).await.map(|mut addrs| addrs.next()) {
                Ok(Some(addr)) => addr,
                Ok(None) => {
                    warn!("'{}' did not resolve", address);
                    return;
                }
                Err(e) => {
                    warn!("Failed to resolve '{}': {}", address, e);
                    return;
                }
            };
            connect(addr, context, tls, channels).await;
        });
    }
}

/// `host[:port]` of a `lan://` URI as something `lookup_host` accepts
///
/// IPv6 literals may come bare (`::1`) or bracketed (`[::1]`, `[::1]:1739`).
/// The default port fills in when none is given.
fn socket_address(address: &str) -> String {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return addr.to_string();
    }
    let host = address
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(address);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, DEFAULT_PORT)
    }
}

#[async_trait]
impl ChannelService for LanService {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn uri_scheme(&self) -> &str {
        "lan"
    }

    fn state(&self) -> ServiceState {
        self.state
    }

    fn local_uri(&self) -> Option<String> {
        let port = self.local_port?;
        Some(format!(
            "{}://{}",
            self.uri_scheme(),
            SocketAddr::new(self.config.bind_address, port)
        ))
    }

    async fn start(&mut self) -> Result<()> {
        if self.state == ServiceState::Listening {
            return Ok(());
        }

        self.state = ServiceState::Starting;
        if let Err(e) = self.listen().await {
            warn!("LAN service failed to start: {}", e);
            self.stop().await;
            return Err(e);
        }
        self.state = ServiceState::Listening;

        self.broadcast().await;
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state == ServiceState::Disabled {
            return;
        }

        self.state = ServiceState::Stopping;

        // Aborting the loops drops their JoinSets, which aborts the
        // handshakes they spawned.
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.handshakes.shutdown().await;
        self.channels.close_all(STOP_GRACE_PERIOD).await;

        self.socket = None;
        self.tls = None;
        self.local_port = None;
        self.state = ServiceState::Disabled;
        info!("LAN service stopped");
    }

    async fn identify(&mut self, target: Option<&str>) {
        if self.state != ServiceState::Listening {
            debug!("Ignoring identify on {} LAN service", self.state);
            return;
        }

        while self.handshakes.try_join_next().is_some() {}

        match target {
            None => self.broadcast().await,
            Some(uri) => self.connect_to(uri).await,
        }
    }
}

/// The side with the smaller device id opens the TCP connection
pub fn should_initiate(local_id: &str, peer_id: &str) -> bool {
    local_id < peer_id
}

async fn connect(addr: SocketAddr, context: ServiceContext, tls: TlsConfig, channels: ChannelRegistry) {
    let transport = match TlsTransport::connect(addr, &tls).await {
        Ok(transport) => transport,
        Err(e) => {
            warn!("Could not connect to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = complete_handshake(&context, Box::new(transport), &channels).await {
        warn!("Handshake with {} failed: {}", addr, e);
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: ServiceContext,
    tls: TlsConfig,
    channels: ChannelRegistry,
) {
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming connection from {}", addr);
                    let context = context.clone();
                    let tls = tls.clone();
                    let channels = channels.clone();
                    handshakes.spawn(async move {
                        match TlsTransport::accept(stream, addr, &tls).await {
                            Ok(transport) => {
                                if let Err(e) =
                                    complete_handshake(&context, Box::new(transport), &channels).await
                                {
                                    warn!("Rejected connection from {}: {}", addr, e);
                                }
                            }
                            Err(e) => warn!("TLS handshake with {} failed: {}", addr, e),
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    sleep(SOCKET_ERROR_BACKOFF).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
}

struct Discovery {
    socket: Arc<UdpSocket>,
    context: ServiceContext,
    tls: TlsConfig,
    channels: ChannelRegistry,
    tcp_port: u16,
}

impl Discovery {
    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut connects = JoinSet::new();

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((size, src)) => {
                        if let Err(e) = self.handle_datagram(&buf[..size], src, &mut connects).await {
                            debug!("Ignoring datagram from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        warn!("Error receiving datagram: {}", e);
                        sleep(SOCKET_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = connects.join_next(), if !connects.is_empty() => {}
            }
        }
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        src: SocketAddr,
        connects: &mut JoinSet<()>,
    ) -> Result<()> {
        let peer = DeviceInfo::from_identity_packet(&Packet::from_bytes(data)?)?;
        let local_id = self.context.identity().device_id();

        if peer.device_id == local_id {
            return Ok(());
        }
        if self.channels.is_connected_to(&peer.device_id) {
            debug!("Already connected to {}, ignoring announcement", peer.device_id);
            return Ok(());
        }

        if should_initiate(local_id, &peer.device_id) {
            let port = peer
                .tcp_port
                .ok_or_else(|| ProtocolError::InvalidPacket("Missing tcpPort".to_string()))?;
            let addr = SocketAddr::new(src.ip(), port);
            info!("Discovered {} at {}", peer.device_name, addr);
            connects.spawn(connect(
                addr,
                self.context.clone(),
                self.tls.clone(),
                self.channels.clone(),
            ));
        } else {
            let reply = self
                .context
                .local_info()
                .clone()
                .with_tcp_port(self.tcp_port)
                .to_identity_packet()
                .to_bytes()?;
            self.socket.send_to(&reply, src).await?;
            debug!("Answered announcement from {} at {}", peer.device_id, src);
        }

        Ok(())
    }
}

async fn bind_tcp(address: IpAddr, port: u16) -> Result<TcpListener> {
    match TcpListener::bind((address, port)).await {
        Ok(listener) => Ok(listener),
        Err(e) if port != 0 => {
            warn!("Failed to bind TCP port {}: {}. Trying fallback range...", port, e);
            for fallback in PORT_RANGE_START..=PORT_RANGE_END {
                if fallback == port {
                    continue;
                }
                if let Ok(listener) = TcpListener::bind((address, fallback)).await {
                    return Ok(listener);
                }
            }
            Err(ProtocolError::from_io_error(e, "binding TCP listener"))
        }
        Err(e) => Err(ProtocolError::from_io_error(e, "binding TCP listener")),
    }
}

async fn bind_udp(address: IpAddr, port: u16) -> Result<UdpSocket> {
    let socket = match UdpSocket::bind((address, port)).await {
        Ok(socket) => socket,
        Err(e) if port != 0 => {
            warn!("Failed to bind UDP port {}: {}. Trying fallback range...", port, e);
            let mut bound = None;
            for fallback in PORT_RANGE_START..=PORT_RANGE_END {
                if fallback == port {
                    continue;
                }
                if let Ok(socket) = UdpSocket::bind((address, fallback)).await {
                    bound = Some(socket);
                    break;
                }
            }
            bound.ok_or_else(|| ProtocolError::from_io_error(e, "binding UDP socket"))?
        }
        Err(e) => return Err(ProtocolError::from_io_error(e, "binding UDP socket")),
    };

    socket.set_broadcast(true)?;
    info!("LAN discovery bound to UDP {}", socket.local_addr()?);
    Ok(socket)
}
