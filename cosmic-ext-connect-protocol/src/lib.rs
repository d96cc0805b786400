//! COSMIC Connect connectivity core
//!
//! Discovers remote devices over pluggable transports, authenticates them
//! with self-signed certificates, tracks identity and pairing across
//! reconnects and exposes the resulting device graph to observers.
//!
//! ## Components
//!
//! - [`identity`]: local certificate and device id, peer verification
//! - [`transport`]: framed packet transports (TLS over TCP, in-memory)
//! - [`channel`]: one authenticated packet stream to a peer
//! - [`service`]: channel services producing channels (LAN, loopback)
//! - [`device`]: per-peer identity, pairing state and attached channel
//! - [`manager`]: the device registry and coordinating loop
//! - [`export`]: mirrors the registry onto a remote object model
//!
//! ```no_run
//! use cosmic_ext_connect_protocol::{
//!     DeviceManager, FileStorage, LanConfig, LanServiceFactory, ManagerConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> cosmic_ext_connect_protocol::Result<()> {
//! let storage = Arc::new(FileStorage::new("/tmp/cosmic-ext-connect"));
//! let mut manager = DeviceManager::new(storage, ManagerConfig::default()).await?;
//! manager.register_service(Arc::new(LanServiceFactory::new(LanConfig::default())));
//! manager.start().await;
//! manager.identify(None).await?;
//! manager.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod device;
pub mod device_info;
pub mod export;
pub mod identity;
pub mod manager;
pub mod packet;
pub mod service;
pub mod storage;
pub mod transport;

mod error;

pub use channel::{Channel, ChannelHandle, ChannelId};
pub use device::{
    Detached, Device, DeviceProperty, DeviceSnapshot, PairTransition, PairingStatus,
    PAIRING_TIMEOUT,
};
pub use device_info::{DeviceInfo, DeviceType};
pub use error::{ProtocolError, Result};
pub use export::{DeviceObject, ExportBackend, ExportNotification, Exporter, MemoryBackend};
pub use identity::{device_id_of, display_fingerprint, get_or_create_identity, verify_peer, Identity};
pub use manager::{DeviceManager, ManagerConfig, ManagerEvent, ManagerHandle, ServiceSummary};
pub use packet::{
    current_timestamp, Packet, MAX_PACKET_SIZE, MIN_PROTOCOL_VERSION, PACKET_TYPE_IDENTITY,
    PACKET_TYPE_PAIR, PROTOCOL_VERSION,
};
pub use service::{
    ChannelService, LanConfig, LanService, LanServiceFactory, LoopbackHub, LoopbackPeer,
    LoopbackService, LoopbackServiceFactory, ServiceContext, ServiceEvent, ServiceFactory,
    ServiceState,
};
pub use storage::{DeviceRecord, FileStorage, MemoryStorage, Storage, StoredIdentity};
