//! Shared helpers for the integration tests

#![allow(dead_code)]

use cosmic_ext_connect_protocol::{
    DeviceManager, DeviceRecord, DeviceType, Identity, LoopbackHub, LoopbackPeer,
    LoopbackServiceFactory, ManagerConfig, ManagerEvent, MemoryStorage, Packet, Storage,
    PACKET_TYPE_IDENTITY,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Drive the coordinating loop until `done` holds
pub async fn pump_until<F>(manager: &mut DeviceManager, mut done: F)
where
    F: FnMut(&DeviceManager) -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !done(manager) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        timeout(remaining, manager.turn())
            .await
            .expect("condition not reached in time");
    }
}

/// Run one turn, failing if nothing arrives
pub async fn turn(manager: &mut DeviceManager) {
    timeout(WAIT, manager.turn())
        .await
        .expect("no event in time");
}

/// Apply whatever is still queued until the loop stays quiet for a while
///
/// Late close notifications of replaced or stopped channels are consumed
/// here, so assertions afterwards see their (lack of) effect.
pub async fn settle(manager: &mut DeviceManager) {
    let deadline = Instant::now() + WAIT;
    while timeout(Duration::from_millis(200), manager.turn())
        .await
        .is_ok()
    {
        assert!(Instant::now() < deadline, "coordinating loop never settled");
    }
}

/// Everything published so far
pub fn drain(events: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<ManagerEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn added(events: &[ManagerEvent], device_id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ManagerEvent::DeviceAdded(s) if s.id == device_id))
        .count()
}

pub fn removed(events: &[ManagerEvent], device_id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ManagerEvent::DeviceRemoved { device_id: id } if id == device_id))
        .count()
}

pub fn config(services: &[(&str, bool)]) -> ManagerConfig {
    let mut config = ManagerConfig {
        device_name: "Workstation".to_string(),
        ..ManagerConfig::default()
    };
    for (name, enabled) in services {
        config.services.insert(name.to_string(), *enabled);
    }
    config
}

/// Route library logs to the test harness; `RUST_LOG` is not consulted
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A manager with the default loopback service registered
pub async fn loopback_manager(
    storage: Arc<MemoryStorage>,
    hub: &LoopbackHub,
    config: ManagerConfig,
) -> DeviceManager {
    init_logging();
    let mut manager = DeviceManager::new(storage, config)
        .await
        .expect("manager");
    manager.register_service(Arc::new(LoopbackServiceFactory::new(hub.clone())));
    manager
}

/// A simulated phone registered on `hub`
pub fn phone(hub: &LoopbackHub, name: &str) -> Identity {
    let identity = Identity::generate().expect("identity");
    hub.add_peer(LoopbackPeer::from_identity(&identity, name, DeviceType::Phone));
    identity
}

pub fn uri(identity: &Identity) -> String {
    format!("loopback://{}", identity.device_id())
}

/// Store `identity` as a paired device
pub async fn persist_paired(storage: &MemoryStorage, identity: &Identity, name: &str) {
    storage
        .save_device(&DeviceRecord {
            id: identity.device_id().to_string(),
            name: name.to_string(),
            device_type: DeviceType::Phone,
            paired: true,
            incoming_capabilities: vec![],
            outgoing_capabilities: vec![],
            certificate: Some(DeviceRecord::encode_certificate(identity.certificate())),
            last_seen: 0,
        })
        .await
        .expect("save record");
}

/// Stored record of `device_id`, if any
pub async fn stored(storage: &MemoryStorage, device_id: &str) -> Option<DeviceRecord> {
    storage
        .load_all_devices()
        .await
        .expect("load records")
        .into_iter()
        .find(|record| record.id == device_id)
}

/// Next packet the local device sent to a loopback peer, skipping the
/// identity packet of the handshake
pub async fn next_packet_at_peer(hub: &LoopbackHub, device_id: &str) -> Packet {
    loop {
        let packet = hub
            .receive_at_peer(device_id, WAIT)
            .await
            .expect("packet at peer");
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return packet;
        }
    }
}
