//! Pairing protocol tests over the loopback service

mod common;

use common::*;
use cosmic_ext_connect_protocol::{
    DeviceProperty, LoopbackHub, ManagerEvent, MemoryStorage, Packet, PairingStatus,
    ProtocolError, PACKET_TYPE_PAIR,
};
use serde_json::json;
use std::sync::Arc;

fn pair_answer(packet: &Packet) -> Option<bool> {
    assert!(packet.is_type(PACKET_TYPE_PAIR), "expected a pair packet");
    packet.get_body_field("pair")
}

#[tokio::test]
async fn test_peer_request_accepted_locally() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();

    let mut manager = loopback_manager(storage.clone(), &hub, config(&[])).await;
    let mut events = manager.subscribe();
    manager.start().await;
    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some()).await;

    hub.send_from_peer(id, Packet::pair(true)).await.unwrap();
    pump_until(&mut manager, |m| {
        m.get_device(id)
            .is_some_and(|d| d.pairing_status == PairingStatus::RequestedByPeer)
    })
    .await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ManagerEvent::PairingRequested { device_id } if device_id == id)));

    manager.pair_device(id, true).await.unwrap();

    let device = manager.get_device(id).unwrap();
    assert!(device.paired);
    assert_eq!(device.pairing_status, PairingStatus::Paired);
    assert_eq!(pair_answer(&next_packet_at_peer(&hub, id).await), Some(true));

    let record = stored(&storage, id).await.expect("record");
    assert!(record.paired);
    assert_eq!(
        record.certificate_der().as_deref(),
        Some(phone.certificate())
    );
}

#[tokio::test]
async fn test_local_request_accepted_by_peer() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();

    let mut manager = loopback_manager(storage.clone(), &hub, config(&[])).await;
    let mut events = manager.subscribe();
    manager.start().await;
    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some()).await;
    drain(&mut events);

    manager.request_pairing(id).await.unwrap();
    assert_eq!(
        manager.get_device(id).unwrap().pairing_status,
        PairingStatus::Requested
    );
    assert_eq!(pair_answer(&next_packet_at_peer(&hub, id).await), Some(true));

    // A second request while one is pending changes nothing
    manager.request_pairing(id).await.unwrap();

    hub.send_from_peer(id, Packet::pair(true)).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some_and(|d| d.paired)).await;

    let changes: Vec<Vec<DeviceProperty>> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ManagerEvent::DeviceChanged { properties, .. } => Some(properties),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![
            vec![DeviceProperty::PairingState],
            vec![DeviceProperty::Paired, DeviceProperty::PairingState],
        ]
    );
    assert!(stored(&storage, id).await.is_some_and(|r| r.paired));

    assert!(matches!(
        manager.request_pairing(id).await,
        Err(ProtocolError::AlreadyPaired(_))
    ));
}

#[tokio::test]
async fn test_peer_rejects_local_request() {
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();

    let mut manager =
        loopback_manager(Arc::new(MemoryStorage::new()), &hub, config(&[])).await;
    manager.start().await;
    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some()).await;

    manager.request_pairing(id).await.unwrap();
    hub.send_from_peer(id, Packet::pair(false)).await.unwrap();
    pump_until(&mut manager, |m| {
        m.get_device(id)
            .is_some_and(|d| d.pairing_status == PairingStatus::Unpaired)
    })
    .await;

    let device = manager.get_device(id).unwrap();
    assert!(device.connected, "a rejected request keeps the channel");
    assert!(!device.paired);
}

#[tokio::test]
async fn test_local_reject_tears_device_down() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();

    let mut manager = loopback_manager(storage.clone(), &hub, config(&[])).await;
    let mut events = manager.subscribe();
    manager.start().await;
    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some()).await;

    hub.send_from_peer(id, Packet::pair(true)).await.unwrap();
    pump_until(&mut manager, |m| {
        m.get_device(id)
            .is_some_and(|d| d.pairing_status == PairingStatus::RequestedByPeer)
    })
    .await;

    manager.pair_device(id, false).await.unwrap();

    assert!(manager.get_device(id).is_none());
    assert_eq!(removed(&drain(&mut events), id), 1);
    assert_eq!(pair_answer(&next_packet_at_peer(&hub, id).await), Some(false));
    assert!(stored(&storage, id).await.is_none());

    // The closed channel no longer belongs to anyone
    settle(&mut manager).await;
    assert!(manager.get_device(id).is_none());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_unpaired_packets_are_dropped() {
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();

    let mut manager =
        loopback_manager(Arc::new(MemoryStorage::new()), &hub, config(&[])).await;
    let mut events = manager.subscribe();
    manager.start().await;
    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some()).await;

    let ping = Packet::new("cconnect.ping", json!({}));
    hub.send_from_peer(id, ping.clone()).await.unwrap();
    turn(&mut manager).await;
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, ManagerEvent::PacketReceived { .. })));

    assert!(matches!(
        manager.send_packet(id, ping.clone()),
        Err(ProtocolError::NotPaired)
    ));

    hub.send_from_peer(id, Packet::pair(true)).await.unwrap();
    pump_until(&mut manager, |m| {
        m.get_device(id)
            .is_some_and(|d| d.pairing_status == PairingStatus::RequestedByPeer)
    })
    .await;
    manager.pair_device(id, true).await.unwrap();
    assert_eq!(pair_answer(&next_packet_at_peer(&hub, id).await), Some(true));

    hub.send_from_peer(id, ping.clone()).await.unwrap();
    turn(&mut manager).await;
    let received: Vec<Packet> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ManagerEvent::PacketReceived { device_id, packet } if device_id == id => Some(packet),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 1);
    assert!(received[0].is_type("cconnect.ping"));

    manager.send_packet(id, ping).unwrap();
    assert!(next_packet_at_peer(&hub, id).await.is_type("cconnect.ping"));
}

#[tokio::test]
async fn test_pairing_survives_restart() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();

    let local_id = {
        let mut manager = loopback_manager(storage.clone(), &hub, config(&[])).await;
        manager.start().await;
        manager.identify(Some(&uri(&phone))).await.unwrap();
        pump_until(&mut manager, |m| m.get_device(id).is_some()).await;
        manager.request_pairing(id).await.unwrap();
        hub.send_from_peer(id, Packet::pair(true)).await.unwrap();
        pump_until(&mut manager, |m| m.get_device(id).is_some_and(|d| d.paired)).await;
        manager.stop().await;
        manager.id().to_string()
    };

    let mut manager = loopback_manager(storage, &hub, config(&[])).await;
    assert_eq!(manager.id(), local_id, "local identity is reused");
    manager.start().await;

    let device = manager.get_device(id).expect("restored device");
    assert!(device.paired);
    assert!(!device.connected);
    assert_eq!(device.name, "Pixel");

    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some_and(|d| d.connected)).await;
    assert!(manager.get_device(id).unwrap().paired);
}

#[tokio::test]
async fn test_unpair_while_disconnected_evicts() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();
    persist_paired(&storage, &phone, "Pixel").await;

    let mut manager = loopback_manager(storage.clone(), &hub, config(&[])).await;
    let mut events = manager.subscribe();
    manager.start().await;
    assert!(manager.get_device(id).is_some());

    manager.unpair_device(id).await.unwrap();

    assert!(manager.get_device(id).is_none());
    assert_eq!(removed(&drain(&mut events), id), 1);
    assert!(stored(&storage, id).await.is_none());

    assert!(matches!(
        manager.unpair_device(id).await,
        Err(ProtocolError::DeviceNotFound(_))
    ));
}

#[tokio::test]
async fn test_unpair_while_connected_evicts_on_disconnect() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();
    persist_paired(&storage, &phone, "Pixel").await;

    let mut manager = loopback_manager(storage.clone(), &hub, config(&[])).await;
    let mut events = manager.subscribe();
    manager.start().await;
    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some_and(|d| d.connected)).await;

    manager.unpair_device(id).await.unwrap();
    assert_eq!(pair_answer(&next_packet_at_peer(&hub, id).await), Some(false));

    let device = manager.get_device(id).unwrap();
    assert!(!device.paired);
    assert!(device.connected);
    assert!(stored(&storage, id).await.is_some_and(|r| !r.paired));

    hub.disconnect(id);
    pump_until(&mut manager, |m| m.get_device(id).is_none()).await;
    assert_eq!(removed(&drain(&mut events), id), 1);
    assert!(stored(&storage, id).await.is_none());
}

#[tokio::test]
async fn test_peer_unpair() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();
    persist_paired(&storage, &phone, "Pixel").await;

    let mut manager = loopback_manager(storage.clone(), &hub, config(&[])).await;
    manager.start().await;
    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some_and(|d| d.connected)).await;

    hub.send_from_peer(id, Packet::pair(false)).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some_and(|d| !d.paired)).await;

    let record = stored(&storage, id).await.expect("record");
    assert!(!record.paired);
    assert!(record.certificate.is_none());
}
