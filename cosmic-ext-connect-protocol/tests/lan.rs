//! Two device managers talking TLS over loopback TCP

mod common;

use common::*;
use cosmic_ext_connect_protocol::{
    DeviceManager, LanConfig, LanServiceFactory, ManagerConfig, ManagerEvent, MemoryStorage,
    Packet, ServiceState,
};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

async fn lan_manager(storage: Arc<MemoryStorage>, name: &str) -> DeviceManager {
    init_logging();
    let config = ManagerConfig {
        device_name: name.to_string(),
        ..ManagerConfig::default()
    };
    let mut manager = DeviceManager::new(storage, config).await.expect("manager");
    manager.register_service(Arc::new(LanServiceFactory::new(LanConfig {
        tcp_port: 0,
        discovery: false,
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..LanConfig::default()
    })));
    manager
}

/// Wait for the first event matching `wanted`
async fn expect_event<F>(events: &mut mpsc::UnboundedReceiver<ManagerEvent>, wanted: F)
where
    F: Fn(&ManagerEvent) -> bool,
{
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if wanted(&event) {
                return;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("event not published in time");
}

#[tokio::test]
async fn test_pair_and_exchange_packets_over_tls() {
    let a_storage = Arc::new(MemoryStorage::new());
    let b_storage = Arc::new(MemoryStorage::new());

    let mut a = lan_manager(a_storage, "Desktop A").await;
    a.start().await;
    assert_eq!(a.service_state("lan"), Some(ServiceState::Listening));
    let a_uri = a
        .services()
        .into_iter()
        .find(|s| s.name == "lan")
        .and_then(|s| s.uri)
        .expect("listening URI");
    assert!(a_uri.starts_with("lan://127.0.0.1:"));

    let a_id = a.id().to_string();
    let a_certificate = a.identity().certificate().to_vec();
    let a_handle = a.handle();
    let mut a_events = a.subscribe();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let a_task = tokio::spawn(async move {
        a.run(async {
            let _ = shutdown_rx.await;
        })
        .await;
        a
    });

    let mut b = lan_manager(b_storage.clone(), "Laptop B").await;
    let b_id = b.id().to_string();
    let mut b_events = b.subscribe();
    b.start().await;
    b.identify(Some(&a_uri)).await.unwrap();
    pump_until(&mut b, |m| {
        m.get_device(&a_id).is_some_and(|d| d.connected)
    })
    .await;
    assert_eq!(b.get_device(&a_id).unwrap().name, "Desktop A");
    expect_event(&mut a_events, |e| {
        matches!(e, ManagerEvent::DeviceAdded(s) if s.id == b_id && s.connected)
    })
    .await;

    // B asks, A accepts
    b.request_pairing(&a_id).await.unwrap();
    expect_event(&mut a_events, |e| {
        matches!(e, ManagerEvent::PairingRequested { device_id } if *device_id == b_id)
    })
    .await;
    a_handle.pair_device(&b_id, true).await.unwrap();
    pump_until(&mut b, |m| m.get_device(&a_id).is_some_and(|d| d.paired)).await;

    let record = stored(&b_storage, &a_id).await.expect("record of A");
    assert!(record.paired);
    assert_eq!(record.certificate_der(), Some(a_certificate));

    // A pings B
    a_handle
        .send_packet(&b_id, Packet::new("cconnect.ping", json!({ "message": "hi" })))
        .await
        .unwrap();
    let mut ping = None;
    while ping.is_none() {
        turn(&mut b).await;
        ping = drain(&mut b_events).into_iter().find_map(|e| match e {
            ManagerEvent::PacketReceived { device_id, packet } if device_id == a_id => Some(packet),
            _ => None,
        });
    }
    let ping = ping.unwrap();
    assert!(ping.is_type("cconnect.ping"));
    assert_eq!(ping.get_body_field::<String>("message").as_deref(), Some("hi"));

    let devices = a_handle.get_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert!(devices[0].paired);

    // A shuts down; B keeps A as a paired, disconnected device
    shutdown_tx.send(()).unwrap();
    let a = a_task.await.unwrap();
    assert_eq!(a.service_state("lan"), Some(ServiceState::Disabled));

    pump_until(&mut b, |m| {
        m.get_device(&a_id).is_some_and(|d| !d.connected)
    })
    .await;
    let device = b.get_device(&a_id).unwrap();
    assert!(device.paired);
    assert_eq!(b.get_devices().len(), 1);

    b.stop().await;
}

#[tokio::test]
async fn test_identify_unreachable_address_produces_nothing() {
    let mut manager = lan_manager(Arc::new(MemoryStorage::new()), "Lonely").await;
    manager.start().await;

    // Port 9 (discard) on loopback is closed in test environments
    manager.identify(Some("lan://127.0.0.1:9")).await.unwrap();
    assert!(manager.identify(Some("loopback://nobody")).await.is_err());
    assert!(manager.identify(Some("not a uri")).await.is_err());
    settle(&mut manager).await;

    assert!(manager.get_devices().is_empty());
    manager.stop().await;
}
