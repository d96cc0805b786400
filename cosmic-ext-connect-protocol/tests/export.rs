//! Export layer tests against the in-memory backend

mod common;

use common::*;
use cosmic_ext_connect_protocol::export::object_path;
use cosmic_ext_connect_protocol::{
    DeviceProperty, DeviceType, ExportNotification, Exporter, LoopbackHub, LoopbackPeer,
    MemoryBackend, MemoryStorage, Packet, PairingStatus,
};
use std::sync::Arc;

const BASE: &str = "/io/github/CosmicExtConnect";

fn properties_changed(backend: &MemoryBackend, path: &str) -> Vec<Vec<DeviceProperty>> {
    backend
        .notifications()
        .into_iter()
        .filter_map(|n| match n {
            ExportNotification::PropertiesChanged { path: p, properties } if p == path => {
                Some(properties)
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_export_mirrors_registry() {
    let storage = Arc::new(MemoryStorage::new());
    let hub = LoopbackHub::new();
    let x = phone(&hub, "X");
    persist_paired(&storage, &x, "X").await;
    let x_path = object_path(BASE, x.device_id());

    let mut manager = loopback_manager(storage, &hub, config(&[])).await;
    manager.start().await;

    let backend = MemoryBackend::new();
    let exporter = Exporter::export(&mut manager, BASE, Arc::new(backend.clone())).await;
    assert_eq!(exporter.base(), BASE);
    assert_eq!(backend.object_count(), manager.get_devices().len());
    assert_eq!(backend.paths(), vec![x_path.clone()]);
    let exported = backend.object(&x_path).unwrap();
    assert!(!exported.snapshot.connected);
    assert_eq!(exported.menu[0].label, "Unpair");

    // A new device appears as a new object
    let y = phone(&hub, "Y");
    let y_path = object_path(BASE, y.device_id());
    manager.identify(Some(&uri(&y))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(y.device_id()).is_some()).await;
    assert!(backend.wait_until(WAIT, |b| b.object_count() == 2).await);
    let y_object = backend.object(&y_path).unwrap();
    assert!(y_object.actions.iter().any(|a| a.name == "pair" && a.enabled));

    // X comes back under a new name: one change carrying both properties
    hub.add_peer(LoopbackPeer::from_identity(&x, "X renamed", DeviceType::Phone));
    manager.identify(Some(&uri(&x))).await.unwrap();
    pump_until(&mut manager, |m| {
        m.get_device(x.device_id()).is_some_and(|d| d.connected)
    })
    .await;
    assert!(
        backend
            .wait_until(WAIT, |b| !properties_changed(b, &x_path).is_empty())
            .await
    );
    assert_eq!(
        properties_changed(&backend, &x_path),
        vec![vec![DeviceProperty::Name, DeviceProperty::Connected]]
    );
    let renamed = backend.object(&x_path).unwrap();
    assert_eq!(renamed.snapshot.name, "X renamed");
    assert!(renamed.snapshot.connected);

    // Y disconnects and, being unpaired, disappears
    hub.disconnect(y.device_id());
    pump_until(&mut manager, |m| m.get_device(y.device_id()).is_none()).await;
    assert!(backend.wait_until(WAIT, |b| b.object_count() == 1).await);
    assert!(backend
        .notifications()
        .contains(&ExportNotification::ObjectRemoved(y_path)));

    let before = manager.get_devices();
    exporter.unexport().await;
    assert_eq!(backend.object_count(), 0);
    assert_eq!(manager.get_devices(), before, "unexport leaves the registry alone");
}

#[tokio::test]
async fn test_pairing_updates_actions() {
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();
    let path = object_path(BASE, id);

    let mut manager =
        loopback_manager(Arc::new(MemoryStorage::new()), &hub, config(&[])).await;
    manager.start().await;
    let backend = MemoryBackend::new();
    let exporter = Exporter::export(&mut manager, BASE, Arc::new(backend.clone())).await;
    assert_eq!(backend.object_count(), 0);

    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some()).await;
    hub.send_from_peer(id, Packet::pair(true)).await.unwrap();
    pump_until(&mut manager, |m| {
        m.get_device(id)
            .is_some_and(|d| d.pairing_status == PairingStatus::RequestedByPeer)
    })
    .await;
    manager.pair_device(id, true).await.unwrap();

    assert!(
        backend
            .wait_until(WAIT, |b| b
                .notifications()
                .contains(&ExportNotification::ActionsChanged(path.clone())))
            .await
    );
    let object = backend.object(&path).unwrap();
    assert!(object.snapshot.paired);
    assert_eq!(object.menu.len(), 1);
    assert_eq!(object.menu[0].action, "device.unpair");

    exporter.unexport().await;
    assert!(manager.get_device(id).is_some_and(|d| d.paired));
}

#[tokio::test]
async fn test_rejecting_peer_request_retracts_object() {
    let hub = LoopbackHub::new();
    let phone = phone(&hub, "Pixel");
    let id = phone.device_id();
    let path = object_path(BASE, id);

    let mut manager =
        loopback_manager(Arc::new(MemoryStorage::new()), &hub, config(&[])).await;
    manager.start().await;
    let backend = MemoryBackend::new();
    let exporter = Exporter::export(&mut manager, BASE, Arc::new(backend.clone())).await;

    manager.identify(Some(&uri(&phone))).await.unwrap();
    pump_until(&mut manager, |m| m.get_device(id).is_some()).await;
    hub.send_from_peer(id, Packet::pair(true)).await.unwrap();
    pump_until(&mut manager, |m| {
        m.get_device(id)
            .is_some_and(|d| d.pairing_status == PairingStatus::RequestedByPeer)
    })
    .await;

    assert!(
        backend
            .wait_until(WAIT, |b| b
                .object(&path)
                .is_some_and(|o| o.actions.iter().any(|a| a.name == "reject" && a.enabled)))
            .await
    );
    let menu: Vec<String> = backend
        .object(&path)
        .unwrap()
        .menu
        .into_iter()
        .map(|item| item.action)
        .collect();
    assert_eq!(menu, vec!["device.pair", "device.reject"]);

    manager.pair_device(id, false).await.unwrap();
    assert!(backend.wait_until(WAIT, |b| b.object_count() == 0).await);
    assert!(backend
        .notifications()
        .contains(&ExportNotification::ObjectRemoved(path)));
    assert!(manager.get_device(id).is_none());

    exporter.unexport().await;
}
