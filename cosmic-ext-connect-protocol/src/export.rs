//! Device graph export
//!
//! Mirrors the device manager's registry onto a remote object model. Each
//! device becomes one [`DeviceObject`] at a stable path, carrying its
//! properties, an action group and a menu. An [`ExportBackend`] turns the
//! object notifications into a concrete IPC protocol (D-Bus in the daemon,
//! [`MemoryBackend`] in-process).
//!
//! Exporting only observes: it never mutates devices or the manager, and
//! objects are added and removed exactly when the manager reports
//! `DeviceAdded` and `DeviceRemoved`.

use crate::device::{DeviceProperty, DeviceSnapshot, PairingStatus};
use crate::manager::{DeviceManager, ManagerEvent};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

pub const ACTION_PAIR: &str = "pair";
pub const ACTION_UNPAIR: &str = "unpair";
/// Decline a pairing request from the peer
pub const ACTION_REJECT: &str = "reject";

/// Prefix of menu item action names
pub const ACTION_NAMESPACE: &str = "device";

/// One entry of a device's action group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionState {
    pub name: String,
    pub enabled: bool,
}

/// One entry of a device's menu
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuItem {
    pub label: String,
    /// Namespaced action, e.g. `device.pair`
    pub action: String,
}

/// Remote representation of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceObject {
    pub path: String,
    pub snapshot: DeviceSnapshot,
    pub actions: Vec<ActionState>,
    pub menu: Vec<MenuItem>,
}

impl DeviceObject {
    pub fn new(base: &str, snapshot: DeviceSnapshot) -> Self {
        let actions = device_actions(&snapshot);
        let menu = device_menu(&actions);
        Self {
            path: object_path(base, &snapshot.id),
            snapshot,
            actions,
            menu,
        }
    }

    /// Replace the snapshot; returns true when the actions changed
    fn update(&mut self, snapshot: DeviceSnapshot) -> bool {
        let actions = device_actions(&snapshot);
        self.snapshot = snapshot;
        if actions == self.actions {
            return false;
        }
        self.menu = device_menu(&actions);
        self.actions = actions;
        true
    }
}

/// Object path of a device below `base`
///
/// Characters outside `[A-Za-z0-9]` become `_`.
pub fn object_path(base: &str, device_id: &str) -> String {
    let id: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}/Device/{}", base.trim_end_matches('/'), id)
}

/// Actions of a device and whether each is currently available
pub fn device_actions(snapshot: &DeviceSnapshot) -> Vec<ActionState> {
    vec![
        ActionState {
            name: ACTION_PAIR.to_string(),
            enabled: snapshot.connected
                && !snapshot.paired
                && snapshot.pairing_status != PairingStatus::Requested,
        },
        ActionState {
            name: ACTION_UNPAIR.to_string(),
            enabled: snapshot.paired,
        },
        ActionState {
            name: ACTION_REJECT.to_string(),
            enabled: snapshot.pairing_status == PairingStatus::RequestedByPeer,
        },
    ]
}

fn device_menu(actions: &[ActionState]) -> Vec<MenuItem> {
    actions
        .iter()
        .filter(|action| action.enabled)
        .map(|action| MenuItem {
            label: match action.name.as_str() {
                ACTION_PAIR => "Pair".to_string(),
                ACTION_UNPAIR => "Unpair".to_string(),
                ACTION_REJECT => "Reject".to_string(),
                other => other.to_string(),
            },
            action: format!("{}.{}", ACTION_NAMESPACE, action.name),
        })
        .collect()
}

/// Receiver of object notifications
#[async_trait]
pub trait ExportBackend: Send + Sync + fmt::Debug {
    async fn object_added(&self, object: &DeviceObject) -> Result<()>;

    async fn object_removed(&self, path: &str) -> Result<()>;

    /// Called after the state change, with the properties that changed
    async fn properties_changed(
        &self,
        object: &DeviceObject,
        properties: &[DeviceProperty],
    ) -> Result<()>;

    /// The action group (and menu) of `object` changed
    async fn actions_changed(&self, object: &DeviceObject) -> Result<()>;
}

type Published = BTreeMap<String, DeviceObject>;

/// A running export of one manager's device graph
#[derive(Debug)]
pub struct Exporter {
    base: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Published>,
    backend: Arc<dyn ExportBackend>,
}

impl Exporter {
    /// Publish every current device, then follow the manager's events
    pub async fn export(
        manager: &mut DeviceManager,
        base: impl Into<String>,
        backend: Arc<dyn ExportBackend>,
    ) -> Self {
        let base = base.into();
        // Subscribing and taking the snapshot without yielding in between
        // means no event is missed or applied twice.
        let events = manager.subscribe();
        let devices = manager.get_devices();

        let mut published = Published::new();
        for snapshot in devices {
            let object = DeviceObject::new(&base, snapshot);
            if let Err(e) = backend.object_added(&object).await {
                warn!("Failed to export {}: {}", object.path, e);
            }
            published.insert(object.snapshot.id.clone(), object);
        }
        info!("Exporting {} devices at {}", published.len(), base);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(follow(
            base.clone(),
            backend.clone(),
            events,
            shutdown_rx,
            published,
        ));

        Self {
            base,
            shutdown: Some(shutdown),
            task,
            backend,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Stop following and retract every published object
    pub async fn unexport(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        let published = match (&mut self.task).await {
            Ok(published) => published,
            Err(e) => {
                warn!("Export task failed: {}", e);
                return;
            }
        };

        for object in published.values() {
            if let Err(e) = self.backend.object_removed(&object.path).await {
                warn!("Failed to retract {}: {}", object.path, e);
            }
        }
        info!("Retracted {} objects at {}", published.len(), self.base);
    }
}

async fn follow(
    base: String,
    backend: Arc<dyn ExportBackend>,
    mut events: mpsc::UnboundedReceiver<ManagerEvent>,
    mut shutdown: oneshot::Receiver<()>,
    mut published: Published,
) -> Published {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        apply(&base, backend.as_ref(), &mut published, event).await;
    }
    published
}

async fn apply(
    base: &str,
    backend: &dyn ExportBackend,
    published: &mut Published,
    event: ManagerEvent,
) {
    match event {
        ManagerEvent::DeviceAdded(snapshot) => {
            let object = DeviceObject::new(base, snapshot);
            if let Err(e) = backend.object_added(&object).await {
                warn!("Failed to export {}: {}", object.path, e);
            }
            published.insert(object.snapshot.id.clone(), object);
        }
        ManagerEvent::DeviceRemoved { device_id } => {
            let Some(object) = published.remove(&device_id) else {
                debug!("Removed device {} was not exported", device_id);
                return;
            };
            if let Err(e) = backend.object_removed(&object.path).await {
                warn!("Failed to retract {}: {}", object.path, e);
            }
        }
        ManagerEvent::DeviceChanged {
            snapshot,
            properties,
        } => {
            let Some(object) = published.get_mut(&snapshot.id) else {
                debug!("Changed device {} was not exported", snapshot.id);
                return;
            };
            let actions_changed = object.update(snapshot);
            if let Err(e) = backend.properties_changed(object, &properties).await {
                warn!("Failed to notify change of {}: {}", object.path, e);
            }
            if actions_changed {
                if let Err(e) = backend.actions_changed(object).await {
                    warn!("Failed to notify actions of {}: {}", object.path, e);
                }
            }
        }
        ManagerEvent::PairingRequested { .. }
        | ManagerEvent::PacketReceived { .. }
        | ManagerEvent::ServiceStateChanged { .. } => {}
    }
}

/// A notification recorded by [`MemoryBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportNotification {
    ObjectAdded(String),
    ObjectRemoved(String),
    PropertiesChanged {
        path: String,
        properties: Vec<DeviceProperty>,
    },
    ActionsChanged(String),
}

#[derive(Debug, Default)]
struct MemoryBackendState {
    objects: BTreeMap<String, DeviceObject>,
    notifications: Vec<ExportNotification>,
}

/// In-process backend keeping the published objects in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryBackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Paths of the currently published objects
    pub fn paths(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn object(&self, path: &str) -> Option<DeviceObject> {
        self.lock().objects.get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Every notification received so far, in order
    pub fn notifications(&self) -> Vec<ExportNotification> {
        self.lock().notifications.clone()
    }

    /// Poll until `condition` holds, for at most `wait`
    pub async fn wait_until<F>(&self, wait: Duration, condition: F) -> bool
    where
        F: Fn(&MemoryBackend) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl ExportBackend for MemoryBackend {
    async fn object_added(&self, object: &DeviceObject) -> Result<()> {
        let mut state = self.lock();
        state.objects.insert(object.path.clone(), object.clone());
        state
            .notifications
            .push(ExportNotification::ObjectAdded(object.path.clone()));
        Ok(())
    }

    async fn object_removed(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        state.objects.remove(path);
        state
            .notifications
            .push(ExportNotification::ObjectRemoved(path.to_string()));
        Ok(())
    }

    async fn properties_changed(
        &self,
        object: &DeviceObject,
        properties: &[DeviceProperty],
    ) -> Result<()> {
        let mut state = self.lock();
        state.objects.insert(object.path.clone(), object.clone());
        state.notifications.push(ExportNotification::PropertiesChanged {
            path: object.path.clone(),
            properties: properties.to_vec(),
        });
        Ok(())
    }

    async fn actions_changed(&self, object: &DeviceObject) -> Result<()> {
        let mut state = self.lock();
        state.objects.insert(object.path.clone(), object.clone());
        state
            .notifications
            .push(ExportNotification::ActionsChanged(object.path.clone()));
        Ok(())
    }
}
