//! DBus Interface for the COSMIC Connect Daemon
//!
//! Publishes the device graph on the session bus:
//!
//! - `<base>`: `org.freedesktop.DBus.ObjectManager` and
//!   `io.github.CosmicExtConnect.Manager`
//! - `<base>/Device/<id>`: `io.github.CosmicExtConnect.Device` (properties),
//!   `io.github.CosmicExtConnect.Actions` and `io.github.CosmicExtConnect.Menu`
//!
//! Device objects are driven by the export layer through [`DbusBackend`].
//! Method calls are forwarded to the coordinating loop via [`ManagerHandle`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use cosmic_ext_connect_protocol::export::{
    ActionState, MenuItem, ACTION_PAIR, ACTION_REJECT, ACTION_UNPAIR,
};
use cosmic_ext_connect_protocol::{
    DeviceObject, DeviceProperty, DeviceSnapshot, ExportBackend, ManagerHandle, ProtocolError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zbus::{connection, interface, Connection};

use crate::config::Config;

/// DBus service name
pub const SERVICE_NAME: &str = "io.github.CosmicExtConnect";

fn failed(error: ProtocolError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(error.user_message())
}

fn bus_error(error: zbus::Error) -> ProtocolError {
    ProtocolError::Transport(format!("D-Bus: {}", error))
}

/// Device properties
pub struct DeviceInterface {
    snapshot: DeviceSnapshot,
}

#[interface(name = "io.github.CosmicExtConnect.Device")]
impl DeviceInterface {
    #[zbus(property)]
    fn id(&self) -> String {
        self.snapshot.id.clone()
    }

    #[zbus(property)]
    fn name(&self) -> String {
        self.snapshot.name.clone()
    }

    #[zbus(property)]
    fn device_type(&self) -> String {
        self.snapshot.device_type.as_str().to_string()
    }

    #[zbus(property)]
    fn connected(&self) -> bool {
        self.snapshot.connected
    }

    #[zbus(property)]
    fn paired(&self) -> bool {
        self.snapshot.paired
    }

    /// unpaired, requested, requested_by_peer or paired
    #[zbus(property)]
    fn pairing_state(&self) -> String {
        self.snapshot.pairing_status.as_str().to_string()
    }

    #[zbus(property)]
    fn incoming_capabilities(&self) -> Vec<String> {
        self.snapshot.incoming_capabilities.clone()
    }

    #[zbus(property)]
    fn outgoing_capabilities(&self) -> Vec<String> {
        self.snapshot.outgoing_capabilities.clone()
    }
}

/// Per-device action group
pub struct ActionsInterface {
    device_id: String,
    actions: Vec<ActionState>,
    handle: ManagerHandle,
}

fn action_list(actions: &[ActionState]) -> Vec<(String, bool)> {
    actions
        .iter()
        .map(|action| (action.name.clone(), action.enabled))
        .collect()
}

/// Forward an action to the coordinating loop; `None` for unknown names
async fn run_action(
    handle: &ManagerHandle,
    device_id: &str,
    name: &str,
) -> Option<cosmic_ext_connect_protocol::Result<()>> {
    let result = match name {
        // Also accepts a pending request from the peer
        ACTION_PAIR => handle.request_pairing(device_id).await,
        ACTION_REJECT => handle.pair_device(device_id, false).await,
        ACTION_UNPAIR => handle.unpair_device(device_id).await,
        _ => return None,
    };
    Some(result)
}

#[interface(name = "io.github.CosmicExtConnect.Actions")]
impl ActionsInterface {
    /// Names of all actions
    fn list(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.name.clone()).collect()
    }

    /// Whether an action is currently enabled
    fn describe(&self, name: String) -> zbus::fdo::Result<bool> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.enabled)
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Unknown action: {}", name)))
    }

    async fn activate(&self, name: String) -> zbus::fdo::Result<()> {
        info!("DBus: Activate '{}' on {}", name, self.device_id);

        if !self.describe(name.clone())? {
            return Err(zbus::fdo::Error::Failed(format!(
                "Action '{}' is not available",
                name
            )));
        }

        match run_action(&self.handle, &self.device_id, &name).await {
            Some(result) => result.map_err(failed),
            None => Err(zbus::fdo::Error::NotSupported(format!(
                "Action '{}' has no handler",
                name
            ))),
        }
    }

    /// Emitted with the full action list whenever an action's state changes
    #[zbus(signal)]
    async fn changed(
        signal_emitter: &SignalEmitter<'_>,
        actions: Vec<(String, bool)>,
    ) -> zbus::Result<()>;
}

/// Per-device menu
pub struct MenuInterface {
    items: Vec<MenuItem>,
}

fn menu_items(items: &[MenuItem]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|item| (item.label.clone(), item.action.clone()))
        .collect()
}

#[interface(name = "io.github.CosmicExtConnect.Menu")]
impl MenuInterface {
    /// `(label, action)` pairs of the enabled actions
    fn get_items(&self) -> Vec<(String, String)> {
        menu_items(&self.items)
    }

    #[zbus(signal)]
    async fn changed(
        signal_emitter: &SignalEmitter<'_>,
        items: Vec<(String, String)>,
    ) -> zbus::Result<()>;
}

/// Manager-level calls at the base path
pub struct ManagerInterface {
    device_id: String,
    handle: ManagerHandle,
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
}

impl ManagerInterface {
    pub fn new(
        device_id: impl Into<String>,
        handle: ManagerHandle,
        config: Arc<RwLock<Config>>,
        config_path: PathBuf,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            handle,
            config,
            config_path,
        }
    }
}

/// An empty URI means "announce everywhere"
fn identify_target(uri: String) -> Option<String> {
    let uri = uri.trim();
    (!uri.is_empty()).then(|| uri.to_string())
}

#[interface(name = "io.github.CosmicExtConnect.Manager")]
impl ManagerInterface {
    /// Local device id
    #[zbus(property)]
    fn id(&self) -> String {
        self.device_id.clone()
    }

    /// Connect to `uri`, or re-announce on every service when empty
    async fn identify(&self, uri: String) -> zbus::fdo::Result<()> {
        debug!("DBus: Identify called for '{}'", uri);
        self.handle
            .identify(identify_target(uri))
            .await
            .map_err(failed)
    }

    /// Enable or disable a channel service and store the choice
    async fn set_service_enabled(&self, name: String, enabled: bool) -> zbus::fdo::Result<()> {
        info!("DBus: SetServiceEnabled {} = {}", name, enabled);
        self.handle
            .set_service_enabled(&name, enabled)
            .await
            .map_err(failed)?;

        let mut config = self.config.write().await;
        config.set_service_enabled(&name, enabled);
        config
            .save(&self.config_path)
            .map_err(|e| zbus::fdo::Error::Failed(format!("{:#}", e)))
    }

    /// `(name, enabled, state, uri)` of every channel service
    async fn list_services(&self) -> zbus::fdo::Result<Vec<(String, bool, String, String)>> {
        let services = self.handle.list_services().await.map_err(failed)?;
        Ok(services
            .into_iter()
            .map(|s| {
                (
                    s.name,
                    s.enabled,
                    s.state.as_str().to_string(),
                    s.uri.unwrap_or_default(),
                )
            })
            .collect())
    }
}

/// DBus server for the daemon
pub struct DbusServer {
    connection: Connection,
    base: String,
}

impl DbusServer {
    /// Connect to the session bus and serve the manager at `base`
    pub async fn start(base: &str, manager: ManagerInterface) -> Result<Self> {
        info!("Starting DBus server on {}", SERVICE_NAME);

        let connection = connection::Builder::session()?
            .build()
            .await
            .context("Failed to build DBus connection")?;

        connection
            .object_server()
            .at(base, zbus::fdo::ObjectManager)
            .await
            .context("Failed to serve object manager")?;
        connection
            .object_server()
            .at(base, manager)
            .await
            .context("Failed to serve manager interface")?;

        connection
            .request_name(SERVICE_NAME)
            .await
            .context("Failed to request DBus name")?;

        info!("DBus server started at {}", base);
        Ok(Self {
            connection,
            base: base.to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Export backend publishing device objects on this connection
    pub fn backend(&self, handle: ManagerHandle) -> DbusBackend {
        DbusBackend {
            connection: self.connection.clone(),
            handle,
        }
    }
}

/// [`ExportBackend`] serving device objects on the bus
#[derive(Debug, Clone)]
pub struct DbusBackend {
    connection: Connection,
    handle: ManagerHandle,
}

impl DbusBackend {
    async fn emit_property(
        &self,
        object: &DeviceObject,
        property: DeviceProperty,
    ) -> zbus::Result<()> {
        let iface_ref = self
            .connection
            .object_server()
            .interface::<_, DeviceInterface>(object.path.as_str())
            .await?;
        let emitter = iface_ref.signal_emitter();
        let iface = iface_ref.get().await;

        match property {
            DeviceProperty::Name => iface.name_changed(emitter).await,
            DeviceProperty::DeviceType => iface.device_type_changed(emitter).await,
            DeviceProperty::Connected => iface.connected_changed(emitter).await,
            DeviceProperty::Paired => iface.paired_changed(emitter).await,
            DeviceProperty::PairingState => iface.pairing_state_changed(emitter).await,
            DeviceProperty::Capabilities => {
                iface.incoming_capabilities_changed(emitter).await?;
                iface.outgoing_capabilities_changed(emitter).await
            }
        }
    }
}

#[async_trait]
impl ExportBackend for DbusBackend {
    async fn object_added(&self, object: &DeviceObject) -> cosmic_ext_connect_protocol::Result<()> {
        let server = self.connection.object_server();
        let path = object.path.as_str();

        server
            .at(
                path,
                DeviceInterface {
                    snapshot: object.snapshot.clone(),
                },
            )
            .await
            .map_err(bus_error)?;
        server
            .at(
                path,
                ActionsInterface {
                    device_id: object.snapshot.id.clone(),
                    actions: object.actions.clone(),
                    handle: self.handle.clone(),
                },
            )
            .await
            .map_err(bus_error)?;
        server
            .at(
                path,
                MenuInterface {
                    items: object.menu.clone(),
                },
            )
            .await
            .map_err(bus_error)?;

        debug!("Exported {}", path);
        Ok(())
    }

    async fn object_removed(&self, path: &str) -> cosmic_ext_connect_protocol::Result<()> {
        let server = self.connection.object_server();
        server
            .remove::<MenuInterface, _>(path)
            .await
            .map_err(bus_error)?;
        server
            .remove::<ActionsInterface, _>(path)
            .await
            .map_err(bus_error)?;
        server
            .remove::<DeviceInterface, _>(path)
            .await
            .map_err(bus_error)?;

        debug!("Retracted {}", path);
        Ok(())
    }

    async fn properties_changed(
        &self,
        object: &DeviceObject,
        properties: &[DeviceProperty],
    ) -> cosmic_ext_connect_protocol::Result<()> {
        {
            let iface_ref = self
                .connection
                .object_server()
                .interface::<_, DeviceInterface>(object.path.as_str())
                .await
                .map_err(bus_error)?;
            iface_ref.get_mut().await.snapshot = object.snapshot.clone();
        }

        for property in properties {
            if let Err(e) = self.emit_property(object, *property).await {
                warn!(
                    "Failed to emit {:?} change of {}: {}",
                    property, object.path, e
                );
            }
        }
        Ok(())
    }

    async fn actions_changed(&self, object: &DeviceObject) -> cosmic_ext_connect_protocol::Result<()> {
        let server = self.connection.object_server();
        let path = object.path.as_str();

        let actions = server
            .interface::<_, ActionsInterface>(path)
            .await
            .map_err(bus_error)?;
        actions.get_mut().await.actions = object.actions.clone();
        ActionsInterface::changed(actions.signal_emitter(), action_list(&object.actions))
            .await
            .map_err(bus_error)?;

        let menu = server
            .interface::<_, MenuInterface>(path)
            .await
            .map_err(bus_error)?;
        menu.get_mut().await.items = object.menu.clone();
        MenuInterface::changed(menu.signal_emitter(), menu_items(&object.menu))
            .await
            .map_err(bus_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosmic_ext_connect_protocol::{
        DeviceManager, DeviceType, Identity, LoopbackHub, LoopbackPeer, LoopbackServiceFactory,
        ManagerConfig, MemoryStorage, Packet, PairingStatus,
    };
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_identify_target() {
        assert_eq!(identify_target(String::new()), None);
        assert_eq!(identify_target("  ".to_string()), None);
        assert_eq!(
            identify_target("lan://192.168.1.20:1716".to_string()),
            Some("lan://192.168.1.20:1716".to_string())
        );
    }

    #[test]
    fn test_action_and_menu_encoding() {
        let actions = vec![
            ActionState {
                name: ACTION_PAIR.to_string(),
                enabled: false,
            },
            ActionState {
                name: ACTION_UNPAIR.to_string(),
                enabled: true,
            },
            ActionState {
                name: ACTION_REJECT.to_string(),
                enabled: false,
            },
        ];
        assert_eq!(
            action_list(&actions),
            vec![
                ("pair".to_string(), false),
                ("unpair".to_string(), true),
                ("reject".to_string(), false)
            ]
        );

        let items = vec![MenuItem {
            label: "Unpair".to_string(),
            action: "device.unpair".to_string(),
        }];
        assert_eq!(
            menu_items(&items),
            vec![("Unpair".to_string(), "device.unpair".to_string())]
        );
    }

    async fn pump_until<F>(manager: &mut DeviceManager, done: F)
    where
        F: Fn(&DeviceManager) -> bool,
    {
        while !done(manager) {
            timeout(Duration::from_secs(5), manager.turn())
                .await
                .expect("manager made no progress");
        }
    }

    #[tokio::test]
    async fn test_reject_action_declines_peer_request() {
        let hub = LoopbackHub::new();
        let peer = Identity::generate().unwrap();
        let id = peer.device_id().to_string();
        hub.add_peer(LoopbackPeer::from_identity(&peer, "Phone", DeviceType::Phone));

        let mut manager =
            DeviceManager::new(Arc::new(MemoryStorage::new()), ManagerConfig::default())
                .await
                .unwrap();
        manager.register_service(Arc::new(LoopbackServiceFactory::new(hub.clone())));
        manager.start().await;
        manager.identify(None).await.unwrap();
        pump_until(&mut manager, |m| m.get_device(&id).is_some_and(|d| d.connected)).await;

        hub.send_from_peer(&id, Packet::pair(true)).await.unwrap();
        pump_until(&mut manager, |m| {
            m.get_device(&id)
                .is_some_and(|d| d.pairing_status == PairingStatus::RequestedByPeer)
        })
        .await;

        let handle = manager.handle();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            manager
                .run(async {
                    let _ = stop_rx.await;
                })
                .await;
        });

        assert!(run_action(&handle, &id, "explode").await.is_none());
        assert!(handle
            .identify(identify_target("bluetooth://phone".to_string()))
            .await
            .is_err());
        run_action(&handle, &id, ACTION_REJECT)
            .await
            .expect("known action")
            .unwrap();
        assert!(handle.get_devices().await.unwrap().is_empty());

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_errors_carry_user_message() {
        match failed(ProtocolError::NotPaired) {
            zbus::fdo::Error::Failed(message) => assert_eq!(message, "Device not paired. Please pair the device first."),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
