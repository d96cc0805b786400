//! Persistence collaborator
//!
//! The device manager persists paired device records and the local identity
//! through the [`Storage`] trait. [`FileStorage`] keeps everything under one
//! directory:
//!
//! ```text
//! <root>/certificate.pem
//! <root>/private.pem
//! <root>/devices/<device-id>.json
//! ```

use crate::{DeviceType, ProtocolError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, info, warn};

const CERTIFICATE_FILE: &str = "certificate.pem";
const PRIVATE_KEY_FILE: &str = "private.pem";
const DEVICES_DIR: &str = "devices";

/// Persisted view of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub paired: bool,
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,
    /// Base64 DER certificate pinned when the device was paired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// UNIX timestamp (seconds) of the last connection
    #[serde(default)]
    pub last_seen: i64,
}

impl DeviceRecord {
    /// Decode the pinned certificate, if any
    pub fn certificate_der(&self) -> Option<Vec<u8>> {
        let encoded = self.certificate.as_ref()?;
        match BASE64.decode(encoded) {
            Ok(der) => Some(der),
            Err(e) => {
                warn!("Ignoring undecodable certificate for {}: {}", self.id, e);
                None
            }
        }
    }

    pub fn encode_certificate(der: &[u8]) -> String {
        BASE64.encode(der)
    }
}

/// PEM-encoded local identity
#[derive(Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

impl fmt::Debug for StoredIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredIdentity").finish_non_exhaustive()
    }
}

/// Load/save contract used by the device manager
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Every readable device record; unreadable records are skipped
    async fn load_all_devices(&self) -> Result<Vec<DeviceRecord>>;

    async fn save_device(&self, record: &DeviceRecord) -> Result<()>;

    /// Deleting an unknown id is not an error
    async fn delete_device(&self, id: &str) -> Result<()>;

    async fn load_identity(&self) -> Result<Option<StoredIdentity>>;

    async fn save_identity(&self, identity: &StoredIdentity) -> Result<()>;
}

/// Directory-backed storage
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join(DEVICES_DIR)
    }

    fn device_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ProtocolError::Storage(format!(
                "Refusing to store device with id '{}'",
                id
            )));
        }
        Ok(self.devices_dir().join(format!("{}.json", id)))
    }

    async fn read_record(path: &Path) -> Result<DeviceRecord> {
        let data = fs::read(path).await?;
        let record: DeviceRecord = serde_json::from_slice(&data)?;
        Ok(record)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load_all_devices(&self) -> Result<Vec<DeviceRecord>> {
        let dir = self.devices_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No device records at {:?}", dir);
                return Ok(Vec::new());
            }
            Err(e) => return Err(ProtocolError::from_io_error(e, "reading device records")),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match Self::read_record(&path).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable device record {:?}: {}", path, e),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        info!("Loaded {} device records from {:?}", records.len(), dir);
        Ok(records)
    }

    async fn save_device(&self, record: &DeviceRecord) -> Result<()> {
        let path = self.device_path(&record.id)?;
        fs::create_dir_all(self.devices_dir()).await?;

        let json = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Saved device record {:?}", path);
        Ok(())
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let path = self.device_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted device record {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_identity(&self) -> Result<Option<StoredIdentity>> {
        let cert_path = self.root.join(CERTIFICATE_FILE);
        let key_path = self.root.join(PRIVATE_KEY_FILE);

        let certificate_pem = match fs::read(&cert_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let private_key_pem = fs::read(&key_path).await.map_err(|e| {
            ProtocolError::Storage(format!(
                "Certificate present but private key unreadable at {:?}: {}",
                key_path, e
            ))
        })?;

        Ok(Some(StoredIdentity {
            certificate_pem,
            private_key_pem,
        }))
    }

    async fn save_identity(&self, identity: &StoredIdentity) -> Result<()> {
        fs::create_dir_all(&self.root).await?;

        let key_path = self.root.join(PRIVATE_KEY_FILE);
        fs::write(&key_path, &identity.private_key_pem).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        fs::write(self.root.join(CERTIFICATE_FILE), &identity.certificate_pem).await?;

        info!("Saved identity to {:?}", self.root);
        Ok(())
    }
}

/// In-process storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    devices: Mutex<BTreeMap<String, DeviceRecord>>,
    identity: Mutex<Option<StoredIdentity>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ProtocolError {
        ProtocolError::Storage("memory storage lock poisoned".to_string())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_all_devices(&self) -> Result<Vec<DeviceRecord>> {
        let devices = self.devices.lock().map_err(|_| Self::poisoned())?;
        Ok(devices.values().cloned().collect())
    }

    async fn save_device(&self, record: &DeviceRecord) -> Result<()> {
        let mut devices = self.devices.lock().map_err(|_| Self::poisoned())?;
        devices.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let mut devices = self.devices.lock().map_err(|_| Self::poisoned())?;
        devices.remove(id);
        Ok(())
    }

    async fn load_identity(&self) -> Result<Option<StoredIdentity>> {
        let identity = self.identity.lock().map_err(|_| Self::poisoned())?;
        Ok(identity.clone())
    }

    async fn save_identity(&self, identity: &StoredIdentity) -> Result<()> {
        let mut stored = self.identity.lock().map_err(|_| Self::poisoned())?;
        *stored = Some(identity.clone());
        Ok(())
    }
}
