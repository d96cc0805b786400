//! Local identity and peer certificate verification
//!
//! Every installation owns one self-signed certificate. The device id is
//! derived from it and never stored separately, so a peer cannot claim an id
//! without also presenting the certificate that hashes to it.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: ECDSA P-256, SHA-256 signature
//! - **Organization (O)**: "COSMIC"
//! - **Organizational Unit (OU)**: "Cosmic Connect"
//! - **Common Name (CN)**: random UUID
//! - **Validity**: 10 years
//!
//! Pairing trust is tracked by [`crate::Device`]; this module only
//! establishes cryptographic identity.

use crate::storage::{Storage, StoredIdentity};
use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

const CERT_VALIDITY_DAYS: u32 = 10 * 365;

const CERT_ORG: &str = "COSMIC";

const CERT_ORG_UNIT: &str = "Cosmic Connect";

/// The local device's cryptographic identity
#[derive(Clone)]
pub struct Identity {
    /// Fingerprint of `certificate`, see [`device_id_of`]
    device_id: String,

    /// DER-encoded certificate
    certificate: Vec<u8>,

    /// DER-encoded private key
    private_key: Vec<u8>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a fresh self-signed identity
    pub fn generate() -> Result<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let pkey = PKey::from_ec_key(EcKey::generate(&group)?)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &Uuid::new_v4().simple().to_string())?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&pkey)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let certificate = builder.build().to_der()?;

        let identity = Self {
            device_id: device_id_of(&certificate),
            certificate,
            private_key: pkey.private_key_to_der()?,
        };

        info!("Generated new identity {}", identity.device_id);
        Ok(identity)
    }

    /// Rebuild an identity from its persisted PEM form
    pub fn from_stored(stored: &StoredIdentity) -> Result<Self> {
        let certificate = X509::from_pem(&stored.certificate_pem)
            .map_err(|e| ProtocolError::Storage(format!("Invalid stored certificate: {}", e)))?
            .to_der()?;
        let private_key = PKey::private_key_from_pem(&stored.private_key_pem)
            .map_err(|e| ProtocolError::Storage(format!("Invalid stored private key: {}", e)))?
            .private_key_to_der()?;

        Ok(Self {
            device_id: device_id_of(&certificate),
            certificate,
            private_key,
        })
    }

    /// Encode for persistence
    pub fn to_stored(&self) -> Result<StoredIdentity> {
        Ok(StoredIdentity {
            certificate_pem: X509::from_der(&self.certificate)?.to_pem()?,
            private_key_pem: PKey::private_key_from_der(&self.private_key)?
                .private_key_to_pem_pkcs8()?,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// DER-encoded certificate
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// DER-encoded private key
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Human readable fingerprint for out-of-band verification
    pub fn fingerprint(&self) -> String {
        display_fingerprint(&self.certificate)
    }
}

/// Load the persisted identity, or create and persist a new one
///
/// A persisted identity that cannot be parsed is an error. It is never
/// replaced silently because every paired peer has pinned it.
pub async fn get_or_create_identity(storage: &dyn Storage) -> Result<Identity> {
    if let Some(stored) = storage.load_identity().await? {
        let identity = Identity::from_stored(&stored)?;
        debug!("Loaded identity {}", identity.device_id());
        return Ok(identity);
    }

    let identity = tokio::task::spawn_blocking(Identity::generate)
        .await
        .map_err(|e| ProtocolError::Cancelled(format!("identity generation: {}", e)))??;
    storage.save_identity(&identity.to_stored()?).await?;

    Ok(identity)
}

/// Device id of the holder of `certificate` (DER)
///
/// Lower-case hex SHA-256 of the encoded certificate.
pub fn device_id_of(certificate: &[u8]) -> String {
    hex::encode(Sha256::digest(certificate))
}

/// Check that `certificate` (DER) really belongs to `claimed_id`
///
/// Ids are registry keys, so only the exact lower-case form is accepted.
pub fn verify_peer(certificate: &[u8], claimed_id: &str) -> bool {
    !certificate.is_empty() && device_id_of(certificate) == claimed_id
}

/// SHA-256 fingerprint as colon-separated upper-case hex
pub fn display_fingerprint(certificate: &[u8]) -> String {
    Sha256::digest(certificate)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
