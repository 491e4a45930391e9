//! Key custody: the signing oracle every other component signs through.

use crate::*;
use aes_gcm::aead::{generic_array::GenericArray, Aead, NewAead};
use aes_gcm::Aes256Gcm;
use ed25519_dalek::{Keypair, Signature, Signer};
use parking_lot::RwLock;
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;

pub const BULLETIN_BOARD_KEY: &str = "bulletin_board_key";
pub const AUDIT_LOG_KEY: &str = "audit_log_key";
pub const HEALTH_CHECK_KEY: &str = "hsm_health_key";

const AES_NONCE_LENGTH: usize = 12;
const VERSION_LENGTH: usize = 4;

/// A holder of asymmetric keys and sealed secrets.
///
/// Signatures returned by `sign` are opaque to callers and must be checked with
/// `verify` on the same custody instance.
pub trait KeyCustody: Send + Sync {
    fn sign(&self, key_id: &str, bytes: &[u8]) -> Result<Vec<u8>, CustodyError>;

    fn verify(&self, key_id: &str, bytes: &[u8], signature: &[u8]) -> Result<bool, CustodyError>;

    /// Make a fresh key version current. Older signatures keep verifying.
    fn rotate(&self, key_id: &str) -> Result<(), CustodyError>;

    fn store_secret(&self, id: &str, bytes: &[u8]) -> Result<(), CustodyError>;

    fn retrieve_secret(&self, id: &str) -> Result<Option<Vec<u8>>, CustodyError>;

    fn key_ids(&self) -> Vec<String>;

    fn health_check(&self) -> bool {
        let probe = format!("health probe {}", uuid::Uuid::new_v4());
        match self.sign(HEALTH_CHECK_KEY, probe.as_bytes()) {
            Ok(signature) => self
                .verify(HEALTH_CHECK_KEY, probe.as_bytes(), &signature)
                .unwrap_or(false),
            Err(e) => {
                tracing::error!("key custody health check failed: {}", e);
                false
            }
        }
    }
}

/// Which custody implementation to run with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodyProvider {
    Software,
    Device,
}

impl CustodyProvider {
    pub fn from_name(name: &str) -> Result<Self, CustodyError> {
        if name.eq_ignore_ascii_case("software") {
            return Ok(CustodyProvider::Software);
        }
        if name.eq_ignore_ascii_case("device") {
            return Ok(CustodyProvider::Device);
        }
        Err(CustodyError::UnknownProvider(name.to_owned()))
    }

    pub fn build(self) -> Arc<dyn KeyCustody> {
        match self {
            CustodyProvider::Software => Arc::new(SoftwareCustody::new()),
            CustodyProvider::Device => {
                tracing::warn!("no hardware signing driver configured, using the emulated device");
                Arc::new(DeviceCustody::new(EmulatedDevice::new()))
            }
        }
    }
}

fn encode_versioned(version: u32, signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERSION_LENGTH + signature.len());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(signature);
    out
}

fn split_versioned(signature: &[u8]) -> Option<(u32, &[u8])> {
    if signature.len() <= VERSION_LENGTH {
        return None;
    }
    let mut version = [0u8; VERSION_LENGTH];
    version.copy_from_slice(&signature[..VERSION_LENGTH]);
    Some((u32::from_be_bytes(version), &signature[VERSION_LENGTH..]))
}

fn verify_ed25519(keypair: &Keypair, bytes: &[u8], signature: &[u8]) -> bool {
    match Signature::try_from(signature) {
        Ok(signature) => keypair.public.verify_strict(bytes, &signature).is_ok(),
        Err(_) => false,
    }
}

/// AES-256-GCM sealing under a per-process key. Output is nonce || ciphertext.
struct Sealer {
    key: [u8; 32],
}

impl Sealer {
    fn new() -> Self {
        let mut key = [0u8; 32];
        thread_rng().fill(&mut key);
        Sealer { key }
    }

    fn seal(&self, id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CustodyError> {
        let aead = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let mut nonce = [0u8; AES_NONCE_LENGTH];
        thread_rng().fill(&mut nonce);

        let encrypted = aead
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| CustodyError::Sealing(id.to_owned()))?;

        let mut output = Vec::with_capacity(AES_NONCE_LENGTH + encrypted.len());
        output.extend_from_slice(&nonce);
        output.extend(encrypted);
        Ok(output)
    }

    fn open(&self, id: &str, sealed: &[u8]) -> Result<Vec<u8>, CustodyError> {
        if sealed.len() < AES_NONCE_LENGTH {
            return Err(CustodyError::Sealing(id.to_owned()));
        }
        let aead = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let nonce = GenericArray::from_slice(&sealed[..AES_NONCE_LENGTH]);
        aead.decrypt(nonce, &sealed[AES_NONCE_LENGTH..])
            .map_err(|_| CustodyError::Sealing(id.to_owned()))
    }
}

/// In-memory custody backed by versioned ed25519 key rings.
pub struct SoftwareCustody {
    keys: RwLock<HashMap<String, Vec<Keypair>>>,
    secrets: RwLock<HashMap<String, Vec<u8>>>,
    sealer: Sealer,
}

impl SoftwareCustody {
    pub fn new() -> Self {
        SoftwareCustody {
            keys: RwLock::new(HashMap::new()),
            secrets: RwLock::new(HashMap::new()),
            sealer: Sealer::new(),
        }
    }
}

impl Default for SoftwareCustody {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCustody for SoftwareCustody {
    fn sign(&self, key_id: &str, bytes: &[u8]) -> Result<Vec<u8>, CustodyError> {
        let mut keys = self.keys.write();
        let ring = keys.entry(key_id.to_owned()).or_insert_with(|| {
            tracing::info!("provisioning signing key {}", key_id);
            vec![generate_keypair()]
        });
        let version = ring.len() - 1;
        let signature = ring[version].sign(bytes);
        Ok(encode_versioned(version as u32, &signature.to_bytes()))
    }

    fn verify(&self, key_id: &str, bytes: &[u8], signature: &[u8]) -> Result<bool, CustodyError> {
        let keys = self.keys.read();
        let ring = keys
            .get(key_id)
            .ok_or_else(|| CustodyError::KeyNotFound(key_id.to_owned()))?;
        let (version, signature) = match split_versioned(signature) {
            Some(parts) => parts,
            None => return Ok(false),
        };
        match ring.get(version as usize) {
            Some(keypair) => Ok(verify_ed25519(keypair, bytes, signature)),
            None => Ok(false),
        }
    }

    fn rotate(&self, key_id: &str) -> Result<(), CustodyError> {
        let mut keys = self.keys.write();
        let ring = keys
            .get_mut(key_id)
            .ok_or_else(|| CustodyError::KeyNotFound(key_id.to_owned()))?;
        ring.push(generate_keypair());
        tracing::info!("rotated key {} to version {}", key_id, ring.len() - 1);
        Ok(())
    }

    fn store_secret(&self, id: &str, bytes: &[u8]) -> Result<(), CustodyError> {
        let sealed = self.sealer.seal(id, bytes)?;
        self.secrets.write().insert(id.to_owned(), sealed);
        Ok(())
    }

    fn retrieve_secret(&self, id: &str) -> Result<Option<Vec<u8>>, CustodyError> {
        match self.secrets.read().get(id) {
            Some(sealed) => self.sealer.open(id, sealed).map(Some),
            None => Ok(None),
        }
    }

    fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Driver interface for a hardware signing device.
///
/// Devices address keys by slot; mapping key ids and versions onto slots is the
/// job of [`DeviceCustody`].
pub trait SigningDevice: Send + Sync {
    fn generate_key(&self) -> Result<u64, CustodyError>;

    fn sign(&self, slot: u64, bytes: &[u8]) -> Result<Vec<u8>, CustodyError>;

    fn verify(&self, slot: u64, bytes: &[u8], signature: &[u8]) -> Result<bool, CustodyError>;

    fn wrap_secret(&self, plaintext: &[u8]) -> Result<Vec<u8>, CustodyError>;

    fn unwrap_secret(&self, wrapped: &[u8]) -> Result<Vec<u8>, CustodyError>;
}

pub struct DeviceCustody<D: SigningDevice> {
    device: D,
    slots: RwLock<HashMap<String, Vec<u64>>>,
    wrapped: RwLock<HashMap<String, Vec<u8>>>,
}

impl<D: SigningDevice> DeviceCustody<D> {
    pub fn new(device: D) -> Self {
        DeviceCustody {
            device,
            slots: RwLock::new(HashMap::new()),
            wrapped: RwLock::new(HashMap::new()),
        }
    }

    fn current_slot(&self, key_id: &str) -> Result<(u32, u64), CustodyError> {
        if let Some(slots) = self.slots.read().get(key_id) {
            if let Some(slot) = slots.last() {
                return Ok(((slots.len() - 1) as u32, *slot));
            }
        }

        let mut slots = self.slots.write();
        let versions = slots.entry(key_id.to_owned()).or_insert_with(Vec::new);
        if versions.is_empty() {
            tracing::info!("provisioning device key {}", key_id);
            versions.push(self.device.generate_key()?);
        }
        Ok(((versions.len() - 1) as u32, versions[versions.len() - 1]))
    }
}

impl<D: SigningDevice> KeyCustody for DeviceCustody<D> {
    fn sign(&self, key_id: &str, bytes: &[u8]) -> Result<Vec<u8>, CustodyError> {
        let (version, slot) = self.current_slot(key_id)?;
        let signature = self.device.sign(slot, bytes)?;
        Ok(encode_versioned(version, &signature))
    }

    fn verify(&self, key_id: &str, bytes: &[u8], signature: &[u8]) -> Result<bool, CustodyError> {
        let slot = {
            let slots = self.slots.read();
            let versions = slots
                .get(key_id)
                .ok_or_else(|| CustodyError::KeyNotFound(key_id.to_owned()))?;
            match split_versioned(signature) {
                Some((version, _)) => versions.get(version as usize).copied(),
                None => None,
            }
        };
        match (slot, split_versioned(signature)) {
            (Some(slot), Some((_, signature))) => self.device.verify(slot, bytes, signature),
            _ => Ok(false),
        }
    }

    fn rotate(&self, key_id: &str) -> Result<(), CustodyError> {
        let mut slots = self.slots.write();
        let versions = slots
            .get_mut(key_id)
            .ok_or_else(|| CustodyError::KeyNotFound(key_id.to_owned()))?;
        versions.push(self.device.generate_key()?);
        tracing::info!("rotated device key {} to version {}", key_id, versions.len() - 1);
        Ok(())
    }

    fn store_secret(&self, id: &str, bytes: &[u8]) -> Result<(), CustodyError> {
        let wrapped = self.device.wrap_secret(bytes)?;
        self.wrapped.write().insert(id.to_owned(), wrapped);
        Ok(())
    }

    fn retrieve_secret(&self, id: &str) -> Result<Option<Vec<u8>>, CustodyError> {
        match self.wrapped.read().get(id) {
            Some(wrapped) => self.device.unwrap_secret(wrapped).map(Some),
            None => Ok(None),
        }
    }

    fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// A signing device emulated in process memory
pub struct EmulatedDevice {
    slots: RwLock<Vec<Keypair>>,
    sealer: Sealer,
}

impl EmulatedDevice {
    pub fn new() -> Self {
        EmulatedDevice {
            slots: RwLock::new(Vec::new()),
            sealer: Sealer::new(),
        }
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningDevice for EmulatedDevice {
    fn generate_key(&self) -> Result<u64, CustodyError> {
        let mut slots = self.slots.write();
        slots.push(generate_keypair());
        Ok((slots.len() - 1) as u64)
    }

    fn sign(&self, slot: u64, bytes: &[u8]) -> Result<Vec<u8>, CustodyError> {
        let slots = self.slots.read();
        let keypair = slots
            .get(slot as usize)
            .ok_or_else(|| CustodyError::DeviceUnavailable(format!("empty slot {}", slot)))?;
        Ok(keypair.sign(bytes).to_bytes().to_vec())
    }

    fn verify(&self, slot: u64, bytes: &[u8], signature: &[u8]) -> Result<bool, CustodyError> {
        let slots = self.slots.read();
        let keypair = slots
            .get(slot as usize)
            .ok_or_else(|| CustodyError::DeviceUnavailable(format!("empty slot {}", slot)))?;
        Ok(verify_ed25519(keypair, bytes, signature))
    }

    fn wrap_secret(&self, plaintext: &[u8]) -> Result<Vec<u8>, CustodyError> {
        self.sealer.seal("device", plaintext)
    }

    fn unwrap_secret(&self, wrapped: &[u8]) -> Result<Vec<u8>, CustodyError> {
        self.sealer.open("device", wrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(custody: &dyn KeyCustody) {
        let message = b"entry hash";
        let signature = custody.sign("record_key", message).unwrap();
        assert!(custody.verify("record_key", message, &signature).unwrap());
        assert!(!custody.verify("record_key", b"other", &signature).unwrap());

        // Old signatures survive rotation, new ones use the new version
        custody.rotate("record_key").unwrap();
        assert!(custody.verify("record_key", message, &signature).unwrap());
        let rotated = custody.sign("record_key", message).unwrap();
        assert_ne!(rotated[..VERSION_LENGTH], signature[..VERSION_LENGTH]);
        assert!(custody.verify("record_key", message, &rotated).unwrap());

        let mut tampered = rotated.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(!custody.verify("record_key", message, &tampered).unwrap());

        assert!(custody.verify("missing_key", message, &signature).is_err());
        assert!(custody.rotate("missing_key").is_err());

        custody.store_secret("secret", b"lambda").unwrap();
        assert_eq!(custody.retrieve_secret("secret").unwrap().unwrap(), b"lambda");
        assert_eq!(custody.retrieve_secret("absent").unwrap(), None);

        assert!(custody.health_check());
        assert!(custody.key_ids().contains(&"record_key".to_owned()));
    }

    #[test]
    fn test_software_custody() {
        exercise(&SoftwareCustody::new());
    }

    #[test]
    fn test_device_custody() {
        exercise(&DeviceCustody::new(EmulatedDevice::new()));
    }

    #[test]
    fn test_sealed_secrets_are_encrypted() {
        let custody = SoftwareCustody::new();
        custody.store_secret("s", b"plaintext secret").unwrap();
        let sealed = custody.secrets.read().get("s").cloned().unwrap();
        assert!(!sealed.windows(16).any(|w| w == b"plaintext secret"));
    }

    #[test]
    fn test_provider_from_name() {
        assert_eq!(
            CustodyProvider::from_name("Software").unwrap(),
            CustodyProvider::Software
        );
        assert_eq!(
            CustodyProvider::from_name("device").unwrap(),
            CustodyProvider::Device
        );
        assert!(CustodyProvider::from_name("cloud").is_err());
        assert!(CustodyProvider::Device.build().health_check());
    }
}
