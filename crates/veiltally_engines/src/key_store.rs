#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use veiltally_contracts::cipher::{EnginePublicKey, PublicParams};
use veiltally_contracts::AccountAddress;

use crate::session::SessionMaterial;

const KEY_STORE_SCHEMA_VERSION: u8 = 1;

#[derive(Debug)]
pub enum KeyStoreError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "key store io error: {err}"),
            Self::Json(err) => write!(f, "key store json error: {err}"),
        }
    }
}

impl std::error::Error for KeyStoreError {}

impl From<std::io::Error> for KeyStoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for KeyStoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Read-through cache for public key/parameter material, keyed by the
/// access-registry address. A miss or a store failure is never fatal; it
/// only costs the caller one extra network round trip.
pub trait KeyStore: Send + Sync {
    fn load(&self, registry: &AccountAddress) -> Option<SessionMaterial>;
    fn store(&self, registry: &AccountAddress, material: &SessionMaterial)
        -> Result<(), KeyStoreError>;
}

#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<BTreeMap<String, SessionMaterial>>,
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, registry: &AccountAddress) -> Option<SessionMaterial> {
        self.entries
            .lock()
            .ok()?
            .get(registry.as_str())
            .cloned()
    }

    fn store(
        &self,
        registry: &AccountAddress,
        material: &SessionMaterial,
    ) -> Result<(), KeyStoreError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(registry.as_str().to_string(), material.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct KeyStoreDocument {
    schema_version: u8,
    entries: BTreeMap<String, KeyStoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyStoreEntry {
    public_key_b64: String,
    public_params_b64: String,
}

/// JSON key/parameter cache on disk. Reads degrade to a miss on any error;
/// only the material is public so the document is not encrypted.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn for_path(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_document(&self) -> Option<KeyStoreDocument> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let doc = serde_json::from_str::<KeyStoreDocument>(&raw).ok()?;
        if doc.schema_version != KEY_STORE_SCHEMA_VERSION {
            return None;
        }
        Some(doc)
    }

    fn write_document(&self, doc: &KeyStoreDocument) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_vec_pretty(doc)?;
        atomic_write(&self.path, &serialized)
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self, registry: &AccountAddress) -> Option<SessionMaterial> {
        let doc = self.read_document()?;
        let entry = doc.entries.get(registry.as_str())?;
        let public_key = BASE64.decode(entry.public_key_b64.as_bytes()).ok()?;
        let public_params = BASE64.decode(entry.public_params_b64.as_bytes()).ok()?;
        Some(SessionMaterial {
            public_key: EnginePublicKey(public_key),
            public_params: PublicParams(public_params),
        })
    }

    fn store(
        &self,
        registry: &AccountAddress,
        material: &SessionMaterial,
    ) -> Result<(), KeyStoreError> {
        let mut doc = self.read_document().unwrap_or_default();
        doc.schema_version = KEY_STORE_SCHEMA_VERSION;
        doc.entries.insert(
            registry.as_str().to_string(),
            KeyStoreEntry {
                public_key_b64: BASE64.encode(&material.public_key.0),
                public_params_b64: BASE64.encode(&material.public_params.0),
            },
        );
        self.write_document(&doc)
    }
}

pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), KeyStoreError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}
