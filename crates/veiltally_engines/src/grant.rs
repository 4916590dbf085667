#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use veiltally_contracts::grant::{DecryptionGrant, GRANT_VALIDITY_DAYS};
use veiltally_contracts::{AccountAddress, UnixTimeMs};

use crate::key_store::atomic_write;
use crate::session::{hex_of, EngineSession, StructuredSigner};

const GRANT_CACHE_SCHEMA_VERSION: u8 = 1;

/// Grant cache seam. Write failures are non-fatal; absence of an entry means
/// "go back through the signer", never an error.
pub trait GrantCache: Send + Sync {
    fn load(&self, key: &str) -> Option<DecryptionGrant>;
    fn store(&self, key: &str, grant: &DecryptionGrant) -> Result<(), std::io::Error>;
}

#[derive(Default)]
pub struct MemoryGrantCache {
    entries: Mutex<BTreeMap<String, DecryptionGrant>>,
}

impl GrantCache for MemoryGrantCache {
    fn load(&self, key: &str) -> Option<DecryptionGrant> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn store(&self, key: &str, grant: &DecryptionGrant) -> Result<(), std::io::Error> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), grant.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct GrantCacheDocument {
    schema_version: u8,
    entries: BTreeMap<String, DecryptionGrant>,
}

/// Grant cache on disk. Holds ephemeral secret keys, so the document is
/// written atomically and tightened to owner-only permissions.
#[derive(Debug, Clone)]
pub struct FileGrantCache {
    path: PathBuf,
}

impl FileGrantCache {
    pub fn for_path(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_document(&self) -> Option<GrantCacheDocument> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let doc = serde_json::from_str::<GrantCacheDocument>(&raw).ok()?;
        if doc.schema_version != GRANT_CACHE_SCHEMA_VERSION {
            return None;
        }
        Some(doc)
    }
}

impl GrantCache for FileGrantCache {
    fn load(&self, key: &str) -> Option<DecryptionGrant> {
        self.read_document()?.entries.get(key).cloned()
    }

    fn store(&self, key: &str, grant: &DecryptionGrant) -> Result<(), std::io::Error> {
        let mut doc = self.read_document().unwrap_or_default();
        doc.schema_version = GRANT_CACHE_SCHEMA_VERSION;
        doc.entries.insert(key.to_string(), grant.clone());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_vec_pretty(&doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        atomic_write(&self.path, &serialized)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        restrict_permissions(&self.path);
        Ok(())
    }
}

fn restrict_permissions(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Cache key binds who is asking, what they may open, and which engine key
/// the session runs under. Any of the three changing means a fresh grant.
pub fn grant_cache_key(
    grantee: &AccountAddress,
    contracts: &[AccountAddress],
    engine_key_fingerprint: &[u8; 32],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(grantee.as_str().as_bytes());
    hasher.update([0u8]);
    for contract in contracts {
        hasher.update(contract.as_str().as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(engine_key_fingerprint);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Obtain a decryption authorization for `contracts`, reusing a cached one
/// when still inside its window. `None` means no authorization is currently
/// available (signer declined or failed) — recoverable, never cached.
pub fn obtain(
    session: &EngineSession,
    contracts: &[AccountAddress],
    signer: &dyn StructuredSigner,
    cache: &dyn GrantCache,
    now: UnixTimeMs,
) -> Option<DecryptionGrant> {
    if contracts.is_empty() {
        return None;
    }
    let mut sorted: Vec<AccountAddress> = contracts.to_vec();
    sorted.sort();
    sorted.dedup();

    let grantee = signer.address();
    let fingerprint = session.public_key_fingerprint();
    let key = grant_cache_key(&grantee, &sorted, &fingerprint);

    if let Some(cached) = cache.load(&key) {
        if cached.is_valid_at(now) {
            return Some(cached);
        }
    }

    let mut secret_key = vec![0u8; 32];
    OsRng.fill_bytes(&mut secret_key);
    let mut hasher = Sha256::new();
    hasher.update(&secret_key);
    let public_key: [u8; 32] = hasher.finalize().into();
    let public_key = public_key.to_vec();

    let payload = session.decrypt_request_payload(
        hex_of(&public_key),
        &sorted,
        now,
        GRANT_VALIDITY_DAYS,
    );
    // The signer may sit on this arbitrarily long (external approval).
    // Rejection and failure are the same outcome here.
    let signature = signer.sign_decrypt_request(&payload).ok()?;

    let grant = DecryptionGrant {
        grantee,
        public_key,
        secret_key,
        contracts: sorted,
        issued_at: now,
        validity_days: GRANT_VALIDITY_DAYS,
        signature,
    };
    let _ = cache.store(&key, &grant);
    Some(grant)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use veiltally_contracts::cipher::{EnginePublicKey, HexSignature, PublicParams};
    use veiltally_contracts::grant::DecryptRequestPayload;
    use veiltally_contracts::{ChainId, SignerError, Validate};

    use super::*;
    use crate::emulated::EmulatedEngineProvider;
    use crate::network::NetworkClass;
    use crate::session::SessionMaterial;

    fn addr(n: u8) -> AccountAddress {
        AccountAddress::new(format!("0x{:040x}", u64::from(n))).unwrap()
    }

    fn session() -> EngineSession {
        EngineSession::new(
            NetworkClass::Emulated {
                chain_id: ChainId(31337),
                endpoint: "http://127.0.0.1:8545".to_string(),
            },
            SessionMaterial {
                public_key: EnginePublicKey(vec![9, 9, 9]),
                public_params: PublicParams(vec![2]),
            },
            addr(0xa1),
            addr(0xa2),
            Arc::new(EmulatedEngineProvider::new()),
        )
    }

    struct CountingSigner {
        calls: AtomicU32,
        reject: bool,
    }

    impl CountingSigner {
        fn approving() -> Self {
            Self {
                calls: AtomicU32::new(0),
                reject: false,
            }
        }
    }

    impl StructuredSigner for CountingSigner {
        fn address(&self) -> AccountAddress {
            addr(0x11)
        }

        fn sign_decrypt_request(
            &self,
            payload: &DecryptRequestPayload,
        ) -> Result<HexSignature, SignerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(SignerError::Rejected);
            }
            assert_eq!(payload.primary_type, "UserDecryptRequestVerification");
            HexSignature::new("0xfeedface").map_err(|_| SignerError::Failed("hex".to_string()))
        }
    }

    #[test]
    fn at_grantmgr_01_fresh_grant_is_valid_and_sorted() {
        let cache = MemoryGrantCache::default();
        let signer = CountingSigner::approving();
        let grant = obtain(
            &session(),
            &[addr(3), addr(2), addr(3)],
            &signer,
            &cache,
            UnixTimeMs(10),
        )
        .unwrap();
        assert!(grant.validate().is_ok());
        assert_eq!(grant.contracts, vec![addr(2), addr(3)]);
        assert!(grant.is_valid_at(UnixTimeMs(10)));
        assert!(!grant.is_valid_at(UnixTimeMs(10).plus_days(365)));
    }

    #[test]
    fn at_grantmgr_02_cache_hit_skips_the_signer() {
        let cache = MemoryGrantCache::default();
        let signer = CountingSigner::approving();
        let s = session();
        let first = obtain(&s, &[addr(2)], &signer, &cache, UnixTimeMs(10)).unwrap();
        let second = obtain(&s, &[addr(2)], &signer, &cache, UnixTimeMs(20)).unwrap();
        assert_eq!(first, second);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_grantmgr_03_expired_cache_entry_re_signs() {
        let cache = MemoryGrantCache::default();
        let signer = CountingSigner::approving();
        let s = session();
        obtain(&s, &[addr(2)], &signer, &cache, UnixTimeMs(10)).unwrap();
        let later = UnixTimeMs(10).plus_days(366);
        let renewed = obtain(&s, &[addr(2)], &signer, &cache, later).unwrap();
        assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
        assert!(renewed.is_valid_at(later));
    }

    #[test]
    fn at_grantmgr_04_signer_rejection_yields_none_and_caches_nothing() {
        let cache = MemoryGrantCache::default();
        let signer = CountingSigner {
            calls: AtomicU32::new(0),
            reject: true,
        };
        let s = session();
        assert!(obtain(&s, &[addr(2)], &signer, &cache, UnixTimeMs(10)).is_none());
        // A later attempt with a working signer is not poisoned by the miss.
        let ok_signer = CountingSigner::approving();
        assert!(obtain(&s, &[addr(2)], &ok_signer, &cache, UnixTimeMs(11)).is_some());
    }

    #[test]
    fn at_grantmgr_05_cache_key_varies_with_all_inputs() {
        let fp_a = [1u8; 32];
        let fp_b = [2u8; 32];
        let base = grant_cache_key(&addr(1), &[addr(2), addr(3)], &fp_a);
        assert_ne!(base, grant_cache_key(&addr(9), &[addr(2), addr(3)], &fp_a));
        assert_ne!(base, grant_cache_key(&addr(1), &[addr(2)], &fp_a));
        assert_ne!(base, grant_cache_key(&addr(1), &[addr(2), addr(3)], &fp_b));
        assert_eq!(base, grant_cache_key(&addr(1), &[addr(2), addr(3)], &fp_a));
    }

    #[test]
    fn at_grantmgr_06_file_cache_roundtrip() {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        let path = std::env::temp_dir().join(format!("veiltally-grants-{suffix}.json"));
        let cache = FileGrantCache::for_path(path.clone());
        let signer = CountingSigner::approving();
        let s = session();
        let grant = obtain(&s, &[addr(2)], &signer, &cache, UnixTimeMs(10)).unwrap();
        let reloaded = obtain(&s, &[addr(2)], &signer, &cache, UnixTimeMs(20)).unwrap();
        assert_eq!(grant, reloaded);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
        fs::remove_file(path).unwrap();
    }
}
