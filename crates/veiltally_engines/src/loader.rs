#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use veiltally_contracts::EngineError;

use crate::session::EngineProvider;

/// One fixed, versioned distribution endpoint for the engine module.
pub const ENGINE_DIST_URL: &str = "https://dist.veiltally.dev/engine/v1/module.json";
pub const SUPPORTED_API_MAJOR: u32 = 1;
const FETCH_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineModuleDescriptor {
    pub name: String,
    pub version: String,
    pub api_major: u32,
    pub payload_b64: String,
    pub checksum_sha256: String,
}

impl EngineModuleDescriptor {
    /// Well-formedness check run both after fetch and against an already
    /// installed module.
    pub fn check_shape(&self) -> Result<(), EngineError> {
        if self.name.is_empty() || self.version.is_empty() {
            return Err(EngineError::ShapeInvalid(
                "descriptor name/version missing".to_string(),
            ));
        }
        if self.api_major != SUPPORTED_API_MAJOR {
            return Err(EngineError::ShapeInvalid(format!(
                "api_major {} unsupported, expected {}",
                self.api_major, SUPPORTED_API_MAJOR
            )));
        }
        use base64::Engine as _;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(self.payload_b64.as_bytes())
            .map_err(|_| EngineError::ShapeInvalid("payload is not base64".to_string()))?;
        if payload.is_empty() {
            return Err(EngineError::ShapeInvalid("payload is empty".to_string()));
        }
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        let digest: [u8; 32] = hasher.finalize().into();
        let mut hex = String::with_capacity(64);
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        if !hex.eq_ignore_ascii_case(&self.checksum_sha256) {
            return Err(EngineError::ShapeInvalid(
                "payload checksum mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

pub trait EngineModuleFetcher: Send + Sync {
    fn fetch(&self) -> Result<EngineModuleDescriptor, EngineError>;
}

/// Fetches the module descriptor from the distribution endpoint.
#[derive(Debug, Clone)]
pub struct HttpModuleFetcher {
    url: String,
}

impl HttpModuleFetcher {
    pub fn dist_default() -> Self {
        Self {
            url: ENGINE_DIST_URL.to_string(),
        }
    }

    pub fn for_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl EngineModuleFetcher for HttpModuleFetcher {
    fn fetch(&self) -> Result<EngineModuleDescriptor, EngineError> {
        let timeout = Duration::from_millis(FETCH_TIMEOUT_MS);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        let response = agent
            .get(&self.url)
            .set("Accept", "application/json")
            .call()
            .map_err(|e| EngineError::Load(format!("module fetch failed: {e}")))?;
        serde_json::from_reader(response.into_reader())
            .map_err(|_| EngineError::ShapeInvalid("descriptor is not valid json".to_string()))
    }
}

/// Turns a fetched descriptor into a live provider.
pub trait EngineProviderFactory: Send + Sync {
    fn build(
        &self,
        descriptor: &EngineModuleDescriptor,
    ) -> Result<Arc<dyn EngineProvider>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct InstalledEngineInfo {
    pub descriptor: EngineModuleDescriptor,
    pub initialized: bool,
}

struct ContextState {
    installed: Option<(EngineModuleDescriptor, Arc<dyn EngineProvider>)>,
    initialized: bool,
}

/// Explicit home for the "engine loaded / engine initialized" process-wide
/// flags. Injected wherever the loaded engine is needed; `reset` is the
/// teardown half of the exactly-once contract.
pub struct RuntimeContext {
    state: Mutex<ContextState>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState {
                installed: None,
                initialized: false,
            }),
        }
    }

    /// Idempotent install. Present and well-formed: no-op. Present but
    /// malformed: `ShapeInvalid`. Absent: fetch, validate, install — the lock
    /// is held across the fetch so installation happens exactly once.
    pub fn ensure_loaded(
        &self,
        fetcher: &dyn EngineModuleFetcher,
        factory: &dyn EngineProviderFactory,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("runtime context poisoned");
        if let Some((descriptor, _)) = &state.installed {
            return descriptor.check_shape();
        }
        let descriptor = fetcher.fetch()?;
        descriptor.check_shape()?;
        let provider = factory.build(&descriptor)?;
        state.installed = Some((descriptor, provider));
        Ok(())
    }

    /// Idempotent one-time init of the installed module.
    pub fn ensure_initialized(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("runtime context poisoned");
        if state.initialized {
            return Ok(());
        }
        let provider = match &state.installed {
            Some((_, provider)) => provider.clone(),
            None => {
                return Err(EngineError::Init(
                    "engine module not loaded".to_string(),
                ))
            }
        };
        provider.init()?;
        state.initialized = true;
        Ok(())
    }

    pub fn provider(&self) -> Option<Arc<dyn EngineProvider>> {
        let state = self.state.lock().expect("runtime context poisoned");
        state.installed.as_ref().map(|(_, p)| p.clone())
    }

    pub fn installed_info(&self) -> Option<InstalledEngineInfo> {
        let state = self.state.lock().expect("runtime context poisoned");
        state.installed.as_ref().map(|(d, _)| InstalledEngineInfo {
            descriptor: d.clone(),
            initialized: state.initialized,
        })
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("runtime context poisoned");
        state.installed = None;
        state.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use veiltally_contracts::cipher::PlainValue;
    use veiltally_contracts::{AccountAddress, DecryptError};

    use super::*;
    use crate::session::{EncryptedInput, SessionConfig, SessionMaterial, UserDecryptRequest};

    fn descriptor_for(payload: &[u8]) -> EngineModuleDescriptor {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        let digest: [u8; 32] = hasher.finalize().into();
        let mut hex = String::new();
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        use base64::Engine as _;
        EngineModuleDescriptor {
            name: "veiltally-engine".to_string(),
            version: "1.0.0".to_string(),
            api_major: SUPPORTED_API_MAJOR,
            payload_b64: base64::engine::general_purpose::STANDARD.encode(payload),
            checksum_sha256: hex,
        }
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicU32,
        fail_transport: bool,
    }

    impl EngineModuleFetcher for CountingFetcher {
        fn fetch(&self) -> Result<EngineModuleDescriptor, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_transport {
                return Err(EngineError::Load("connection refused".to_string()));
            }
            Ok(descriptor_for(b"engine-bytes"))
        }
    }

    struct NoopProvider {
        init_calls: AtomicU32,
        fail_init: bool,
    }

    impl NoopProvider {
        fn ok() -> Self {
            Self {
                init_calls: AtomicU32::new(0),
                fail_init: false,
            }
        }
    }

    impl crate::session::EngineProvider for NoopProvider {
        fn init(&self) -> Result<(), EngineError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(EngineError::Init("entry point threw".to_string()));
            }
            Ok(())
        }

        fn create_session(&self, _config: &SessionConfig) -> Result<SessionMaterial, EngineError> {
            Err(EngineError::Init("not under test".to_string()))
        }

        fn encrypt(
            &self,
            _values: &[PlainValue],
            _destination: &AccountAddress,
            _origin: &AccountAddress,
        ) -> Result<EncryptedInput, EngineError> {
            Err(EngineError::Init("not under test".to_string()))
        }

        fn user_decrypt(
            &self,
            _request: &UserDecryptRequest,
        ) -> Result<BTreeMap<veiltally_contracts::cipher::CiphertextHandle, PlainValue>, DecryptError>
        {
            Err(DecryptError::VerificationFailed("not under test".to_string()))
        }
    }

    struct SharedFactory(Arc<NoopProvider>);

    impl EngineProviderFactory for SharedFactory {
        fn build(
            &self,
            _descriptor: &EngineModuleDescriptor,
        ) -> Result<Arc<dyn EngineProvider>, EngineError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn at_loader_01_ensure_loaded_fetches_exactly_once() {
        let ctx = RuntimeContext::new();
        let fetcher = CountingFetcher::default();
        let factory = SharedFactory(Arc::new(NoopProvider::ok()));
        ctx.ensure_loaded(&fetcher, &factory).unwrap();
        ctx.ensure_loaded(&fetcher, &factory).unwrap();
        ctx.ensure_loaded(&fetcher, &factory).unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_loader_02_transport_failure_is_load_error_and_retryable() {
        let ctx = RuntimeContext::new();
        let fetcher = CountingFetcher {
            calls: AtomicU32::new(0),
            fail_transport: true,
        };
        let factory = SharedFactory(Arc::new(NoopProvider::ok()));
        assert!(matches!(
            ctx.ensure_loaded(&fetcher, &factory),
            Err(EngineError::Load(_))
        ));
        // Failure does not poison the context; the good fetcher succeeds.
        let good = CountingFetcher::default();
        ctx.ensure_loaded(&good, &factory).unwrap();
        assert!(ctx.provider().is_some());
    }

    #[test]
    fn at_loader_03_malformed_descriptor_is_shape_invalid() {
        let mut d = descriptor_for(b"engine-bytes");
        d.checksum_sha256 = "00".repeat(32);
        assert!(matches!(d.check_shape(), Err(EngineError::ShapeInvalid(_))));

        let mut d = descriptor_for(b"engine-bytes");
        d.api_major = 2;
        assert!(matches!(d.check_shape(), Err(EngineError::ShapeInvalid(_))));

        let mut d = descriptor_for(b"engine-bytes");
        d.name = String::new();
        assert!(matches!(d.check_shape(), Err(EngineError::ShapeInvalid(_))));
    }

    #[test]
    fn at_loader_04_init_runs_once_and_memoizes() {
        let ctx = RuntimeContext::new();
        let provider = Arc::new(NoopProvider::ok());
        let factory = SharedFactory(provider.clone());
        ctx.ensure_loaded(&CountingFetcher::default(), &factory)
            .unwrap();
        ctx.ensure_initialized().unwrap();
        ctx.ensure_initialized().unwrap();
        assert_eq!(provider.init_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_loader_05_init_without_load_and_init_failure() {
        let ctx = RuntimeContext::new();
        assert!(matches!(
            ctx.ensure_initialized(),
            Err(EngineError::Init(_))
        ));

        let provider = Arc::new(NoopProvider {
            init_calls: AtomicU32::new(0),
            fail_init: true,
        });
        let factory = SharedFactory(provider.clone());
        ctx.ensure_loaded(&CountingFetcher::default(), &factory)
            .unwrap();
        assert!(matches!(
            ctx.ensure_initialized(),
            Err(EngineError::Init(_))
        ));
        // Not memoized on failure: a later attempt re-runs init.
        assert!(ctx.ensure_initialized().is_err());
        assert_eq!(provider.init_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn at_loader_06_reset_tears_down_both_flags() {
        let ctx = RuntimeContext::new();
        let factory = SharedFactory(Arc::new(NoopProvider::ok()));
        ctx.ensure_loaded(&CountingFetcher::default(), &factory)
            .unwrap();
        ctx.ensure_initialized().unwrap();
        ctx.reset();
        assert!(ctx.provider().is_none());
        assert!(ctx.installed_info().is_none());
    }
}
