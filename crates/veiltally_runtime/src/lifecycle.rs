#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::spawn_blocking;
use veiltally_contracts::{ActivationError, ChainId, EngineError};
use veiltally_engines::factory::{self, NetworkDefaults};
use veiltally_engines::key_store::KeyStore;
use veiltally_engines::loader::{EngineModuleFetcher, EngineProviderFactory, RuntimeContext};
use veiltally_engines::network::{self, NetworkClass, Transport};
use veiltally_engines::probe::{self, ProbeOutcome};
use veiltally_engines::session::EngineSession;

/// Externally observable activation state. `Loading` covers the whole
/// resolve/probe/load/session pipeline; intermediate stages are not states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Loading { chain_id: ChainId },
    Ready { chain_id: ChainId },
    Failed { error: ActivationError },
    Reset,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub defaults: NetworkDefaults,
    /// Extra chain-id -> endpoint entries treated as emulated networks,
    /// merged over the built-in local-dev entry.
    pub emulated_overrides: Option<BTreeMap<ChainId, String>>,
}

impl ControllerConfig {
    pub fn mvp_v1() -> Self {
        Self {
            defaults: NetworkDefaults::mvp_v1(),
            emulated_overrides: None,
        }
    }
}

type ObserverFn = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct ControllerInner {
    state: LifecycleState,
    session: Option<EngineSession>,
    error: Option<ActivationError>,
    loading_key: Option<(usize, ChainId)>,
}

/// Drives activation against a (transport, chain) pair. Re-activation with a
/// different pair supersedes any run in flight: the stale run's outcome is
/// discarded at the next stage boundary, so only the latest caller ever
/// settles the state. Blocking stages run off the async scheduler.
pub struct LifecycleController {
    inner: Mutex<ControllerInner>,
    epoch: AtomicU64,
    context: Arc<RuntimeContext>,
    fetcher: Arc<dyn EngineModuleFetcher>,
    provider_factory: Arc<dyn EngineProviderFactory>,
    key_store: Arc<dyn KeyStore>,
    config: ControllerConfig,
    observers: Mutex<BTreeMap<u64, ObserverFn>>,
    next_observer: AtomicU64,
}

impl LifecycleController {
    pub fn new(
        context: Arc<RuntimeContext>,
        fetcher: Arc<dyn EngineModuleFetcher>,
        provider_factory: Arc<dyn EngineProviderFactory>,
        key_store: Arc<dyn KeyStore>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Mutex::new(ControllerInner {
                state: LifecycleState::Idle,
                session: None,
                error: None,
                loading_key: None,
            }),
            epoch: AtomicU64::new(0),
            context,
            fetcher,
            provider_factory,
            key_store,
            config,
            observers: Mutex::new(BTreeMap::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().expect("lifecycle state poisoned").state
    }

    pub fn session(&self) -> Option<EngineSession> {
        self.inner
            .lock()
            .expect("lifecycle state poisoned")
            .session
            .clone()
    }

    pub fn last_error(&self) -> Option<ActivationError> {
        self.inner
            .lock()
            .expect("lifecycle state poisoned")
            .error
            .clone()
    }

    pub fn subscribe(&self, observer: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        self.observers
            .lock()
            .expect("observer table poisoned")
            .insert(id, Box::new(observer));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.observers
            .lock()
            .expect("observer table poisoned")
            .remove(&id);
    }

    /// Activate against the given transport and chain. A second call with
    /// the same pair while that pair is already loading is a no-op; a call
    /// with a different pair invalidates the run in flight.
    pub async fn activate(&self, transport: Arc<dyn Transport>, chain_id: ChainId) {
        let key = (Arc::as_ptr(&transport) as *const () as usize, chain_id);
        let token = {
            let mut inner = self.inner.lock().expect("lifecycle state poisoned");
            if inner.state == LifecycleState::Loading && inner.loading_key == Some(key) {
                return;
            }
            inner.state = LifecycleState::Loading;
            inner.loading_key = Some(key);
            inner.session = None;
            inner.error = None;
            self.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.emit(&LifecycleEvent::Loading { chain_id });

        match self.drive(transport, token).await {
            Ok(Some(session)) => self.settle_ready(token, chain_id, session),
            // Superseded mid-run. The winning activation owns the state.
            Ok(None) => {}
            Err(error) => self.settle_error(token, error),
        }
    }

    /// Back to `Idle` and invalidate any run in flight. The loaded engine
    /// module stays installed; only the network binding is dropped.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().expect("lifecycle state poisoned");
            inner.state = LifecycleState::Idle;
            inner.session = None;
            inner.error = None;
            inner.loading_key = None;
        }
        self.emit(&LifecycleEvent::Reset);
    }

    async fn drive(
        &self,
        transport: Arc<dyn Transport>,
        token: u64,
    ) -> Result<Option<EngineSession>, ActivationError> {
        let overrides = self.config.emulated_overrides.clone();
        let t = transport.clone();
        let class = spawn_blocking(move || network::classify(t.as_ref(), overrides.as_ref()))
            .await
            .map_err(worker_lost)??;
        if !self.is_current(token) {
            return Ok(None);
        }

        if matches!(class, NetworkClass::Emulated { .. }) {
            let t = transport.clone();
            let c = class.clone();
            let outcome = spawn_blocking(move || probe::run(t.as_ref(), &c))
                .await
                .map_err(worker_lost)?;
            if !self.is_current(token) {
                return Ok(None);
            }
            if let ProbeOutcome::Detected(session) = outcome {
                return Ok(Some(session));
            }
            // Fell through: the dev node is not running the lightweight
            // stack, continue on the remote path with the same class.
        }

        let context = self.context.clone();
        let fetcher = self.fetcher.clone();
        let provider_factory = self.provider_factory.clone();
        let key_store = self.key_store.clone();
        let defaults = self.config.defaults.clone();
        let session = spawn_blocking(move || -> Result<EngineSession, EngineError> {
            context.ensure_loaded(fetcher.as_ref(), provider_factory.as_ref())?;
            context.ensure_initialized()?;
            let provider = context
                .provider()
                .ok_or_else(|| EngineError::Init("engine module not loaded".to_string()))?;
            factory::create_session(&class, &defaults, key_store.as_ref(), provider)
        })
        .await
        .map_err(worker_lost)??;
        if !self.is_current(token) {
            return Ok(None);
        }
        Ok(Some(session))
    }

    fn is_current(&self, token: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == token
    }

    fn settle_ready(&self, token: u64, chain_id: ChainId, session: EngineSession) {
        {
            let mut inner = self.inner.lock().expect("lifecycle state poisoned");
            if self.epoch.load(Ordering::SeqCst) != token {
                return;
            }
            inner.state = LifecycleState::Ready;
            inner.session = Some(session);
            inner.loading_key = None;
        }
        self.emit(&LifecycleEvent::Ready { chain_id });
    }

    fn settle_error(&self, token: u64, error: ActivationError) {
        {
            let mut inner = self.inner.lock().expect("lifecycle state poisoned");
            if self.epoch.load(Ordering::SeqCst) != token {
                return;
            }
            inner.state = LifecycleState::Error;
            inner.error = Some(error.clone());
            inner.loading_key = None;
        }
        self.emit(&LifecycleEvent::Failed { error });
    }

    fn emit(&self, event: &LifecycleEvent) {
        let observers = self.observers.lock().expect("observer table poisoned");
        for observer in observers.values() {
            observer(event);
        }
    }
}

fn worker_lost(_err: tokio::task::JoinError) -> ActivationError {
    ActivationError::Engine(EngineError::Init("background worker lost".to_string()))
}
