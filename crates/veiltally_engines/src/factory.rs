#![forbid(unsafe_code)]

use std::sync::Arc;

use veiltally_contracts::{AccountAddress, EngineError};

use crate::key_store::KeyStore;
use crate::network::NetworkClass;
use crate::session::{EngineProvider, EngineSession, SessionConfig};

/// Deployment-wide defaults merged with the resolved network on every
/// session build.
#[derive(Debug, Clone)]
pub struct NetworkDefaults {
    pub relay_url: String,
    pub access_registry: AccountAddress,
    pub verifier_contract: AccountAddress,
}

impl NetworkDefaults {
    pub fn mvp_v1() -> Self {
        Self {
            relay_url: "https://relay.veiltally.dev".to_string(),
            access_registry: AccountAddress::new(
                "0x000000000000000000000000000000000000ac01",
            )
            .expect("builtin registry address"),
            verifier_contract: AccountAddress::new(
                "0x000000000000000000000000000000000000ac02",
            )
            .expect("builtin verifier address"),
        }
    }
}

/// Builds a session from the resolved network, consulting the key store on
/// the way in and writing back opportunistically on the way out. Cache
/// absence must never block a session; it only adds one round trip.
pub fn create_session(
    class: &NetworkClass,
    defaults: &NetworkDefaults,
    key_store: &dyn KeyStore,
    provider: Arc<dyn EngineProvider>,
) -> Result<EngineSession, EngineError> {
    let cached = key_store.load(&defaults.access_registry);
    let had_cache = cached.is_some();

    let relay_url = match class {
        NetworkClass::Emulated { endpoint, .. } => endpoint.clone(),
        NetworkClass::Remote { .. } => defaults.relay_url.clone(),
    };
    let config = SessionConfig {
        chain_id: class.chain_id(),
        relay_url,
        access_registry: defaults.access_registry.clone(),
        verifier_contract: defaults.verifier_contract.clone(),
        cached,
    };

    let material = provider.create_session(&config)?;
    if !had_cache {
        // Best effort; a full disk or read-only cache never fails a session.
        let _ = key_store.store(&defaults.access_registry, &material);
    }

    Ok(EngineSession::new(
        class.clone(),
        material,
        defaults.access_registry.clone(),
        defaults.verifier_contract.clone(),
        provider,
    ))
}
