#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use veiltally_contracts::{AccountAddress, ChainId, TransportError};

/// Conventional local-development chain id. A transport reporting this id is
/// treated as emulated even when no override map is supplied.
pub const DEFAULT_LOCAL_CHAIN_ID: ChainId = ChainId(31337);
pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://127.0.0.1:8545";

/// Wallet/RPC seam. One generic request method covers the client-version
/// query and the relay-metadata query; everything else is typed.
pub trait Transport: Send + Sync {
    fn chain_id(&self) -> Result<ChainId, TransportError>;
    fn request(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
    fn account(&self) -> Result<AccountAddress, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkClass {
    Emulated { chain_id: ChainId, endpoint: String },
    Remote { chain_id: ChainId },
}

impl NetworkClass {
    pub fn chain_id(&self) -> ChainId {
        match self {
            Self::Emulated { chain_id, .. } | Self::Remote { chain_id } => *chain_id,
        }
    }
}

/// Pure classification, re-run on every activation. Overrides are merged on
/// top of the built-in local-dev entry; a matching chain id means emulated.
pub fn classify(
    transport: &dyn Transport,
    overrides: Option<&BTreeMap<ChainId, String>>,
) -> Result<NetworkClass, TransportError> {
    let chain_id = transport.chain_id()?;

    let mut table: BTreeMap<ChainId, String> = BTreeMap::new();
    table.insert(DEFAULT_LOCAL_CHAIN_ID, DEFAULT_LOCAL_ENDPOINT.to_string());
    if let Some(extra) = overrides {
        for (id, endpoint) in extra {
            table.insert(*id, endpoint.clone());
        }
    }

    match table.get(&chain_id) {
        Some(endpoint) => Ok(NetworkClass::Emulated {
            chain_id,
            endpoint: endpoint.clone(),
        }),
        None => Ok(NetworkClass::Remote { chain_id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) struct StaticTransport {
        pub chain: ChainId,
    }

    impl Transport for StaticTransport {
        fn chain_id(&self) -> Result<ChainId, TransportError> {
            Ok(self.chain)
        }

        fn request(
            &self,
            _method: &str,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value, TransportError> {
            Err(TransportError::Unavailable("static transport".to_string()))
        }

        fn account(&self) -> Result<AccountAddress, TransportError> {
            AccountAddress::new("0x00000000000000000000000000000000000000aa").map_err(|_| {
                TransportError::Unavailable("static transport account".to_string())
            })
        }
    }

    #[test]
    fn at_network_01_default_local_chain_is_emulated_without_overrides() {
        let t = StaticTransport {
            chain: DEFAULT_LOCAL_CHAIN_ID,
        };
        let class = classify(&t, None).unwrap();
        assert_eq!(
            class,
            NetworkClass::Emulated {
                chain_id: DEFAULT_LOCAL_CHAIN_ID,
                endpoint: DEFAULT_LOCAL_ENDPOINT.to_string(),
            }
        );
    }

    #[test]
    fn at_network_02_unknown_chain_is_remote() {
        let t = StaticTransport { chain: ChainId(1) };
        assert_eq!(
            classify(&t, None).unwrap(),
            NetworkClass::Remote { chain_id: ChainId(1) }
        );
    }

    #[test]
    fn at_network_03_overrides_extend_and_replace_the_builtin_entry() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ChainId(1337), "http://127.0.0.1:9999".to_string());
        overrides.insert(DEFAULT_LOCAL_CHAIN_ID, "http://10.0.0.5:8545".to_string());

        let t = StaticTransport { chain: ChainId(1337) };
        let class = classify(&t, Some(&overrides)).unwrap();
        assert!(matches!(class, NetworkClass::Emulated { endpoint, .. } if endpoint == "http://127.0.0.1:9999"));

        let t = StaticTransport {
            chain: DEFAULT_LOCAL_CHAIN_ID,
        };
        let class = classify(&t, Some(&overrides)).unwrap();
        assert!(matches!(class, NetworkClass::Emulated { endpoint, .. } if endpoint == "http://10.0.0.5:8545"));
    }

    #[test]
    fn at_network_04_transport_failure_propagates() {
        struct DeadTransport;
        impl Transport for DeadTransport {
            fn chain_id(&self) -> Result<ChainId, TransportError> {
                Err(TransportError::Unavailable("rpc down".to_string()))
            }
            fn request(
                &self,
                _method: &str,
                _params: &serde_json::Value,
            ) -> Result<serde_json::Value, TransportError> {
                Err(TransportError::Unavailable("rpc down".to_string()))
            }
            fn account(&self) -> Result<AccountAddress, TransportError> {
                Err(TransportError::Unavailable("rpc down".to_string()))
            }
        }
        assert!(classify(&DeadTransport, None).is_err());
    }
}
