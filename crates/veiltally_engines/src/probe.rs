#![forbid(unsafe_code)]

use std::sync::Arc;

use veiltally_contracts::{AccountAddress, ReasonCodeId};

use crate::emulated::EmulatedEngineProvider;
use crate::network::{NetworkClass, Transport};
use crate::session::EngineSession;

pub mod reason_codes {
    use veiltally_contracts::ReasonCodeId;

    // Probe fall-through namespace. These mean "dev node is not running the
    // lightweight stack", never a fatal condition.
    pub const PROBE_NOT_EMULATED: ReasonCodeId = ReasonCodeId(0x5650_0001);
    pub const PROBE_CLIENT_VERSION_UNAVAILABLE: ReasonCodeId = ReasonCodeId(0x5650_0002);
    pub const PROBE_CLIENT_VERSION_MISMATCH: ReasonCodeId = ReasonCodeId(0x5650_0003);
    pub const PROBE_METADATA_UNAVAILABLE: ReasonCodeId = ReasonCodeId(0x5650_0004);
    pub const PROBE_METADATA_INCOMPLETE: ReasonCodeId = ReasonCodeId(0x5650_0005);
}

/// Dev-node banners the lightweight stack ships under.
const ACCEPTED_CLIENT_PREFIXES: [&str; 2] = ["anvil", "HardhatNetwork"];
const RELAY_METADATA_METHOD: &str = "veiltally_relayMetadata";

#[derive(Debug)]
pub enum ProbeOutcome {
    /// Dev node runs the lightweight stack; session built directly from its
    /// relay metadata, loader and factory bypassed.
    Detected(EngineSession),
    /// Anything else. Callers continue on the remote path.
    FellThrough(ReasonCodeId),
}

/// Two sequential queries against the local node. Every failure mode is a
/// silent fall-through; the probe never surfaces an error.
pub fn run(transport: &dyn Transport, class: &NetworkClass) -> ProbeOutcome {
    if !matches!(class, NetworkClass::Emulated { .. }) {
        return ProbeOutcome::FellThrough(reason_codes::PROBE_NOT_EMULATED);
    }

    let version = match transport.request("web3_clientVersion", &serde_json::json!([])) {
        Ok(value) => value,
        Err(_) => {
            return ProbeOutcome::FellThrough(reason_codes::PROBE_CLIENT_VERSION_UNAVAILABLE)
        }
    };
    let recognized = version
        .as_str()
        .map(|v| ACCEPTED_CLIENT_PREFIXES.iter().any(|p| v.starts_with(p)))
        .unwrap_or(false);
    if !recognized {
        return ProbeOutcome::FellThrough(reason_codes::PROBE_CLIENT_VERSION_MISMATCH);
    }

    let metadata = match transport.request(RELAY_METADATA_METHOD, &serde_json::json!([])) {
        Ok(value) => value,
        Err(_) => return ProbeOutcome::FellThrough(reason_codes::PROBE_METADATA_UNAVAILABLE),
    };
    let Some((access_registry, verifier_contract)) = required_addresses(&metadata) else {
        return ProbeOutcome::FellThrough(reason_codes::PROBE_METADATA_INCOMPLETE);
    };

    let provider = Arc::new(EmulatedEngineProvider::new());
    let material = provider.session_material();
    ProbeOutcome::Detected(EngineSession::new(
        class.clone(),
        material,
        access_registry,
        verifier_contract,
        provider,
    ))
}

/// All three verifier/registry addresses must parse as well-formed account
/// addresses; only the registry and verifier are carried into the session.
fn required_addresses(metadata: &serde_json::Value) -> Option<(AccountAddress, AccountAddress)> {
    let access_registry = AccountAddress::new(metadata.get("access_registry")?.as_str()?).ok()?;
    let verifier_contract =
        AccountAddress::new(metadata.get("verifier_contract")?.as_str()?).ok()?;
    AccountAddress::new(metadata.get("input_verifier")?.as_str()?).ok()?;
    Some((access_registry, verifier_contract))
}
