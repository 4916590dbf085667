#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use veiltally_contracts::cipher::{
    CiphertextHandle, EnginePublicKey, HexSignature, PlainValue, ProofBlob, PublicParams,
};
use veiltally_contracts::grant::{DecryptRequestPayload, DecryptionGrant};
use veiltally_contracts::{
    AccountAddress, ChainId, DecryptError, EngineError, SignerError, UnixTimeMs,
};

use crate::network::NetworkClass;

/// Public key/parameter pair a session runs with. Cacheable; absence only
/// costs an extra round trip at session construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMaterial {
    pub public_key: EnginePublicKey,
    pub public_params: PublicParams,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chain_id: ChainId,
    pub relay_url: String,
    pub access_registry: AccountAddress,
    pub verifier_contract: AccountAddress,
    pub cached: Option<SessionMaterial>,
}

/// Encrypted payload produced by one builder run: one handle per plaintext
/// value, in call order, plus the attached proof. Single-use per ledger call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedInput {
    pub handles: Vec<CiphertextHandle>,
    pub proof: ProofBlob,
}

/// Decryption request as handed to the verification path: handle/contract
/// pairs plus the grant fields the verifier checks them against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDecryptRequest {
    pub pairs: Vec<(CiphertextHandle, AccountAddress)>,
    pub grantee: AccountAddress,
    pub contracts: Vec<AccountAddress>,
    pub public_key: Vec<u8>,
    pub signature: HexSignature,
    pub issued_at: UnixTimeMs,
    pub duration_days: u32,
    pub now: UnixTimeMs,
}

/// The opaque cryptographic capability. Everything the system knows about
/// homomorphic encryption goes through this seam.
pub trait EngineProvider: Send + Sync {
    fn init(&self) -> Result<(), EngineError>;
    fn create_session(&self, config: &SessionConfig) -> Result<SessionMaterial, EngineError>;
    fn encrypt(
        &self,
        values: &[PlainValue],
        destination: &AccountAddress,
        origin: &AccountAddress,
    ) -> Result<EncryptedInput, EngineError>;
    fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<BTreeMap<CiphertextHandle, PlainValue>, DecryptError>;
}

/// Structured-data signing delegation. Rejection is an ordinary outcome, not
/// a fault: the grant manager maps it to "no authorization available".
pub trait StructuredSigner: Send + Sync {
    fn address(&self) -> AccountAddress;
    fn sign_decrypt_request(
        &self,
        payload: &DecryptRequestPayload,
    ) -> Result<HexSignature, SignerError>;
}

/// Activated, network-bound engine handle. One per (transport, chain);
/// invalidated by the lifecycle controller on transport/chain change.
#[derive(Clone)]
pub struct EngineSession {
    class: NetworkClass,
    material: SessionMaterial,
    access_registry: AccountAddress,
    verifier_contract: AccountAddress,
    provider: Arc<dyn EngineProvider>,
}

impl EngineSession {
    pub fn new(
        class: NetworkClass,
        material: SessionMaterial,
        access_registry: AccountAddress,
        verifier_contract: AccountAddress,
        provider: Arc<dyn EngineProvider>,
    ) -> Self {
        Self {
            class,
            material,
            access_registry,
            verifier_contract,
            provider,
        }
    }

    pub fn class(&self) -> &NetworkClass {
        &self.class
    }

    pub fn chain_id(&self) -> ChainId {
        self.class.chain_id()
    }

    pub fn public_key(&self) -> &EnginePublicKey {
        &self.material.public_key
    }

    pub fn public_params(&self) -> &PublicParams {
        &self.material.public_params
    }

    pub fn access_registry(&self) -> &AccountAddress {
        &self.access_registry
    }

    pub fn provider(&self) -> Arc<dyn EngineProvider> {
        self.provider.clone()
    }

    pub fn public_key_fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.material.public_key.0);
        hasher.finalize().into()
    }

    pub fn encrypt_values(
        &self,
        values: &[PlainValue],
        destination: &AccountAddress,
        origin: &AccountAddress,
    ) -> Result<EncryptedInput, EngineError> {
        self.provider.encrypt(values, destination, origin)
    }

    /// Structured signing document for a decrypt authorization, bound to this
    /// session's chain and verifier contract.
    pub fn decrypt_request_payload(
        &self,
        public_key_hex: String,
        contracts: &[AccountAddress],
        issued_at: UnixTimeMs,
        duration_days: u32,
    ) -> DecryptRequestPayload {
        DecryptRequestPayload::v1(
            self.chain_id(),
            &self.verifier_contract,
            public_key_hex,
            contracts,
            issued_at,
            duration_days,
        )
    }

    /// Resolve ciphertext handles to plaintext under an existing grant.
    /// Pairs naming a contract outside the grant's set are rejected here,
    /// before any wire traffic.
    pub fn decrypt_with_grant(
        &self,
        grant: &DecryptionGrant,
        pairs: &[(CiphertextHandle, AccountAddress)],
        now: UnixTimeMs,
    ) -> Result<BTreeMap<CiphertextHandle, PlainValue>, DecryptError> {
        for (_, contract) in pairs {
            if !grant.authorizes(contract) {
                return Err(DecryptError::VerificationFailed(format!(
                    "contract {contract} not covered by grant"
                )));
            }
        }
        let request = UserDecryptRequest {
            pairs: pairs.to_vec(),
            grantee: grant.grantee.clone(),
            contracts: grant.contracts.clone(),
            public_key: grant.public_key.clone(),
            signature: grant.signature.clone(),
            issued_at: grant.issued_at,
            duration_days: grant.validity_days,
            now,
        };
        self.provider.user_decrypt(&request)
    }
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("class", &self.class)
            .field("access_registry", &self.access_registry)
            .field("verifier_contract", &self.verifier_contract)
            .finish()
    }
}

pub fn hex_of(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
