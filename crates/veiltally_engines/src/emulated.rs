#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use veiltally_contracts::cipher::{CiphertextHandle, EnginePublicKey, PlainValue, ProofBlob, PublicParams};
use veiltally_contracts::{AccountAddress, DecryptError, EngineError};

use crate::session::{
    EncryptedInput, EngineProvider, SessionConfig, SessionMaterial, UserDecryptRequest,
};

const NONCE_LEN: usize = 12;

struct StoredInput {
    ciphertext: Vec<u8>,
    destination: AccountAddress,
    origin: AccountAddress,
    value: PlainValue,
}

struct CounterCell {
    destination: AccountAddress,
    value: u64,
}

struct EmulatedState {
    inputs: BTreeMap<CiphertextHandle, StoredInput>,
    counters: BTreeMap<CiphertextHandle, CounterCell>,
}

/// Lightweight stand-in for the full verification stack, used against local
/// dev chains. Ciphertexts are real (AES-256-GCM under a per-instance key)
/// but live in process memory; handles bind the (destination, origin) pair
/// they were created for.
pub struct EmulatedEngineProvider {
    key: [u8; 32],
    public_key: Vec<u8>,
    state: Mutex<EmulatedState>,
}

impl Default for EmulatedEngineProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedEngineProvider {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let mut public_key = vec![0u8; 32];
        OsRng.fill_bytes(&mut public_key);
        Self {
            key,
            public_key,
            state: Mutex::new(EmulatedState {
                inputs: BTreeMap::new(),
                counters: BTreeMap::new(),
            }),
        }
    }

    pub fn session_material(&self) -> SessionMaterial {
        SessionMaterial {
            public_key: EnginePublicKey(self.public_key.clone()),
            public_params: PublicParams(b"veiltally-emulated-params-v1".to_vec()),
        }
    }

    /// Handle bound to its ciphertext and the exact (destination, origin)
    /// pair. A payload replayed under a different pair produces different
    /// handles and fails proof verification.
    fn derive_handle(
        ciphertext: &[u8],
        destination: &AccountAddress,
        origin: &AccountAddress,
        index: u32,
    ) -> CiphertextHandle {
        let mut hasher = Sha256::new();
        hasher.update(ciphertext);
        hasher.update(destination.as_str().as_bytes());
        hasher.update(origin.as_str().as_bytes());
        hasher.update(index.to_be_bytes());
        CiphertextHandle(hasher.finalize().into())
    }

    fn derive_proof(
        handles: &[CiphertextHandle],
        destination: &AccountAddress,
        origin: &AccountAddress,
    ) -> ProofBlob {
        let mut hasher = Sha256::new();
        for h in handles {
            hasher.update(h.0);
        }
        hasher.update(destination.as_str().as_bytes());
        hasher.update(origin.as_str().as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        ProofBlob(digest.to_vec())
    }

    /// Input-verifier half of the emulated stack: accepts a payload only for
    /// the pair its handles were derived under.
    pub fn verify_encrypted_input(
        &self,
        input: &EncryptedInput,
        destination: &AccountAddress,
        origin: &AccountAddress,
    ) -> bool {
        Self::derive_proof(&input.handles, destination, origin) == input.proof
    }

    /// Fresh counter ciphertext holding zero, owned by `destination`.
    pub fn encrypted_zero(&self, destination: &AccountAddress) -> CiphertextHandle {
        self.store_counter(destination.clone(), 0)
    }

    /// Homomorphic add of plaintext 1. Produces a new handle; the old one
    /// stays resolvable at its historic value.
    pub fn add_plaintext_one(&self, handle: &CiphertextHandle) -> Option<CiphertextHandle> {
        let (destination, value) = {
            let state = self.state.lock().expect("emulated state poisoned");
            let cell = state.counters.get(handle)?;
            (cell.destination.clone(), cell.value)
        };
        Some(self.store_counter(destination, value.saturating_add(1)))
    }

    fn store_counter(&self, destination: AccountAddress, value: u64) -> CiphertextHandle {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(destination.as_str().as_bytes());
        hasher.update(value.to_be_bytes());
        let handle = CiphertextHandle(hasher.finalize().into());
        let mut state = self.state.lock().expect("emulated state poisoned");
        state
            .counters
            .insert(handle, CounterCell { destination, value });
        handle
    }

    fn check_grant(request: &UserDecryptRequest) -> Result<(), DecryptError> {
        if request.now >= request.issued_at.plus_days(request.duration_days) {
            return Err(DecryptError::VerificationFailed(
                "grant outside validity window".to_string(),
            ));
        }
        for (_, contract) in &request.pairs {
            if !request.contracts.contains(contract) {
                return Err(DecryptError::VerificationFailed(format!(
                    "contract {contract} not covered by grant"
                )));
            }
        }
        Ok(())
    }
}

impl EngineProvider for EmulatedEngineProvider {
    fn init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn create_session(&self, _config: &SessionConfig) -> Result<SessionMaterial, EngineError> {
        Ok(self.session_material())
    }

    fn encrypt(
        &self,
        values: &[PlainValue],
        destination: &AccountAddress,
        origin: &AccountAddress,
    ) -> Result<EncryptedInput, EngineError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| EngineError::Init("emulated cipher key rejected".to_string()))?;
        let mut handles = Vec::with_capacity(values.len());
        let mut stored = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            let plaintext = serde_json::to_vec(value)
                .map_err(|_| EngineError::Init("value serialization failed".to_string()))?;
            let mut nonce_bytes = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce_bytes);
            let nonce = Nonce::from_slice(&nonce_bytes);
            let mut ciphertext = cipher
                .encrypt(nonce, plaintext.as_ref())
                .map_err(|_| EngineError::Init("emulated encryption failed".to_string()))?;
            let mut framed = nonce_bytes.to_vec();
            framed.append(&mut ciphertext);
            let handle =
                Self::derive_handle(&framed, destination, origin, index as u32);
            handles.push(handle);
            stored.push((
                handle,
                StoredInput {
                    ciphertext: framed,
                    destination: destination.clone(),
                    origin: origin.clone(),
                    value: value.clone(),
                },
            ));
        }
        let proof = Self::derive_proof(&handles, destination, origin);
        let mut state = self.state.lock().expect("emulated state poisoned");
        for (handle, input) in stored {
            state.inputs.insert(handle, input);
        }
        Ok(EncryptedInput { handles, proof })
    }

    fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<BTreeMap<CiphertextHandle, PlainValue>, DecryptError> {
        Self::check_grant(request)?;
        let state = self.state.lock().expect("emulated state poisoned");
        let mut out = BTreeMap::new();
        for (handle, contract) in &request.pairs {
            if let Some(cell) = state.counters.get(handle) {
                if cell.destination != *contract {
                    return Err(DecryptError::VerificationFailed(
                        "handle not held by named contract".to_string(),
                    ));
                }
                let value =
                    PlainValue::uint(veiltally_contracts::cipher::UintWidth::U64, u128::from(cell.value))
                        .map_err(|_| {
                            DecryptError::VerificationFailed("counter overflow".to_string())
                        })?;
                out.insert(*handle, value);
                continue;
            }
            let Some(input) = state.inputs.get(handle) else {
                return Err(DecryptError::VerificationFailed(format!(
                    "unknown handle {}",
                    handle.to_hex()
                )));
            };
            if input.destination != *contract {
                return Err(DecryptError::VerificationFailed(
                    "handle bound to a different destination".to_string(),
                ));
            }
            // Decrypt rather than echo the stored value, so a corrupted
            // ciphertext surfaces as a verification failure.
            let cipher = Aes256Gcm::new_from_slice(&self.key)
                .map_err(|_| DecryptError::VerificationFailed("cipher key rejected".to_string()))?;
            if input.ciphertext.len() <= NONCE_LEN {
                return Err(DecryptError::VerificationFailed(
                    "ciphertext truncated".to_string(),
                ));
            }
            let (nonce_bytes, body) = input.ciphertext.split_at(NONCE_LEN);
            let nonce = Nonce::from_slice(nonce_bytes);
            let plaintext = cipher
                .decrypt(nonce, body)
                .map_err(|_| DecryptError::VerificationFailed("ciphertext corrupt".to_string()))?;
            let value: PlainValue = serde_json::from_slice(&plaintext)
                .map_err(|_| DecryptError::VerificationFailed("plaintext malformed".to_string()))?;
            if value != input.value {
                return Err(DecryptError::VerificationFailed(
                    "plaintext mismatch".to_string(),
                ));
            }
            out.insert(*handle, value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use veiltally_contracts::cipher::{HexSignature, UintWidth};
    use veiltally_contracts::UnixTimeMs;

    use super::*;

    fn addr(n: u8) -> AccountAddress {
        AccountAddress::new(format!("0x{:040x}", u64::from(n))).unwrap()
    }

    fn request_for(
        pairs: Vec<(CiphertextHandle, AccountAddress)>,
        contracts: Vec<AccountAddress>,
    ) -> UserDecryptRequest {
        UserDecryptRequest {
            pairs,
            grantee: addr(1),
            contracts,
            public_key: vec![1],
            signature: HexSignature::new("0xabcd").unwrap(),
            issued_at: UnixTimeMs(0),
            duration_days: 365,
            now: UnixTimeMs(1),
        }
    }

    #[test]
    fn at_emulated_01_encrypt_binds_destination_and_origin() {
        let engine = EmulatedEngineProvider::new();
        let values = [PlainValue::Bool(true)];
        let input = engine.encrypt(&values, &addr(10), &addr(20)).unwrap();
        assert!(engine.verify_encrypted_input(&input, &addr(10), &addr(20)));
        assert!(!engine.verify_encrypted_input(&input, &addr(11), &addr(20)));
        assert!(!engine.verify_encrypted_input(&input, &addr(10), &addr(21)));
    }

    #[test]
    fn at_emulated_02_user_decrypt_roundtrips_inputs() {
        let engine = EmulatedEngineProvider::new();
        let values = [
            PlainValue::Bool(true),
            PlainValue::uint(UintWidth::U32, 99).unwrap(),
        ];
        let input = engine.encrypt(&values, &addr(10), &addr(20)).unwrap();
        let req = request_for(
            input.handles.iter().map(|h| (*h, addr(10))).collect(),
            vec![addr(10)],
        );
        let out = engine.user_decrypt(&req).unwrap();
        assert_eq!(out.get(&input.handles[0]), Some(&PlainValue::Bool(true)));
        assert_eq!(out.get(&input.handles[1]).and_then(|v| v.as_u64()), Some(99));
    }

    #[test]
    fn at_emulated_03_decrypt_refuses_unauthorized_contract() {
        let engine = EmulatedEngineProvider::new();
        let input = engine
            .encrypt(&[PlainValue::Bool(false)], &addr(10), &addr(20))
            .unwrap();
        let req = request_for(vec![(input.handles[0], addr(10))], vec![addr(99)]);
        assert!(matches!(
            engine.user_decrypt(&req),
            Err(DecryptError::VerificationFailed(_))
        ));
    }

    #[test]
    fn at_emulated_04_decrypt_refuses_expired_grant() {
        let engine = EmulatedEngineProvider::new();
        let input = engine
            .encrypt(&[PlainValue::Bool(false)], &addr(10), &addr(20))
            .unwrap();
        let mut req = request_for(vec![(input.handles[0], addr(10))], vec![addr(10)]);
        req.now = req.issued_at.plus_days(req.duration_days);
        assert!(engine.user_decrypt(&req).is_err());
    }

    #[test]
    fn at_emulated_05_counters_start_at_zero_and_add_one() {
        let engine = EmulatedEngineProvider::new();
        let ledger = addr(40);
        let h0 = engine.encrypted_zero(&ledger);
        let h1 = engine.add_plaintext_one(&h0).unwrap();
        let h2 = engine.add_plaintext_one(&h1).unwrap();
        let req = request_for(vec![(h2, ledger.clone())], vec![ledger]);
        let out = engine.user_decrypt(&req).unwrap();
        assert_eq!(out.values().next().and_then(|v| v.as_u64()), Some(2));
    }

    #[test]
    fn at_emulated_06_unknown_counter_handle_is_none() {
        let engine = EmulatedEngineProvider::new();
        assert!(engine.add_plaintext_one(&CiphertextHandle([9u8; 32])).is_none());
    }
}
