#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use veiltally_contracts::cipher::{
    CiphertextHandle, EnginePublicKey, PlainValue, ProofBlob, PublicParams,
};
use veiltally_contracts::{AccountAddress, DecryptError, EngineError};

use crate::session::{
    hex_of, EncryptedInput, EngineProvider, SessionConfig, SessionMaterial, UserDecryptRequest,
};

const RELAY_TIMEOUT_MS: u64 = 30_000;

/// Engine provider backed by the remote relay and the decryption
/// verification service. Everything crosses the wire as JSON; the relay
/// carries the actual cryptosystem.
#[derive(Debug)]
pub struct RelayEngineProvider {
    base_url: String,
    resolved_url: Mutex<Option<String>>,
}

impl RelayEngineProvider {
    pub fn for_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            resolved_url: Mutex::new(None),
        }
    }

    /// Endpoint every round trip goes through. The construction-time URL
    /// holds only until a session resolves one; from then on the resolved
    /// endpoint governs.
    pub fn endpoint(&self) -> String {
        self.resolved_url
            .lock()
            .expect("relay url state poisoned")
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }

    fn agent(&self) -> ureq::Agent {
        let timeout = Duration::from_millis(RELAY_TIMEOUT_MS);
        ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build()
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<Value, String> {
        let url = format!("{}{}", self.endpoint(), path);
        let response = self
            .agent()
            .post(&url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .send_json(body.clone())
            .map_err(|e| format!("{path}: {e}"))?;
        serde_json::from_reader(response.into_reader()).map_err(|_| format!("{path}: bad json"))
    }
}

impl EngineProvider for RelayEngineProvider {
    fn init(&self) -> Result<(), EngineError> {
        let url = format!("{}/v1/health", self.endpoint());
        self.agent()
            .get(&url)
            .call()
            .map_err(|e| EngineError::Init(format!("relay unreachable: {e}")))?;
        Ok(())
    }

    fn create_session(&self, config: &SessionConfig) -> Result<SessionMaterial, EngineError> {
        *self.resolved_url.lock().expect("relay url state poisoned") =
            Some(config.relay_url.clone());
        if let Some(cached) = &config.cached {
            return Ok(cached.clone());
        }
        let url = format!(
            "{}/v1/keys?registry={}",
            config.relay_url,
            config.access_registry.as_str()
        );
        let response = self
            .agent()
            .get(&url)
            .set("Accept", "application/json")
            .call()
            .map_err(|e| EngineError::Load(format!("key fetch failed: {e}")))?;
        let body: Value = serde_json::from_reader(response.into_reader())
            .map_err(|_| EngineError::ShapeInvalid("key response is not json".to_string()))?;
        parse_session_material(&body)
    }

    fn encrypt(
        &self,
        values: &[PlainValue],
        destination: &AccountAddress,
        origin: &AccountAddress,
    ) -> Result<EncryptedInput, EngineError> {
        let body = build_input_request(values, destination, origin);
        let response = self
            .post_json("/v1/input-proof", &body)
            .map_err(EngineError::Load)?;
        parse_encrypted_input(&response)
    }

    fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
    ) -> Result<BTreeMap<CiphertextHandle, PlainValue>, DecryptError> {
        let body = build_decrypt_request(request);
        let response = self
            .post_json("/v1/user-decrypt", &body)
            .map_err(DecryptError::VerificationFailed)?;
        parse_decrypt_response(&response)
    }
}

pub fn build_input_request(
    values: &[PlainValue],
    destination: &AccountAddress,
    origin: &AccountAddress,
) -> Value {
    serde_json::json!({
        "values": values,
        "destination": destination.as_str(),
        "origin": origin.as_str(),
    })
}

pub fn build_decrypt_request(request: &UserDecryptRequest) -> Value {
    let pairs: Vec<Value> = request
        .pairs
        .iter()
        .map(|(handle, contract)| {
            serde_json::json!({
                "handle": handle.to_hex(),
                "contract": contract.as_str(),
            })
        })
        .collect();
    serde_json::json!({
        "pairs": pairs,
        "grantee": request.grantee.as_str(),
        "contracts": request.contracts.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        "public_key": hex_of(&request.public_key),
        "signature": request.signature.as_str(),
        "issued_at": request.issued_at.0,
        "duration_days": request.duration_days,
    })
}

pub fn parse_session_material(body: &Value) -> Result<SessionMaterial, EngineError> {
    let public_key = body
        .get("public_key_b64")
        .and_then(Value::as_str)
        .and_then(|s| BASE64.decode(s.as_bytes()).ok())
        .ok_or_else(|| EngineError::ShapeInvalid("public_key_b64 missing".to_string()))?;
    let public_params = body
        .get("public_params_b64")
        .and_then(Value::as_str)
        .and_then(|s| BASE64.decode(s.as_bytes()).ok())
        .ok_or_else(|| EngineError::ShapeInvalid("public_params_b64 missing".to_string()))?;
    if public_key.is_empty() {
        return Err(EngineError::ShapeInvalid("public key empty".to_string()));
    }
    Ok(SessionMaterial {
        public_key: EnginePublicKey(public_key),
        public_params: PublicParams(public_params),
    })
}

pub fn parse_encrypted_input(body: &Value) -> Result<EncryptedInput, EngineError> {
    let handles = body
        .get("handles")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::ShapeInvalid("handles missing".to_string()))?
        .iter()
        .map(|v| v.as_str().and_then(parse_handle_hex))
        .collect::<Option<Vec<CiphertextHandle>>>()
        .ok_or_else(|| EngineError::ShapeInvalid("handle malformed".to_string()))?;
    let proof = body
        .get("proof_b64")
        .and_then(Value::as_str)
        .and_then(|s| BASE64.decode(s.as_bytes()).ok())
        .ok_or_else(|| EngineError::ShapeInvalid("proof_b64 missing".to_string()))?;
    Ok(EncryptedInput {
        handles,
        proof: ProofBlob(proof),
    })
}

pub fn parse_decrypt_response(
    body: &Value,
) -> Result<BTreeMap<CiphertextHandle, PlainValue>, DecryptError> {
    let plaintexts = body
        .get("plaintexts")
        .and_then(Value::as_object)
        .ok_or_else(|| DecryptError::VerificationFailed("plaintexts missing".to_string()))?;
    let mut out = BTreeMap::new();
    for (handle_hex, value) in plaintexts {
        let handle = parse_handle_hex(handle_hex).ok_or_else(|| {
            DecryptError::VerificationFailed("plaintext handle malformed".to_string())
        })?;
        let value: PlainValue = serde_json::from_value(value.clone()).map_err(|_| {
            DecryptError::VerificationFailed("plaintext value malformed".to_string())
        })?;
        out.insert(handle, value);
    }
    Ok(out)
}

fn parse_handle_hex(raw: &str) -> Option<CiphertextHandle> {
    if raw.len() != 64 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        bytes[i] = ((hi << 4) | lo) as u8;
    }
    Some(CiphertextHandle(bytes))
}
