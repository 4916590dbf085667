#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::cipher::HexSignature;
use crate::common::{AccountAddress, ChainId, ContractViolation, UnixTimeMs, Validate};

pub const GRANT_VALIDITY_DAYS: u32 = 365;

/// Time-boxed decryption authorization. Valid strictly before
/// issued_at + validity window; the authorized contract set is sorted and
/// deduplicated at construction so cache keys are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionGrant {
    pub grantee: AccountAddress,
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
    pub contracts: Vec<AccountAddress>,
    pub issued_at: UnixTimeMs,
    pub validity_days: u32,
    pub signature: HexSignature,
}

impl DecryptionGrant {
    pub fn is_valid_at(&self, now: UnixTimeMs) -> bool {
        now < self.issued_at.plus_days(self.validity_days)
    }

    pub fn authorizes(&self, contract: &AccountAddress) -> bool {
        self.contracts.binary_search(contract).is_ok()
    }
}

impl Validate for DecryptionGrant {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.grantee.validate()?;
        self.signature.validate()?;
        if self.contracts.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_grant.contracts",
                reason: "must name at least one contract",
            });
        }
        if self.contracts.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_grant.contracts",
                reason: "must be sorted and deduplicated",
            });
        }
        if self.validity_days == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_grant.validity_days",
                reason: "must be > 0",
            });
        }
        if self.public_key.is_empty() || self.secret_key.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_grant.keypair",
                reason: "ephemeral keypair must be present",
            });
        }
        Ok(())
    }
}

/// Structured signing document presented to the signer. Shape is fixed:
/// domain, a types table with one UserDecryptRequestVerification entry, and
/// the message itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptRequestPayload {
    pub domain: SigningDomain,
    pub types: SigningTypes,
    pub primary_type: String,
    pub message: DecryptRequestMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningTypes {
    #[serde(rename = "UserDecryptRequestVerification")]
    pub user_decrypt_request_verification: Vec<SigningField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptRequestMessage {
    pub public_key: String,
    pub contracts: Vec<String>,
    pub issued_at: u64,
    pub duration_days: u32,
}

impl DecryptRequestPayload {
    pub fn v1(
        chain_id: ChainId,
        verifying_contract: &AccountAddress,
        public_key_hex: String,
        contracts: &[AccountAddress],
        issued_at: UnixTimeMs,
        duration_days: u32,
    ) -> Self {
        Self {
            domain: SigningDomain {
                name: "veiltally".to_string(),
                version: "1".to_string(),
                chain_id: chain_id.0,
                verifying_contract: verifying_contract.as_str().to_string(),
            },
            types: SigningTypes {
                user_decrypt_request_verification: vec![
                    SigningField {
                        name: "public_key".to_string(),
                        field_type: "bytes".to_string(),
                    },
                    SigningField {
                        name: "contracts".to_string(),
                        field_type: "address[]".to_string(),
                    },
                    SigningField {
                        name: "issued_at".to_string(),
                        field_type: "uint64".to_string(),
                    },
                    SigningField {
                        name: "duration_days".to_string(),
                        field_type: "uint32".to_string(),
                    },
                ],
            },
            primary_type: "UserDecryptRequestVerification".to_string(),
            message: DecryptRequestMessage {
                public_key: public_key_hex,
                contracts: contracts.iter().map(|c| c.as_str().to_string()).collect(),
                issued_at: issued_at.0,
                duration_days,
            },
        }
    }
}
