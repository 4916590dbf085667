#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{AccountAddress, ContractViolation, Validate};

/// Opaque 32-byte reference to a ciphertext held by the ledger. The bytes
/// identify the ciphertext; they are not the ciphertext itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CiphertextHandle(pub [u8; 32]);

impl CiphertextHandle {
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// Engine public key material as handed out by a session. Opaque bytes;
/// fingerprinting lives with the engines that own a hash implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePublicKey(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicParams(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBlob(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexSignature(String);

impl HexSignature {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(raw.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for HexSignature {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !self.0.starts_with("0x") || self.0.len() < 4 {
            return Err(ContractViolation::InvalidValue {
                field: "hex_signature",
                reason: "must be 0x-prefixed hex",
            });
        }
        if !self.0[2..].bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ContractViolation::InvalidValue {
                field: "hex_signature",
                reason: "must be 0x-prefixed hex",
            });
        }
        Ok(())
    }
}

/// Declared fixed integer width. There is no implicit promotion anywhere:
/// callers name the width and the value must fit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UintWidth {
    U8,
    U16,
    U32,
    U64,
    U128,
    U256,
}

impl UintWidth {
    pub fn bits(self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::U16 => 16,
            Self::U32 => 32,
            Self::U64 => 64,
            Self::U128 => 128,
            Self::U256 => 256,
        }
    }
}

/// One plaintext value headed into an encrypted payload. Uints carry 32
/// big-endian bytes regardless of declared width so U256 needs no special
/// casing downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlainValue {
    Bool(bool),
    Address(AccountAddress),
    Uint { width: UintWidth, be: [u8; 32] },
}

impl PlainValue {
    pub fn uint(width: UintWidth, value: u128) -> Result<Self, ContractViolation> {
        let bits = width.bits();
        if bits < 128 {
            let max = (1u128 << bits) - 1;
            if value > max {
                return Err(ContractViolation::InvalidValue {
                    field: "plain_value.uint",
                    reason: "value does not fit declared width",
                });
            }
        }
        let mut be = [0u8; 32];
        be[16..].copy_from_slice(&value.to_be_bytes());
        Ok(Self::Uint { width, be })
    }

    pub fn uint256(be: [u8; 32]) -> Self {
        Self::Uint {
            width: UintWidth::U256,
            be,
        }
    }

    /// Low 64 bits of a uint value; None for bools/addresses or wider values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint { be, .. } => {
                if be[..24].iter().any(|b| *b != 0) {
                    return None;
                }
                let mut low = [0u8; 8];
                low.copy_from_slice(&be[24..]);
                Some(u64::from_be_bytes(low))
            }
            _ => None,
        }
    }
}
