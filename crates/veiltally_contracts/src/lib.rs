#![forbid(unsafe_code)]

pub mod cipher;
pub mod common;
pub mod errors;
pub mod grant;

pub use common::{
    AccountAddress, CategoryKey, ChainId, ContractViolation, EntityId, ReasonCodeId,
    SchemaVersion, TxId, UnixTimeMs, Validate,
};
pub use errors::{
    ActivationError, BuilderError, DecryptError, EngineError, LedgerError, SignerError,
    TransportError,
};
