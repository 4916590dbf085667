#![forbid(unsafe_code)]

use crate::common::{CategoryKey, EntityId};

/// Wallet/RPC transport failure. Fatal for the call that hit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Unavailable(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(detail) => write!(f, "transport unavailable: {detail}"),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Fetching the engine module failed at the transport layer.
    Load(String),
    /// The module arrived but its descriptor is malformed.
    ShapeInvalid(String),
    /// The one-time init entry point failed.
    Init(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(detail) => write!(f, "engine load failed: {detail}"),
            Self::ShapeInvalid(detail) => write!(f, "engine module malformed: {detail}"),
            Self::Init(detail) => write!(f, "engine init failed: {detail}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Terminal outcome of a failed activation. `Cancelled` is internal only:
/// the controller drops it instead of surfacing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    Transport(TransportError),
    Engine(EngineError),
    Cancelled,
}

impl std::fmt::Display for ActivationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "activation transport failure: {err}"),
            Self::Engine(err) => write!(f, "activation engine failure: {err}"),
            Self::Cancelled => write!(f, "activation superseded"),
        }
    }
}

impl std::error::Error for ActivationError {}

impl From<TransportError> for ActivationError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<EngineError> for ActivationError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

/// Misuse of a single-use ciphertext input builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderError {
    Exhausted,
}

impl std::fmt::Display for BuilderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "ciphertext input builder already finished"),
        }
    }
}

impl std::error::Error for BuilderError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    Rejected,
    Failed(String),
}

impl std::fmt::Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "signer rejected the request"),
            Self::Failed(detail) => write!(f, "signer failed: {detail}"),
        }
    }
}

impl std::error::Error for SignerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    VerificationFailed(String),
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VerificationFailed(detail) => {
                write!(f, "decryption verification failed: {detail}")
            }
        }
    }
}

impl std::error::Error for DecryptError {}

/// Ledger-side refusals, surfaced verbatim and never auto-retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    EntityNotFound(EntityId),
    CategoryNotAllowed {
        entity: EntityId,
        category: CategoryKey,
    },
    /// The engine no longer recognizes the stored counter handle.
    CounterUnavailable(EntityId),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntityNotFound(id) => write!(f, "entity {} not found", id.0),
            Self::CategoryNotAllowed { entity, category } => write!(
                f,
                "category {:?} not declared for entity {}",
                category.as_str(),
                entity.0
            ),
            Self::CounterUnavailable(id) => {
                write!(f, "counter handle for entity {} unavailable", id.0)
            }
        }
    }
}

impl std::error::Error for LedgerError {}
