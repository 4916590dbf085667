#![forbid(unsafe_code)]

use std::sync::Arc;

use veiltally_contracts::cipher::{PlainValue, UintWidth};
use veiltally_contracts::{
    AccountAddress, BuilderError, ContractViolation, EngineError,
};

use crate::session::{EncryptedInput, EngineProvider, EngineSession};

#[derive(Debug)]
pub enum InputError {
    Builder(BuilderError),
    Value(ContractViolation),
    Engine(EngineError),
}

impl std::fmt::Display for InputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builder(err) => write!(f, "{err}"),
            Self::Value(err) => write!(f, "invalid input value: {err}"),
            Self::Engine(err) => write!(f, "input encryption failed: {err}"),
        }
    }
}

impl std::error::Error for InputError {}

impl From<BuilderError> for InputError {
    fn from(value: BuilderError) -> Self {
        Self::Builder(value)
    }
}

impl From<EngineError> for InputError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

/// Single-use assembler for one encrypted payload. Values append in call
/// order; `finish` runs the proof-generating encryption exactly once. Any
/// use after `finish` is `BuilderError::Exhausted`.
pub struct CiphertextInputBuilder {
    provider: Arc<dyn EngineProvider>,
    destination: AccountAddress,
    origin: AccountAddress,
    pending: Vec<PlainValue>,
    exhausted: bool,
}

impl CiphertextInputBuilder {
    pub fn new(session: &EngineSession, destination: AccountAddress, origin: AccountAddress) -> Self {
        Self {
            provider: session.provider(),
            destination,
            origin,
            pending: Vec::new(),
            exhausted: false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn add_bool(&mut self, value: bool) -> Result<&mut Self, InputError> {
        self.push(PlainValue::Bool(value))
    }

    pub fn add_address(&mut self, value: AccountAddress) -> Result<&mut Self, InputError> {
        self.push(PlainValue::Address(value))
    }

    /// Width is declared explicitly; the value must fit it, no promotion.
    pub fn add_uint(&mut self, width: UintWidth, value: u128) -> Result<&mut Self, InputError> {
        let v = PlainValue::uint(width, value).map_err(InputError::Value)?;
        self.push(v)
    }

    pub fn add_uint256(&mut self, be: [u8; 32]) -> Result<&mut Self, InputError> {
        self.push(PlainValue::uint256(be))
    }

    fn push(&mut self, value: PlainValue) -> Result<&mut Self, InputError> {
        if self.exhausted {
            return Err(BuilderError::Exhausted.into());
        }
        self.pending.push(value);
        Ok(self)
    }

    /// Consumes the pending list and encrypts it into one payload bound to
    /// the (destination, origin) pair fixed at construction. Proof
    /// generation is CPU-bound; interactive callers should run this off
    /// their scheduler (see the runtime crate's async wrapper).
    pub fn finish(&mut self) -> Result<EncryptedInput, InputError> {
        if self.exhausted {
            return Err(BuilderError::Exhausted.into());
        }
        self.exhausted = true;
        let values = std::mem::take(&mut self.pending);
        let input = self
            .provider
            .encrypt(&values, &self.destination, &self.origin)?;
        Ok(input)
    }
}
