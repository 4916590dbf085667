#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::spawn_blocking;
use veiltally_contracts::cipher::{CiphertextHandle, PlainValue};
use veiltally_contracts::grant::DecryptionGrant;
use veiltally_contracts::{AccountAddress, DecryptError, EngineError, UnixTimeMs};
use veiltally_engines::grant::{self, GrantCache};
use veiltally_engines::input::{CiphertextInputBuilder, InputError};
use veiltally_engines::session::{EncryptedInput, EngineSession, StructuredSigner};

/// Run the proof-generating encryption of a finished builder off the async
/// scheduler. The builder is consumed; it was single-use anyway.
pub async fn finalize_input(builder: CiphertextInputBuilder) -> Result<EncryptedInput, InputError> {
    spawn_blocking(move || {
        let mut builder = builder;
        builder.finish()
    })
    .await
    .map_err(|_| InputError::Engine(EngineError::Init("background worker lost".to_string())))?
}

/// Async wrapper over the grant manager. Same contract: `None` means no
/// authorization is available right now, whatever the cause.
pub async fn obtain_grant(
    session: EngineSession,
    contracts: Vec<AccountAddress>,
    signer: Arc<dyn StructuredSigner>,
    cache: Arc<dyn GrantCache>,
    now: UnixTimeMs,
) -> Option<DecryptionGrant> {
    spawn_blocking(move || grant::obtain(&session, &contracts, signer.as_ref(), cache.as_ref(), now))
        .await
        .ok()
        .flatten()
}

/// Resolve ciphertext handles under an existing grant, off the scheduler.
pub async fn decrypt_with_grant(
    session: EngineSession,
    grant: DecryptionGrant,
    pairs: Vec<(CiphertextHandle, AccountAddress)>,
    now: UnixTimeMs,
) -> Result<BTreeMap<CiphertextHandle, PlainValue>, DecryptError> {
    spawn_blocking(move || session.decrypt_with_grant(&grant, &pairs, now))
        .await
        .map_err(|_| DecryptError::VerificationFailed("background worker lost".to_string()))?
}
