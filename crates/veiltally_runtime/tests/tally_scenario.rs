#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use veiltally_contracts::cipher::{CiphertextHandle, HexSignature, UintWidth};
use veiltally_contracts::grant::DecryptRequestPayload;
use veiltally_contracts::{
    AccountAddress, CategoryKey, LedgerError, SignerError, TxId, UnixTimeMs,
};
use veiltally_engines::emulated::EmulatedEngineProvider;
use veiltally_engines::grant::MemoryGrantCache;
use veiltally_engines::input::CiphertextInputBuilder;
use veiltally_engines::network::{NetworkClass, DEFAULT_LOCAL_CHAIN_ID};
use veiltally_engines::session::{EngineSession, StructuredSigner};
use veiltally_ledger::{EncryptedTallyLedger, HomomorphicOps, TxContext};
use veiltally_runtime::flows;

fn addr(n: u8) -> AccountAddress {
    AccountAddress::new(format!("0x{:040x}", u64::from(n))).unwrap()
}

fn cat(raw: &str) -> CategoryKey {
    CategoryKey::new(raw).unwrap()
}

/// Bridges the emulated engine's counter primitives into the ledger seam.
struct EmulatedOps(Arc<EmulatedEngineProvider>);

impl HomomorphicOps for EmulatedOps {
    fn encrypted_zero(&self, destination: &AccountAddress) -> CiphertextHandle {
        self.0.encrypted_zero(destination)
    }

    fn add_plaintext_one(&self, handle: &CiphertextHandle) -> Option<CiphertextHandle> {
        self.0.add_plaintext_one(handle)
    }
}

struct ApprovingSigner {
    address: AccountAddress,
}

impl StructuredSigner for ApprovingSigner {
    fn address(&self) -> AccountAddress {
        self.address.clone()
    }

    fn sign_decrypt_request(
        &self,
        _payload: &DecryptRequestPayload,
    ) -> Result<HexSignature, SignerError> {
        Ok(HexSignature::new("0xfeedbead").unwrap())
    }
}

fn emulated_session(provider: Arc<EmulatedEngineProvider>) -> EngineSession {
    EngineSession::new(
        NetworkClass::Emulated {
            chain_id: DEFAULT_LOCAL_CHAIN_ID,
            endpoint: "http://127.0.0.1:8545".to_string(),
        },
        provider.session_material(),
        addr(0xa1),
        addr(0xa2),
        provider,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_scenario_01_tally_roundtrip_overall_and_category() {
    let provider = Arc::new(EmulatedEngineProvider::new());
    let session = emulated_session(provider.clone());
    let ledger_addr = addr(0xee);
    let user = addr(7);
    let mut ledger =
        EncryptedTallyLedger::new(ledger_addr.clone(), EmulatedOps(provider.clone()));

    let id = ledger.create_entity(
        &TxContext {
            caller: user.clone(),
            tx: TxId(1),
        },
        "first entity",
        [1; 32],
        [2; 32],
        vec!["demo".to_string()],
        [cat("a"), cat("b")].into_iter().collect::<BTreeSet<_>>(),
    );

    for tx in 2..5 {
        ledger
            .increment(
                &TxContext {
                    caller: user.clone(),
                    tx: TxId(tx),
                },
                id,
            )
            .unwrap();
    }
    for tx in 5..7 {
        ledger
            .increment_category(
                &TxContext {
                    caller: user.clone(),
                    tx: TxId(tx),
                },
                id,
                &cat("a"),
            )
            .unwrap();
    }

    let now = UnixTimeMs(1_000);
    let signer = Arc::new(ApprovingSigner {
        address: user.clone(),
    });
    let cache = Arc::new(MemoryGrantCache::default());
    let grant = flows::obtain_grant(
        session.clone(),
        vec![ledger_addr.clone()],
        signer,
        cache,
        now,
    )
    .await
    .expect("signer approved, grant expected");
    assert!(grant.is_valid_at(now));

    let overall = ledger.get_entity(id).unwrap().counter;
    let cat_a = ledger.get_category_counter(id, &cat("a")).unwrap().unwrap();
    let out = flows::decrypt_with_grant(
        session,
        grant,
        vec![
            (overall, ledger_addr.clone()),
            (cat_a, ledger_addr.clone()),
        ],
        now,
    )
    .await
    .unwrap();

    assert_eq!(out.get(&overall).and_then(|v| v.as_u64()), Some(3));
    assert_eq!(out.get(&cat_a).and_then(|v| v.as_u64()), Some(2));
    // Declared but untouched stays None, not zero.
    assert_eq!(ledger.get_category_counter(id, &cat("b")).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_scenario_02_undeclared_category_changes_nothing() {
    let provider = Arc::new(EmulatedEngineProvider::new());
    let ledger_addr = addr(0xee);
    let mut ledger = EncryptedTallyLedger::new(ledger_addr, EmulatedOps(provider));
    let id = ledger.create_entity(
        &TxContext {
            caller: addr(7),
            tx: TxId(1),
        },
        "entity",
        [0; 32],
        [0; 32],
        vec![],
        [cat("a")].into_iter().collect::<BTreeSet<_>>(),
    );

    let overall_before = ledger.get_entity(id).unwrap().counter;
    let err = ledger
        .increment_category(
            &TxContext {
                caller: addr(7),
                tx: TxId(2),
            },
            id,
            &cat("zz"),
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::CategoryNotAllowed { .. }));
    let record = ledger.get_entity(id).unwrap();
    assert_eq!(record.counter, overall_before);
    assert!(record.category_counters.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_scenario_03_input_builder_finishes_off_scheduler() {
    let provider = Arc::new(EmulatedEngineProvider::new());
    let session = emulated_session(provider.clone());

    let mut builder = CiphertextInputBuilder::new(&session, addr(0x10), addr(0x20));
    builder.add_uint(UintWidth::U64, 5).unwrap();
    builder.add_bool(true).unwrap();
    let input = flows::finalize_input(builder).await.unwrap();

    assert_eq!(input.handles.len(), 2);
    assert!(provider.verify_encrypted_input(&input, &addr(0x10), &addr(0x20)));
    assert!(!provider.verify_encrypted_input(&input, &addr(0x11), &addr(0x20)));
}
