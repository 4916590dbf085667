#![forbid(unsafe_code)]

//! In-ledger aggregation over encrypted counters. The ledger never sees a
//! plaintext tally; it moves opaque handles and maintains the access grants
//! that let authorized parties decrypt them elsewhere.

pub mod aggregator;

pub use aggregator::{EncryptedTallyLedger, EntityRecord, HomomorphicOps, TxContext};
