#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use veiltally_contracts::cipher::CiphertextHandle;
use veiltally_contracts::{AccountAddress, CategoryKey, EntityId, LedgerError, TxId};

/// The two homomorphic primitives the aggregator needs. Both are total over
/// handles the engine issued; `add_plaintext_one` returns `None` only for a
/// handle the engine has never seen.
pub trait HomomorphicOps: Send + Sync {
    fn encrypted_zero(&self, destination: &AccountAddress) -> CiphertextHandle;
    fn add_plaintext_one(&self, handle: &CiphertextHandle) -> Option<CiphertextHandle>;
}

impl<H: HomomorphicOps + ?Sized> HomomorphicOps for Arc<H> {
    fn encrypted_zero(&self, destination: &AccountAddress) -> CiphertextHandle {
        self.as_ref().encrypted_zero(destination)
    }

    fn add_plaintext_one(&self, handle: &CiphertextHandle) -> Option<CiphertextHandle> {
        self.as_ref().add_plaintext_one(handle)
    }
}

/// Native transaction scope of a ledger call. Transient access grants are
/// bound to the `tx` and are worthless outside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub caller: AccountAddress,
    pub tx: TxId,
}

/// One tallied entity. Counter fields hold handles, never plaintext; the
/// overall counter and the per-category counters move independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub owner: AccountAddress,
    pub title: String,
    pub descriptor_hash: [u8; 32],
    pub content_hash: [u8; 32],
    pub tags: Vec<String>,
    pub categories: BTreeSet<CategoryKey>,
    pub counter: CiphertextHandle,
    /// Absent key: declared but never incremented. Distinct from a counter
    /// that holds zero.
    pub category_counters: BTreeMap<CategoryKey, CiphertextHandle>,
    pub persistent_grants: BTreeSet<AccountAddress>,
    pub transient_grant: Option<(AccountAddress, TxId)>,
}

/// Encrypted tally state as the ledger holds it. Entity ids are allocated
/// monotonically; counters never decrement, so plaintext values are
/// non-decreasing and concurrent increments commute under tx ordering.
pub struct EncryptedTallyLedger<H: HomomorphicOps> {
    address: AccountAddress,
    ops: H,
    entities: BTreeMap<EntityId, EntityRecord>,
    next_id: u64,
}

impl<H: HomomorphicOps> EncryptedTallyLedger<H> {
    pub fn new(address: AccountAddress, ops: H) -> Self {
        Self {
            address,
            ops,
            entities: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn address(&self) -> &AccountAddress {
        &self.address
    }

    /// Register an entity with an encrypted-zero overall counter. The ledger
    /// itself and the creator get persistent decryption access.
    pub fn create_entity(
        &mut self,
        ctx: &TxContext,
        title: impl Into<String>,
        descriptor_hash: [u8; 32],
        content_hash: [u8; 32],
        tags: Vec<String>,
        categories: BTreeSet<CategoryKey>,
    ) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        let counter = self.ops.encrypted_zero(&self.address);
        let mut persistent_grants = BTreeSet::new();
        persistent_grants.insert(self.address.clone());
        persistent_grants.insert(ctx.caller.clone());
        self.entities.insert(
            id,
            EntityRecord {
                owner: ctx.caller.clone(),
                title: title.into(),
                descriptor_hash,
                content_hash,
                tags,
                categories,
                counter,
                category_counters: BTreeMap::new(),
                persistent_grants,
                transient_grant: Some((ctx.caller.clone(), ctx.tx)),
            },
        );
        id
    }

    /// Homomorphic add of plaintext 1 to the overall counter. Refreshes the
    /// persistent grants and rebinds the transient grant to this tx.
    pub fn increment(&mut self, ctx: &TxContext, id: EntityId) -> Result<(), LedgerError> {
        let record = self
            .entities
            .get_mut(&id)
            .ok_or(LedgerError::EntityNotFound(id))?;
        let next = self
            .ops
            .add_plaintext_one(&record.counter)
            .ok_or(LedgerError::CounterUnavailable(id))?;
        record.counter = next;
        Self::refresh_grants(record, &self.address, ctx);
        Ok(())
    }

    /// Add 1 to one category counter. The key must be in the declared set;
    /// the overall counter is untouched. First touch starts from encrypted
    /// zero, so the first call lands the counter at 1.
    pub fn increment_category(
        &mut self,
        ctx: &TxContext,
        id: EntityId,
        key: &CategoryKey,
    ) -> Result<(), LedgerError> {
        let record = self
            .entities
            .get_mut(&id)
            .ok_or(LedgerError::EntityNotFound(id))?;
        if !record.categories.contains(key) {
            return Err(LedgerError::CategoryNotAllowed {
                entity: id,
                category: key.clone(),
            });
        }
        let current = match record.category_counters.get(key) {
            Some(handle) => *handle,
            None => self.ops.encrypted_zero(&self.address),
        };
        let next = self
            .ops
            .add_plaintext_one(&current)
            .ok_or(LedgerError::CounterUnavailable(id))?;
        record.category_counters.insert(key.clone(), next);
        Self::refresh_grants(record, &self.address, ctx);
        Ok(())
    }

    pub fn get_entity(&self, id: EntityId) -> Result<&EntityRecord, LedgerError> {
        self.entities.get(&id).ok_or(LedgerError::EntityNotFound(id))
    }

    /// `Ok(None)` means declared but never incremented.
    pub fn get_category_counter(
        &self,
        id: EntityId,
        key: &CategoryKey,
    ) -> Result<Option<CiphertextHandle>, LedgerError> {
        let record = self.get_entity(id)?;
        if !record.categories.contains(key) {
            return Err(LedgerError::CategoryNotAllowed {
                entity: id,
                category: key.clone(),
            });
        }
        Ok(record.category_counters.get(key).copied())
    }

    pub fn list_entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Most recent transient grant and the tx it is bound to.
    pub fn transient_grant(
        &self,
        id: EntityId,
    ) -> Result<Option<(AccountAddress, TxId)>, LedgerError> {
        Ok(self.get_entity(id)?.transient_grant.clone())
    }

    /// Access check the decryption side consults: persistent grants hold
    /// across transactions, the transient grant only within its own tx.
    pub fn is_allowed(
        &self,
        id: EntityId,
        address: &AccountAddress,
        tx: TxId,
    ) -> Result<bool, LedgerError> {
        let record = self.get_entity(id)?;
        if record.persistent_grants.contains(address) {
            return Ok(true);
        }
        Ok(matches!(
            &record.transient_grant,
            Some((granted, granted_tx)) if granted == address && *granted_tx == tx
        ))
    }

    fn refresh_grants(record: &mut EntityRecord, ledger: &AccountAddress, ctx: &TxContext) {
        record.persistent_grants.insert(ledger.clone());
        record.persistent_grants.insert(record.owner.clone());
        record.transient_grant = Some((ctx.caller.clone(), ctx.tx));
    }
}
