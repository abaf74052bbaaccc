// src/storage/memory.rs
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{
    AlertRule, ListAlertRulesQuery, OrgId, Provenance, Provisionable, RuleGroupKey, UpdateRule,
};

use super::traits::{
    ProvenanceStore, RuleStore, StoreError, StoreResult, TransactionManager,
};

type RuleKey = (OrgId, String);
type ProvenanceKey = (OrgId, String, String);

#[derive(Debug, Clone, Default)]
struct MemoryState {
    rules: BTreeMap<RuleKey, AlertRule>,
    provenance: HashMap<ProvenanceKey, Provenance>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<MemoryState>,
    versions: RwLock<Vec<AlertRule>>,
    writer: Arc<Mutex<()>>,
    record_versions: bool,
    next_id: AtomicI64,
    update_batches: AtomicUsize,
    group_locks: AtomicUsize,
    fail_provenance_writes: AtomicBool,
    omit_inserted_ids: AtomicBool,
}

/// In-memory backend implementing the rule store, the provenance store and
/// the transaction manager over one shared state.
///
/// Transactions are serialized by a writer lock and mutate a private copy of
/// the state which replaces the committed state on commit. Readers outside a
/// transaction only ever observe committed state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

/// Connection into a [`MemoryStore`], either an auto-commit session or an open
/// transaction.
#[derive(Debug)]
pub struct MemoryConn {
    shared: Arc<Shared>,
    staged: Option<MemoryState>,
    staged_versions: Vec<AlertRule>,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl MemoryConn {
    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        match &self.staged {
            Some(state) => f(state),
            None => f(&self.shared.committed.read()),
        }
    }

    fn write<T>(
        &mut self,
        f: impl FnOnce(&mut MemoryState, &mut Vec<AlertRule>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        match &mut self.staged {
            Some(state) => f(state, &mut self.staged_versions),
            None => Err(StoreError::ReadOnlySession),
        }
    }

    fn check_provenance_writes(&self) -> StoreResult<()> {
        if self.shared.fail_provenance_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "provenance writes disabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn provenance_key(entity: &dyn Provisionable, org_id: OrgId) -> ProvenanceKey {
    (
        org_id,
        entity.resource_type().to_string(),
        entity.resource_id().to_string(),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that also keeps every committed rule version, readable through
    /// [`rule_versions`](Self::rule_versions). The history is never pruned.
    pub fn with_version_history() -> Self {
        MemoryStore {
            shared: Arc::new(Shared {
                record_versions: true,
                ..Shared::default()
            }),
        }
    }

    /// Number of `update_alert_rules` calls issued (for assertions).
    pub fn update_batch_count(&self) -> usize {
        self.shared.update_batches.load(Ordering::SeqCst)
    }

    /// Number of rule group locks taken (for assertions).
    pub fn group_lock_count(&self) -> usize {
        self.shared.group_locks.load(Ordering::SeqCst)
    }

    /// Every committed version of a rule, oldest first. Empty unless the
    /// store was built with [`with_version_history`](Self::with_version_history).
    pub fn rule_versions(&self, org_id: OrgId, uid: &str) -> Vec<AlertRule> {
        self.shared
            .versions
            .read()
            .iter()
            .filter(|r| r.org_id == org_id && r.uid == uid)
            .cloned()
            .collect()
    }

    /// Number of committed rules.
    pub fn rule_count(&self) -> usize {
        self.shared.committed.read().rules.len()
    }

    /// Make `insert_alert_rules` return no ids (for testing inconsistent
    /// stores).
    pub fn set_omit_inserted_ids(&self, omit: bool) {
        self.shared.omit_inserted_ids.store(omit, Ordering::SeqCst);
    }

    /// Make provenance writes fail (for testing rollback).
    pub fn set_fail_provenance_writes(&self, fail: bool) {
        self.shared
            .fail_provenance_writes
            .store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    type Conn = MemoryConn;

    async fn get_alert_rule_by_uid(
        &self,
        conn: &mut MemoryConn,
        org_id: OrgId,
        uid: &str,
    ) -> StoreResult<AlertRule> {
        conn.read(|state| state.rules.get(&(org_id, uid.to_string())).cloned())
            .ok_or_else(|| StoreError::RuleNotFound {
                org_id,
                uid: uid.to_string(),
            })
    }

    async fn list_alert_rules(
        &self,
        conn: &mut MemoryConn,
        query: &ListAlertRulesQuery,
    ) -> StoreResult<Vec<AlertRule>> {
        Ok(conn.read(|state| {
            state
                .rules
                .values()
                .filter(|r| query.matches(r))
                .cloned()
                .collect()
        }))
    }

    async fn insert_alert_rules(
        &self,
        conn: &mut MemoryConn,
        rules: &[AlertRule],
    ) -> StoreResult<HashMap<String, i64>> {
        let shared = conn.shared.clone();
        let omit_ids = shared.omit_inserted_ids.load(Ordering::SeqCst);
        conn.write(|state, versions| {
            for rule in rules {
                if rule.uid.is_empty() {
                    return Err(StoreError::Corrupt("rule without uid".to_string()));
                }
                if state.rules.contains_key(&(rule.org_id, rule.uid.clone())) {
                    return Err(StoreError::DuplicateUid(rule.uid.clone()));
                }
            }

            let mut ids = HashMap::with_capacity(rules.len());
            for rule in rules {
                let mut stored = rule.clone();
                stored.id = shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                stored.version = 1;
                if !omit_ids {
                    ids.insert(stored.uid.clone(), stored.id);
                }
                if shared.record_versions {
                    versions.push(stored.clone());
                }
                state.rules.insert((stored.org_id, stored.uid.clone()), stored);
            }
            Ok(ids)
        })
    }

    async fn update_alert_rules(
        &self,
        conn: &mut MemoryConn,
        updates: &[UpdateRule],
    ) -> StoreResult<()> {
        conn.shared.update_batches.fetch_add(1, Ordering::SeqCst);
        let record_versions = conn.shared.record_versions;
        conn.write(|state, versions| {
            for update in updates {
                let key = (update.existing.org_id, update.existing.uid.clone());
                if !state.rules.contains_key(&key) {
                    return Err(StoreError::RuleNotFound {
                        org_id: key.0,
                        uid: key.1,
                    });
                }
            }

            for update in updates {
                let key = (update.existing.org_id, update.existing.uid.clone());
                if let Some(current) = state.rules.get_mut(&key) {
                    let mut next = update.new.clone();
                    next.id = current.id;
                    next.org_id = current.org_id;
                    next.uid = current.uid.clone();
                    next.version = current.version + 1;
                    if record_versions {
                        versions.push(next.clone());
                    }
                    *current = next;
                }
            }
            Ok(())
        })
    }

    async fn delete_alert_rules_by_uid(
        &self,
        conn: &mut MemoryConn,
        org_id: OrgId,
        uids: &[String],
    ) -> StoreResult<()> {
        conn.write(|state, _| {
            for uid in uids {
                state.rules.remove(&(org_id, uid.clone()));
            }
            Ok(())
        })
    }

    async fn lock_rule_group(&self, conn: &mut MemoryConn, _key: &RuleGroupKey) -> StoreResult<()> {
        // Open transactions already hold the store-wide writer lock
        conn.write(|_, _| Ok(()))?;
        conn.shared.group_locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_rule_group_interval(
        &self,
        conn: &mut MemoryConn,
        key: &RuleGroupKey,
    ) -> StoreResult<i64> {
        conn.read(|state| {
            state
                .rules
                .values()
                .find(|r| key.contains(r))
                .map(|r| r.interval_seconds)
        })
        .ok_or_else(|| StoreError::RuleGroupNotFound(key.clone()))
    }
}

#[async_trait]
impl ProvenanceStore for MemoryStore {
    type Conn = MemoryConn;

    async fn get_provenance(
        &self,
        conn: &mut MemoryConn,
        entity: &dyn Provisionable,
        org_id: OrgId,
    ) -> StoreResult<Provenance> {
        let key = provenance_key(entity, org_id);
        Ok(conn.read(|state| state.provenance.get(&key).copied().unwrap_or_default()))
    }

    async fn get_provenances(
        &self,
        conn: &mut MemoryConn,
        org_id: OrgId,
        resource_type: &str,
        resource_ids: &[String],
    ) -> StoreResult<HashMap<String, Provenance>> {
        Ok(conn.read(|state| {
            resource_ids
                .iter()
                .filter_map(|id| {
                    let key = (org_id, resource_type.to_string(), id.clone());
                    state
                        .provenance
                        .get(&key)
                        .filter(|p| !p.is_none())
                        .map(|p| (id.clone(), *p))
                })
                .collect()
        }))
    }

    async fn set_provenance(
        &self,
        conn: &mut MemoryConn,
        entity: &dyn Provisionable,
        org_id: OrgId,
        provenance: Provenance,
    ) -> StoreResult<()> {
        conn.check_provenance_writes()?;
        let key = provenance_key(entity, org_id);
        conn.write(|state, _| {
            state.provenance.insert(key, provenance);
            Ok(())
        })
    }

    async fn delete_provenance(
        &self,
        conn: &mut MemoryConn,
        entity: &dyn Provisionable,
        org_id: OrgId,
    ) -> StoreResult<()> {
        conn.check_provenance_writes()?;
        let key = provenance_key(entity, org_id);
        conn.write(|state, _| {
            state.provenance.remove(&key);
            Ok(())
        })
    }
}

#[async_trait]
impl TransactionManager for MemoryStore {
    type Conn = MemoryConn;
    type Session = Box<MemoryConn>;
    type Transaction = Box<MemoryConn>;

    async fn session(&self) -> StoreResult<Box<MemoryConn>> {
        Ok(Box::new(MemoryConn {
            shared: self.shared.clone(),
            staged: None,
            staged_versions: Vec::new(),
            _writer: None,
        }))
    }

    async fn begin(&self) -> StoreResult<Box<MemoryConn>> {
        let guard = self.shared.writer.clone().lock_owned().await;
        let staged = self.shared.committed.read().clone();

        Ok(Box::new(MemoryConn {
            shared: self.shared.clone(),
            staged: Some(staged),
            staged_versions: Vec::new(),
            _writer: Some(guard),
        }))
    }

    async fn commit(&self, tx: Box<MemoryConn>) -> StoreResult<()> {
        let MemoryConn {
            shared,
            staged,
            staged_versions,
            _writer,
        } = *tx;

        if let Some(state) = staged {
            *shared.committed.write() = state;
            shared.versions.write().extend(staged_versions);
        }
        Ok(())
    }

    async fn rollback(&self, tx: Box<MemoryConn>) -> StoreResult<()> {
        drop(tx);
        Ok(())
    }
}
