// src/storage/traits.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::DerefMut;
use thiserror::Error;

use crate::domain::{
    AlertRule, ListAlertRulesQuery, OrgId, Provenance, Provisionable, RuleGroupKey, UpdateRule,
};

/// Errors reported by storage backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("alert rule {uid} not found in org {org_id}")]
    RuleNotFound { org_id: OrgId, uid: String },

    #[error("rule group {0} not found")]
    RuleGroupNotFound(RuleGroupKey),

    #[error("alert rule with uid {0} already exists")]
    DuplicateUid(String),

    #[error("writes require an open transaction")]
    ReadOnlySession,

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The backend aborted the transaction to keep concurrent writers
    /// serializable. Retrying the whole operation is safe.
    #[error("transaction aborted by a concurrent writer: {0}")]
    SerializationFailure(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence of alert rules.
///
/// Every operation runs on a connection handed out by the backend's
/// [`TransactionManager`], so reads and writes issued inside one transaction
/// observe each other and commit together.
#[async_trait]
pub trait RuleStore: Send + Sync {
    type Conn: Send;

    async fn get_alert_rule_by_uid(
        &self,
        conn: &mut Self::Conn,
        org_id: OrgId,
        uid: &str,
    ) -> StoreResult<AlertRule>;

    async fn list_alert_rules(
        &self,
        conn: &mut Self::Conn,
        query: &ListAlertRulesQuery,
    ) -> StoreResult<Vec<AlertRule>>;

    /// Insert rules, returning the internal ID assigned to each UID.
    async fn insert_alert_rules(
        &self,
        conn: &mut Self::Conn,
        rules: &[AlertRule],
    ) -> StoreResult<HashMap<String, i64>>;

    /// Apply a batch of updates atomically.
    async fn update_alert_rules(
        &self,
        conn: &mut Self::Conn,
        updates: &[UpdateRule],
    ) -> StoreResult<()>;

    async fn delete_alert_rules_by_uid(
        &self,
        conn: &mut Self::Conn,
        org_id: OrgId,
        uids: &[String],
    ) -> StoreResult<()>;

    /// Block other writers of the group until the surrounding transaction
    /// ends. Must be taken before the group's interval or provenance is read.
    async fn lock_rule_group(&self, conn: &mut Self::Conn, key: &RuleGroupKey) -> StoreResult<()>;

    /// Interval shared by the group's rules. Fails with
    /// [`StoreError::RuleGroupNotFound`] when no rule carries the key.
    async fn get_rule_group_interval(
        &self,
        conn: &mut Self::Conn,
        key: &RuleGroupKey,
    ) -> StoreResult<i64>;
}

/// Persistence of provenance records, keyed by org, resource type and id.
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    type Conn: Send;

    /// Stored provenance, `Provenance::None` if never set.
    async fn get_provenance(
        &self,
        conn: &mut Self::Conn,
        entity: &dyn Provisionable,
        org_id: OrgId,
    ) -> StoreResult<Provenance>;

    /// Non-default provenances of the given resources, by resource id.
    /// Resources without a record are absent from the map.
    async fn get_provenances(
        &self,
        conn: &mut Self::Conn,
        org_id: OrgId,
        resource_type: &str,
        resource_ids: &[String],
    ) -> StoreResult<HashMap<String, Provenance>>;

    async fn set_provenance(
        &self,
        conn: &mut Self::Conn,
        entity: &dyn Provisionable,
        org_id: OrgId,
        provenance: Provenance,
    ) -> StoreResult<()>;

    async fn delete_provenance(
        &self,
        conn: &mut Self::Conn,
        entity: &dyn Provisionable,
        org_id: OrgId,
    ) -> StoreResult<()>;
}

/// Unit-of-work coordinator shared by the rule and provenance stores.
///
/// A transaction that is dropped without [`commit`](Self::commit) is rolled
/// back.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Conn: Send;

    /// Auto-commit handle for standalone reads.
    type Session: DerefMut<Target = Self::Conn> + Send;

    type Transaction: DerefMut<Target = Self::Conn> + Send;

    async fn session(&self) -> StoreResult<Self::Session>;

    async fn begin(&self) -> StoreResult<Self::Transaction>;

    async fn commit(&self, tx: Self::Transaction) -> StoreResult<()>;

    async fn rollback(&self, tx: Self::Transaction) -> StoreResult<()>;
}
