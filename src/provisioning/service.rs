use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::domain::provenance::check_transition;
use crate::domain::rule::{
    generate_short_uid, validate_rule_group_interval, ALERT_RULE_RESOURCE_TYPE,
};
use crate::domain::{
    AlertRule, ListAlertRulesQuery, OrgId, Provenance, ProvenanceAction, RuleGroupKey, UpdateRule,
};
use crate::storage::{ProvenanceStore, RuleStore, StoreError, TransactionManager};

use super::error::ProvisioningError;

/// Operations of the alert rule provisioning service.
///
/// Object-safe so that callers such as the HTTP layer can hold the service
/// behind `Arc<dyn AlertRuleProvisioning>` regardless of the backend.
#[async_trait]
pub trait AlertRuleProvisioning: Send + Sync {
    /// Fetch a rule together with its provenance. Not transactional.
    async fn get_alert_rule(
        &self,
        org_id: OrgId,
        uid: &str,
    ) -> Result<(AlertRule, Provenance), ProvisioningError>;

    /// Create a rule. Any interval set on `rule` is ignored; the rule takes
    /// the interval of its group, or the default interval for a new group.
    async fn create_alert_rule(
        &self,
        rule: AlertRule,
        provenance: Provenance,
    ) -> Result<AlertRule, ProvisioningError>;

    /// Set the interval of every rule in a group.
    async fn update_rule_group(
        &self,
        org_id: OrgId,
        namespace_uid: &str,
        rule_group: &str,
        interval_seconds: i64,
    ) -> Result<(), ProvisioningError>;

    /// Update a rule. Any interval set on `rule` is ignored; the current
    /// group interval is used.
    async fn update_alert_rule(
        &self,
        rule: AlertRule,
        provenance: Provenance,
    ) -> Result<AlertRule, ProvisioningError>;

    /// Delete a rule and its provenance record.
    async fn delete_alert_rule(
        &self,
        org_id: OrgId,
        uid: &str,
        provenance: Provenance,
    ) -> Result<(), ProvisioningError>;
}

/// Stateless orchestrator keeping group intervals and provenance consistent
/// across the rule and provenance stores.
pub struct RuleProvisioningService<R, P, T> {
    default_interval_seconds: i64,
    base_interval_seconds: i64,
    rule_store: R,
    provenance_store: P,
    xact: T,
}

impl<R, P, T> RuleProvisioningService<R, P, T>
where
    T: TransactionManager,
    R: RuleStore<Conn = T::Conn>,
    P: ProvenanceStore<Conn = T::Conn>,
{
    pub fn new(
        rule_store: R,
        provenance_store: P,
        xact: T,
        default_interval_seconds: i64,
        base_interval_seconds: i64,
    ) -> Self {
        RuleProvisioningService {
            default_interval_seconds,
            base_interval_seconds,
            rule_store,
            provenance_store,
            xact,
        }
    }

    pub fn default_interval_seconds(&self) -> i64 {
        self.default_interval_seconds
    }

    pub fn base_interval_seconds(&self) -> i64 {
        self.base_interval_seconds
    }

    /// Commit on success, roll back on failure.
    async fn finish<O>(
        &self,
        tx: T::Transaction,
        result: Result<O, ProvisioningError>,
    ) -> Result<O, ProvisioningError> {
        match result {
            Ok(value) => {
                self.xact.commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.xact.rollback(tx).await {
                    warn!(error = %rollback_err, "Failed to roll back transaction");
                }
                Err(err)
            }
        }
    }

    /// Whether a rule may be placed under non-`None` provenance in its group.
    ///
    /// True when the rule is already provisioned, when its group has no rules
    /// yet, or when at least one member of the group is provisioned. A missing
    /// group is reported as `Ok(true)`, never as an error.
    async fn is_group_provisioned(
        &self,
        conn: &mut T::Conn,
        rule: &AlertRule,
    ) -> Result<bool, ProvisioningError> {
        let stored = self
            .provenance_store
            .get_provenance(conn, rule, rule.org_id)
            .await?;
        if !stored.is_none() {
            return Ok(true);
        }

        let key = rule.group_key();
        match self.rule_store.get_rule_group_interval(conn, &key).await {
            Ok(_) => {}
            Err(StoreError::RuleGroupNotFound(_)) => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let member_uids: Vec<String> = self
            .rule_store
            .list_alert_rules(conn, &ListAlertRulesQuery::for_group(&key))
            .await?
            .into_iter()
            .map(|member| member.uid)
            .collect();
        let provenances = self
            .provenance_store
            .get_provenances(conn, key.org_id, ALERT_RULE_RESOURCE_TYPE, &member_uids)
            .await?;

        Ok(provenances.values().any(|p| !p.is_none()))
    }

    async fn require_provisioned_group(
        &self,
        conn: &mut T::Conn,
        rule: &AlertRule,
        provenance: Provenance,
    ) -> Result<(), ProvisioningError> {
        if self.is_group_provisioned(conn, rule).await? || provenance.is_none() {
            return Ok(());
        }

        warn!(
            org_id = rule.org_id,
            rule_uid = %rule.uid,
            rule_group = %rule.group_key(),
            provenance = %provenance,
            "Refusing to provision rule into unprovisioned group"
        );
        Err(ProvisioningError::GroupNotProvisioned)
    }

    async fn create_in(
        &self,
        conn: &mut T::Conn,
        mut rule: AlertRule,
        provenance: Provenance,
    ) -> Result<AlertRule, ProvisioningError> {
        let key = rule.group_key();
        self.rule_store.lock_rule_group(conn, &key).await?;
        self.require_provisioned_group(conn, &rule, provenance)
            .await?;

        rule.interval_seconds = match self.rule_store.get_rule_group_interval(conn, &key).await {
            Ok(interval) => interval,
            Err(StoreError::RuleGroupNotFound(_)) => self.default_interval_seconds,
            Err(e) => return Err(e.into()),
        };
        rule.updated = Utc::now();

        let ids = self
            .rule_store
            .insert_alert_rules(conn, std::slice::from_ref(&rule))
            .await?;
        rule.id = *ids.get(&rule.uid).ok_or_else(|| {
            ProvisioningError::InternalInconsistency(format!(
                "store returned no id for newly created rule {}",
                rule.uid
            ))
        })?;
        rule.version = 1;

        self.provenance_store
            .set_provenance(conn, &rule, rule.org_id, provenance)
            .await?;

        Ok(rule)
    }

    async fn update_group_in(
        &self,
        conn: &mut T::Conn,
        key: &RuleGroupKey,
        interval_seconds: i64,
    ) -> Result<usize, ProvisioningError> {
        self.rule_store.lock_rule_group(conn, key).await?;
        let rules = self
            .rule_store
            .list_alert_rules(conn, &ListAlertRulesQuery::for_group(key))
            .await?;

        let updates: Vec<UpdateRule> = rules
            .into_iter()
            .filter(|rule| rule.interval_seconds != interval_seconds)
            .map(|existing| {
                let mut new = existing.clone();
                new.interval_seconds = interval_seconds;
                new.updated = Utc::now();
                UpdateRule { existing, new }
            })
            .collect();

        if updates.is_empty() {
            debug!(rule_group = %key, interval_seconds, "Rule group interval unchanged");
            return Ok(0);
        }

        self.rule_store.update_alert_rules(conn, &updates).await?;
        Ok(updates.len())
    }

    async fn update_in(
        &self,
        conn: &mut T::Conn,
        mut rule: AlertRule,
        provenance: Provenance,
    ) -> Result<AlertRule, ProvisioningError> {
        // Only the target group; leaving a group never changes its interval
        self.rule_store
            .lock_rule_group(conn, &rule.group_key())
            .await?;
        self.require_provisioned_group(conn, &rule, provenance)
            .await?;

        let stored_rule = self
            .rule_store
            .get_alert_rule_by_uid(conn, rule.org_id, &rule.uid)
            .await?;
        let stored_provenance = self
            .provenance_store
            .get_provenance(conn, &stored_rule, rule.org_id)
            .await?;

        check_transition(stored_provenance, provenance).map_err(|stored| {
            warn!(
                org_id = rule.org_id,
                rule_uid = %rule.uid,
                stored = %stored,
                requested = %provenance,
                "Provenance conflict on update"
            );
            ProvisioningError::ProvenanceConflict {
                action: ProvenanceAction::Update,
                stored,
                requested: provenance,
            }
        })?;

        rule.updated = Utc::now();
        rule.id = stored_rule.id;
        rule.version = stored_rule.version + 1;
        rule.interval_seconds = self
            .rule_store
            .get_rule_group_interval(conn, &rule.group_key())
            .await?;

        info!(
            rule_id = stored_rule.id,
            labels = ?rule.labels,
            "Updating alert rule"
        );

        self.rule_store
            .update_alert_rules(
                conn,
                &[UpdateRule {
                    existing: stored_rule,
                    new: rule.clone(),
                }],
            )
            .await?;
        self.provenance_store
            .set_provenance(conn, &rule, rule.org_id, provenance)
            .await?;

        Ok(rule)
    }

    async fn delete_in(
        &self,
        conn: &mut T::Conn,
        org_id: OrgId,
        uid: &str,
        provenance: Provenance,
    ) -> Result<(), ProvisioningError> {
        let rule = AlertRule::stub(org_id, uid);
        let stored = self
            .provenance_store
            .get_provenance(conn, &rule, org_id)
            .await?;

        check_transition(stored, provenance).map_err(|stored| {
            warn!(
                org_id,
                rule_uid = uid,
                stored = %stored,
                requested = %provenance,
                "Provenance conflict on delete"
            );
            ProvisioningError::ProvenanceConflict {
                action: ProvenanceAction::Delete,
                stored,
                requested: provenance,
            }
        })?;

        self.rule_store
            .delete_alert_rules_by_uid(conn, org_id, &[uid.to_string()])
            .await?;
        self.provenance_store
            .delete_provenance(conn, &rule, org_id)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl<R, P, T> AlertRuleProvisioning for RuleProvisioningService<R, P, T>
where
    T: TransactionManager,
    R: RuleStore<Conn = T::Conn>,
    P: ProvenanceStore<Conn = T::Conn>,
{
    async fn get_alert_rule(
        &self,
        org_id: OrgId,
        uid: &str,
    ) -> Result<(AlertRule, Provenance), ProvisioningError> {
        let mut session = self.xact.session().await?;

        let rule = self
            .rule_store
            .get_alert_rule_by_uid(&mut *session, org_id, uid)
            .await?;
        let provenance = self
            .provenance_store
            .get_provenance(&mut *session, &rule, org_id)
            .await?;

        Ok((rule, provenance))
    }

    async fn create_alert_rule(
        &self,
        mut rule: AlertRule,
        provenance: Provenance,
    ) -> Result<AlertRule, ProvisioningError> {
        if rule.uid.is_empty() {
            rule.uid = generate_short_uid();
        }

        let mut tx = self.xact.begin().await?;
        let result = self.create_in(&mut *tx, rule, provenance).await;
        let rule = self.finish(tx, result).await?;

        info!(
            org_id = rule.org_id,
            rule_uid = %rule.uid,
            rule_group = %rule.group_key(),
            interval_seconds = rule.interval_seconds,
            provenance = %provenance,
            "Created alert rule"
        );
        Ok(rule)
    }

    async fn update_rule_group(
        &self,
        org_id: OrgId,
        namespace_uid: &str,
        rule_group: &str,
        interval_seconds: i64,
    ) -> Result<(), ProvisioningError> {
        validate_rule_group_interval(interval_seconds, self.base_interval_seconds)
            .map_err(ProvisioningError::InvalidInterval)?;

        let key = RuleGroupKey::new(org_id, namespace_uid, rule_group);
        let mut tx = self.xact.begin().await?;
        let result = self.update_group_in(&mut *tx, &key, interval_seconds).await;
        let updated = self.finish(tx, result).await?;

        info!(
            rule_group = %key,
            interval_seconds,
            updated_rules = updated,
            "Updated rule group interval"
        );
        Ok(())
    }

    async fn update_alert_rule(
        &self,
        rule: AlertRule,
        provenance: Provenance,
    ) -> Result<AlertRule, ProvisioningError> {
        let mut tx = self.xact.begin().await?;
        let result = self.update_in(&mut *tx, rule, provenance).await;
        let rule = self.finish(tx, result).await?;

        info!(
            org_id = rule.org_id,
            rule_uid = %rule.uid,
            provenance = %provenance,
            "Updated alert rule"
        );
        Ok(rule)
    }

    async fn delete_alert_rule(
        &self,
        org_id: OrgId,
        uid: &str,
        provenance: Provenance,
    ) -> Result<(), ProvisioningError> {
        let mut tx = self.xact.begin().await?;
        let result = self.delete_in(&mut *tx, org_id, uid, provenance).await;
        self.finish(tx, result).await?;

        info!(org_id, rule_uid = uid, "Deleted alert rule");
        Ok(())
    }
}
