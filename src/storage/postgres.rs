// src/storage/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row};
use std::collections::{BTreeMap, HashMap};

use crate::domain::{
    AlertRule, ListAlertRulesQuery, OrgId, Provenance, Provisionable, RuleGroupKey, UpdateRule,
};

use super::traits::{
    ProvenanceStore, RuleStore, StoreError, StoreResult, TransactionManager,
};

const RULE_COLUMNS: &str = "id, org_id, uid, title, namespace_uid, rule_group, \
     interval_seconds, labels, annotations, version, updated";

/// PostgreSQL implementation of the rule store, provenance store and
/// transaction manager.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgresStore instance with a connection pool.
    pub async fn connect(
        database_url: &str,
        min_connections: u32,
        max_connections: u32,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_to_json(map: &BTreeMap<String, String>) -> StoreResult<serde_json::Value> {
    Ok(serde_json::to_value(map)?)
}

fn rule_from_row(row: &PgRow) -> StoreResult<AlertRule> {
    let labels: serde_json::Value = row.try_get("labels")?;
    let annotations: serde_json::Value = row.try_get("annotations")?;
    let updated: DateTime<Utc> = row.try_get("updated")?;

    Ok(AlertRule {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        uid: row.try_get("uid")?,
        title: row.try_get("title")?,
        namespace_uid: row.try_get("namespace_uid")?,
        rule_group: row.try_get("rule_group")?,
        interval_seconds: row.try_get("interval_seconds")?,
        labels: serde_json::from_value(labels)?,
        annotations: serde_json::from_value(annotations)?,
        version: row.try_get("version")?,
        updated,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// serialization_failure and deadlock_detected; the transaction was aborted
/// and may be retried as a whole.
fn is_retryable_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let retryable = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| is_retryable_sqlstate(&code));

        if retryable {
            StoreError::SerializationFailure(err.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}

/// Advisory lock key for a rule group. Collisions only over-serialize.
fn group_lock_key(key: &RuleGroupKey) -> String {
    format!("{}\u{1f}{}\u{1f}{}", key.org_id, key.namespace_uid, key.rule_group)
}

async fn record_version(conn: &mut PgConnection, rule: &AlertRule) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO alert_rule_version (
            rule_id, org_id, uid, title, namespace_uid, rule_group,
            interval_seconds, labels, annotations, version, created
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(rule.id)
    .bind(rule.org_id)
    .bind(&rule.uid)
    .bind(&rule.title)
    .bind(&rule.namespace_uid)
    .bind(&rule.rule_group)
    .bind(rule.interval_seconds)
    .bind(map_to_json(&rule.labels)?)
    .bind(map_to_json(&rule.annotations)?)
    .bind(rule.version)
    .bind(rule.updated)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl RuleStore for PostgresStore {
    type Conn = PgConnection;

    async fn get_alert_rule_by_uid(
        &self,
        conn: &mut PgConnection,
        org_id: OrgId,
        uid: &str,
    ) -> StoreResult<AlertRule> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM alert_rule WHERE org_id = $1 AND uid = $2",
            RULE_COLUMNS
        ))
        .bind(org_id)
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::RuleNotFound {
                org_id,
                uid: uid.to_string(),
            });
        };

        rule_from_row(&row)
    }

    async fn list_alert_rules(
        &self,
        conn: &mut PgConnection,
        query: &ListAlertRulesQuery,
    ) -> StoreResult<Vec<AlertRule>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM alert_rule
            WHERE org_id = $1
              AND (cardinality($2::text[]) = 0 OR namespace_uid = ANY($2))
              AND ($3 = '' OR rule_group = $3)
            ORDER BY id
            "#,
            RULE_COLUMNS
        ))
        .bind(query.org_id)
        .bind(&query.namespace_uids)
        .bind(&query.rule_group)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn insert_alert_rules(
        &self,
        conn: &mut PgConnection,
        rules: &[AlertRule],
    ) -> StoreResult<HashMap<String, i64>> {
        // Savepoint when already inside a transaction
        let mut tx = conn.begin().await?;
        let mut ids = HashMap::with_capacity(rules.len());

        for rule in rules {
            let result = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO alert_rule (
                    org_id, uid, title, namespace_uid, rule_group,
                    interval_seconds, labels, annotations, version, updated
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9)
                RETURNING id
                "#,
            )
            .bind(rule.org_id)
            .bind(&rule.uid)
            .bind(&rule.title)
            .bind(&rule.namespace_uid)
            .bind(&rule.rule_group)
            .bind(rule.interval_seconds)
            .bind(map_to_json(&rule.labels)?)
            .bind(map_to_json(&rule.annotations)?)
            .bind(rule.updated)
            .fetch_one(&mut *tx)
            .await;

            let id = match result {
                Ok(id) => id,
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::DuplicateUid(rule.uid.clone()))
                }
                Err(e) => return Err(e.into()),
            };

            let mut stored = rule.clone();
            stored.id = id;
            stored.version = 1;
            record_version(&mut tx, &stored).await?;

            ids.insert(rule.uid.clone(), id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn update_alert_rules(
        &self,
        conn: &mut PgConnection,
        updates: &[UpdateRule],
    ) -> StoreResult<()> {
        let mut tx = conn.begin().await?;

        for update in updates {
            let row = sqlx::query(
                r#"
                UPDATE alert_rule
                SET title = $3,
                    namespace_uid = $4,
                    rule_group = $5,
                    interval_seconds = $6,
                    labels = $7,
                    annotations = $8,
                    updated = $9,
                    version = version + 1
                WHERE org_id = $1 AND uid = $2
                RETURNING id, version
                "#,
            )
            .bind(update.existing.org_id)
            .bind(&update.existing.uid)
            .bind(&update.new.title)
            .bind(&update.new.namespace_uid)
            .bind(&update.new.rule_group)
            .bind(update.new.interval_seconds)
            .bind(map_to_json(&update.new.labels)?)
            .bind(map_to_json(&update.new.annotations)?)
            .bind(update.new.updated)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                return Err(StoreError::RuleNotFound {
                    org_id: update.existing.org_id,
                    uid: update.existing.uid.clone(),
                });
            };

            let mut stored = update.new.clone();
            stored.org_id = update.existing.org_id;
            stored.uid = update.existing.uid.clone();
            stored.id = row.try_get("id")?;
            stored.version = row.try_get("version")?;
            record_version(&mut tx, &stored).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_alert_rules_by_uid(
        &self,
        conn: &mut PgConnection,
        org_id: OrgId,
        uids: &[String],
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            DELETE FROM alert_rule
            WHERE org_id = $1 AND uid = ANY($2)
            "#,
        )
        .bind(org_id)
        .bind(uids)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn lock_rule_group(&self, conn: &mut PgConnection, key: &RuleGroupKey) -> StoreResult<()> {
        // Released by commit or rollback
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(group_lock_key(key))
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    async fn get_rule_group_interval(
        &self,
        conn: &mut PgConnection,
        key: &RuleGroupKey,
    ) -> StoreResult<i64> {
        let interval: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT interval_seconds
            FROM alert_rule
            WHERE org_id = $1 AND namespace_uid = $2 AND rule_group = $3
            LIMIT 1
            "#,
        )
        .bind(key.org_id)
        .bind(&key.namespace_uid)
        .bind(&key.rule_group)
        .fetch_optional(&mut *conn)
        .await?;

        interval.ok_or_else(|| StoreError::RuleGroupNotFound(key.clone()))
    }
}

#[async_trait]
impl ProvenanceStore for PostgresStore {
    type Conn = PgConnection;

    async fn get_provenance(
        &self,
        conn: &mut PgConnection,
        entity: &dyn Provisionable,
        org_id: OrgId,
    ) -> StoreResult<Provenance> {
        let stored: Option<String> = sqlx::query_scalar(
            r#"
            SELECT provenance
            FROM provenance_type
            WHERE record_key = $1 AND record_type = $2 AND org_id = $3
            "#,
        )
        .bind(entity.resource_id())
        .bind(entity.resource_type())
        .bind(org_id)
        .fetch_optional(&mut *conn)
        .await?;

        match stored {
            None => Ok(Provenance::None),
            Some(value) => Provenance::from_str(&value)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown provenance '{}'", value))),
        }
    }

    async fn get_provenances(
        &self,
        conn: &mut PgConnection,
        org_id: OrgId,
        resource_type: &str,
        resource_ids: &[String],
    ) -> StoreResult<HashMap<String, Provenance>> {
        if resource_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT record_key, provenance
            FROM provenance_type
            WHERE org_id = $1
              AND record_type = $2
              AND record_key = ANY($3)
              AND provenance <> ''
            "#,
        )
        .bind(org_id)
        .bind(resource_type)
        .bind(resource_ids)
        .fetch_all(&mut *conn)
        .await?;

        let mut result = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("record_key")?;
            let value: String = row.try_get("provenance")?;
            let provenance = Provenance::from_str(&value)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown provenance '{}'", value)))?;
            result.insert(key, provenance);
        }

        Ok(result)
    }

    async fn set_provenance(
        &self,
        conn: &mut PgConnection,
        entity: &dyn Provisionable,
        org_id: OrgId,
        provenance: Provenance,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provenance_type (org_id, record_key, record_type, provenance)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (record_type, record_key, org_id)
            DO UPDATE SET provenance = EXCLUDED.provenance
            "#,
        )
        .bind(org_id)
        .bind(entity.resource_id())
        .bind(entity.resource_type())
        .bind(provenance.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn delete_provenance(
        &self,
        conn: &mut PgConnection,
        entity: &dyn Provisionable,
        org_id: OrgId,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            DELETE FROM provenance_type
            WHERE record_key = $1 AND record_type = $2 AND org_id = $3
            "#,
        )
        .bind(entity.resource_id())
        .bind(entity.resource_type())
        .bind(org_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TransactionManager for PostgresStore {
    type Conn = PgConnection;
    type Session = PoolConnection<Postgres>;
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn session(&self) -> StoreResult<PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }

    async fn begin(&self) -> StoreResult<sqlx::Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: sqlx::Transaction<'static, Postgres>) -> StoreResult<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: sqlx::Transaction<'static, Postgres>) -> StoreResult<()> {
        tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::{AlertRuleProvisioning, RuleProvisioningService};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_retryable_sqlstates() {
        assert!(is_retryable_sqlstate("40001"));
        assert!(is_retryable_sqlstate("40P01"));
        assert!(!is_retryable_sqlstate("23505"));
        assert!(!is_retryable_sqlstate("42P01"));
    }

    #[test]
    fn test_non_database_errors_are_not_retryable() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn test_group_lock_key_separates_fields() {
        let a = group_lock_key(&RuleGroupKey::new(1, "ab", "c"));
        let b = group_lock_key(&RuleGroupKey::new(1, "a", "bc"));
        assert_ne!(a, b);
    }

    // Requires a PostgreSQL server at RULEPROV_TEST_DATABASE_URL
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore]
    async fn test_group_lock_serializes_create_behind_interval_update() {
        let url = std::env::var("RULEPROV_TEST_DATABASE_URL")
            .expect("RULEPROV_TEST_DATABASE_URL not set");
        let store = PostgresStore::connect(&url, 1, 4).await.unwrap();
        store.run_migrations().await.unwrap();

        let service = Arc::new(RuleProvisioningService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            60,
            10,
        ));

        let group = format!("lock-{}", uuid::Uuid::new_v4().simple());
        let key = RuleGroupKey::new(1, "lock-test", &group);
        for title in ["a", "b"] {
            service
                .create_alert_rule(AlertRule::new(1, "lock-test", &group, title), Provenance::None)
                .await
                .unwrap();
        }

        // Stage a group interval change and hold the transaction open
        let mut tx = store.begin().await.unwrap();
        store.lock_rule_group(&mut tx, &key).await.unwrap();
        let members = store
            .list_alert_rules(&mut tx, &ListAlertRulesQuery::for_group(&key))
            .await
            .unwrap();
        let updates: Vec<UpdateRule> = members
            .into_iter()
            .map(|existing| {
                let mut new = existing.clone();
                new.interval_seconds = 120;
                UpdateRule { existing, new }
            })
            .collect();
        store.update_alert_rules(&mut tx, &updates).await.unwrap();

        let create = {
            let service = service.clone();
            let group = group.clone();
            tokio::spawn(async move {
                service
                    .create_alert_rule(AlertRule::new(1, "lock-test", &group, "c"), Provenance::None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!create.is_finished(), "create did not wait for the group lock");

        store.commit(tx).await.unwrap();
        let created = create.await.unwrap().unwrap();
        assert_eq!(created.interval_seconds, 120);

        let mut session = store.session().await.unwrap();
        let rules = store
            .list_alert_rules(&mut session, &ListAlertRulesQuery::for_group(&key))
            .await
            .unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.interval_seconds == 120));

        let uids: Vec<String> = rules.into_iter().map(|r| r.uid).collect();
        sqlx::query("DELETE FROM alert_rule WHERE org_id = 1 AND uid = ANY($1)")
            .bind(&uids)
            .execute(store.pool())
            .await
            .unwrap();
    }
}
