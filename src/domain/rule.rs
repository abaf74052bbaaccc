use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::provenance::Provisionable;

/// Opaque organization identifier.
pub type OrgId = i64;

/// Resource type under which alert rule provenance is recorded.
pub const ALERT_RULE_RESOURCE_TYPE: &str = "alertRule";

/// Length of generated rule UIDs.
const SHORT_UID_LEN: usize = 14;

/// Generate a short unique identifier for a new rule.
pub fn generate_short_uid() -> String {
    let mut uid = uuid::Uuid::new_v4().simple().to_string();
    uid.truncate(SHORT_UID_LEN);
    uid
}

/// An alert rule as persisted by the rule store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Internal identifier assigned by the store on insert
    #[serde(default)]
    pub id: i64,

    pub org_id: OrgId,

    /// Unique identifier within the organization
    #[serde(default)]
    pub uid: String,

    #[serde(default)]
    pub title: String,

    /// Folder/namespace the rule lives in
    pub namespace_uid: String,

    /// Name of the rule group
    pub rule_group: String,

    /// Evaluation interval, always equal to the group interval once stored
    #[serde(default)]
    pub interval_seconds: i64,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Bumped by the store on every update
    #[serde(default)]
    pub version: i64,

    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
}

impl AlertRule {
    /// Create a rule in the given group with everything else defaulted.
    pub fn new(
        org_id: OrgId,
        namespace_uid: impl Into<String>,
        rule_group: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        AlertRule {
            id: 0,
            org_id,
            uid: String::new(),
            title: title.into(),
            namespace_uid: namespace_uid.into(),
            rule_group: rule_group.into(),
            interval_seconds: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            version: 0,
            updated: Utc::now(),
        }
    }

    /// A rule reference carrying only its key.
    pub fn stub(org_id: OrgId, uid: impl Into<String>) -> Self {
        AlertRule {
            uid: uid.into(),
            ..AlertRule::new(org_id, "", "", "")
        }
    }

    /// The group this rule belongs to.
    pub fn group_key(&self) -> RuleGroupKey {
        RuleGroupKey::new(self.org_id, &self.namespace_uid, &self.rule_group)
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl Provisionable for AlertRule {
    fn resource_type(&self) -> &'static str {
        ALERT_RULE_RESOURCE_TYPE
    }

    fn resource_id(&self) -> &str {
        &self.uid
    }
}

/// Key of a rule group. Groups are not stored; they are derived from member rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleGroupKey {
    pub org_id: OrgId,
    pub namespace_uid: String,
    pub rule_group: String,
}

impl RuleGroupKey {
    pub fn new(org_id: OrgId, namespace_uid: &str, rule_group: &str) -> Self {
        RuleGroupKey {
            org_id,
            namespace_uid: namespace_uid.to_string(),
            rule_group: rule_group.to_string(),
        }
    }

    /// Check whether a rule belongs to this group.
    pub fn contains(&self, rule: &AlertRule) -> bool {
        rule.org_id == self.org_id
            && rule.namespace_uid == self.namespace_uid
            && rule.rule_group == self.rule_group
    }
}

impl fmt::Display for RuleGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (org {})",
            self.namespace_uid, self.rule_group, self.org_id
        )
    }
}

/// Filter for listing alert rules.
#[derive(Debug, Clone, Default)]
pub struct ListAlertRulesQuery {
    pub org_id: OrgId,

    /// Empty matches every namespace
    pub namespace_uids: Vec<String>,

    /// Empty matches every group
    pub rule_group: String,
}

impl ListAlertRulesQuery {
    /// Query matching every rule of one group.
    pub fn for_group(key: &RuleGroupKey) -> Self {
        ListAlertRulesQuery {
            org_id: key.org_id,
            namespace_uids: vec![key.namespace_uid.clone()],
            rule_group: key.rule_group.clone(),
        }
    }

    pub fn matches(&self, rule: &AlertRule) -> bool {
        rule.org_id == self.org_id
            && (self.namespace_uids.is_empty() || self.namespace_uids.contains(&rule.namespace_uid))
            && (self.rule_group.is_empty() || self.rule_group == rule.rule_group)
    }
}

/// A staged rule update, carrying the stored record so the store can diff it.
#[derive(Debug, Clone)]
pub struct UpdateRule {
    pub existing: AlertRule,
    pub new: AlertRule,
}

/// Validate a rule group interval against the scheduler base interval.
///
/// A valid interval is a positive integer multiple of the base interval.
pub fn validate_rule_group_interval(
    interval_seconds: i64,
    base_interval_seconds: i64,
) -> Result<(), String> {
    if base_interval_seconds <= 0 {
        return Err(format!(
            "base interval must be positive, got {}s",
            base_interval_seconds
        ));
    }
    if interval_seconds <= 0 || interval_seconds % base_interval_seconds != 0 {
        return Err(format!(
            "interval ({}s) should be non-zero and divided exactly by scheduler interval: {}s",
            interval_seconds, base_interval_seconds
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_validation() {
        assert!(validate_rule_group_interval(10, 10).is_ok());
        assert!(validate_rule_group_interval(60, 10).is_ok());

        assert!(validate_rule_group_interval(0, 10).is_err());
        assert!(validate_rule_group_interval(-20, 10).is_err());
        assert!(validate_rule_group_interval(5, 10).is_err());
        assert!(validate_rule_group_interval(65, 10).is_err());
        assert!(validate_rule_group_interval(60, 0).is_err());
    }

    #[test]
    fn test_short_uid() {
        let a = generate_short_uid();
        let b = generate_short_uid();

        assert_eq!(a.len(), SHORT_UID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_group_query_matching() {
        let key = RuleGroupKey::new(1, "ns", "g1");
        let query = ListAlertRulesQuery::for_group(&key);

        let member = AlertRule::new(1, "ns", "g1", "a");
        let other_group = AlertRule::new(1, "ns", "g2", "b");
        let other_org = AlertRule::new(2, "ns", "g1", "c");

        assert!(query.matches(&member));
        assert!(key.contains(&member));
        assert!(!query.matches(&other_group));
        assert!(!query.matches(&other_org));
    }

    #[test]
    fn test_rule_deserialization_defaults() {
        let json = r#"{
            "org_id": 1,
            "namespace_uid": "folder-a",
            "rule_group": "cpu",
            "title": "High CPU",
            "labels": {"team": "infra"}
        }"#;

        let rule: AlertRule = serde_json::from_str(json).unwrap();

        assert_eq!(rule.uid, "");
        assert_eq!(rule.interval_seconds, 0);
        assert_eq!(rule.labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(rule.resource_type(), ALERT_RULE_RESOURCE_TYPE);
    }
}
