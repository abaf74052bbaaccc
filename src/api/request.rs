use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{AlertRule, OrgId};

/// Body of a create or update rule request.
///
/// Rules carry no interval of their own; the interval is owned by the group.
#[derive(Debug, Serialize, Deserialize)]
pub struct AlertRuleRequest {
    /// Optional on create, ignored in favour of the path on update
    #[serde(default)]
    pub uid: String,

    pub title: String,

    pub namespace_uid: String,

    pub rule_group: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl AlertRuleRequest {
    /// Convert to a rule owned by the given organization.
    pub fn into_rule(self, org_id: OrgId) -> AlertRule {
        let mut rule = AlertRule::new(org_id, self.namespace_uid, self.rule_group, self.title)
            .with_uid(self.uid);
        rule.labels = self.labels;
        rule.annotations = self.annotations;
        rule
    }
}

/// Body of a rule group update.
#[derive(Debug, Serialize, Deserialize)]
pub struct RuleGroupRequest {
    /// Group interval in seconds
    pub interval: i64,
}
