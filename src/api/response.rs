use serde::Serialize;

use crate::domain::{AlertRule, Provenance};

/// A rule together with its provenance.
#[derive(Debug, Serialize)]
pub struct AlertRuleResponse {
    #[serde(flatten)]
    pub rule: AlertRule,

    pub provenance: Provenance,
}

/// Result of a rule group update.
#[derive(Debug, Serialize)]
pub struct RuleGroupResponse {
    pub namespace_uid: String,
    pub rule_group: String,
    pub interval: i64,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.into(),
            code: code.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ErrorResponse::new(message, "BAD_REQUEST")
    }
}
