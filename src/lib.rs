pub mod api;
pub mod config;
pub mod domain;
pub mod observability;
pub mod provisioning;
pub mod storage;

pub use config::Config;
pub use domain::{AlertRule, Provenance, RuleGroupKey};
pub use provisioning::{AlertRuleProvisioning, ProvisioningError, RuleProvisioningService};
