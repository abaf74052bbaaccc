pub mod provenance;
pub mod rule;

pub use provenance::{Provenance, ProvenanceAction, Provisionable};
pub use rule::{AlertRule, ListAlertRulesQuery, OrgId, RuleGroupKey, UpdateRule};
