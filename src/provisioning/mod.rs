pub mod error;
pub mod service;

pub use error::{ErrorKind, ProvisioningError};
pub use service::{AlertRuleProvisioning, RuleProvisioningService};
