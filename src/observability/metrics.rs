use std::sync::atomic::{AtomicU64, Ordering};

use crate::provisioning::ProvisioningError;

/// Provisioning operation, used as a metrics dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    UpdateGroup,
}

/// Metrics registry for the application.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Successful operations
    pub rules_created_total: AtomicU64,
    pub rules_updated_total: AtomicU64,
    pub rules_deleted_total: AtomicU64,
    pub group_updates_total: AtomicU64,

    /// Rejections by cause
    pub provenance_conflicts_total: AtomicU64,
    pub group_not_provisioned_total: AtomicU64,
    pub invalid_interval_total: AtomicU64,

    /// Requests that failed for any reason
    pub failed_requests_total: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Record a successful operation.
    pub fn record_success(&self, op: Operation) {
        let counter = match op {
            Operation::Create => &self.rules_created_total,
            Operation::Update => &self.rules_updated_total,
            Operation::Delete => &self.rules_deleted_total,
            Operation::UpdateGroup => &self.group_updates_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed operation.
    pub fn record_failure(&self, err: &ProvisioningError) {
        self.failed_requests_total.fetch_add(1, Ordering::Relaxed);

        match err {
            ProvisioningError::ProvenanceConflict { .. } => {
                self.provenance_conflicts_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            ProvisioningError::GroupNotProvisioned => {
                self.group_not_provisioned_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            ProvisioningError::InvalidInterval(_) => {
                self.invalid_interval_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP ruleprov_operations_total Successful provisioning operations
# TYPE ruleprov_operations_total counter
ruleprov_operations_total{{operation="create"}} {}
ruleprov_operations_total{{operation="update"}} {}
ruleprov_operations_total{{operation="delete"}} {}
ruleprov_operations_total{{operation="update_group"}} {}

# HELP ruleprov_rejections_total Rejected provisioning operations by cause
# TYPE ruleprov_rejections_total counter
ruleprov_rejections_total{{cause="provenance_conflict"}} {}
ruleprov_rejections_total{{cause="group_not_provisioned"}} {}
ruleprov_rejections_total{{cause="invalid_interval"}} {}

# HELP ruleprov_failed_requests_total Failed provisioning requests
# TYPE ruleprov_failed_requests_total counter
ruleprov_failed_requests_total {}
"#,
            self.rules_created_total.load(Ordering::Relaxed),
            self.rules_updated_total.load(Ordering::Relaxed),
            self.rules_deleted_total.load(Ordering::Relaxed),
            self.group_updates_total.load(Ordering::Relaxed),
            self.provenance_conflicts_total.load(Ordering::Relaxed),
            self.group_not_provisioned_total.load(Ordering::Relaxed),
            self.invalid_interval_total.load(Ordering::Relaxed),
            self.failed_requests_total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Provenance, ProvenanceAction};

    #[test]
    fn test_record_outcomes() {
        let metrics = MetricsRegistry::new();

        metrics.record_success(Operation::Create);
        metrics.record_success(Operation::Create);
        metrics.record_success(Operation::UpdateGroup);
        metrics.record_failure(&ProvisioningError::GroupNotProvisioned);
        metrics.record_failure(&ProvisioningError::ProvenanceConflict {
            action: ProvenanceAction::Update,
            stored: Provenance::Api,
            requested: Provenance::None,
        });

        assert_eq!(metrics.rules_created_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.group_updates_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failed_requests_total.load(Ordering::Relaxed), 2);
        assert_eq!(
            metrics.provenance_conflicts_total.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = MetricsRegistry::new();
        metrics.record_success(Operation::Delete);

        let output = metrics.to_prometheus();

        assert!(output.contains("ruleprov_operations_total{operation=\"delete\"} 1"));
        assert!(output.contains("ruleprov_failed_requests_total 0"));
    }
}
