use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use ruleprov::domain::{AlertRule, Provenance};
use ruleprov::provisioning::{AlertRuleProvisioning, RuleProvisioningService};
use ruleprov::storage::MemoryStore;

type MemoryService = RuleProvisioningService<MemoryStore, MemoryStore, MemoryStore>;

fn create_service() -> MemoryService {
    let store = MemoryStore::new();
    RuleProvisioningService::new(store.clone(), store.clone(), store, 60, 10)
}

fn create_test_rule(group: &str, title: &str) -> AlertRule {
    AlertRule::new(1, "bench-folder", group, title)
        .with_label("team", "infra")
        .with_label("severity", "warning")
}

fn bench_create_rule(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let service = create_service();
    let service = &service;

    c.bench_function("create_and_delete_rule_unmanaged", |b| {
        b.to_async(&rt).iter(move || async move {
            let rule = service
                .create_alert_rule(
                    black_box(create_test_rule("bench-group", "rule")),
                    Provenance::None,
                )
                .await
                .unwrap();
            service
                .delete_alert_rule(1, &rule.uid, Provenance::None)
                .await
                .unwrap()
        })
    });
}

fn bench_update_rule(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let service = create_service();

    let rule = rt
        .block_on(
            service.create_alert_rule(create_test_rule("update-group", "rule"), Provenance::Api),
        )
        .unwrap();

    let service = &service;
    let rule = &rule;

    c.bench_function("update_rule_provisioned", |b| {
        b.to_async(&rt).iter(move || async move {
            service
                .update_alert_rule(black_box(rule.clone()), Provenance::Api)
                .await
                .unwrap()
        })
    });
}

fn bench_update_rule_group(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let service = create_service();

    rt.block_on(async {
        for i in 0..50 {
            service
                .create_alert_rule(
                    create_test_rule("wide-group", &format!("rule-{}", i)),
                    Provenance::None,
                )
                .await
                .unwrap();
        }
    });

    let mut interval = 60;
    c.bench_function("update_rule_group_50_rules", |b| {
        b.iter(|| {
            interval = if interval == 60 { 120 } else { 60 };
            rt.block_on(service.update_rule_group(
                1,
                "bench-folder",
                "wide-group",
                black_box(interval),
            ))
            .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_create_rule,
    bench_update_rule,
    bench_update_rule_group,
);

criterion_main!(benches);
