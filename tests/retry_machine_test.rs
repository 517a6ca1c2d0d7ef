//! End-to-end tests for the charge retry state machine.

use std::sync::Arc;
use std::time::Duration;

use rebill::billing::{InMemorySubscriptionStore, MockPaymentGateway, ScriptedCharge};
use rebill::{
    BillingConfig, BillingScheduler, BillingWorker, BillingWorkerHandle, SubscriptionManager,
    SubscriptionStatus, SubscriptionStore,
};
use uuid::Uuid;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Create a subscription through the public lifecycle API and pull its
/// billing date into the past so the next tick selects it.
async fn provision_due_subscription(
    store: &InMemorySubscriptionStore,
    plan: &str,
) -> rebill::StoredSubscription {
    let manager = SubscriptionManager::new(store.clone(), BillingConfig::default());
    let sub = manager
        .create_subscription(Uuid::new_v4(), plan)
        .await
        .unwrap();

    let mut row = store.get_subscription(sub.id).await.unwrap().unwrap();
    row.next_billing_date = current_timestamp().saturating_sub(60);
    store.save_subscription(&row).await.unwrap();
    row
}

#[tokio::test]
async fn test_three_failed_charges_demote_to_delinquent() {
    let store = InMemorySubscriptionStore::new();
    let gateway = MockPaymentGateway::new();
    gateway.decline_charges();
    let sub = provision_due_subscription(&store, "PROFISSIONAL").await;
    let scheduler = BillingScheduler::new(store.clone(), gateway.clone(), BillingConfig::default());

    // Two failures leave the row ACTIVE with attempts counted.
    for expected_attempts in 1..=2 {
        let summary = scheduler.process_billing_cycle().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.demoted, 0);

        let row = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(row.attempt_count, expected_attempts);
        assert_eq!(row.status, SubscriptionStatus::Active);
    }

    // The third failure exhausts the budget.
    let summary = scheduler.process_billing_cycle().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.demoted, 1);

    let row = store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(row.attempt_count, 3);
    assert_eq!(row.status, SubscriptionStatus::Delinquent);

    // Delinquent rows are dead to the scheduler.
    let summary = scheduler.process_billing_cycle().await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(gateway.charge_calls().len(), 3);
}

#[tokio::test]
async fn test_two_failures_then_success_resets_budget() {
    let store = InMemorySubscriptionStore::new();
    let gateway = MockPaymentGateway::new();
    gateway.script_charges([
        ScriptedCharge::Decline,
        ScriptedCharge::Decline,
        ScriptedCharge::Approve,
    ]);
    let sub = provision_due_subscription(&store, "PROFISSIONAL").await;
    let scheduler = BillingScheduler::new(store.clone(), gateway.clone(), BillingConfig::default());

    scheduler.process_billing_cycle().await.unwrap();
    scheduler.process_billing_cycle().await.unwrap();
    let row = store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(row.attempt_count, 2);
    assert_eq!(row.status, SubscriptionStatus::Active);

    let summary = scheduler.process_billing_cycle().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let row = store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(row.attempt_count, 0);
    assert_eq!(row.status, SubscriptionStatus::Active);
    assert!(row.next_billing_date > current_timestamp());

    // Every attempt charged the full plan price.
    let calls = gateway.charge_calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.amount_cents == 4_990));
}

#[tokio::test]
async fn test_gateway_outage_burns_one_attempt_then_recovers() {
    let store = InMemorySubscriptionStore::new();
    let gateway = MockPaymentGateway::new();
    gateway.script_charges([ScriptedCharge::Error, ScriptedCharge::Approve]);
    let sub = provision_due_subscription(&store, "PESSOAL").await;
    let scheduler = BillingScheduler::new(store.clone(), gateway.clone(), BillingConfig::default());

    scheduler.process_billing_cycle().await.unwrap();
    let row = store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.status, SubscriptionStatus::Active);

    let summary = scheduler.process_billing_cycle().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    let row = store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(row.attempt_count, 0);
}

#[tokio::test]
async fn test_lifetime_tier_never_selected_by_tick() {
    let store = InMemorySubscriptionStore::new();
    let gateway = MockPaymentGateway::new();
    let manager = SubscriptionManager::new(store.clone(), BillingConfig::default());
    manager
        .create_subscription(Uuid::new_v4(), "PROFISSIONAL_VITALICIO")
        .await
        .unwrap();
    let scheduler = BillingScheduler::new(store, gateway.clone(), BillingConfig::default());

    let summary = scheduler.process_billing_cycle().await.unwrap();

    assert_eq!(summary.processed, 0);
    assert!(gateway.charge_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_worker_drives_charges_and_shuts_down() {
    let store = InMemorySubscriptionStore::new();
    let gateway = MockPaymentGateway::new();
    let sub = provision_due_subscription(&store, "EMPRESARIAL").await;

    let config = BillingConfig {
        worker_interval_secs: 3_600,
        ..BillingConfig::default()
    };
    let scheduler = Arc::new(BillingScheduler::new(
        store.clone(),
        gateway.clone(),
        config.clone(),
    ));
    let (worker, shutdown_rx) = BillingWorker::new(scheduler, config);
    let shutdown_tx = worker.shutdown_sender();
    let task = tokio::spawn(worker.start(shutdown_rx));
    let handle = BillingWorkerHandle::new(task, shutdown_tx);

    // The immediate first tick picks up the due row.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.charge_calls().len(), 1);
    assert_eq!(gateway.charge_calls()[0].amount_cents, 9_990);

    let row = store.get_subscription(sub.id).await.unwrap().unwrap();
    assert!(row.next_billing_date > current_timestamp());

    handle.shutdown().await;
    assert_eq!(gateway.charge_calls().len(), 1);
}
