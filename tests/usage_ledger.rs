//! Usage Ledger Integration Tests
//!
//! Durability and limit enforcement of the per-identity quota ledger.

use tempfile::TempDir;

use palisade::core::ledger::{LedgerError, LimitSettings, Period, UsageLedger};
use palisade::domain::CostSample;

#[tokio::test]
async fn test_usage_survives_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("usage.jsonl");

    {
        let ledger = UsageLedger::open(path.clone(), LimitSettings::default())
            .await
            .unwrap();
        for _ in 0..3 {
            let reservation = ledger
                .check_and_reserve("key-1", CostSample::new(100, 0.01))
                .await
                .unwrap();
            ledger
                .commit(&reservation, CostSample::new(100, 0.01))
                .await
                .unwrap();
        }
    }

    // A fresh process replays the journal and continues the count.
    let ledger = UsageLedger::open(path, LimitSettings::default())
        .await
        .unwrap();
    let summary = ledger.report("key-1", Period::Day).await;
    assert_eq!(summary.requests, 3);
    assert_eq!(summary.units, 300);
}

#[tokio::test]
async fn test_limits_enforced_across_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("usage.jsonl");
    let mut limits = LimitSettings::default();
    limits.daily.requests = 2;

    {
        let ledger = UsageLedger::open(path.clone(), limits).await.unwrap();
        for _ in 0..2 {
            let reservation = ledger
                .check_and_reserve("key-1", CostSample::zero())
                .await
                .unwrap();
            ledger.commit(&reservation, CostSample::zero()).await.unwrap();
        }
    }

    let ledger = UsageLedger::open(path, limits).await.unwrap();
    let err = ledger
        .check_and_reserve("key-1", CostSample::zero())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::LimitExceeded { .. }));
}

#[tokio::test]
async fn test_identities_are_isolated() {
    let temp = TempDir::new().unwrap();
    let mut limits = LimitSettings::default();
    limits.daily.cost_usd = 1.0;

    let ledger = UsageLedger::open(temp.path().join("usage.jsonl"), limits)
        .await
        .unwrap();

    let reservation = ledger
        .check_and_reserve("key-a", CostSample::new(0, 1.0))
        .await
        .unwrap();
    ledger
        .commit(&reservation, CostSample::new(0, 1.0))
        .await
        .unwrap();

    // key-a is at its cost limit; key-b is untouched.
    assert!(ledger
        .check_and_reserve("key-a", CostSample::new(0, 0.01))
        .await
        .is_err());
    assert!(ledger
        .check_and_reserve("key-b", CostSample::new(0, 0.01))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_monthly_counts_outlive_daily() {
    let temp = TempDir::new().unwrap();
    let ledger = UsageLedger::open(temp.path().join("usage.jsonl"), LimitSettings::default())
        .await
        .unwrap();

    let reservation = ledger
        .check_and_reserve("key-1", CostSample::new(50, 0.005))
        .await
        .unwrap();
    ledger
        .commit(&reservation, CostSample::new(50, 0.005))
        .await
        .unwrap();

    let day = ledger.report("key-1", Period::Day).await;
    let month = ledger.report("key-1", Period::Month).await;
    assert_eq!(day.requests, 1);
    assert_eq!(month.requests, 1);
    assert_eq!(month.limits.requests, LimitSettings::default().monthly.requests);
}
