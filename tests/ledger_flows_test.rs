//! Credit ledger flows through the admin surface and the ledger engine.

use chrono::{Duration, Utc};
use futures::future::join_all;
use ledgerlink::ledger::{
    BonusRequest, ConsumeOutcome, GrantStatus, LedgerStore, SubscriptionGrantRequest,
    TransactionKind,
};
use ledgerlink::testing::{TestHarness, UserFixture};

#[tokio::test]
async fn test_consume_reports_remaining_balance() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    h.ledger()
        .grant_bonus(BonusRequest::new(&user.id, 10, "welcome"))
        .await
        .unwrap();

    let result = h.admin.consume(&user.id, 5, "report export").await;

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["balance"], 5);

    let history = h.ledger().history(&user.id).await.unwrap();
    assert_eq!(history.len(), 2);
    let last = history.last().unwrap();
    assert_eq!(last.amount, -5);
    assert_eq!(last.balance_after, 5);
    assert_eq!(last.kind, TransactionKind::Consumption);
}

#[tokio::test]
async fn test_insufficient_balance_writes_nothing() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    h.ledger()
        .grant_bonus(BonusRequest::new(&user.id, 3, "welcome"))
        .await
        .unwrap();

    let outcome = h.ledger().consume(&user.id, 4, "too much").await.unwrap();
    assert_eq!(
        outcome,
        ConsumeOutcome::InsufficientBalance {
            balance: 3,
            required: 4
        }
    );

    let result = h.admin.consume(&user.id, 4, "too much").await;
    assert!(!result.success);
    assert_eq!(result.code(), Some("insufficient_balance"));

    assert_eq!(h.ledger().balance(&user.id).await.unwrap().balance, 3);
    assert_eq!(h.ledger().history(&user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_signup_bonus_is_granted_once() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    let key = format!("signup_{}", user.id);

    let first = h
        .admin
        .grant_bonus(&user.id, 25, "signup bonus", Some(&key))
        .await;
    let second = h
        .admin
        .grant_bonus(&user.id, 25, "signup bonus", Some(&key))
        .await;

    assert!(first.success);
    assert!(second.success);
    let first = first.data().unwrap();
    let second = second.data().unwrap();
    assert_eq!(first.transaction_id, second.transaction_id);
    assert_eq!(first.balance, second.balance);
    assert!(!first.duplicate);
    assert!(second.duplicate);

    let history = h.ledger().history(&user.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(h.ledger().balance(&user.id).await.unwrap().balance, 25);
}

#[tokio::test]
async fn test_lapsed_grant_expires_remaining_credits() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    let now = Utc::now();

    h.ledger()
        .open_subscription_grant(SubscriptionGrantRequest {
            user_id: user.id.clone(),
            subscription_ref: "sub_lapsed".to_string(),
            credits: 3,
            starts_at: now - Duration::days(31),
            ends_at: now - Duration::days(1),
            description: "Subscription sub_lapsed credits".to_string(),
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();

    let summary = h.ledger().expire_grants(now).await.unwrap();
    assert_eq!(summary.expired_count, 1);
    assert_eq!(summary.recovered_credits, 3);
    assert_eq!(summary.warnings, 0);

    let history = h.ledger().history(&user.id).await.unwrap();
    let expiry = history.last().unwrap();
    assert_eq!(expiry.kind, TransactionKind::Expiry);
    assert_eq!(expiry.amount, -3);
    assert_eq!(expiry.balance_after, 0);

    let grants = h.store.list_grants(&user.id).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].status, GrantStatus::Expired);
    assert_eq!(grants[0].remaining_credits, 0);

    // A second sweep finds nothing left to do.
    let again = h.ledger().expire_grants(now).await.unwrap();
    assert_eq!(again.expired_count, 0);
    assert_eq!(h.ledger().history(&user.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_expiry_after_spending_is_clamped() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    let now = Utc::now();

    h.ledger()
        .open_subscription_grant(SubscriptionGrantRequest {
            user_id: user.id.clone(),
            subscription_ref: "sub_spent".to_string(),
            credits: 10,
            starts_at: now - Duration::days(30),
            ends_at: now + Duration::days(1),
            description: "Subscription sub_spent credits".to_string(),
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();
    h.ledger().consume(&user.id, 4, "usage").await.unwrap();

    // The window closes with 6 credits left on the grant.
    let summary = h
        .ledger()
        .expire_grants(now + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(summary.recovered_credits, 6);
    assert_eq!(h.ledger().balance(&user.id).await.unwrap().balance, 0);
    assert!(h.ledger().verify(&user.id).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_concurrent_consumes_never_overdraw() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    h.ledger()
        .grant_bonus(BonusRequest::new(&user.id, 10, "welcome"))
        .await
        .unwrap();

    let attempts = (0..25).map(|i| {
        let ledger = h.ledger();
        let user_id = user.id.clone();
        async move {
            ledger
                .consume(&user_id, 1, &format!("call {}", i))
                .await
                .unwrap()
        }
    });
    let outcomes = join_all(attempts).await;

    let consumed = outcomes.iter().filter(|o| o.is_consumed()).count();
    assert_eq!(consumed, 10);

    let balance = h.ledger().balance(&user.id).await.unwrap();
    assert_eq!(balance.balance, 0);
    assert_eq!(balance.total_consumed, 10);
    assert_eq!(h.ledger().history(&user.id).await.unwrap().len(), 11);
}

#[tokio::test]
async fn test_transaction_log_matches_balance() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    let now = Utc::now();

    h.ledger()
        .grant_bonus(BonusRequest::new(&user.id, 20, "welcome"))
        .await
        .unwrap();
    h.ledger()
        .open_subscription_grant(SubscriptionGrantRequest {
            user_id: user.id.clone(),
            subscription_ref: "sub_mix".to_string(),
            credits: 50,
            starts_at: now - Duration::days(1),
            ends_at: now + Duration::days(29),
            description: "Subscription sub_mix credits".to_string(),
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();
    for amount in [7, 13, 30] {
        h.ledger().consume(&user.id, amount, "usage").await.unwrap();
    }

    let history = h.ledger().history(&user.id).await.unwrap();
    let mut running = 0;
    for tx in &history {
        running += tx.amount;
        assert_eq!(tx.balance_after, running);
        assert!(tx.balance_after >= 0);
    }

    let balance = h.ledger().balance(&user.id).await.unwrap();
    assert_eq!(balance.balance, running);
    assert_eq!(balance.balance, 20);
    assert_eq!(
        balance.balance,
        balance.total_recharged - balance.total_consumed
    );

    let report = h.admin.balance(&user.id).await;
    let report = report.data().unwrap();
    assert!(report.verification.is_consistent());
    // Grant credits are spent first.
    assert_eq!(report.grants[0].remaining_credits, 0);
}

#[tokio::test]
async fn test_expiry_sweep_racing_consumes_keeps_balance_sound() {
    let h = TestHarness::new();
    let user = UserFixture::new().insert(&h.store);
    let now = Utc::now();

    h.ledger()
        .grant_bonus(BonusRequest::new(&user.id, 20, "welcome"))
        .await
        .unwrap();
    h.ledger()
        .open_subscription_grant(SubscriptionGrantRequest {
            user_id: user.id.clone(),
            subscription_ref: "sub_racing".to_string(),
            credits: 30,
            starts_at: now - Duration::days(30),
            ends_at: now + Duration::hours(1),
            description: "Subscription sub_racing credits".to_string(),
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();

    let consumes = join_all((0..12).map(|i| {
        let ledger = h.ledger();
        let user_id = user.id.clone();
        async move {
            ledger
                .consume(&user_id, 5, &format!("call {}", i))
                .await
                .unwrap()
        }
    }));
    let sweep = h.ledger().expire_grants(now + Duration::hours(2));
    let (outcomes, summary) = futures::join!(consumes, sweep);
    let summary = summary.unwrap();

    assert_eq!(summary.expired_count, 1);
    let consumed = outcomes.iter().filter(|o| o.is_consumed()).count() as i64;

    let balance = h.ledger().balance(&user.id).await.unwrap();
    assert!(balance.balance >= 0);
    assert_eq!(consumed * 5 + summary.recovered_credits + balance.balance, 50);
    assert!(h.ledger().verify(&user.id).await.unwrap().is_consistent());

    let grants = h.store.list_grants(&user.id).await.unwrap();
    assert_eq!(grants[0].status, GrantStatus::Expired);
    assert_eq!(grants[0].remaining_credits, 0);

    let mut running = 0;
    for tx in h.ledger().history(&user.id).await.unwrap() {
        running += tx.amount;
        assert_eq!(tx.balance_after, running);
        assert!(tx.balance_after >= 0);
    }
    assert_eq!(running, balance.balance);
}
