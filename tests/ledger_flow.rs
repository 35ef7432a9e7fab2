mod support;

use std::sync::Arc;

use chrono::{TimeDelta, TimeZone, Utc};
use easyearn_ledger::types::{INTENT_KEY, INVESTMENTS_KEY, REQUESTS_KEY, USERS_KEY};
use easyearn_ledger::{
    InvestmentStatus, Ledger, LedgerError, MemoryStore, NewPaymentRequest, NewUser, PaymentStatus,
    StatusFilter,
};
use rust_decimal::Decimal;
use serde_json::json;
use serde_json::value::RawValue;
use support::{Interleaved, open, seeded_store, settings, stored};

fn ids(requests: &[easyearn_ledger::PaymentRequest]) -> Vec<&str> {
    requests.iter().map(|r| r.id.as_str()).collect()
}

#[tokio::test]
async fn approve_credits_balance_and_activates_plan() {
    let store = seeded_store();
    let mut ledger = open(&store).await;
    let now = Utc.with_ymd_and_hms(2024, 3, 2, 9, 30, 0).unwrap();

    let approval = ledger.approve_at("1001", now).await.unwrap();

    assert_eq!(approval.request.status, PaymentStatus::Approved);
    assert_eq!(approval.balance, Decimal::from(500));
    assert_eq!(approval.investment.user_id, "u1");
    assert_eq!(approval.investment.plan_id, "p1");
    assert_eq!(approval.investment.request_id.as_deref(), Some("1001"));
    assert_eq!(approval.investment.status, InvestmentStatus::Active);
    assert_eq!(approval.investment.purchase_date.parse(), Some(now));
    assert_eq!(
        approval.investment.expiry_date.parse(),
        Some(now + TimeDelta::days(30))
    );

    let requests = stored(&store, REQUESTS_KEY);
    assert_eq!(requests[0]["status"], json!("approved"));
    assert_eq!(requests[1]["status"], json!("pending"));
    let investments = stored(&store, INVESTMENTS_KEY);
    assert_eq!(investments.as_array().unwrap().len(), 1);
    assert_eq!(investments[0]["userId"], json!("u1"));
    assert_eq!(investments[0]["amount"], json!(500));
    assert_eq!(investments[0]["purchaseDate"], json!("2024-03-02T09:30:00.000Z"));
    let users = stored(&store, USERS_KEY);
    assert_eq!(users[0]["balance"], json!("500"));
    assert_eq!(users[0]["referralCode"], json!("ASHA01"));
    assert_eq!(users[1]["balance"], json!("0"));
    assert_eq!(store.value(INTENT_KEY), None);
}

#[tokio::test]
async fn approve_unknown_request_is_not_found_and_changes_nothing() {
    let store = seeded_store();
    let mut ledger = open(&store).await;
    let before = store.snapshot();

    let err = ledger.approve("nonexistent").await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(store.snapshot(), before);
    assert!(ledger.investments_for("u1").is_empty());
    assert_eq!(ledger.balance("u1").unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn approving_twice_does_not_double_credit() {
    let store = seeded_store();
    let mut ledger = open(&store).await;
    ledger.approve("1001").await.unwrap();
    let after_first = store.snapshot();

    let err = ledger.approve("1001").await.unwrap_err();

    assert!(matches!(
        err,
        LedgerError::InvalidState {
            status: PaymentStatus::Approved,
            ..
        }
    ));
    assert_eq!(store.snapshot(), after_first);
    assert_eq!(ledger.balance("u1").unwrap(), Decimal::from(500));
    assert_eq!(ledger.investments_for("u1").len(), 1);
}

#[tokio::test]
async fn reject_changes_only_the_request_status() {
    let store = seeded_store();
    let mut ledger = open(&store).await;
    let before = store.snapshot();

    let rejected = ledger.reject("1002").await.unwrap();

    assert_eq!(rejected.status, PaymentStatus::Rejected);
    let after = store.snapshot();
    assert_eq!(after[USERS_KEY], before[USERS_KEY]);
    assert_eq!(after.get(INVESTMENTS_KEY), None);

    let mut expected: serde_json::Value = serde_json::from_str(&before[REQUESTS_KEY]).unwrap();
    expected[1]["status"] = json!("rejected");
    assert_eq!(stored(&store, REQUESTS_KEY), expected);

    let err = ledger.approve("1002").await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState { .. }));
}

#[tokio::test]
async fn filters_keep_insertion_order() {
    let store = seeded_store();
    let mut ledger = open(&store).await;
    ledger.approve("1002").await.unwrap();
    ledger.reject("1003").await.unwrap();

    assert_eq!(
        ids(&ledger.list_requests(StatusFilter::All)),
        ["1001", "1002", "1003"]
    );
    assert_eq!(
        ids(&ledger.list_requests(StatusFilter::Only(PaymentStatus::Pending))),
        ["1001"]
    );
    assert_eq!(
        ids(&ledger.list_requests(StatusFilter::Only(PaymentStatus::Approved))),
        ["1002"]
    );
    assert_eq!(
        ids(&ledger.list_requests(StatusFilter::Only(PaymentStatus::Rejected))),
        ["1003"]
    );
}

#[tokio::test]
async fn write_failure_at_any_step_leaves_everything_unchanged() {
    // writes of one approval: intent, requests, investments, users, intent delete
    for failing_write in 0..5 {
        let store = seeded_store();
        let mut ledger = open(&store).await;
        let before = store.snapshot();
        store.inject_write_failures(failing_write, 2);

        let err = ledger.approve("1001").await.unwrap_err();

        assert!(
            matches!(err, LedgerError::PersistenceFailure(_)),
            "write {failing_write}: {err}"
        );
        assert_eq!(store.snapshot(), before, "write {failing_write}");
        assert_eq!(
            ledger.get_request("1001").unwrap().status,
            PaymentStatus::Pending
        );
        assert_eq!(ledger.balance("u1").unwrap(), Decimal::ZERO);
        assert!(ledger.investments_for("u1").is_empty());

        let approval = ledger.approve("1001").await.unwrap();
        assert_eq!(approval.balance, Decimal::from(500));
    }
}

#[tokio::test]
async fn transient_write_failure_is_retried() {
    let store = seeded_store();
    let mut ledger = open(&store).await;
    store.inject_write_failures(2, 1);

    let approval = ledger.approve("1001").await.unwrap();

    assert_eq!(approval.balance, Decimal::from(500));
    assert_eq!(stored(&store, USERS_KEY)[0]["balance"], json!("500"));
}

#[tokio::test]
async fn interrupted_commit_is_rolled_back_on_open() {
    let store = seeded_store();
    let before = store.snapshot();
    let mut ledger = open(&store).await;
    // requests is written, investments fails, and so does the rollback
    store.inject_write_failures(2, 100);

    let err = ledger.approve("1001").await.unwrap_err();
    assert!(matches!(err, LedgerError::PersistenceFailure(_)));
    assert!(store.value(INTENT_KEY).is_some());

    store.inject_write_failures(0, 0);
    let reopened = open(&store).await;

    assert_eq!(store.snapshot(), before);
    assert_eq!(
        reopened.get_request("1001").unwrap().status,
        PaymentStatus::Pending
    );

    // the failed ledger reloads before its next transition
    let approval = ledger.approve("1001").await.unwrap();
    assert_eq!(approval.balance, Decimal::from(500));
}

#[tokio::test]
async fn second_ledger_sees_other_writers_changes() {
    let store = seeded_store();
    let mut first = open(&store).await;
    let mut second = open(&store).await;

    first.approve("1001").await.unwrap();
    assert!(second.refresh().await.unwrap());
    assert_eq!(
        second.get_request("1001").unwrap().status,
        PaymentStatus::Approved
    );
    assert!(!second.refresh().await.unwrap());

    first.reject("1003").await.unwrap();
    second.approve("1002").await.unwrap();

    let users = stored(&store, USERS_KEY);
    assert_eq!(users[0]["balance"], json!("500"));
    assert_eq!(users[1]["balance"], json!("250"));
    assert_eq!(
        second.get_request("1003").unwrap().status,
        PaymentStatus::Rejected
    );
    assert!(second.audit().is_clean());
}

#[tokio::test]
async fn conflicting_write_reloads_before_the_next_call() {
    let store = seeded_store();
    let other = open(&store).await;
    // the other ledger approves 1001 just before this one writes its intent
    let shared = Interleaved::new(&store, INTENT_KEY, move || async move {
        let mut other = other;
        other.approve("1001").await.unwrap();
    });
    let mut ledger = Ledger::open(shared, settings()).await.unwrap();

    let err = ledger.approve("1002").await.unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));
    assert_eq!(store.value(INTENT_KEY), None);

    ledger.approve("1002").await.unwrap();

    assert_eq!(
        ledger.get_request("1001").unwrap().status,
        PaymentStatus::Approved
    );
    assert_eq!(ledger.balance("u1").unwrap(), Decimal::from(500));
    assert_eq!(ledger.balance("u2").unwrap(), Decimal::from(250));
    assert!(ledger.audit().is_clean());
}

#[tokio::test]
async fn reconcile_during_approval_never_leaves_it_half_applied() {
    let store = seeded_store();
    let before = store.snapshot();
    // another instance starts up between the approval's investment and user writes
    let inner = store.clone();
    let shared = Interleaved::new(&store, USERS_KEY, move || async move {
        Ledger::open(inner, settings()).await.unwrap();
    });
    let mut ledger = Ledger::open(shared, settings()).await.unwrap();

    let err = ledger.approve("1001").await.unwrap_err();

    assert!(matches!(err, LedgerError::Conflict(_)));
    assert_eq!(store.snapshot(), before);
    let reopened = open(&store).await;
    assert_eq!(
        reopened.get_request("1001").unwrap().status,
        PaymentStatus::Pending
    );
    assert!(reopened.investments_for("u1").is_empty());
    assert!(reopened.audit().is_clean());

    let approval = ledger.approve("1001").await.unwrap();
    assert_eq!(approval.balance, Decimal::from(500));
    assert_eq!(ledger.investments_for("u1").len(), 1);
    assert!(ledger.audit().is_clean());
}

#[tokio::test]
async fn reject_leaves_other_records_byte_for_byte() {
    let requests = concat!(
        r#"[{"id":"1001","userId":"u1","userName":null,"planId":"p1","planName":"Starter","#,
        r#""amount":500,"transactionId":"UTR-1001","date":"2024-03-01T10:00:00.000Z","#,
        r#""status":"pending"},"#,
        r#"{"status":"pending","id":"1002","userId":"u2","userName":"Ravi","planId":"p1","#,
        r#""planName":"Starter","amount":"250.50","transactionId":"UTR-1002","#,
        r#""date":"3/1/2024","screenshot":"data:image/png;base64,AAAA"}]"#
    );
    let users = r#"[{"id":"u1","balance":"0"},{"id":"u2","balance":"0"}]"#;
    let store = Arc::new(MemoryStore::seeded([
        (REQUESTS_KEY, requests),
        (USERS_KEY, users),
    ]));
    let mut ledger = open(&store).await;

    ledger.reject("1001").await.unwrap();

    let after = store.value(REQUESTS_KEY).unwrap();
    assert_eq!(after, requests.replacen("pending", "rejected", 1));
    let before_items: Vec<Box<RawValue>> = serde_json::from_str(requests).unwrap();
    let after_items: Vec<Box<RawValue>> = serde_json::from_str(&after).unwrap();
    assert_eq!(after_items[1].get(), before_items[1].get());
    assert_eq!(store.value(USERS_KEY).as_deref(), Some(users));

    // the unparseable date does not block approving its request
    let approval = ledger.approve("1002").await.unwrap();
    assert_eq!(approval.balance, Decimal::new(25050, 2));
    assert_eq!(approval.request.date.as_str(), "3/1/2024");
}

#[tokio::test]
async fn submitted_request_can_be_approved() {
    let store = Arc::new(MemoryStore::new());
    let mut ledger = Ledger::open(store.clone(), settings()).await.unwrap();

    let user = ledger
        .register_user(NewUser {
            id: Some("u3".into()),
            name: Some("Meera".into()),
            email: Some("meera@example.com".into()),
        })
        .await
        .unwrap();
    let request = ledger
        .submit_request(NewPaymentRequest {
            user_id: user.id.clone(),
            plan_id: "p2".into(),
            plan_name: "Gold".into(),
            amount: Decimal::new(30050, 2),
            transaction_id: "UTR-9".into(),
        })
        .await
        .unwrap();

    assert_eq!(request.status, PaymentStatus::Pending);
    assert_eq!(request.user_email(), Some("meera@example.com"));
    assert_eq!(
        ids(&ledger.list_requests(StatusFilter::Only(PaymentStatus::Pending))),
        [request.id.as_str()]
    );

    ledger.approve(&request.id).await.unwrap();

    assert_eq!(ledger.balance("u3").unwrap(), Decimal::new(30050, 2));
    assert_eq!(ledger.investments_for("u3").len(), 1);
    assert!(ledger.audit().is_clean());

    let reopened = Ledger::open(store, settings()).await.unwrap();
    assert_eq!(reopened.balance("u3").unwrap(), Decimal::new(30050, 2));
}

#[tokio::test]
async fn submit_validates_input() {
    let store = seeded_store();
    let mut ledger = open(&store).await;
    let new = |user_id: &str, amount: i64, transaction_id: &str| NewPaymentRequest {
        user_id: user_id.into(),
        plan_id: "p1".into(),
        plan_name: "Starter".into(),
        amount: Decimal::from(amount),
        transaction_id: transaction_id.into(),
    };

    assert!(matches!(
        ledger.submit_request(new("u1", 0, "T9")).await,
        Err(LedgerError::InvalidInput(_))
    ));
    assert!(matches!(
        ledger.submit_request(new("u1", 10, "  ")).await,
        Err(LedgerError::InvalidInput(_))
    ));
    assert!(matches!(
        ledger.submit_request(new("nobody", 10, "T9")).await,
        Err(LedgerError::UserNotFound(_))
    ));
    let existing = NewUser {
        id: Some("u1".into()),
        name: None,
        email: None,
    };
    assert!(matches!(
        ledger.register_user(existing).await,
        Err(LedgerError::Duplicate(_))
    ));
}
