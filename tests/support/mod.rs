#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use easyearn_ledger::journal::RetryPolicy;
use easyearn_ledger::store::StoreResult;
use easyearn_ledger::types::{REQUESTS_KEY, USERS_KEY};
use easyearn_ledger::{KvStore, Ledger, LedgerSettings, MemoryStore, Versioned};
use serde_json::{Value, json};

/// Fast retries, and any open intent counts as abandoned.
pub fn settings() -> LedgerSettings {
    LedgerSettings {
        intent_timeout: TimeDelta::zero(),
        retry: RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        },
        ..LedgerSettings::default()
    }
}

pub fn pending_request(id: &str, user_id: &str, amount: Value) -> Value {
    json!({
        "id": id,
        "userId": user_id,
        "userName": "Asha",
        "userEmail": "asha@example.com",
        "planId": "p1",
        "planName": "Starter",
        "amount": amount,
        "transactionId": format!("UTR-{id}"),
        "date": "2024-03-01T10:00:00.000Z",
        "status": "pending"
    })
}

/// Store holding requests 1001 (u1, 500), 1002 (u2, 250) and 1003 (u1, 100),
/// all pending, and users u1 and u2 with zero balance.
pub fn seeded_store() -> Arc<MemoryStore> {
    let requests = json!([
        pending_request("1001", "u1", json!(500)),
        pending_request("1002", "u2", json!("250")),
        pending_request("1003", "u1", json!(100)),
    ]);
    let users = json!([
        {"id": "u1", "name": "Asha", "balance": "0", "referralCode": "ASHA01"},
        {"id": "u2", "name": "Ravi", "balance": "0"}
    ]);
    Arc::new(MemoryStore::seeded([
        (REQUESTS_KEY, requests.to_string()),
        (USERS_KEY, users.to_string()),
    ]))
}

pub async fn open(store: &Arc<MemoryStore>) -> Ledger {
    Ledger::open(store.clone(), settings())
        .await
        .expect("open ledger")
}

pub fn stored(store: &MemoryStore, key: &str) -> Value {
    store
        .value(key)
        .map(|v| serde_json::from_str(&v).expect("stored json"))
        .unwrap_or(Value::Null)
}

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Shares a [`MemoryStore`] and runs a hook just before the first put to one
/// key, so another writer's work lands between two steps of a commit.
pub struct Interleaved {
    inner: Arc<MemoryStore>,
    key: &'static str,
    hook: Mutex<Option<Hook>>,
}

impl Interleaved {
    pub fn new<F, Fut>(inner: &Arc<MemoryStore>, key: &'static str, hook: F) -> Arc<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || Box::pin(hook()));
        Arc::new(Self {
            inner: inner.clone(),
            key,
            hook: Mutex::new(Some(hook)),
        })
    }
}

#[async_trait]
impl KvStore for Interleaved {
    async fn get(&self, key: &str) -> StoreResult<Versioned> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &str, expected: u64) -> StoreResult<u64> {
        let hook = if key == self.key {
            self.hook.lock().unwrap().take()
        } else {
            None
        };
        if let Some(hook) = hook {
            hook().await;
        }
        self.inner.put(key, value, expected).await
    }

    async fn delete(&self, key: &str, expected: u64) -> StoreResult<u64> {
        self.inner.delete(key, expected).await
    }
}
