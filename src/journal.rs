//! All-or-nothing writes across several keys of a [`KvStore`].
//!
//! A commit first records an intent holding the previous and next value of
//! every key it touches, then writes the keys, then deletes the intent.
//! Deleting the intent is the commit point. A failed commit restores the
//! previous values.
//!
//! An intent left behind by a crash or a failed rollback is rolled back by
//! [`Journal::reconcile`] once it is older than a grace period. The reconciler
//! claims the intent with a compare-and-swap before touching anything, so a
//! committer that is merely slow either reaches its commit point first (and the
//! claim fails) or finds its commit point taken and rolls itself back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::{KvStore, StoreError, StoreResult, Versioned};
use crate::types::INTENT_KEY;

/// Reads and rewrites of one key while fencing it against a racing committer.
const FENCE_ATTEMPTS: u32 = 3;

/// How often and how fast transient store failures are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// One key to write as part of a commit.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub key: String,
    /// Version the caller last saw.
    pub expected: u64,
    /// Value at `expected`, `None` if the key was absent.
    pub previous: Option<String>,
    pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentWrite {
    key: String,
    previous: Option<String>,
    next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Intent {
    id: Uuid,
    operation: String,
    subject: String,
    started_at: DateTime<Utc>,
    /// Set by the reconciler that claimed this intent.
    #[serde(default)]
    rolling_back: bool,
    writes: Vec<IntentWrite>,
}

/// A commit that did not go through.
#[derive(Debug)]
pub struct CommitFailure {
    pub error: StoreError,
    /// Current version of every touched key, after rollback.
    pub versions: HashMap<String, u64>,
    /// False when the rollback itself failed and an intent was left behind.
    pub rolled_back: bool,
}

/// What a reconciliation pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Operation named by the intent that was rolled back, if any.
    pub operation: Option<String>,
    /// Keys that had to be restored.
    pub restored: Vec<String>,
    /// An intent younger than the grace period is still open.
    pub in_flight: bool,
    /// Version of the intent slot when the pass ended.
    pub slot_version: u64,
}

pub struct Journal {
    store: Arc<dyn KvStore>,
    retry: RetryPolicy,
}

impl Journal {
    pub fn new(store: Arc<dyn KvStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    async fn retrying<T, F, Fut>(&self, op: &str, key: &str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(op, key, attempt, error = %e, "store call failed; retrying");
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Versioned> {
        self.retrying("get", key, || self.store.get(key)).await
    }

    async fn put(&self, key: &str, value: &str, expected: u64) -> StoreResult<u64> {
        self.retrying("put", key, || self.store.put(key, value, expected))
            .await
    }

    async fn delete(&self, key: &str, expected: u64) -> StoreResult<u64> {
        self.retrying("delete", key, || self.store.delete(key, expected))
            .await
    }

    /// Writes every key or none of them and returns the new versions.
    ///
    /// A single write is a plain compare-and-swap and skips the intent record.
    /// An open intent from another commit fails the call with a conflict on
    /// the intent key.
    pub async fn commit(
        &self,
        operation: &str,
        subject: &str,
        writes: Vec<PendingWrite>,
    ) -> Result<HashMap<String, u64>, CommitFailure> {
        let unchanged = |error: StoreError, writes: &[PendingWrite]| CommitFailure {
            error,
            versions: writes.iter().map(|w| (w.key.clone(), w.expected)).collect(),
            rolled_back: true,
        };

        if let [single] = writes.as_slice() {
            return match self.put(&single.key, &single.next, single.expected).await {
                Ok(version) => Ok(HashMap::from([(single.key.clone(), version)])),
                Err(e) => Err(unchanged(e, &writes)),
            };
        }

        let slot = self
            .get(INTENT_KEY)
            .await
            .map_err(|e| unchanged(e, &writes))?;
        if slot.value.is_some() {
            let busy = StoreError::Conflict {
                key: INTENT_KEY.to_string(),
                expected: slot.version,
                actual: slot.version,
            };
            return Err(unchanged(busy, &writes));
        }

        let intent = Intent {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            subject: subject.to_string(),
            started_at: Utc::now(),
            rolling_back: false,
            writes: writes
                .iter()
                .map(|w| IntentWrite {
                    key: w.key.clone(),
                    previous: w.previous.clone(),
                    next: w.next.clone(),
                })
                .collect(),
        };
        let encoded = serde_json::to_string(&intent)
            .map_err(|e| unchanged(StoreError::Backend(e.to_string()), &writes))?;
        let intent_version = self
            .put(INTENT_KEY, &encoded, slot.version)
            .await
            .map_err(|e| unchanged(e, &writes))?;

        let mut applied: Vec<(&PendingWrite, u64)> = Vec::with_capacity(writes.len());
        let mut failure = None;
        for write in &writes {
            match self.put(&write.key, &write.next, write.expected).await {
                Ok(version) => applied.push((write, version)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let error = match failure {
            None => match self.delete(INTENT_KEY, intent_version).await {
                Ok(_) => {
                    return Ok(applied
                        .into_iter()
                        .map(|(w, v)| (w.key.clone(), v))
                        .collect());
                }
                Err(e) => e,
            },
            Some(e) => e,
        };

        warn!(operation, subject, %error, applied = applied.len(), "commit failed; rolling back");
        let mut versions: HashMap<String, u64> =
            writes.iter().map(|w| (w.key.clone(), w.expected)).collect();
        let mut rolled_back = true;
        for (write, version) in applied.iter().rev() {
            match self.restore(&write.key, write.previous.as_deref(), *version).await {
                Ok(restored) => {
                    versions.insert(write.key.clone(), restored);
                }
                Err(e) => {
                    error!(key = %write.key, error = %e, "rollback write failed");
                    versions.insert(write.key.clone(), *version);
                    rolled_back = false;
                }
            }
        }
        if rolled_back {
            if let Err(e) = self.delete(INTENT_KEY, intent_version).await {
                error!(error = %e, "failed to clear commit intent after rollback");
                rolled_back = false;
            }
        }

        Err(CommitFailure {
            error,
            versions,
            rolled_back,
        })
    }

    /// Puts `previous` back over a key at `version`, leaving a tombstone if it
    /// was absent.
    async fn restore(&self, key: &str, previous: Option<&str>, version: u64) -> StoreResult<u64> {
        match previous {
            Some(value) => self.put(key, value, version).await,
            None => self.delete(key, version).await,
        }
    }

    /// Rolls back an intent left by a crash or a failed rollback.
    ///
    /// Intents younger than `min_age` are reported as in flight and left alone,
    /// unless another reconciler already claimed them.
    pub async fn reconcile(&self, min_age: TimeDelta) -> StoreResult<Reconciliation> {
        let slot = self.get(INTENT_KEY).await?;
        let Some(value) = slot.value.as_deref() else {
            return Ok(Reconciliation {
                slot_version: slot.version,
                ..Reconciliation::default()
            });
        };
        let mut intent: Intent = match serde_json::from_str(value) {
            Ok(intent) => intent,
            Err(e) => {
                return Err(StoreError::Backend(format!(
                    "unreadable commit intent: {e}"
                )));
            }
        };
        if !intent.rolling_back && Utc::now() - intent.started_at < min_age {
            return Ok(Reconciliation {
                in_flight: true,
                slot_version: slot.version,
                ..Reconciliation::default()
            });
        }

        intent.rolling_back = true;
        let claim =
            serde_json::to_string(&intent).map_err(|e| StoreError::Backend(e.to_string()))?;
        let claimed = match self.put(INTENT_KEY, &claim, slot.version).await {
            Ok(version) => version,
            Err(StoreError::Conflict { .. }) => {
                info!(
                    operation = %intent.operation,
                    subject = %intent.subject,
                    "commit intent moved on before it could be claimed"
                );
                let now = self.get(INTENT_KEY).await?;
                return Ok(Reconciliation {
                    in_flight: now.value.is_some(),
                    slot_version: now.version,
                    ..Reconciliation::default()
                });
            }
            Err(e) => return Err(e),
        };

        let mut restored = Vec::new();
        for write in intent.writes.iter().rev() {
            if self.fence(write).await? {
                restored.push(write.key.clone());
            }
        }
        let slot_version = self.delete(INTENT_KEY, claimed).await?;

        info!(
            operation = %intent.operation,
            subject = %intent.subject,
            restored = restored.len(),
            "rolled back interrupted commit"
        );
        Ok(Reconciliation {
            operation: Some(intent.operation),
            restored,
            in_flight: false,
            slot_version,
        })
    }

    /// Puts the previous value back over a key the intent touched and returns
    /// whether it had changed.
    ///
    /// A key still at its previous value is rewritten anyway, which moves its
    /// version past any write the original committer still has pending. A key
    /// holding neither value was changed by someone else and is left alone.
    async fn fence(&self, write: &IntentWrite) -> StoreResult<bool> {
        let mut attempt = 1;
        loop {
            let current = self.get(&write.key).await?;
            let changed = match current.value.as_deref() {
                v if v == write.previous.as_deref() => false,
                Some(v) if v == write.next => true,
                _ => return Ok(false),
            };
            let outcome = self
                .restore(&write.key, write.previous.as_deref(), current.version)
                .await;
            match outcome {
                Ok(_) => return Ok(changed),
                Err(StoreError::Conflict { .. }) if attempt < FENCE_ATTEMPTS => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }
}
