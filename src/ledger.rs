//! The payment request ledger.
//!
//! One [`Ledger`] owns the payment request, investment and user collections
//! in memory and is the only writer of their stored copies. Every transition
//! builds the next version of the collections it touches, commits them through
//! the [`Journal`], and only then replaces the in-memory copies. A failed
//! commit leaves memory as it was.
//!
//! Other writers may share the store. Every operation first refreshes the
//! collections whose stored version moved, and a conflicting write marks the
//! ledger for a full reload before the next call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::journal::{Journal, PendingWrite, RetryPolicy};
use crate::store::{KvStore, StoreError, Versioned};
use crate::types::{
    Amount, Approval, AuditReport, INTENT_KEY, INVESTMENTS_KEY, Investment, NewPaymentRequest,
    NewUser, PaymentRequest, PaymentStatus, REQUESTS_KEY, Record, StatusFilter, USERS_KEY,
    UserAccount, Violation,
};

/// Errors returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("payment request {0} not found")]
    RequestNotFound(String),
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("payment request {id} is {status}, expected pending")]
    InvalidState { id: String, status: PaymentStatus },
    #[error("malformed data in {key}: {reason}")]
    MalformedData { key: String, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("stored data changed since it was loaded: {0}")]
    Conflict(StoreError),
    #[error("failed to persist ledger state: {0}")]
    PersistenceFailure(StoreError),
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::RequestNotFound(_) | LedgerError::UserNotFound(_)
        )
    }

    fn malformed(key: &str, reason: impl Into<String>) -> Self {
        LedgerError::MalformedData {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => LedgerError::Conflict(e),
            other => LedgerError::PersistenceFailure(other),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Tunables for a [`Ledger`].
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// How long an approved plan stays active.
    pub investment_validity: TimeDelta,
    /// Age after which another writer's open commit intent counts as abandoned.
    pub intent_timeout: TimeDelta,
    pub retry: RetryPolicy,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            investment_validity: TimeDelta::days(30),
            intent_timeout: TimeDelta::seconds(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// A loaded collection and the stored text and version it was loaded from.
struct Collection<T> {
    items: Vec<T>,
    /// Stored text of each item, by index. Items that are not modified are
    /// written back from here byte for byte.
    raws: Vec<Box<RawValue>>,
    raw: Option<String>,
    version: u64,
}

/// The next state of a collection, ready to commit.
struct Staged<T> {
    items: Vec<T>,
    raws: Vec<Box<RawValue>>,
    write: PendingWrite,
}

impl<T: Record> Collection<T> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            raws: Vec::new(),
            raw: None,
            version: 0,
        }
    }

    fn from_stored(stored: Versioned) -> LedgerResult<Self> {
        let Some(text) = stored.value else {
            return Ok(Self {
                version: stored.version,
                ..Self::empty()
            });
        };
        let raws: Vec<Box<RawValue>> = serde_json::from_str(&text)
            .map_err(|e| LedgerError::malformed(T::KEY, e.to_string()))?;
        let items = raws
            .iter()
            .map(|raw| serde_json::from_str(raw.get()))
            .collect::<Result<Vec<T>, _>>()
            .map_err(|e| LedgerError::malformed(T::KEY, e.to_string()))?;
        Ok(Self {
            items,
            raws,
            raw: Some(text),
            version: stored.version,
        })
    }

    /// The stored collection, unless it is still the one loaded.
    fn reloaded(&self, stored: Versioned, force: bool) -> LedgerResult<Option<Self>> {
        if !force && stored.version == self.version {
            return Ok(None);
        }
        Self::from_stored(stored).map(Some)
    }

    fn stage(&self, items: Vec<T>) -> LedgerResult<Staged<T>> {
        let raws = items
            .iter()
            .enumerate()
            .map(|(i, item)| match (self.items.get(i), self.raws.get(i)) {
                (Some(loaded), Some(raw)) if loaded == item => Ok(raw.clone()),
                _ => serde_json::value::to_raw_value(item),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::malformed(T::KEY, e.to_string()))?;
        let next = serde_json::to_string(&raws)
            .map_err(|e| LedgerError::malformed(T::KEY, e.to_string()))?;
        Ok(Staged {
            items,
            raws,
            write: PendingWrite {
                key: T::KEY.to_string(),
                expected: self.version,
                previous: self.raw.clone(),
                next,
            },
        })
    }

    fn replace(&mut self, staged: Staged<T>, versions: &HashMap<String, u64>) {
        self.items = staged.items;
        self.raws = staged.raws;
        self.raw = Some(staged.write.next);
        if let Some(version) = versions.get(T::KEY) {
            self.version = *version;
        }
    }
}

pub struct Ledger {
    journal: Journal,
    settings: LedgerSettings,
    requests: Collection<PaymentRequest>,
    investments: Collection<Investment>,
    users: Collection<UserAccount>,
    /// Set after a conflict, or while another writer's commit was in flight.
    needs_reload: bool,
    /// Set when this ledger's own failed rollback left an intent behind.
    abandoned_intent: bool,
}

impl Ledger {
    /// Reconciles any abandoned commit and loads the collections.
    pub async fn open(store: Arc<dyn KvStore>, settings: LedgerSettings) -> LedgerResult<Self> {
        let mut ledger = Self {
            journal: Journal::new(store, settings.retry),
            settings,
            requests: Collection::empty(),
            investments: Collection::empty(),
            users: Collection::empty(),
            needs_reload: true,
            abandoned_intent: false,
        };
        ledger.sync(true).await?;
        info!(
            requests = ledger.requests.items.len(),
            investments = ledger.investments.items.len(),
            users = ledger.users.items.len(),
            "ledger loaded"
        );
        Ok(ledger)
    }

    /// Picks up collections other writers changed since they were loaded and
    /// returns whether anything was reloaded.
    ///
    /// While another writer's commit is in flight the loaded state is kept and
    /// the next call tries again.
    pub async fn refresh(&mut self) -> LedgerResult<bool> {
        self.sync(false).await
    }

    /// Re-reads every collection from the store.
    pub async fn reload(&mut self) -> LedgerResult<()> {
        self.needs_reload = true;
        self.sync(false).await.map(|_| ())
    }

    async fn sync(&mut self, initial: bool) -> LedgerResult<bool> {
        let min_age = if self.abandoned_intent {
            TimeDelta::zero()
        } else {
            self.settings.intent_timeout
        };
        let slot = self.journal.reconcile(min_age).await?;
        if !slot.in_flight {
            self.abandoned_intent = false;
        }
        if slot.in_flight && !initial {
            debug!("commit in flight elsewhere; keeping loaded state");
            self.needs_reload = true;
            return Ok(false);
        }

        let requests = self.journal.get(REQUESTS_KEY).await?;
        let investments = self.journal.get(INVESTMENTS_KEY).await?;
        let users = self.journal.get(USERS_KEY).await?;
        // a commit that started while the keys were read may have been half seen
        let settled = !slot.in_flight
            && self.journal.get(INTENT_KEY).await?.version == slot.slot_version;
        if !settled && !initial {
            debug!("commit started during refresh; keeping loaded state");
            self.needs_reload = true;
            return Ok(false);
        }

        let force = self.needs_reload;
        let requests = self.requests.reloaded(requests, force)?;
        let investments = self.investments.reloaded(investments, force)?;
        let users = self.users.reloaded(users, force)?;
        let changed = requests.is_some() || investments.is_some() || users.is_some();
        if let Some(requests) = requests {
            self.requests = requests;
        }
        if let Some(investments) = investments {
            self.investments = investments;
        }
        if let Some(users) = users {
            self.users = users;
        }
        self.needs_reload = !settled;
        if changed && !initial {
            info!("ledger reloaded from store");
        }
        Ok(changed)
    }

    /// Lists requests matching `filter` in insertion order.
    pub fn list_requests(&self, filter: StatusFilter) -> Vec<PaymentRequest> {
        self.requests
            .items
            .iter()
            .filter(|r| filter.matches(r.status))
            .cloned()
            .collect()
    }

    pub fn get_request(&self, request_id: &str) -> LedgerResult<&PaymentRequest> {
        self.requests
            .items
            .iter()
            .find(|r| r.id == request_id)
            .ok_or_else(|| LedgerError::RequestNotFound(request_id.to_string()))
    }

    pub fn get_user(&self, user_id: &str) -> LedgerResult<&UserAccount> {
        self.users
            .items
            .iter()
            .find(|u| u.id == user_id)
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
    }

    pub fn balance(&self, user_id: &str) -> LedgerResult<Decimal> {
        self.get_user(user_id)?
            .balance()
            .map_err(|e| LedgerError::malformed(UserAccount::KEY, format!("user {user_id}: {e}")))
    }

    pub fn investments_for(&self, user_id: &str) -> Vec<Investment> {
        self.investments
            .items
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect()
    }

    /// A user's investments that are active and unexpired at `at`.
    pub fn active_investments_for(&self, user_id: &str, at: DateTime<Utc>) -> Vec<Investment> {
        self.investments
            .items
            .iter()
            .filter(|i| i.user_id == user_id && i.is_running_at(at))
            .cloned()
            .collect()
    }

    fn pending_index(&self, request_id: &str) -> LedgerResult<usize> {
        let index = self
            .requests
            .items
            .iter()
            .position(|r| r.id == request_id)
            .ok_or_else(|| LedgerError::RequestNotFound(request_id.to_string()))?;
        let status = self.requests.items[index].status;
        if status != PaymentStatus::Pending {
            return Err(LedgerError::InvalidState {
                id: request_id.to_string(),
                status,
            });
        }
        Ok(index)
    }

    async fn persist(
        &mut self,
        operation: &str,
        subject: &str,
        writes: Vec<PendingWrite>,
    ) -> LedgerResult<HashMap<String, u64>> {
        match self.journal.commit(operation, subject, writes).await {
            Ok(versions) => Ok(versions),
            Err(failure) => {
                for (key, version) in &failure.versions {
                    match key.as_str() {
                        REQUESTS_KEY => self.requests.version = *version,
                        INVESTMENTS_KEY => self.investments.version = *version,
                        USERS_KEY => self.users.version = *version,
                        _ => {}
                    }
                }
                if !failure.rolled_back {
                    self.abandoned_intent = true;
                    self.needs_reload = true;
                }
                let error = LedgerError::from(failure.error);
                if matches!(error, LedgerError::Conflict(_)) {
                    self.needs_reload = true;
                }
                Err(error)
            }
        }
    }

    /// Approves a pending request now. See [`Ledger::approve_at`].
    pub async fn approve(&mut self, request_id: &str) -> LedgerResult<Approval> {
        self.approve_at(request_id, Utc::now()).await
    }

    /// Approves a pending request: marks it approved, activates an investment
    /// for its plan and credits the user's balance, all in one commit.
    pub async fn approve_at(
        &mut self,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Approval> {
        self.refresh().await?;
        let index = self.pending_index(request_id)?;
        let request = &self.requests.items[index];

        let amount = request.amount.to_decimal().map_err(|e| {
            LedgerError::malformed(
                PaymentRequest::KEY,
                format!("request {request_id} amount '{}': {e}", request.amount),
            )
        })?;
        let user_index = self
            .users
            .items
            .iter()
            .position(|u| u.id == request.user_id)
            .ok_or_else(|| LedgerError::UserNotFound(request.user_id.clone()))?;
        let balance = self.balance(&request.user_id)?;
        let new_balance = balance.checked_add(amount).ok_or_else(|| {
            let reason = format!("balance overflow for {}", request.user_id);
            LedgerError::malformed(UserAccount::KEY, reason)
        })?;

        let mut requests = self.requests.items.clone();
        requests[index].status = PaymentStatus::Approved;
        let approved = requests[index].clone();
        let validity = self.settings.investment_validity;
        let investment = Investment::from_request(&approved, now, validity);
        let mut investments = self.investments.items.clone();
        investments.push(investment.clone());
        let mut users = self.users.items.clone();
        users[user_index].set_balance(new_balance);

        let requests = self.requests.stage(requests)?;
        let investments = self.investments.stage(investments)?;
        let users = self.users.stage(users)?;
        let writes = vec![
            requests.write.clone(),
            investments.write.clone(),
            users.write.clone(),
        ];
        let versions = self.persist("approve", request_id, writes).await?;

        self.requests.replace(requests, &versions);
        self.investments.replace(investments, &versions);
        self.users.replace(users, &versions);

        info!(
            request_id,
            user_id = %approved.user_id,
            amount = %amount,
            investment_id = %investment.id,
            "payment request approved"
        );
        Ok(Approval {
            request: approved,
            investment,
            balance: new_balance,
        })
    }

    /// Rejects a pending request. No other collection is touched.
    pub async fn reject(&mut self, request_id: &str) -> LedgerResult<PaymentRequest> {
        self.refresh().await?;
        let index = self.pending_index(request_id)?;

        let mut requests = self.requests.items.clone();
        requests[index].status = PaymentStatus::Rejected;
        let rejected = requests[index].clone();
        let staged = self.requests.stage(requests)?;
        let versions = self
            .persist("reject", request_id, vec![staged.write.clone()])
            .await?;

        self.requests.replace(staged, &versions);
        info!(request_id, user_id = %rejected.user_id, "payment request rejected");
        Ok(rejected)
    }

    /// Files a deposit claim for review.
    pub async fn submit_request(&mut self, new: NewPaymentRequest) -> LedgerResult<PaymentRequest> {
        self.submit_request_at(new, Utc::now()).await
    }

    pub async fn submit_request_at(
        &mut self,
        new: NewPaymentRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<PaymentRequest> {
        self.refresh().await?;
        if new.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput("amount must be > 0".into()));
        }
        let transaction_id = new.transaction_id.trim();
        if transaction_id.is_empty() {
            return Err(LedgerError::InvalidInput("transaction id is required".into()));
        }
        if new.plan_id.trim().is_empty() || new.plan_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("plan is required".into()));
        }
        let user = self.get_user(&new.user_id)?;
        if self
            .requests
            .items
            .iter()
            .any(|r| r.transaction_id == transaction_id)
        {
            return Err(LedgerError::Duplicate(format!("transaction {transaction_id}")));
        }

        let request = PaymentRequest {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            user_email: user.email.clone(),
            plan_id: new.plan_id,
            plan_name: new.plan_name,
            amount: Amount::from_decimal(new.amount),
            transaction_id: transaction_id.to_string(),
            date: now.into(),
            status: PaymentStatus::Pending,
            extra: Default::default(),
        };
        let mut requests = self.requests.items.clone();
        requests.push(request.clone());
        let staged = self.requests.stage(requests)?;
        let versions = self
            .persist("submit", &request.id, vec![staged.write.clone()])
            .await?;
        self.requests.replace(staged, &versions);

        info!(
            request_id = %request.id,
            user_id = %request.user_id,
            amount = %request.amount,
            "payment request submitted"
        );
        Ok(request)
    }

    /// Creates a user account with a zero balance.
    pub async fn register_user(&mut self, new: NewUser) -> LedgerResult<UserAccount> {
        self.refresh().await?;
        let id = match new.id {
            Some(id) if id.trim().is_empty() => {
                return Err(LedgerError::InvalidInput("user id must not be blank".into()));
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        if self.users.items.iter().any(|u| u.id == id) {
            return Err(LedgerError::Duplicate(format!("user {id}")));
        }

        let user = UserAccount {
            id,
            name: new.name.map(Some),
            email: new.email.map(Some),
            balance: Some(Some(Amount::from_decimal(Decimal::ZERO))),
            extra: Default::default(),
        };
        let mut users = self.users.items.clone();
        users.push(user.clone());
        let staged = self.users.stage(users)?;
        let versions = self
            .persist("register", &user.id, vec![staged.write.clone()])
            .await?;
        self.users.replace(staged, &versions);

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Checks the links between requests, investments and balances.
    pub fn audit(&self) -> AuditReport {
        let mut report = AuditReport {
            requests: self.requests.items.len(),
            investments: self.investments.items.len(),
            users: self.users.items.len(),
            violations: Vec::new(),
        };

        let mut linked: HashMap<&str, usize> = HashMap::new();
        for investment in &self.investments.items {
            let Some(request_id) = investment.request_id.as_deref() else {
                report.violations.push(Violation::UnlinkedInvestment {
                    investment_id: investment.id.clone(),
                });
                continue;
            };
            *linked.entry(request_id).or_default() += 1;
            let approved = self
                .requests
                .items
                .iter()
                .any(|r| r.id == request_id && r.status == PaymentStatus::Approved);
            if !approved {
                report.violations.push(Violation::OrphanInvestment {
                    investment_id: investment.id.clone(),
                    request_id: request_id.to_string(),
                });
            }
        }

        let mut approved_totals: HashMap<&str, Decimal> = HashMap::new();
        for request in &self.requests.items {
            if request.status != PaymentStatus::Approved {
                continue;
            }
            match linked.get(request.id.as_str()).copied().unwrap_or(0) {
                0 => report.violations.push(Violation::MissingInvestment {
                    request_id: request.id.clone(),
                }),
                1 => {}
                count => report.violations.push(Violation::DuplicateInvestment {
                    request_id: request.id.clone(),
                    count,
                }),
            }
            match request.amount.to_decimal() {
                Ok(amount) => {
                    *approved_totals.entry(request.user_id.as_str()).or_default() += amount;
                }
                Err(_) => report.violations.push(Violation::MalformedRecord {
                    key: PaymentRequest::KEY.to_string(),
                    id: request.id.clone(),
                }),
            }
        }

        for user in &self.users.items {
            let expected = approved_totals
                .get(user.id.as_str())
                .copied()
                .unwrap_or(Decimal::ZERO);
            match user.balance() {
                Ok(actual) if actual == expected => {}
                Ok(actual) => report.violations.push(Violation::BalanceMismatch {
                    user_id: user.id.clone(),
                    expected,
                    actual,
                }),
                Err(_) => report.violations.push(Violation::MalformedRecord {
                    key: UserAccount::KEY.to_string(),
                    id: user.id.clone(),
                }),
            }
        }

        report
    }
}
