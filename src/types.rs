use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// Storage key of the payment request collection.
pub const REQUESTS_KEY: &str = "paymentRequests";
/// Storage key of the investment collection.
pub const INVESTMENTS_KEY: &str = "userInvestments";
/// Storage key of the user collection.
pub const USERS_KEY: &str = "users";
/// Storage key of the in-flight commit record.
pub const INTENT_KEY: &str = "ledgerIntent";

/// A record type stored as one JSON array under a fixed key.
pub trait Record: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync {
    /// The storage key holding the collection.
    const KEY: &'static str;
}

/// Status of a payment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "approved" => Ok(PaymentStatus::Approved),
            "rejected" => Ok(PaymentStatus::Rejected),
            other => Err(format!("unknown payment status '{other}'")),
        }
    }
}

/// Filter applied when listing payment requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Only(PaymentStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: PaymentStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(StatusFilter::All);
        }
        s.parse().map(StatusFilter::Only)
    }
}

/// A money amount in the textual or numeric form it was stored in.
///
/// Older records hold amounts as JSON numbers, newer ones as decimal strings.
/// The stored form is kept so untouched records serialize back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Number(serde_json::Number),
    Text(String),
}

impl Amount {
    pub fn from_decimal(value: Decimal) -> Self {
        Amount::Text(value.normalize().to_string())
    }

    /// Parses the stored amount. Fails on anything that is not a decimal number.
    pub fn to_decimal(&self) -> Result<Decimal, rust_decimal::Error> {
        let text = match self {
            Amount::Number(n) => n.to_string(),
            Amount::Text(s) => s.trim().to_string(),
        };
        Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Amount::Number(n) => write!(f, "{n}"),
            Amount::Text(s) => f.write_str(s),
        }
    }
}

/// A point in time in the text form it was stored in.
///
/// New timestamps are written as RFC 3339 with milliseconds and a `Z` suffix.
/// Stored text that does not parse is kept and only fails the reads that
/// need the instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.0.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Timestamp(at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads a field that may be `null`, keeping `Some(None)` for an explicit null
/// so it is written back. A missing field stays `None` via `#[serde(default)]`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// A user's claim of an external deposit, awaiting administrator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// The ID of the request.
    pub id: String,
    /// The ID of the user who made the deposit.
    pub user_id: String,
    /// The display name of the user at submission time.
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_name: Option<Option<String>>,
    /// The email of the user at submission time.
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_email: Option<Option<String>>,
    /// The ID of the plan being bought.
    pub plan_id: String,
    /// The name of the plan being bought.
    pub plan_name: String,
    /// The deposited amount.
    pub amount: Amount,
    /// The external payment reference given by the user.
    pub transaction_id: String,
    /// When the request was submitted.
    pub date: Timestamp,
    /// The review status.
    pub status: PaymentStatus,
    /// Fields written by other parts of the platform, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PaymentRequest {
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_ref()?.as_deref()
    }

    pub fn user_email(&self) -> Option<&str> {
        self.user_email.as_ref()?.as_deref()
    }
}

impl Record for PaymentRequest {
    const KEY: &'static str = REQUESTS_KEY;
}

/// Status of an activated investment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentStatus {
    Active,
    Expired,
}

/// A plan instance activated by an approved payment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investment {
    pub id: String,
    /// The approved request this investment was created from. Absent on
    /// records written before requests were linked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub user_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub amount: Amount,
    pub status: InvestmentStatus,
    pub purchase_date: Timestamp,
    pub expiry_date: Timestamp,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Investment {
    /// Activates the plan bought by `request`, valid for `validity` from `now`.
    pub fn from_request(request: &PaymentRequest, now: DateTime<Utc>, validity: TimeDelta) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: Some(request.id.clone()),
            user_id: request.user_id.clone(),
            plan_id: request.plan_id.clone(),
            plan_name: request.plan_name.clone(),
            amount: request.amount.clone(),
            status: InvestmentStatus::Active,
            purchase_date: now.into(),
            expiry_date: (now + validity).into(),
            extra: Map::new(),
        }
    }

    /// Active and not yet past its expiry. An unreadable expiry date counts
    /// as expired.
    pub fn is_running_at(&self, at: DateTime<Utc>) -> bool {
        self.status == InvestmentStatus::Active
            && self.expiry_date.parse().is_some_and(|expiry| at < expiry)
    }
}

impl Record for Investment {
    const KEY: &'static str = INVESTMENTS_KEY;
}

/// The part of a user record the ledger reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    /// The ID of the user.
    pub id: String,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub email: Option<Option<String>>,
    /// The user's balance. A missing or null balance counts as zero.
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub balance: Option<Option<Amount>>,
    /// Profile fields owned by other parts of the platform.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserAccount {
    pub fn balance(&self) -> Result<Decimal, rust_decimal::Error> {
        match &self.balance {
            None | Some(None) => Ok(Decimal::ZERO),
            Some(Some(Amount::Text(s))) if s.trim().is_empty() => Ok(Decimal::ZERO),
            Some(Some(amount)) => amount.to_decimal(),
        }
    }

    pub fn set_balance(&mut self, value: Decimal) {
        self.balance = Some(Some(Amount::from_decimal(value)));
    }
}

impl Record for UserAccount {
    const KEY: &'static str = USERS_KEY;
}

/// The deposit claim filed by a user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPaymentRequest {
    /// The ID of the depositing user.
    pub user_id: String,
    /// The ID of the plan being bought.
    pub plan_id: String,
    /// The name of the plan being bought.
    pub plan_name: String,
    /// The deposited amount.
    pub amount: Decimal,
    /// The external payment reference.
    pub transaction_id: String,
}

/// A user account to register.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    /// The ID of the user; generated when absent.
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// The outcome of approving a payment request.
#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    /// The request after approval.
    pub request: PaymentRequest,
    /// The investment activated by the approval.
    pub investment: Investment,
    /// The user's balance after the credit.
    pub balance: Decimal,
}

/// A broken ledger invariant found by an audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// An approved request with no investment linked to it.
    MissingInvestment { request_id: String },
    /// More than one investment linked to the same request.
    DuplicateInvestment { request_id: String, count: usize },
    /// An investment linked to a request that is absent or not approved.
    OrphanInvestment { investment_id: String, request_id: String },
    /// An investment with no request link, written before linking existed.
    UnlinkedInvestment { investment_id: String },
    /// A balance that differs from the user's approved deposits.
    BalanceMismatch {
        user_id: String,
        expected: Decimal,
        actual: Decimal,
    },
    /// A record whose amount or balance is not a number.
    MalformedRecord { key: String, id: String },
}

/// Result of an invariant check over the loaded collections.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub requests: usize,
    pub investments: usize,
    pub users: usize,
    pub violations: Vec<Violation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}
