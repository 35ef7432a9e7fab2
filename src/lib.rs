//! Payment request ledger for the EasyEarn investment platform.
//!
//! Users file payment requests for external deposits; an administrator
//! approves or rejects them. Approval activates an investment for the user's
//! plan and credits the user's balance in one all-or-nothing commit.

mod api;
pub mod config;
mod error;
pub mod journal;
pub mod ledger;
pub mod pg_store;
mod responses;
pub mod store;
pub mod types;

pub use api::{ADMIN_TOKEN_HEADER, AppState, init_router};
pub use crate::config::Config;
pub use ledger::{Ledger, LedgerError, LedgerResult, LedgerSettings};
pub use pg_store::PgStore;
pub use store::{KvStore, MemoryStore, StoreError, Versioned};
pub use types::{
    Amount, Approval, AuditReport, Investment, InvestmentStatus, NewPaymentRequest, NewUser,
    PaymentRequest, PaymentStatus, StatusFilter, Timestamp, UserAccount, Violation,
};
