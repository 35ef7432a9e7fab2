use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::journal::RetryPolicy;
use crate::ledger::LedgerSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    /// Postgres URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Token expected in `x-admin-token`. Empty disables the admin routes.
    pub admin_token: String,
    pub investment_validity_days: i64,
    pub persist_retry_attempts: u32,
    pub persist_retry_backoff_ms: u64,
    /// Seconds before another writer's open commit is rolled back.
    pub intent_timeout_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::default())
    }

    pub fn from_environment(env: config::Environment) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("admin_token", "")?
            .set_default("investment_validity_days", 30)?
            .set_default("persist_retry_attempts", 3)?
            .set_default("persist_retry_backoff_ms", 50)?
            .set_default("intent_timeout_secs", 30)?
            .add_source(env)
            .build()?;
        config.try_deserialize()
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            investment_validity: TimeDelta::days(self.investment_validity_days),
            intent_timeout: TimeDelta::seconds(self.intent_timeout_secs),
            retry: RetryPolicy {
                attempts: self.persist_retry_attempts,
                backoff: Duration::from_millis(self.persist_retry_backoff_ms),
            },
        }
    }
}
