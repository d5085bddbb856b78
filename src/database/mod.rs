//! Database abstraction for subkeeper.
//!
//! - `rest`   → PostgREST client (Supabase `/rest/v1`)
//! - `memory` → In-memory store used by the test suite
//!
//! Every job talks to `Database`; the variant decides where the queries go.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};

use crate::config::DatabaseConfig;
use crate::errors::SubkeeperResult;

pub mod memory;
pub mod rest;

pub use memory::{MemoryStore, Table, UsageRow};
pub use rest::RestClient;

/// Select list for subscription rows.
///
/// Every column is requested so schemas without optional columns such as
/// `grace_days` still answer; absent columns decode to their defaults.
pub const SUBSCRIPTION_SELECT: &str = "*";

/// A subscription row as stored in the external database.
///
/// Timestamps are kept as the raw text the database returned; jobs parse
/// them with [`crate::validation::parse_timestamp`] and skip rows they
/// cannot read.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Subscription {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub plan_code: Option<String>,
    #[serde(default)]
    pub pending_plan_code: Option<String>,
    #[serde(default)]
    pub pending_starts_at: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub grace_days: Option<i64>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub is_active: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Subscription {
    /// Build an active subscription with only an id set.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: None,
            plan_code: None,
            pending_plan_code: None,
            pending_starts_at: None,
            expires_at: None,
            grace_days: None,
            is_active: true,
            status: Some("active".to_string()),
            updated_at: None,
        }
    }
}

/// Primary keys may be uuid text or bigint depending on the schema.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Int(n) => n.to_string(),
    })
}

/// A null `is_active` reads as inactive instead of failing the whole page.
fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Format a timestamp the way it is written back to the database.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Unified database abstraction.
#[derive(Debug, Clone)]
pub enum Database {
    Rest(RestClient),
    Memory(MemoryStore),
}

impl Database {
    /// Build the REST-backed database from configuration.
    pub fn connect(config: &DatabaseConfig) -> SubkeeperResult<Self> {
        Ok(Database::Rest(RestClient::new(config)?))
    }

    /// One page of subscriptions with a non-null `pending_plan_code`,
    /// ordered by id and starting after `after`.
    pub async fn pending_plan_changes(
        &self,
        after: Option<&str>,
        limit: u32,
    ) -> SubkeeperResult<Vec<Subscription>> {
        match self {
            Database::Rest(client) => client.pending_plan_changes(after, limit).await,
            Database::Memory(store) => store.pending_plan_changes(after, limit),
        }
    }

    /// One page of active subscriptions whose `expires_at` is at or before `now`.
    ///
    /// Grace days are applied by the caller; this is only the coarse filter.
    pub async fn expiry_candidates(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: u32,
    ) -> SubkeeperResult<Vec<Subscription>> {
        match self {
            Database::Rest(client) => client.expiry_candidates(now, after, limit).await,
            Database::Memory(store) => store.expiry_candidates(now, after, limit),
        }
    }

    /// Promote a pending plan on one row.
    ///
    /// Only applies while `pending_plan_code` still equals `expected_pending`.
    /// With `new_plan = None` the pending fields are cleared and `plan_code`
    /// is left alone. Returns whether a row was updated.
    pub async fn apply_plan_change(
        &self,
        id: &str,
        expected_pending: &str,
        new_plan: Option<&str>,
        now: DateTime<Utc>,
    ) -> SubkeeperResult<bool> {
        match self {
            Database::Rest(client) => {
                client
                    .apply_plan_change(id, expected_pending, new_plan, now)
                    .await
            }
            Database::Memory(store) => store.apply_plan_change(id, expected_pending, new_plan, now),
        }
    }

    /// Mark one active row as expired. Returns whether a row was updated.
    pub async fn deactivate_subscription(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> SubkeeperResult<bool> {
        match self {
            Database::Rest(client) => client.deactivate_subscription(id, now).await,
            Database::Memory(store) => store.deactivate_subscription(id, now),
        }
    }

    /// Count usage rows dated strictly before `cutoff`.
    pub async fn count_usage_before(&self, cutoff: NaiveDate) -> SubkeeperResult<u64> {
        match self {
            Database::Rest(client) => client.count_usage_before(cutoff).await,
            Database::Memory(store) => store.count_usage_before(cutoff),
        }
    }

    /// Delete usage rows dated strictly before `cutoff`, returning how many went.
    pub async fn purge_usage_before(&self, cutoff: NaiveDate) -> SubkeeperResult<u64> {
        match self {
            Database::Rest(client) => client.purge_usage_before(cutoff).await,
            Database::Memory(store) => store.purge_usage_before(cutoff),
        }
    }

    /// Grace days configured for `plan_code` in the plans table.
    ///
    /// `None` when the plan is unknown or carries no grace value.
    pub async fn plan_grace_days(&self, plan_code: &str) -> SubkeeperResult<Option<i64>> {
        match self {
            Database::Rest(client) => client.plan_grace_days(plan_code).await,
            Database::Memory(store) => store.plan_grace_days(plan_code),
        }
    }

    /// Call a database function with no arguments.
    pub async fn call_function(&self, name: &str) -> SubkeeperResult<serde_json::Value> {
        match self {
            Database::Rest(client) => client.call_function(name).await,
            Database::Memory(store) => store.call_function(name),
        }
    }
}
