//! In-memory database used by the test suite.
//!
//! Mirrors the filter semantics of the REST queries closely enough that job
//! behaviour can be checked without a live endpoint. Tables and single rows
//! can be made to fail to exercise error paths.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::{SubkeeperError, SubkeeperResult};
use crate::validation::parse_timestamp;

use super::{format_timestamp, Subscription};

/// Tables that can be switched into a failing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Subscriptions,
    Usage,
    Plans,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Table::Subscriptions => write!(f, "subscriptions"),
            Table::Usage => write!(f, "usage"),
            Table::Plans => write!(f, "plans"),
        }
    }
}

/// A per-user, per-day usage counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub account_id: String,
    pub usage_date: NaiveDate,
    pub questions: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    // Keyed by id so iteration matches `order=id.asc`.
    subscriptions: BTreeMap<String, Subscription>,
    usage: Vec<UsageRow>,
    plans: HashMap<String, Option<i64>>,
    functions: HashMap<String, serde_json::Value>,
    function_calls: Vec<String>,
    failing_tables: HashSet<Table>,
    rejected_rows: HashSet<String>,
}

/// Shared in-memory store; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SubkeeperResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SubkeeperError::StoreUnavailable("memory store lock poisoned".into()))
    }

    fn check_table(state: &MemoryState, table: Table) -> SubkeeperResult<()> {
        if state.failing_tables.contains(&table) {
            return Err(SubkeeperError::StoreUnavailable(format!(
                "table '{table}' is failing"
            )));
        }
        Ok(())
    }

    // === Seeding and inspection ===

    pub fn insert_subscription(&self, subscription: Subscription) -> SubkeeperResult<()> {
        let mut state = self.lock()?;
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
        Ok(())
    }

    pub fn get_subscription(&self, id: &str) -> SubkeeperResult<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(id).cloned())
    }

    pub fn subscriptions(&self) -> SubkeeperResult<Vec<Subscription>> {
        Ok(self.lock()?.subscriptions.values().cloned().collect())
    }

    pub fn insert_usage(&self, row: UsageRow) -> SubkeeperResult<()> {
        self.lock()?.usage.push(row);
        Ok(())
    }

    pub fn usage_rows(&self) -> SubkeeperResult<Vec<UsageRow>> {
        Ok(self.lock()?.usage.clone())
    }

    /// Add a plan and the grace days it grants.
    pub fn define_plan(&self, plan_code: &str, grace_days: Option<i64>) -> SubkeeperResult<()> {
        self.lock()?.plans.insert(plan_code.to_string(), grace_days);
        Ok(())
    }

    /// Register a database function and the value it returns.
    pub fn define_function(&self, name: &str, result: serde_json::Value) -> SubkeeperResult<()> {
        self.lock()?.functions.insert(name.to_string(), result);
        Ok(())
    }

    pub fn function_calls(&self) -> SubkeeperResult<Vec<String>> {
        Ok(self.lock()?.function_calls.clone())
    }

    /// Make every operation against `table` fail (or stop failing).
    pub fn set_failing(&self, table: Table, failing: bool) -> SubkeeperResult<()> {
        let mut state = self.lock()?;
        if failing {
            state.failing_tables.insert(table);
        } else {
            state.failing_tables.remove(&table);
        }
        Ok(())
    }

    /// Make writes to one subscription row fail.
    pub fn reject_writes_to(&self, id: &str) -> SubkeeperResult<()> {
        self.lock()?.rejected_rows.insert(id.to_string());
        Ok(())
    }

    // === Queries mirroring the REST client ===

    fn page<F>(
        state: &MemoryState,
        after: Option<&str>,
        limit: u32,
        filter: F,
    ) -> Vec<Subscription>
    where
        F: Fn(&Subscription) -> bool,
    {
        state
            .subscriptions
            .values()
            .filter(|s| after.map_or(true, |last| s.id.as_str() > last))
            .filter(|s| filter(s))
            .take(limit as usize)
            .cloned()
            .collect()
    }

    pub(crate) fn pending_plan_changes(
        &self,
        after: Option<&str>,
        limit: u32,
    ) -> SubkeeperResult<Vec<Subscription>> {
        let state = self.lock()?;
        Self::check_table(&state, Table::Subscriptions)?;
        Ok(Self::page(&state, after, limit, |s| {
            s.pending_plan_code.is_some()
        }))
    }

    pub(crate) fn expiry_candidates(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: u32,
    ) -> SubkeeperResult<Vec<Subscription>> {
        let state = self.lock()?;
        Self::check_table(&state, Table::Subscriptions)?;
        // Unreadable timestamps are passed through so the job can report them.
        Ok(Self::page(&state, after, limit, |s| {
            s.is_active
                && s.expires_at
                    .as_deref()
                    .is_some_and(|raw| parse_timestamp(raw).map_or(true, |exp| exp <= now))
        }))
    }

    fn writable_row<'a>(
        state: &'a mut MemoryState,
        id: &str,
    ) -> SubkeeperResult<Option<&'a mut Subscription>> {
        Self::check_table(state, Table::Subscriptions)?;
        if state.rejected_rows.contains(id) {
            return Err(SubkeeperError::ApiError {
                status: 500,
                message: format!("write to subscription {id} rejected"),
            });
        }
        Ok(state.subscriptions.get_mut(id))
    }

    pub(crate) fn apply_plan_change(
        &self,
        id: &str,
        expected_pending: &str,
        new_plan: Option<&str>,
        now: DateTime<Utc>,
    ) -> SubkeeperResult<bool> {
        let mut state = self.lock()?;
        let Some(row) = Self::writable_row(&mut state, id)? else {
            return Ok(false);
        };
        if row.pending_plan_code.as_deref() != Some(expected_pending) {
            return Ok(false);
        }

        if let Some(plan) = new_plan {
            row.plan_code = Some(plan.to_string());
        }
        row.pending_plan_code = None;
        row.pending_starts_at = None;
        row.updated_at = Some(format_timestamp(now));
        Ok(true)
    }

    pub(crate) fn deactivate_subscription(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> SubkeeperResult<bool> {
        let mut state = self.lock()?;
        let Some(row) = Self::writable_row(&mut state, id)? else {
            return Ok(false);
        };
        if !row.is_active {
            return Ok(false);
        }

        row.is_active = false;
        row.status = Some("expired".to_string());
        row.updated_at = Some(format_timestamp(now));
        Ok(true)
    }

    pub(crate) fn count_usage_before(&self, cutoff: NaiveDate) -> SubkeeperResult<u64> {
        let state = self.lock()?;
        Self::check_table(&state, Table::Usage)?;
        Ok(state.usage.iter().filter(|r| r.usage_date < cutoff).count() as u64)
    }

    pub(crate) fn purge_usage_before(&self, cutoff: NaiveDate) -> SubkeeperResult<u64> {
        let mut state = self.lock()?;
        Self::check_table(&state, Table::Usage)?;
        let before = state.usage.len();
        state.usage.retain(|r| r.usage_date >= cutoff);
        Ok((before - state.usage.len()) as u64)
    }

    pub(crate) fn plan_grace_days(&self, plan_code: &str) -> SubkeeperResult<Option<i64>> {
        let state = self.lock()?;
        Self::check_table(&state, Table::Plans)?;
        Ok(state.plans.get(plan_code).copied().flatten())
    }

    pub(crate) fn call_function(&self, name: &str) -> SubkeeperResult<serde_json::Value> {
        let mut state = self.lock()?;
        state.function_calls.push(name.to_string());
        state
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| SubkeeperError::ApiError {
                status: 404,
                message: format!("Could not find the function public.{name}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn pages_follow_id_order() {
        let store = MemoryStore::new();
        for id in ["c", "a", "b", "d"] {
            let mut sub = Subscription::new(id);
            sub.pending_plan_code = Some("pro".into());
            store.insert_subscription(sub).unwrap();
        }

        let first = store.pending_plan_changes(None, 2).unwrap();
        let ids: Vec<_> = first.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let second = store.pending_plan_changes(Some("b"), 2).unwrap();
        let ids: Vec<_> = second.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["c", "d"]);
    }

    #[test]
    fn plan_change_requires_matching_pending_code() {
        let store = MemoryStore::new();
        let mut sub = Subscription::new("s1");
        sub.plan_code = Some("free".into());
        sub.pending_plan_code = Some("team".into());
        store.insert_subscription(sub).unwrap();

        assert!(!store
            .apply_plan_change("s1", "pro", Some("pro"), Utc::now())
            .unwrap());
        assert!(store
            .apply_plan_change("s1", "team", Some("team"), Utc::now())
            .unwrap());

        let row = store.get_subscription("s1").unwrap().unwrap();
        assert_eq!(row.plan_code.as_deref(), Some("team"));
        assert_eq!(row.pending_plan_code, None);
    }

    #[test]
    fn purge_keeps_rows_on_cutoff() {
        let store = MemoryStore::new();
        for day in [1, 2, 3] {
            store
                .insert_usage(UsageRow {
                    account_id: "acct".into(),
                    usage_date: date(2025, 5, day),
                    questions: 1,
                })
                .unwrap();
        }

        assert_eq!(store.count_usage_before(date(2025, 5, 2)).unwrap(), 1);
        assert_eq!(store.purge_usage_before(date(2025, 5, 2)).unwrap(), 1);
        assert_eq!(store.usage_rows().unwrap().len(), 2);
    }

    #[test]
    fn failing_table_errors() {
        let store = MemoryStore::new();
        store.set_failing(Table::Usage, true).unwrap();
        assert!(store.purge_usage_before(date(2025, 1, 1)).is_err());

        store.set_failing(Table::Usage, false).unwrap();
        assert_eq!(store.purge_usage_before(date(2025, 1, 1)).unwrap(), 0);
    }

    #[test]
    fn unknown_plan_has_no_grace() {
        let store = MemoryStore::new();
        store.define_plan("pro", Some(7)).unwrap();
        store.define_plan("free", None).unwrap();

        assert_eq!(store.plan_grace_days("pro").unwrap(), Some(7));
        assert_eq!(store.plan_grace_days("free").unwrap(), None);
        assert_eq!(store.plan_grace_days("team").unwrap(), None);
    }

    #[test]
    fn unknown_function_is_not_found() {
        let store = MemoryStore::new();
        let err = store.call_function("missing").unwrap_err();
        assert!(matches!(err, SubkeeperError::ApiError { status: 404, .. }));
        assert_eq!(store.function_calls().unwrap(), ["missing"]);
    }
}
