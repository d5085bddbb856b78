//! Subscription expiration job.
//!
//! This job checks for active subscriptions whose expiration date plus grace
//! period has passed, and marks them inactive with status 'expired'.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::database::{Database, Subscription};
use crate::errors::SubkeeperResult;
use crate::logging::{log_subscription_event, SubscriptionEvent};
use crate::validation::parse_timestamp;

use super::{JobError, PassOptions, PassOutcome};

/// The moment a subscription stops being covered by its grace period.
///
/// Negative grace values count as zero. Returns `None` when the deadline
/// does not fit in a timestamp, which means it is never reached.
pub fn grace_deadline(expires_at: DateTime<Utc>, grace_days: i64) -> Option<DateTime<Utc>> {
    let grace = Duration::try_days(grace_days.max(0))?;
    expires_at.checked_add_signed(grace)
}

/// Whether `now >= expires_at + grace_days`.
pub fn is_past_grace(now: DateTime<Utc>, expires_at: DateTime<Utc>, grace_days: i64) -> bool {
    grace_deadline(expires_at, grace_days).is_some_and(|deadline| now >= deadline)
}

/// Grace days looked up per plan code, cached for one pass.
#[derive(Debug, Default)]
struct PlanGraceCache {
    plans: HashMap<String, Option<i64>>,
}

impl PlanGraceCache {
    fn new() -> Self {
        Self::default()
    }

    /// Grace days the `plans` table gives `plan_code`, if any.
    async fn grace_days(
        &mut self,
        db: &Database,
        plan_code: &str,
    ) -> SubkeeperResult<Option<i64>> {
        if let Some(cached) = self.plans.get(plan_code) {
            return Ok(*cached);
        }
        let grace = db.plan_grace_days(plan_code).await?;
        self.plans.insert(plan_code.to_string(), grace);
        Ok(grace)
    }
}

/// Check for and deactivate expired subscriptions.
///
/// Queries for subscriptions where:
/// - `is_active = true`
/// - `expires_at <= now`
///
/// and then keeps those where `now >= expires_at + grace_days`. Grace days
/// come from the row itself, then from the row's plan in the plans table,
/// then from `default_grace_days`.
///
/// Updates matching subscriptions:
/// - Sets `is_active = false`
/// - Sets `status = 'expired'`
pub async fn run_expiration_check(
    db: &Database,
    now: DateTime<Utc>,
    default_grace_days: u32,
    options: &PassOptions,
) -> Result<PassOutcome, JobError> {
    debug!("Checking for expired subscriptions at {}", now);

    let mut outcome = PassOutcome::default();
    let mut plans = PlanGraceCache::new();
    let mut after: Option<String> = None;

    loop {
        let page = db
            .expiry_candidates(now, after.as_deref(), options.page_size)
            .await
            .map_err(|e| JobError::interrupted(outcome, e))?;

        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());

        for subscription in &page {
            outcome.checked += 1;
            expire_one(
                db,
                subscription,
                now,
                default_grace_days,
                &mut plans,
                options.dry_run,
                &mut outcome,
            )
            .await;
        }
    }

    Ok(outcome)
}

/// Grace days for one row: its own value, else its plan's, else the default.
async fn resolve_grace_days(
    db: &Database,
    subscription: &Subscription,
    default_grace_days: u32,
    plans: &mut PlanGraceCache,
) -> SubkeeperResult<i64> {
    if let Some(days) = subscription.grace_days {
        return Ok(days);
    }

    let plan_code = subscription.plan_code.as_deref().unwrap_or_default().trim();
    let from_plan = if plan_code.is_empty() {
        None
    } else {
        plans.grace_days(db, plan_code).await?
    };

    Ok(from_plan.unwrap_or(i64::from(default_grace_days)))
}

async fn expire_one(
    db: &Database,
    subscription: &Subscription,
    now: DateTime<Utc>,
    default_grace_days: u32,
    plans: &mut PlanGraceCache,
    dry_run: bool,
    outcome: &mut PassOutcome,
) {
    let raw_expires = subscription.expires_at.as_deref().unwrap_or_default();
    let Some(expires_at) = parse_timestamp(raw_expires) else {
        log_subscription_event(
            SubscriptionEvent::Skipped,
            &subscription.id,
            Some(&format!("unreadable expires_at '{raw_expires}'")),
        );
        return;
    };

    // Without a known grace period the row cannot be judged; leave it active.
    let grace_days = match resolve_grace_days(db, subscription, default_grace_days, plans).await {
        Ok(days) => days,
        Err(e) => {
            outcome.failed += 1;
            log_subscription_event(
                SubscriptionEvent::Skipped,
                &subscription.id,
                Some(&format!("plan grace lookup failed: {e}")),
            );
            return;
        }
    };

    if !is_past_grace(now, expires_at, grace_days) {
        debug!(
            "Subscription {} still within grace ({} days after {})",
            subscription.id, grace_days, expires_at
        );
        return;
    }

    if dry_run {
        outcome.changed += 1;
        debug!("Would deactivate subscription {}", subscription.id);
        return;
    }

    match db.deactivate_subscription(&subscription.id, now).await {
        Ok(true) => {
            outcome.changed += 1;
            log_subscription_event(
                SubscriptionEvent::Deactivated,
                &subscription.id,
                Some(&format!("expired at {expires_at}, grace {grace_days} days")),
            );
        }
        Ok(false) => {
            debug!("Subscription {} already inactive", subscription.id);
        }
        Err(e) => {
            outcome.failed += 1;
            log_subscription_event(
                SubscriptionEvent::WriteFailed,
                &subscription.id,
                Some(&e.to_string()),
            );
        }
    }
}
