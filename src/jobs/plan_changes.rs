//! Pending plan change job.
//!
//! Promotes `pending_plan_code` into `plan_code` and clears the pending
//! fields on every subscription that has one.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::database::{Database, Subscription};
use crate::logging::{log_subscription_event, SubscriptionEvent};

use super::{JobError, PassOptions, PassOutcome};

/// Apply every pending plan change.
///
/// Queries for subscriptions where:
/// - `pending_plan_code IS NOT NULL`
///
/// Updates matching subscriptions:
/// - Sets `plan_code = pending_plan_code`
/// - Clears `pending_plan_code` and `pending_starts_at`
///
/// A blank pending code is cleared without touching `plan_code`. Each update
/// is conditional on the pending code read, so a row rescheduled in the
/// meantime is left for the next run.
pub async fn run_plan_changes(
    db: &Database,
    now: DateTime<Utc>,
    options: &PassOptions,
) -> Result<PassOutcome, JobError> {
    debug!("Applying pending plan changes at {}", now);

    let mut outcome = PassOutcome::default();
    let mut after: Option<String> = None;

    loop {
        let page = db
            .pending_plan_changes(after.as_deref(), options.page_size)
            .await
            .map_err(|e| JobError::interrupted(outcome, e))?;

        // The server may cap a page below `page_size`, so only an empty page ends the scan.
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());

        for subscription in &page {
            outcome.checked += 1;
            apply_one(db, subscription, now, options.dry_run, &mut outcome).await;
        }
    }

    Ok(outcome)
}

async fn apply_one(
    db: &Database,
    subscription: &Subscription,
    now: DateTime<Utc>,
    dry_run: bool,
    outcome: &mut PassOutcome,
) {
    let Some(raw_pending) = subscription.pending_plan_code.as_deref() else {
        return;
    };
    let pending = raw_pending.trim();
    let new_plan = (!pending.is_empty()).then_some(pending);
    let from = subscription.plan_code.as_deref().unwrap_or("none");

    if dry_run {
        if let Some(plan) = new_plan {
            outcome.changed += 1;
            debug!("Would move subscription {} from {} to {}", subscription.id, from, plan);
        }
        return;
    }

    match db
        .apply_plan_change(&subscription.id, raw_pending, new_plan, now)
        .await
    {
        Ok(true) => match new_plan {
            Some(plan) => {
                outcome.changed += 1;
                log_subscription_event(
                    SubscriptionEvent::PlanChanged,
                    &subscription.id,
                    Some(&format!("{from} -> {plan}")),
                );
            }
            None => log_subscription_event(
                SubscriptionEvent::PendingCleared,
                &subscription.id,
                Some("blank pending plan code"),
            ),
        },
        Ok(false) => {
            debug!(
                "Subscription {} changed since it was read; leaving it",
                subscription.id
            );
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
