//! Daily usage purge job.
//!
//! Deletes per-day usage counters older than the retention window.

use chrono::{Days, NaiveDate};
use tracing::{debug, info};

use crate::database::Database;

use super::{JobError, PassOutcome};

/// First date that is kept: rows dated strictly before it are purged.
pub fn retention_cutoff(today: NaiveDate, retention_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Delete usage rows older than `retention_days`.
///
/// Deletes rows where:
/// - `usage_date < today - retention_days`
///
/// Returns the number of rows removed (or that would be removed on a dry run).
pub async fn run_usage_purge(
    db: &Database,
    today: NaiveDate,
    retention_days: u32,
    dry_run: bool,
) -> Result<PassOutcome, JobError> {
    let cutoff = retention_cutoff(today, retention_days);

    debug!(
        "Purging usage rows dated before {} (retention {} days)",
        cutoff, retention_days
    );

    let removed = if dry_run {
        db.count_usage_before(cutoff).await?
    } else {
        db.purge_usage_before(cutoff).await?
    };

    if removed > 0 && !dry_run {
        info!(
            event = "usage_purged",
            rows = removed,
            cutoff = %cutoff,
            "Usage rows purged"
        );
    }

    let removed = u32::try_from(removed).unwrap_or(u32::MAX);
    Ok(PassOutcome {
        checked: removed,
        changed: removed,
        failed: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn cutoff_counts_back_from_today() {
        assert_eq!(retention_cutoff(date(2025, 10, 16), 30), date(2025, 9, 16));
        assert_eq!(retention_cutoff(date(2025, 3, 1), 1), date(2025, 2, 28));
    }

    #[test]
    fn zero_retention_keeps_only_today() {
        assert_eq!(retention_cutoff(date(2025, 10, 16), 0), date(2025, 10, 16));
    }
}
