//! Credit expiry job.
//!
//! Calls a database function that expires prepaid credits. The function
//! owns the logic; this pass only triggers it and records the result.

use tracing::{debug, info};

use crate::database::Database;

use super::{JobError, PassOutcome};

/// Call `function` once and report the number it returns, if any.
pub async fn run_credit_expiry(
    db: &Database,
    function: &str,
    dry_run: bool,
) -> Result<PassOutcome, JobError> {
    if dry_run {
        debug!("Would call database function {}", function);
        return Ok(PassOutcome::default());
    }

    let result = db.call_function(function).await?;
    info!(function = function, result = %result, "Credit expiry function completed");

    let changed = result
        .as_u64()
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0);

    Ok(PassOutcome {
        checked: 0,
        changed,
        failed: 0,
    })
}
