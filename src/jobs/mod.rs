//! Maintenance passes for subkeeper.
//!
//! One invocation runs every pass once, in order, against the same `now`.
//! Passes are independent: a failing pass is logged and recorded in the
//! report, and the remaining passes still run.
//!
//! # Available Jobs
//!
//! - **Plan Changes**: Promotes `pending_plan_code` into `plan_code` and
//!   clears the pending fields
//!
//! - **Expiration**: Deactivates active subscriptions once
//!   `expires_at + grace_days` has passed
//!
//! - **Usage Purge**: Deletes daily usage rows older than the retention window
//!
//! - **Credit Expiry** (optional): Calls the credit expiry database function
//!
//! # Usage
//!
//! ```rust,ignore
//! use subkeeper::config::SubkeeperConfig;
//! use subkeeper::database::Database;
//! use subkeeper::jobs::JobRunner;
//!
//! let config = SubkeeperConfig::load()?;
//! let db = Database::connect(&config.database)?;
//! let runner = JobRunner::new(db, config.jobs.clone(), config.database.page_size);
//! let report = runner.run_once().await;
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::database::Database;
use crate::errors::SubkeeperError;

mod credit_expiry;
mod expiration;
mod plan_changes;
mod usage_purge;

pub use credit_expiry::run_credit_expiry;
pub use expiration::{grace_deadline, is_past_grace, run_expiration_check};
pub use plan_changes::run_plan_changes;
pub use usage_purge::{retention_cutoff, run_usage_purge};

pub const PLAN_CHANGES: &str = "apply_plan_changes";
pub const EXPIRATION: &str = "deactivate_expired";
pub const USAGE_PURGE: &str = "purge_usage";
pub const CREDIT_EXPIRY: &str = "expire_credits";

/// Settings shared by the paged passes.
#[derive(Debug, Clone, Copy)]
pub struct PassOptions {
    /// Rows read per page
    pub page_size: u32,
    /// Count what would change without writing
    pub dry_run: bool,
}

/// Row counts produced by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassOutcome {
    /// Rows examined
    pub checked: u32,
    /// Rows changed (or that would change on a dry run)
    pub changed: u32,
    /// Rows that could not be processed (failed write or lookup)
    pub failed: u32,
}

/// Result of one pass as it appears in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub name: &'static str,
    pub ok: bool,
    pub checked: u32,
    pub changed: u32,
    pub failed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PassReport {
    fn from_result(name: &'static str, result: Result<PassOutcome, JobError>) -> Self {
        match result {
            Ok(outcome) => Self {
                name,
                ok: outcome.failed == 0,
                checked: outcome.checked,
                changed: outcome.changed,
                failed: outcome.failed,
                error: None,
            },
            Err(e) => {
                let outcome = e.partial_outcome();
                Self {
                    name,
                    ok: false,
                    checked: outcome.checked,
                    changed: outcome.changed,
                    failed: outcome.failed,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Summary of one invocation, printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub ok: bool,
    pub passes: Vec<PassReport>,
}

impl RunReport {
    /// Look up a pass by name.
    pub fn pass(&self, name: &str) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.name == name)
    }
}

/// Runs the maintenance passes against one database.
pub struct JobRunner {
    db: Database,
    config: JobConfig,
    page_size: u32,
}

impl JobRunner {
    /// Create a new job runner.
    pub fn new(db: Database, config: JobConfig, page_size: u32) -> Self {
        Self {
            db,
            config,
            page_size: page_size.max(1),
        }
    }

    fn options(&self) -> PassOptions {
        PassOptions {
            page_size: self.page_size,
            dry_run: self.config.dry_run,
        }
    }

    /// Run every pass once using the current time.
    pub async fn run_once(&self) -> RunReport {
        self.run_once_at(Utc::now()).await
    }

    /// Run every pass once as if the current time were `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, dry_run = self.config.dry_run);

        async move {
            info!("Starting maintenance run at {}", now);

            let mut passes = vec![
                Self::record(PLAN_CHANGES, self.run_plan_changes_now(now)).await,
                Self::record(EXPIRATION, self.run_expiration_check_now(now)).await,
                Self::record(USAGE_PURGE, self.run_usage_purge_now(now)).await,
            ];

            if self.config.expire_credits_enabled {
                passes.push(Self::record(CREDIT_EXPIRY, self.run_credit_expiry_now()).await);
            }

            let ok = passes.iter().all(|p| p.ok);
            let finished_at = Utc::now();

            if ok {
                info!("Maintenance run completed successfully");
            } else {
                let failed: Vec<_> = passes.iter().filter(|p| !p.ok).map(|p| p.name).collect();
                error!("Maintenance run finished with failed passes: {}", failed.join(", "));
            }

            RunReport {
                run_id,
                started_at: now,
                finished_at,
                dry_run: self.config.dry_run,
                ok,
                passes,
            }
        }
        .instrument(span)
        .await
    }

    async fn record<F>(name: &'static str, pass: F) -> PassReport
    where
        F: Future<Output = Result<PassOutcome, JobError>>,
    {
        info!("Running pass {}", name);
        let report = PassReport::from_result(name, pass.await);

        match (&report.error, report.failed) {
            (Some(e), _) => error!("Pass {} failed: {}", name, e),
            (None, 0) => info!(
                "Pass {}: {} checked, {} changed",
                name, report.checked, report.changed
            ),
            (None, failed) => error!(
                "Pass {}: {} checked, {} changed, {} writes failed",
                name, report.checked, report.changed, failed
            ),
        }

        report
    }

    /// Run the plan change pass immediately.
    pub async fn run_plan_changes_now(&self, now: DateTime<Utc>) -> Result<PassOutcome, JobError> {
        run_plan_changes(&self.db, now, &self.options()).await
    }

    /// Run the expiration pass immediately.
    pub async fn run_expiration_check_now(
        &self,
        now: DateTime<Utc>,
    ) -> Result<PassOutcome, JobError> {
        run_expiration_check(&self.db, now, self.config.default_grace_days, &self.options()).await
    }

    /// Run the usage purge immediately.
    pub async fn run_usage_purge_now(&self, now: DateTime<Utc>) -> Result<PassOutcome, JobError> {
        run_usage_purge(
            &self.db,
            now.date_naive(),
            self.config.usage_retention_days,
            self.config.dry_run,
        )
        .await
    }

    /// Call the credit expiry function immediately.
    pub async fn run_credit_expiry_now(&self) -> Result<PassOutcome, JobError> {
        run_credit_expiry(
            &self.db,
            &self.config.expire_credits_function,
            self.config.dry_run,
        )
        .await
    }
}

/// Errors that can occur while running a pass.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A page read failed; `outcome` holds what the pass did before it.
    #[error("Database error: {message}")]
    Interrupted {
        outcome: PassOutcome,
        message: String,
    },
}

impl JobError {
    pub(crate) fn interrupted(outcome: PassOutcome, err: SubkeeperError) -> Self {
        JobError::Interrupted {
            outcome,
            message: err.to_string(),
        }
    }

    /// Counts accumulated before the pass stopped.
    pub fn partial_outcome(&self) -> PassOutcome {
        match self {
            JobError::Interrupted { outcome, .. } => *outcome,
            JobError::DatabaseError(_) => PassOutcome::default(),
        }
    }
}

impl From<SubkeeperError> for JobError {
    fn from(err: SubkeeperError) -> Self {
        JobError::DatabaseError(err.to_string())
    }
}
