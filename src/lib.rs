//! subkeeper - scheduled maintenance for subscription records
//!
//! Each invocation runs a fixed set of idempotent passes against a
//! PostgREST database (such as Supabase) using a service role key:
//!
//! - promote pending plan changes,
//! - deactivate subscriptions past their expiration and grace period,
//! - purge old daily usage rows,
//! - optionally call a credit expiry database function.
//!
//! Scheduling is left to whatever invokes the binary (cron, a CI schedule).

pub mod config;
pub mod database;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod validation;
