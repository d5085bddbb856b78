//! Configuration system for subkeeper.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `subkeeper.toml` file (path overridable with `SUBKEEPER_CONFIG`)
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `SUPABASE_URL` - Database service endpoint (required)
//! - `SUPABASE_SERVICE_ROLE_KEY` - Service role key (required)
//! - `SUBKEEPER_SUBSCRIPTIONS_TABLE` - Subscriptions table name
//! - `SUBKEEPER_USAGE_TABLE` - Daily usage table name
//! - `SUBKEEPER_PLANS_TABLE` - Plans table consulted for grace days
//! - `SUBKEEPER_REQUEST_TIMEOUT_SECS` - Per-request timeout in seconds
//! - `SUBKEEPER_PAGE_SIZE` - Rows fetched per page
//! - `SUBKEEPER_USAGE_RETENTION_DAYS` - Days of usage rows to keep
//! - `SUBKEEPER_DEFAULT_GRACE_DAYS` - Grace days for rows without their own value
//! - `SUBKEEPER_DRY_RUN` - Report changes without writing them
//! - `SUBKEEPER_EXPIRE_CREDITS` - Enable the credit expiry RPC pass
//! - `SUBKEEPER_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
//! - `SUBKEEPER_LOG_FORMAT` - Log format (text, json)

use config::Config;
use serde::Deserialize;
use std::env;

use crate::errors::{SubkeeperError, SubkeeperResult};
use crate::validation::{validate_base_url, validate_identifier, validate_range};

/// Environment variable holding the database endpoint.
pub const URL_ENV: &str = "SUPABASE_URL";
/// Environment variable holding the service role key.
pub const SERVICE_ROLE_KEY_ENV: &str = "SUPABASE_SERVICE_ROLE_KEY";
/// Environment variable pointing at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "SUBKEEPER_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "subkeeper";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubkeeperConfig {
    /// Database endpoint and table configuration
    pub database: DatabaseConfig,
    /// Maintenance pass configuration
    pub jobs: JobConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database endpoint configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Base URL of the PostgREST service (without `/rest/v1`)
    pub url: String,
    /// Service role key, sent as both `apikey` and bearer token
    pub service_role_key: String,
    /// Table holding subscription rows
    pub subscriptions_table: String,
    /// Table holding per-user, per-day usage counters
    pub usage_table: String,
    /// Table holding plan definitions, read for `grace_days`
    pub plans_table: String,
    /// Timeout applied to every request, in seconds
    pub request_timeout_secs: u64,
    /// Number of rows read per page
    pub page_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_role_key: String::new(),
            subscriptions_table: "user_subscriptions".to_string(),
            usage_table: "daily_question_usage".to_string(),
            plans_table: "plans".to_string(),
            request_timeout_secs: 30,
            page_size: 1000,
        }
    }
}

// The key never reaches log output.
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url)
            .field("service_role_key", &"<redacted>")
            .field("subscriptions_table", &self.subscriptions_table)
            .field("usage_table", &self.usage_table)
            .field("plans_table", &self.plans_table)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Maintenance pass configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Usage rows with a `usage_date` older than this many days are deleted (default: 30)
    pub usage_retention_days: u32,
    /// Grace days applied when neither the row nor its plan carries any (default: 0)
    pub default_grace_days: u32,
    /// Report what would change without writing (default: false)
    pub dry_run: bool,
    /// Whether the credit expiry RPC pass runs (default: false)
    pub expire_credits_enabled: bool,
    /// Database function called by the credit expiry pass
    pub expire_credits_function: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            usage_retention_days: 30,
            default_grace_days: 0,
            dry_run: false,
            expire_credits_enabled: false,
            expire_credits_function: "expire_ai_credits".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Output format: text or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Read an environment variable, treating blank values as unset.
fn env_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable; a value that is set but unreadable is an error.
fn env_parsed<T: std::str::FromStr>(key: &str) -> SubkeeperResult<Option<T>> {
    env_trimmed(key)
        .map(|v| {
            v.parse::<T>().map_err(|_| {
                SubkeeperError::ConfigError(format!("{key} has an invalid value '{v}'"))
            })
        })
        .transpose()
}

/// Parse a boolean flag, accepting `true/false`, `1/0`, `yes/no` and `on/off`.
fn env_flag(key: &str) -> SubkeeperResult<Option<bool>> {
    env_trimmed(key)
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(SubkeeperError::ConfigError(format!(
                "{key} must be true or false, got '{v}'"
            ))),
        })
        .transpose()
}

impl SubkeeperConfig {
    /// Load configuration from file and environment, then validate it.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. `subkeeper.toml` file (optional)
    /// 3. Environment variables
    pub fn load() -> SubkeeperResult<Self> {
        let config_file =
            env_trimmed(CONFIG_PATH_ENV).unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
        let defaults = SubkeeperConfig::default();

        let builder = Config::builder()
            // Start with defaults
            .set_default("database.url", "")?
            .set_default("database.service_role_key", "")?
            .set_default(
                "database.subscriptions_table",
                defaults.database.subscriptions_table,
            )?
            .set_default("database.usage_table", defaults.database.usage_table)?
            .set_default("database.plans_table", defaults.database.plans_table)?
            .set_default(
                "database.request_timeout_secs",
                defaults.database.request_timeout_secs as i64,
            )?
            .set_default("database.page_size", i64::from(defaults.database.page_size))?
            .set_default(
                "jobs.usage_retention_days",
                i64::from(defaults.jobs.usage_retention_days),
            )?
            .set_default(
                "jobs.default_grace_days",
                i64::from(defaults.jobs.default_grace_days),
            )?
            .set_default("jobs.dry_run", defaults.jobs.dry_run)?
            .set_default(
                "jobs.expire_credits_enabled",
                defaults.jobs.expire_credits_enabled,
            )?
            .set_default(
                "jobs.expire_credits_function",
                defaults.jobs.expire_credits_function,
            )?
            .set_default("logging.level", defaults.logging.level)?
            .set_default("logging.format", defaults.logging.format)?
            // Load from subkeeper.toml (optional)
            .add_source(config::File::with_name(&config_file).required(false))
            // Override with environment variables
            .set_override_option("database.url", env_trimmed(URL_ENV))?
            .set_override_option(
                "database.service_role_key",
                env_trimmed(SERVICE_ROLE_KEY_ENV),
            )?
            .set_override_option(
                "database.subscriptions_table",
                env_trimmed("SUBKEEPER_SUBSCRIPTIONS_TABLE"),
            )?
            .set_override_option("database.usage_table", env_trimmed("SUBKEEPER_USAGE_TABLE"))?
            .set_override_option("database.plans_table", env_trimmed("SUBKEEPER_PLANS_TABLE"))?
            .set_override_option(
                "database.request_timeout_secs",
                env_parsed::<i64>("SUBKEEPER_REQUEST_TIMEOUT_SECS")?,
            )?
            .set_override_option("database.page_size", env_parsed::<i64>("SUBKEEPER_PAGE_SIZE")?)?
            .set_override_option(
                "jobs.usage_retention_days",
                env_parsed::<i64>("SUBKEEPER_USAGE_RETENTION_DAYS")?,
            )?
            .set_override_option(
                "jobs.default_grace_days",
                env_parsed::<i64>("SUBKEEPER_DEFAULT_GRACE_DAYS")?,
            )?
            .set_override_option("jobs.dry_run", env_flag("SUBKEEPER_DRY_RUN")?)?
            .set_override_option(
                "jobs.expire_credits_enabled",
                env_flag("SUBKEEPER_EXPIRE_CREDITS")?,
            )?
            .set_override_option("logging.level", env_trimmed("SUBKEEPER_LOG_LEVEL"))?
            .set_override_option("logging.format", env_trimmed("SUBKEEPER_LOG_FORMAT"))?;

        let settings = builder
            .build()
            .map_err(|e| SubkeeperError::ConfigError(format!("failed to build config: {e}")))?;

        let mut config: SubkeeperConfig = settings.try_deserialize().map_err(|e| {
            SubkeeperError::ConfigError(format!("failed to deserialize config: {e}"))
        })?;

        // File values are trimmed the same way environment values are.
        config.database.url = config.database.url.trim().trim_end_matches('/').to_string();
        config.database.service_role_key = config.database.service_role_key.trim().to_string();

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Missing credentials are reported before anything else so the caller
    /// can tell them apart from malformed values.
    pub fn validate(&self) -> SubkeeperResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(SubkeeperError::MissingCredential(URL_ENV));
        }
        if self.database.service_role_key.trim().is_empty() {
            return Err(SubkeeperError::MissingCredential(SERVICE_ROLE_KEY_ENV));
        }

        let invalid = |e: crate::validation::ValidationError| {
            SubkeeperError::ConfigError(e.to_string())
        };

        validate_base_url(&self.database.url, "database.url").map_err(invalid)?;
        validate_identifier(
            &self.database.subscriptions_table,
            "database.subscriptions_table",
        )
        .map_err(invalid)?;
        validate_identifier(&self.database.usage_table, "database.usage_table").map_err(invalid)?;
        validate_identifier(&self.database.plans_table, "database.plans_table").map_err(invalid)?;
        validate_range(
            self.database.page_size as u64,
            1,
            10_000,
            "database.page_size",
        )
        .map_err(invalid)?;
        validate_range(
            self.database.request_timeout_secs,
            1,
            600,
            "database.request_timeout_secs",
        )
        .map_err(invalid)?;

        if self.jobs.expire_credits_enabled {
            validate_identifier(
                &self.jobs.expire_credits_function,
                "jobs.expire_credits_function",
            )
            .map_err(invalid)?;
        }

        // Validate log level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(SubkeeperError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        match self.logging.format.to_lowercase().as_str() {
            "text" | "json" => {}
            other => {
                return Err(SubkeeperError::ConfigError(format!(
                    "logging.format must be 'text' or 'json', got '{other}'"
                )));
            }
        }

        Ok(())
    }
}
