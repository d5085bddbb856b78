//! Configuration loading tests.
//!
//! These mutate process environment variables, so each one is `#[serial]`.

use serial_test::serial;
use std::env;

use subkeeper::config::{SubkeeperConfig, CONFIG_PATH_ENV, SERVICE_ROLE_KEY_ENV, URL_ENV};
use subkeeper::errors::SubkeeperError;

const MANAGED_VARS: &[&str] = &[
    URL_ENV,
    SERVICE_ROLE_KEY_ENV,
    CONFIG_PATH_ENV,
    "SUBKEEPER_SUBSCRIPTIONS_TABLE",
    "SUBKEEPER_USAGE_TABLE",
    "SUBKEEPER_PLANS_TABLE",
    "SUBKEEPER_REQUEST_TIMEOUT_SECS",
    "SUBKEEPER_PAGE_SIZE",
    "SUBKEEPER_USAGE_RETENTION_DAYS",
    "SUBKEEPER_DEFAULT_GRACE_DAYS",
    "SUBKEEPER_DRY_RUN",
    "SUBKEEPER_EXPIRE_CREDITS",
    "SUBKEEPER_LOG_LEVEL",
    "SUBKEEPER_LOG_FORMAT",
];

fn clear_env() {
    for var in MANAGED_VARS {
        env::remove_var(var);
    }
    // Point at a file that does not exist so a stray local config is ignored.
    env::set_var(CONFIG_PATH_ENV, temp_path("subkeeper-absent"));
}

fn set_credentials() {
    env::set_var(URL_ENV, "https://project.supabase.co");
    env::set_var(SERVICE_ROLE_KEY_ENV, "service-role-key");
}

fn temp_path(name: &str) -> String {
    let mut path = env::temp_dir();
    path.push(format!("{name}-{}", std::process::id()));
    path.to_string_lossy().into_owned()
}

#[test]
#[serial]
fn missing_url_is_fatal() {
    clear_env();
    env::set_var(SERVICE_ROLE_KEY_ENV, "service-role-key");

    let err = SubkeeperConfig::load().unwrap_err();
    assert!(matches!(err, SubkeeperError::MissingCredential(URL_ENV)));
    assert!(err.is_fatal());
}

#[test]
#[serial]
fn missing_key_is_fatal() {
    clear_env();
    env::set_var(URL_ENV, "https://project.supabase.co");

    let err = SubkeeperConfig::load().unwrap_err();
    assert!(matches!(
        err,
        SubkeeperError::MissingCredential(SERVICE_ROLE_KEY_ENV)
    ));
}

#[test]
#[serial]
fn blank_credentials_count_as_missing() {
    clear_env();
    env::set_var(URL_ENV, "   ");
    env::set_var(SERVICE_ROLE_KEY_ENV, "service-role-key");

    assert!(matches!(
        SubkeeperConfig::load(),
        Err(SubkeeperError::MissingCredential(URL_ENV))
    ));
}

#[test]
#[serial]
fn credentials_are_trimmed() {
    clear_env();
    env::set_var(URL_ENV, "  https://project.supabase.co/  ");
    env::set_var(SERVICE_ROLE_KEY_ENV, " service-role-key\n");

    let config = SubkeeperConfig::load().expect("config should load");
    assert_eq!(config.database.url, "https://project.supabase.co");
    assert_eq!(config.database.service_role_key, "service-role-key");
}

#[test]
#[serial]
fn defaults_apply_with_only_credentials() {
    clear_env();
    set_credentials();

    let config = SubkeeperConfig::load().expect("config should load");
    assert_eq!(config.database.subscriptions_table, "user_subscriptions");
    assert_eq!(config.database.usage_table, "daily_question_usage");
    assert_eq!(config.database.plans_table, "plans");
    assert_eq!(config.database.page_size, 1000);
    assert_eq!(config.jobs.usage_retention_days, 30);
    assert!(!config.jobs.dry_run);
    assert!(!config.jobs.expire_credits_enabled);
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    clear_env();
    set_credentials();
    env::set_var("SUBKEEPER_USAGE_TABLE", "question_usage");
    env::set_var("SUBKEEPER_PAGE_SIZE", "250");
    env::set_var("SUBKEEPER_USAGE_RETENTION_DAYS", "7");
    env::set_var("SUBKEEPER_DEFAULT_GRACE_DAYS", "2");
    env::set_var("SUBKEEPER_DRY_RUN", "true");
    env::set_var("SUBKEEPER_LOG_FORMAT", "json");

    let config = SubkeeperConfig::load().expect("config should load");
    assert_eq!(config.database.usage_table, "question_usage");
    assert_eq!(config.database.page_size, 250);
    assert_eq!(config.jobs.usage_retention_days, 7);
    assert_eq!(config.jobs.default_grace_days, 2);
    assert!(config.jobs.dry_run);
    assert_eq!(config.logging.format, "json");

    clear_env();
}

#[test]
#[serial]
fn numeric_flags_are_accepted() {
    clear_env();
    set_credentials();
    env::set_var("SUBKEEPER_DRY_RUN", "1");
    env::set_var("SUBKEEPER_EXPIRE_CREDITS", "off");

    let config = SubkeeperConfig::load().expect("config should load");
    assert!(config.jobs.dry_run);
    assert!(!config.jobs.expire_credits_enabled);

    clear_env();
}

#[test]
#[serial]
fn unreadable_flag_is_rejected() {
    clear_env();
    set_credentials();
    env::set_var("SUBKEEPER_DRY_RUN", "maybe");

    let err = SubkeeperConfig::load().unwrap_err();
    assert!(matches!(err, SubkeeperError::ConfigError(_)));
    assert!(err.to_string().contains("SUBKEEPER_DRY_RUN"), "{err}");

    clear_env();
}

#[test]
#[serial]
fn unreadable_number_is_rejected() {
    clear_env();
    set_credentials();
    env::set_var("SUBKEEPER_USAGE_RETENTION_DAYS", "abc");

    let err = SubkeeperConfig::load().unwrap_err();
    assert!(matches!(err, SubkeeperError::ConfigError(_)));
    assert!(err.is_fatal());

    clear_env();
}

#[test]
#[serial]
fn invalid_table_name_is_rejected() {
    clear_env();
    set_credentials();
    env::set_var("SUBKEEPER_SUBSCRIPTIONS_TABLE", "subs?select=*");

    let err = SubkeeperConfig::load().unwrap_err();
    assert!(matches!(err, SubkeeperError::ConfigError(_)));

    clear_env();
}

#[test]
#[serial]
fn config_file_is_read_and_env_wins() {
    clear_env();
    set_credentials();

    let path = format!("{}.toml", temp_path("subkeeper-config"));
    std::fs::write(
        &path,
        r#"
[database]
subscriptions_table = "subscriptions"
page_size = 500

[jobs]
usage_retention_days = 14
expire_credits_enabled = true
expire_credits_function = "expire_credits"
"#,
    )
    .expect("failed to write config file");

    env::set_var(CONFIG_PATH_ENV, &path);
    env::set_var("SUBKEEPER_PAGE_SIZE", "50");

    let config = SubkeeperConfig::load();
    let _ = std::fs::remove_file(&path);
    let config = config.expect("config should load");

    assert_eq!(config.database.subscriptions_table, "subscriptions");
    assert_eq!(config.database.page_size, 50);
    assert_eq!(config.jobs.usage_retention_days, 14);
    assert!(config.jobs.expire_credits_enabled);
    assert_eq!(config.jobs.expire_credits_function, "expire_credits");

    clear_env();
}
