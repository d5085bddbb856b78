use std::process::ExitCode;

use tracing::{error, info};

use subkeeper::config::{LoggingConfig, SubkeeperConfig};
use subkeeper::database::Database;
use subkeeper::errors::SubkeeperError;
use subkeeper::jobs::JobRunner;
use subkeeper::logging::init_logging;

const EXIT_PASS_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn startup_exit_status(err: &SubkeeperError) -> u8 {
    if err.is_fatal() {
        EXIT_CONFIG
    } else {
        EXIT_PASS_FAILED
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match SubkeeperConfig::load() {
        Ok(config) => config,
        Err(e) => {
            init_logging(&LoggingConfig::default());
            error!("Startup aborted: {e}");
            return ExitCode::from(startup_exit_status(&e));
        }
    };

    init_logging(&config.logging);
    info!(
        subscriptions_table = %config.database.subscriptions_table,
        usage_table = %config.database.usage_table,
        dry_run = config.jobs.dry_run,
        "subkeeper {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let db = match Database::connect(&config.database) {
        Ok(db) => db,
        Err(e) => {
            error!("Startup aborted: {e}");
            return ExitCode::from(startup_exit_status(&e));
        }
    };

    let runner = JobRunner::new(db, config.jobs.clone(), config.database.page_size);
    let report = runner.run_once().await;

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to render run report: {e}"),
    }

    if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PASS_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_exit_with_config_status() {
        assert_eq!(
            startup_exit_status(&SubkeeperError::MissingCredential("SUPABASE_URL")),
            EXIT_CONFIG
        );
        assert_eq!(
            startup_exit_status(&SubkeeperError::ConfigError("bad page size".into())),
            EXIT_CONFIG
        );
    }

    #[test]
    fn other_startup_errors_exit_as_failed_run() {
        let err = SubkeeperError::StoreUnavailable("no route".into());
        assert_eq!(startup_exit_status(&err), EXIT_PASS_FAILED);
    }
}
