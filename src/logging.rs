//! Logging setup and structured subscription events.
//!
//! Logs go to stderr so stdout stays free for the run report.
//!
//! # Usage
//!
//! ```rust,ignore
//! use subkeeper::config::LoggingConfig;
//! use subkeeper::logging::init_logging;
//!
//! init_logging(&LoggingConfig::default());
//! ```

use tracing::{info, info_span, warn, Level};

use crate::config::LoggingConfig;

/// Subscription state change event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Pending plan was promoted to the active plan
    PlanChanged,
    /// A blank pending plan was cleared
    PendingCleared,
    /// Subscription was deactivated after its grace period
    Deactivated,
    /// Subscription could not be processed
    Skipped,
    /// A write to the subscription failed
    WriteFailed,
}

impl std::fmt::Display for SubscriptionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionEvent::PlanChanged => "plan_changed",
            SubscriptionEvent::PendingCleared => "pending_cleared",
            SubscriptionEvent::Deactivated => "deactivated",
            SubscriptionEvent::Skipped => "skipped",
            SubscriptionEvent::WriteFailed => "write_failed",
        };
        write!(f, "{}", s)
    }
}

/// Log a subscription state change event.
///
/// # Arguments
///
/// * `event` - The type of subscription event
/// * `subscription_id` - The subscription row id
/// * `details` - Optional additional details about the event
pub fn log_subscription_event(
    event: SubscriptionEvent,
    subscription_id: &str,
    details: Option<&str>,
) {
    let span = info_span!(
        "subscription_event",
        event = %event,
        subscription_id = %subscription_id,
    );
    let _enter = span.enter();

    match event {
        SubscriptionEvent::Skipped | SubscriptionEvent::WriteFailed => {
            if let Some(d) = details {
                warn!(reason = %d, "Subscription event occurred");
            } else {
                warn!("Subscription event occurred");
            }
        }
        _ => {
            if let Some(d) = details {
                info!(details = %d, "Subscription event occurred");
            } else {
                info!("Subscription event occurred");
            }
        }
    }
}

/// Map a configured level name to a tracing level; unknown names fall back to info.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global tracing subscriber.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let level = parse_level(&config.level);

    let result = if config.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_levels() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("info"), Level::INFO);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn event_names() {
        assert_eq!(SubscriptionEvent::PlanChanged.to_string(), "plan_changed");
        assert_eq!(SubscriptionEvent::Deactivated.to_string(), "deactivated");
        assert_eq!(SubscriptionEvent::WriteFailed.to_string(), "write_failed");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_logging(&LoggingConfig::default());
        init_logging(&LoggingConfig::default());
    }
}
