//! Structured logging for keyward.
//!
//! [`init_logging`] installs a `tracing-subscriber` formatter filtered by the
//! configured level (or `RUST_LOG` when set). [`log_license_event`] records
//! lifecycle changes with the license's store id; plaintext keys are never
//! logged.

use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// License state change event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseEvent {
    Created,
    Imported,
    ImportRejected,
    Generated,
    Updated,
    Deleted,
    Activated,
    Deactivated,
    ActivationRefused,
    MetaAdded,
    MetaUpdated,
    MetaDeleted,
}

impl std::fmt::Display for LicenseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LicenseEvent::Created => "created",
            LicenseEvent::Imported => "imported",
            LicenseEvent::ImportRejected => "import_rejected",
            LicenseEvent::Generated => "generated",
            LicenseEvent::Updated => "updated",
            LicenseEvent::Deleted => "deleted",
            LicenseEvent::Activated => "activated",
            LicenseEvent::Deactivated => "deactivated",
            LicenseEvent::ActivationRefused => "activation_refused",
            LicenseEvent::MetaAdded => "meta_added",
            LicenseEvent::MetaUpdated => "meta_updated",
            LicenseEvent::MetaDeleted => "meta_deleted",
        };
        write!(f, "{}", s)
    }
}

impl LicenseEvent {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            LicenseEvent::ImportRejected | LicenseEvent::ActivationRefused
        )
    }
}

/// Log a license state change event.
///
/// # Arguments
///
/// * `event` - The type of license event
/// * `license_id` - Store id of the license (0 when it has none yet)
/// * `details` - Optional additional details about the event
pub fn log_license_event(event: LicenseEvent, license_id: i64, details: Option<&str>) {
    let span = info_span!(
        "license_event",
        event = %event,
        license_id = license_id,
    );
    let _enter = span.enter();

    match (event.is_failure(), details) {
        (true, Some(d)) => warn!(reason = %d, "License event occurred"),
        (true, None) => warn!("License event occurred"),
        (false, Some(d)) => info!(details = %d, "License event occurred"),
        (false, None) => info!("License event occurred"),
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` when logging is disabled or a subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> bool {
    if !config.enabled {
        return false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        assert_eq!(LicenseEvent::Created.to_string(), "created");
        assert_eq!(LicenseEvent::ActivationRefused.to_string(), "activation_refused");
        assert_eq!(LicenseEvent::MetaUpdated.to_string(), "meta_updated");
    }

    #[test]
    fn disabled_logging_installs_nothing() {
        let config = LoggingConfig::default();
        assert!(!init_logging(&config));
    }

    #[test]
    fn logging_events_without_subscriber_is_harmless() {
        log_license_event(LicenseEvent::Activated, 7, Some("times_activated=1"));
        log_license_event(LicenseEvent::ActivationRefused, 7, None);
    }
}
