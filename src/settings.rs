//! Operator settings
//!
//! Parsed once at startup from flags or the environment.

use std::time::Duration;

use clap::Parser;

use crate::crd::MANAGER_NAME;

#[derive(Parser, Clone, Debug)]
#[command(
    name = "runtime-operator",
    about = "Operator reconciling ApplicationDefinition resources"
)]
pub struct Settings {
    /// Namespace to watch; all namespaces when unset.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Field manager identity for server-side apply.
    #[arg(long, env = "FIELD_MANAGER", default_value = MANAGER_NAME)]
    pub field_manager: String,

    /// Default requeue interval in seconds.
    #[arg(long, env = "REQUEUE_SECONDS", default_value_t = 30)]
    pub requeue_seconds: u64,

    /// Requeue interval after an optimistic-concurrency conflict.
    #[arg(long, env = "CONFLICT_REQUEUE_SECONDS", default_value_t = 5)]
    pub conflict_requeue_seconds: u64,

    /// Print the ApplicationDefinition CRD manifest and exit.
    #[arg(long)]
    pub crdgen: bool,
}

impl Settings {
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    pub fn conflict_requeue_interval(&self) -> Duration {
        Duration::from_secs(self.conflict_requeue_seconds)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            field_manager: MANAGER_NAME.to_string(),
            requeue_seconds: 30,
            conflict_requeue_seconds: 5,
            crdgen: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_requeue_policy() {
        let settings = Settings::default();
        assert_eq!(settings.requeue_interval(), Duration::from_secs(30));
        assert_eq!(settings.conflict_requeue_interval(), Duration::from_secs(5));
        assert_eq!(settings.field_manager, "runtime-operator");
    }

    #[test]
    fn parses_flags() {
        let settings = Settings::parse_from([
            "runtime-operator",
            "--watch-namespace",
            "apps",
            "--requeue-seconds",
            "10",
        ]);
        assert_eq!(settings.watch_namespace.as_deref(), Some("apps"));
        assert_eq!(settings.requeue_interval(), Duration::from_secs(10));
    }
}
