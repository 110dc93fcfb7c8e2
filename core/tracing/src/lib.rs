// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::TryInitError;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TracingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default = "default_display_thread_names")]
    display_thread_names: bool,

    #[serde(default = "default_display_thread_ids")]
    display_thread_ids: bool,

    /// `EnvFilter` directives, e.g. `info,slim_grpc=debug`
    #[serde(default = "default_filter")]
    filter: String,
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        TracingConfiguration {
            log_level: default_log_level(),
            display_thread_names: default_display_thread_names(),
            display_thread_ids: default_display_thread_ids(),
            filter: default_filter(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_display_thread_names() -> bool {
    true
}

fn default_display_thread_ids() -> bool {
    false
}

fn default_filter() -> String {
    "info".to_string()
}

// unknown names fall back to INFO
fn resolve_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

impl TracingConfiguration {
    pub fn with_log_level(self, log_level: String) -> Self {
        TracingConfiguration { log_level, ..self }
    }

    pub fn with_display_thread_names(self, display_thread_names: bool) -> Self {
        TracingConfiguration {
            display_thread_names,
            ..self
        }
    }

    pub fn with_display_thread_ids(self, display_thread_ids: bool) -> Self {
        TracingConfiguration {
            display_thread_ids,
            ..self
        }
    }

    pub fn with_filter(self, filter: String) -> Self {
        TracingConfiguration { filter, ..self }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn display_thread_names(&self) -> bool {
        self.display_thread_names
    }

    pub fn display_thread_ids(&self) -> bool {
        self.display_thread_ids
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Filter built from the `filter` directives, or from the log level when
    /// they do not parse.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter)
            .unwrap_or_else(|_| EnvFilter::new(resolve_level(&self.log_level).as_str()))
    }

    /// Set up a subscriber that logs to stdout. Fails if a global
    /// subscriber is already installed.
    pub fn setup_tracing_subscriber(&self) -> Result<(), TryInitError> {
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(self.env_filter())
            .with_thread_names(self.display_thread_names)
            .with_thread_ids(self.display_thread_ids)
            .finish()
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_default_tracing_configuration() {
        let config = TracingConfiguration::default();
        assert_eq!(config.log_level(), "info");
        assert!(config.display_thread_names());
        assert!(!config.display_thread_ids());
        assert_eq!(config.filter(), "info");
    }

    #[test]
    fn test_resolve_level() {
        assert_eq!(resolve_level("trace"), Level::TRACE);
        assert_eq!(resolve_level("DEBUG"), Level::DEBUG);
        assert_eq!(resolve_level("warn"), Level::WARN);
        assert_eq!(resolve_level("error"), Level::ERROR);
        assert_eq!(resolve_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_builders_and_yaml() {
        let config = TracingConfiguration::default()
            .with_log_level("debug".to_string())
            .with_display_thread_ids(true)
            .with_filter("info,slim_grpc=trace".to_string());

        let parsed: TracingConfiguration = serde_yaml::from_str(
            "log_level: debug\ndisplay_thread_ids: true\nfilter: info,slim_grpc=trace\n",
        )
        .unwrap();
        assert_eq!(parsed, config);

        // missing fields take their defaults
        let parsed: TracingConfiguration = serde_yaml::from_str("log_level: warn\n").unwrap();
        assert_eq!(parsed.filter(), "info");
        assert!(parsed.display_thread_names());
    }

    #[test]
    fn test_env_filter_falls_back_to_log_level() {
        let config = TracingConfiguration::default()
            .with_log_level("debug".to_string())
            .with_filter("slim_grpc=loud".to_string());
        assert_eq!(config.env_filter().max_level_hint(), Some(LevelFilter::DEBUG));

        let config = TracingConfiguration::default().with_filter("warn".to_string());
        assert_eq!(config.env_filter().max_level_hint(), Some(LevelFilter::WARN));
    }
}
