// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::debug;

use super::errors::ConfigError;
use super::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_PENDING_MESSAGES, MAX_WINDOW_SIZE, strip_scheme};
use crate::component::configuration::Configuration;

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, JsonSchema)]
pub struct ServerConfig {
    /// Endpoint is the address to listen on.
    pub endpoint: String,

    /// Maximum size (in bytes) of a single message accepted by the server.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// MaxConcurrentStreams sets the limit on the number of concurrent streams per connection.
    pub max_concurrent_streams: Option<u32>,

    /// Initial HTTP/2 flow-control window for every stream.
    pub initial_stream_window_size: Option<u32>,

    /// Initial HTTP/2 flow-control window for the whole connection.
    pub initial_connection_window_size: Option<u32>,

    /// Number of messages buffered per call direction before backpressure kicks in.
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_pending_messages() -> usize {
    DEFAULT_MAX_PENDING_MESSAGES
}

/// Default values for ServerConfig
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            max_message_size: default_max_message_size(),
            max_concurrent_streams: Some(100),
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            max_pending_messages: default_max_pending_messages(),
        }
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ServerConfig {{ endpoint: {}, max_message_size: {}, max_concurrent_streams: {:?}, initial_stream_window_size: {:?}, initial_connection_window_size: {:?}, max_pending_messages: {} }}",
            self.endpoint,
            self.max_message_size,
            self.max_concurrent_streams,
            self.initial_stream_window_size,
            self.initial_connection_window_size,
            self.max_pending_messages,
        )
    }
}

impl Configuration for ServerConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if strip_scheme(&self.endpoint).is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::invalid(
                "max_message_size",
                "must be greater than zero",
            ));
        }

        if self.max_pending_messages == 0 {
            return Err(ConfigError::invalid(
                "max_pending_messages",
                "must be greater than zero",
            ));
        }

        for (field, window) in [
            ("initial_stream_window_size", self.initial_stream_window_size),
            (
                "initial_connection_window_size",
                self.initial_connection_window_size,
            ),
        ] {
            if let Some(window) = window
                && window > MAX_WINDOW_SIZE
            {
                return Err(ConfigError::invalid(
                    field,
                    format!("{} exceeds the HTTP/2 maximum {}", window, MAX_WINDOW_SIZE),
                ));
            }
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    pub fn with_max_message_size(self, max_message_size: usize) -> Self {
        Self {
            max_message_size,
            ..self
        }
    }

    pub fn with_max_concurrent_streams(self, max_concurrent_streams: Option<u32>) -> Self {
        Self {
            max_concurrent_streams,
            ..self
        }
    }

    pub fn with_initial_stream_window_size(self, initial_stream_window_size: Option<u32>) -> Self {
        Self {
            initial_stream_window_size,
            ..self
        }
    }

    pub fn with_initial_connection_window_size(
        self,
        initial_connection_window_size: Option<u32>,
    ) -> Self {
        Self {
            initial_connection_window_size,
            ..self
        }
    }

    pub fn with_max_pending_messages(self, max_pending_messages: usize) -> Self {
        Self {
            max_pending_messages,
            ..self
        }
    }

    /// HTTP/2 server builder carrying the flow-control settings of this config.
    pub fn to_h2_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();

        if let Some(max_concurrent_streams) = self.max_concurrent_streams {
            builder.max_concurrent_streams(max_concurrent_streams);
        }

        if let Some(window) = self.initial_stream_window_size {
            builder.initial_window_size(window);
        }

        if let Some(window) = self.initial_connection_window_size {
            builder.initial_connection_window_size(window);
        }

        builder
    }

    /// Bind a TCP listener on the configured endpoint.
    pub async fn bind(&self) -> Result<TcpListener, ConfigError> {
        let endpoint = strip_scheme(&self.endpoint);
        if endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }

        let listener = TcpListener::bind(endpoint).await?;
        debug!(%endpoint, local_addr = ?listener.local_addr().ok(), "server listener bound");

        Ok(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.max_pending_messages, DEFAULT_MAX_PENDING_MESSAGES);
        assert_eq!(config.max_concurrent_streams, Some(100));

        // no endpoint configured
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEndpoint)
        ));
    }

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig::with_endpoint("127.0.0.1:50051");
        assert!(config.validate().is_ok());

        let config = ServerConfig::with_endpoint("127.0.0.1:50051").with_max_message_size(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "max_message_size",
                ..
            })
        ));

        let config = ServerConfig::with_endpoint("127.0.0.1:50051").with_max_pending_messages(0);
        assert!(config.validate().is_err());

        let config = ServerConfig::with_endpoint("127.0.0.1:50051")
            .with_initial_stream_window_size(Some(u32::MAX));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "initial_stream_window_size",
                ..
            })
        ));
    }

    #[test]
    fn test_server_config_yaml_defaults() {
        let yaml = r#"
endpoint: "0.0.0.0:8080"
max_concurrent_streams: 10
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(config.endpoint, "0.0.0.0:8080");
        assert_eq!(config.max_concurrent_streams, Some(10));
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.max_pending_messages, DEFAULT_MAX_PENDING_MESSAGES);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig::with_endpoint("http://127.0.0.1:0");
        let listener = config.bind().await.expect("bind should succeed");
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_without_endpoint() {
        let config = ServerConfig::default();
        assert!(matches!(
            config.bind().await,
            Err(ConfigError::MissingEndpoint)
        ));
    }
}
