// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::time::Duration;

use duration_str::deserialize_duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::duration::serialize_duration;
use super::errors::ConfigError;
use super::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_PENDING_MESSAGES, MAX_WINDOW_SIZE, strip_scheme};
use crate::component::configuration::Configuration;

/// Struct for the client configuration.
/// This struct contains the endpoint of the remote gRPC server together with
/// the HTTP/2 and queueing limits applied to every call opened by the client.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, JsonSchema)]
pub struct ClientConfig {
    /// The target the client will connect to.
    pub endpoint: String,

    /// Timeout for establishing the TCP connection and the HTTP/2 handshake.
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[schemars(with = "String")]
    pub connect_timeout: Duration,

    /// Maximum size (in bytes) of a single message accepted from the server.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Initial HTTP/2 flow-control window for every stream.
    pub initial_stream_window_size: Option<u32>,

    /// Initial HTTP/2 flow-control window for the whole connection.
    pub initial_connection_window_size: Option<u32>,

    /// Number of messages buffered per call direction before backpressure kicks in.
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_pending_messages() -> usize {
    DEFAULT_MAX_PENDING_MESSAGES
}

/// Defaults for ClientConfig
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: String::new(),
            connect_timeout: default_connect_timeout(),
            max_message_size: default_max_message_size(),
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            max_pending_messages: default_max_pending_messages(),
        }
    }
}

impl std::fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClientConfig {{ endpoint: {}, connect_timeout: {:?}, max_message_size: {}, initial_stream_window_size: {:?}, initial_connection_window_size: {:?}, max_pending_messages: {} }}",
            self.endpoint,
            self.connect_timeout,
            self.max_message_size,
            self.initial_stream_window_size,
            self.initial_connection_window_size,
            self.max_pending_messages,
        )
    }
}

impl Configuration for ClientConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        // an empty endpoint is allowed: clients may be address-driven
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "connect_timeout",
                "must be greater than zero",
            ));
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

impl ClientConfig {
    /// Creates a new client configuration with the given endpoint.
    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    pub fn with_max_message_size(self, max_message_size: usize) -> Self {
        Self {
            max_message_size,
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

    /// HTTP/2 client builder carrying the flow-control settings of this config.
    pub fn to_h2_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();

        if let Some(window) = self.initial_stream_window_size {
            builder.initial_window_size(window);
        }

        if let Some(window) = self.initial_connection_window_size {
            builder.initial_connection_window_size(window);
        }

        builder
    }

    /// Resolve the configured endpoint to the first matching socket address.
    pub async fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        let endpoint = strip_scheme(&self.endpoint);
        if endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }

        tokio::net::lookup_host(endpoint)
            .await?
            .next()
            .ok_or_else(|| ConfigError::UnresolvedEndpoint(endpoint.to_string()))
    }
}
