// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use slim_config::component::Component;
use slim_config::component::configuration::Configuration;
use slim_config::grpc::client::ClientConfig;
use slim_config::grpc::errors::ConfigError;
use slim_config::grpc::server::ServerConfig;
use slim_grpc::{Client, PassThrough, Server};

use crate::config::ProxyError;

/// The `proxy:` section of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Where the proxy accepts calls
    pub server: ServerConfig,

    /// Where every call is forwarded
    pub upstream: ClientConfig,
}

impl Configuration for ProxyConfig {
    type Error = ProxyError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.server.validate()?;
        self.upstream.validate()?;

        if self.upstream.endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint.into());
        }

        Ok(())
    }
}

/// Proxy component: a server whose catch-all handler forwards to the
/// upstream.
pub struct ProxyService {
    id: String,
    config: ProxyConfig,
    server: Option<Server>,
    local_addr: Option<SocketAddr>,
    serve_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl ProxyService {
    pub fn new(id: &str, config: ProxyConfig) -> Self {
        Self {
            id: id.to_string(),
            config,
            server: None,
            local_addr: None,
            serve_task: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Address the proxy listens on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Component for ProxyService {
    type Error = ProxyError;

    fn identifier(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.server.is_some() {
            return Err(ProxyError::AlreadyStarted);
        }

        // resolved once, every call goes to the same address
        let upstream = self.config.upstream.resolve().await?;
        let listener = self.config.server.bind().await?;
        let local_addr = listener.local_addr().map_err(ConfigError::from)?;

        let bridge = PassThrough::new(Client::new(self.config.upstream.clone()), upstream);
        let server = Server::new(self.config.server.clone());
        server.set_fallback_handler(bridge.handler());

        let serving = server.clone();
        let task = tokio::spawn(async move {
            if let Err(status) = serving.serve(listener).await {
                error!(%status, "proxy server stopped");
            }
        });

        info!(id = %self.id, %local_addr, %upstream, "proxy started");

        self.server = Some(server);
        self.local_addr = Some(local_addr);
        self.serve_task = Some(task);

        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Self::Error> {
        let Some(server) = self.server.take() else {
            return Err(ProxyError::NotStarted);
        };

        server.shutdown().await;

        if let Some(task) = self.serve_task.take()
            && let Err(e) = task.await
        {
            debug!(error = %e, "serve task did not complete cleanly");
        }

        self.local_addr = None;
        info!(id = %self.id, "proxy stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server: &str, upstream: &str) -> ProxyConfig {
        ProxyConfig {
            server: ServerConfig::with_endpoint(server),
            upstream: ClientConfig::with_endpoint(upstream),
        }
    }

    #[test]
    fn test_validate() {
        assert!(config("127.0.0.1:0", "127.0.0.1:50051").validate().is_ok());

        assert!(matches!(
            config("127.0.0.1:0", "").validate(),
            Err(ProxyError::Config(ConfigError::MissingEndpoint))
        ));
        assert!(matches!(
            config("", "127.0.0.1:50051").validate(),
            Err(ProxyError::Config(ConfigError::MissingEndpoint))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let mut service = ProxyService::new("proxy", config("127.0.0.1:0", "127.0.0.1:50051"));
        assert_eq!(service.identifier(), "proxy");
        assert!(matches!(service.shutdown().await, Err(ProxyError::NotStarted)));
    }
}
