// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;

use anyhow::{Context, Result};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::build_info;
use crate::config::ConfigLoader;
use crate::runtime;
use crate::service::ProxyService;
use crate::signal;
use slim_config::component::Component;

/// Start the proxy described by `config`, wait for `shutdown` to resolve,
/// then drain in-flight calls within the runtime's drain timeout.
pub async fn run_proxy_until<F>(mut config: ConfigLoader, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let tracing_conf = config.tracing().clone();
    if let Err(e) = tracing_conf.setup_tracing_subscriber() {
        // another subscriber is already installed, keep using it
        warn!(error = %e, "tracing subscriber not installed");
    }

    let root_span = info_span!("application_lifecycle");

    async move {
        debug!(?tracing_conf);
        info!(build_info = %build_info::BUILD_INFO);

        let drain_timeout = config.runtime().drain_timeout();
        let proxy_config = config
            .proxy()
            .context("invalid proxy configuration")?
            .clone();

        let mut service = ProxyService::new("proxy", proxy_config);
        service.start().await.context("failed to start proxy")?;

        shutdown.await;
        debug!("received shutdown signal");

        match tokio::time::timeout(drain_timeout, service.shutdown()).await {
            Ok(result) => result.context("failed to stop proxy")?,
            Err(_) => {
                warn!(timeout = ?drain_timeout, "proxy shutdown timed out");
                anyhow::bail!("proxy shutdown timed out after {:?}", drain_timeout);
            }
        }

        Ok(())
    }
    .instrument(root_span)
    .await
}

/// Like [`run_proxy_until`], stopping on SIGINT or SIGTERM.
pub async fn run_proxy(config: ConfigLoader) -> Result<()> {
    run_proxy_until(config, signal::shutdown()).await
}

/// Load `config_file`, build the runtime from its `runtime:` section and
/// block until the proxy has stopped.
pub fn run(config_file: &str) -> Result<()> {
    let mut config = ConfigLoader::new(config_file).context("failed to load configuration")?;

    let proxy_runtime = runtime::build(config.runtime()).context("failed to build runtime")?;
    proxy_runtime.runtime.block_on(run_proxy(config))
}
