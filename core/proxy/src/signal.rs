// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

/// Resolves once the process is asked to stop (SIGINT or SIGTERM, Ctrl-C
/// on Windows).
pub async fn shutdown() {
    imp::shutdown().await
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            _ = sig(SignalKind::interrupt(), "SIGINT") => {}
            // e.g. sent by k8s to stop the container
            _ = sig(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn sig(kind: SignalKind, name: &str) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(signal = name, "received signal, starting shutdown");
            }
            Err(e) => {
                error!(signal = name, error = %e, "failed to register signal handler");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, starting shutdown"),
            Err(e) => {
                error!(error = %e, "failed to register signal handler");
                std::future::pending::<()>().await;
            }
        }
    }
}
