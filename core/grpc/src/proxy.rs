// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Pass-through bridge
//!
//! Forwards every call it receives to an upstream server without decoding
//! the messages. Request messages, request metadata, response messages and
//! the final status with its trailers are relayed as they are; a failure or
//! a cancellation on either side terminates both.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{Client, ResponseFuture};
use crate::registry::CallHandler;
use crate::stream::{ReadStream, WriteStream};
use crate::{ServerCall, Status};

/// Relays calls to a fixed upstream address.
#[derive(Debug, Clone)]
pub struct PassThrough {
    client: Client,
    upstream: SocketAddr,
}

impl PassThrough {
    pub fn new(client: Client, upstream: SocketAddr) -> Self {
        Self { client, upstream }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Handler forwarding every call, meant to be installed as the server's
    /// catch-all so that methods unknown to the proxy still go through.
    pub fn handler(&self) -> CallHandler {
        let bridge = self.clone();
        Arc::new(move |call: ServerCall| -> BoxFuture<'static, Result<(), Status>> {
            let bridge = bridge.clone();
            Box::pin(async move { bridge.forward(call).await })
        })
    }

    /// Forward a single call and wait until both of its directions are done.
    pub async fn forward(&self, call: ServerCall) -> Result<(), Status> {
        let (context, requests, response) = call.into_parts();
        let method = context.method().to_string();
        debug!(%method, upstream = %self.upstream, "forwarding call");

        let upstream_call = self.client.request_with_metadata(
            self.upstream,
            &method,
            context.metadata().clone(),
        );
        let token = upstream_call.cancellation_token();
        let (upstream_requests, upstream_response) = upstream_call.into_parts();

        let relay = tokio::spawn(relay_requests(requests, upstream_requests));
        let result = relay_responses(upstream_response, &response, &token).await;

        // the response is over, whatever the client still sends is not needed
        relay.abort();

        match &result {
            Ok(()) => debug!(%method, "call forwarded"),
            Err(status) => {
                debug!(%method, %status, "forwarding failed");
                token.cancel();
            }
        }

        result
    }
}

/// Downstream requests -> upstream call.
async fn relay_requests(mut requests: ReadStream, upstream: WriteStream) {
    while let Some(item) = requests.next().await {
        match item {
            Ok(message) => {
                if let Err(e) = upstream.send(message).await {
                    debug!(error = %e, "upstream stopped accepting requests");
                    return;
                }
            }
            Err(status) => {
                debug!(%status, "request stream failed, cancelling upstream call");
                upstream.fail(status);
                return;
            }
        }
    }

    if let Err(e) = upstream.end() {
        debug!(error = %e, "failed to end upstream request stream");
    }
}

/// Upstream response -> downstream response, including the final status.
///
/// Returns an error when the downstream response could not be completed
/// here and must be failed by the caller.
async fn relay_responses(
    upstream: ResponseFuture,
    downstream: &WriteStream,
    token: &CancellationToken,
) -> Result<(), Status> {
    let response = tokio::select! {
        res = upstream => res?,
        status = downstream.closed() => {
            token.cancel();
            return Err(status);
        }
    };

    // response headers are already on their way downstream, so the upstream
    // header metadata travels with the trailers
    let (mut metadata, mut messages) = response.into_parts();

    loop {
        tokio::select! {
            next = messages.next() => match next {
                Some(Ok(message)) => {
                    if let Err(e) = downstream.send(message).await {
                        token.cancel();
                        return Err(e.into());
                    }
                }
                Some(Err(status)) => {
                    metadata.merge(messages.trailers().unwrap_or_default());
                    downstream.fail_with_trailers(status, metadata);
                    return Ok(());
                }
                None => {
                    metadata.merge(messages.trailers().unwrap_or_default());
                    downstream.end_with_trailers(metadata)?;
                    return Ok(());
                }
            },
            status = downstream.closed() => {
                token.cancel();
                return Err(status);
            }
        }
    }
}
