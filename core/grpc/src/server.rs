// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Server-side call handling
//!
//! Accepts HTTP/2 connections, turns every stream into a [`ServerCall`] and
//! dispatches it to the handler registered for its method.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use h2::RecvStream;
use h2::server::SendResponse;
use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slim_config::grpc::server::ServerConfig;

use crate::call::{CallContext, CallShape, ServerCall, validate_method_name};
use crate::codec::{Decoder, Encoder};
use crate::registry::{CallHandler, MethodRegistry, RequestStream, Route};
use crate::status::Side;
use crate::stream::{read_channel, write_channel};
use crate::transport::{self, CallScope, ConnectionScope};
use crate::{Metadata, Status};

/// Internal server state shared across clones
struct ServerInner {
    config: ServerConfig,
    registry: RwLock<MethodRegistry>,
    /// Stops the accept loop
    cancellation_token: RwLock<CancellationToken>,
    /// Drain signal for graceful shutdown
    drain_signal: RwLock<Option<drain::Signal>>,
    /// Drain watch held by every live connection
    drain_watch: RwLock<Option<drain::Watch>>,
}

/// gRPC server
///
/// Cloning is cheap: clones share the registry and the shutdown state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("registry", &*self.inner.registry.read())
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, MethodRegistry::new())
    }

    pub fn with_registry(config: ServerConfig, registry: MethodRegistry) -> Self {
        let (drain_signal, drain_watch) = drain::channel();

        Self {
            inner: Arc::new(ServerInner {
                config,
                registry: RwLock::new(registry),
                cancellation_token: RwLock::new(CancellationToken::new()),
                drain_signal: RwLock::new(Some(drain_signal)),
                drain_watch: RwLock::new(Some(drain_watch)),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        self.inner.registry.read().methods()
    }

    /// Register a raw handler. Safe while serving: calls already dispatched
    /// keep the handler they resolved.
    pub fn register<F, Fut>(&self, method: &str, shape: CallShape, handler: F)
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.inner.registry.write().register(method, shape, handler);
    }

    pub fn register_unary<F, Req, Res, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        self.inner.registry.write().register_unary(method, handler);
    }

    pub fn register_server_streaming<F, Req, Res, S, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: futures::Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        self.inner
            .registry
            .write()
            .register_server_streaming(method, handler);
    }

    pub fn register_client_streaming<F, Req, Res, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        self.inner
            .registry
            .write()
            .register_client_streaming(method, handler);
    }

    pub fn register_bidi<F, Req, Res, S, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: futures::Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        self.inner.registry.write().register_bidi(method, handler);
    }

    /// Install the catch-all handler.
    pub fn set_fallback<F, Fut>(&self, handler: F)
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.inner.registry.write().set_fallback(handler);
    }

    pub fn set_fallback_handler(&self, handler: CallHandler) {
        self.inner.registry.write().set_fallback_handler(handler);
    }

    /// Accept connections from `listener` until [`Server::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Status> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| Status::internal(format!("listener has no local address: {}", e)))?;
        let token = self.inner.cancellation_token.read().clone();

        info!(%local_addr, "grpc server listening");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(%local_addr, "server received shutdown signal");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                            }

                            let server = self.clone();
                            tokio::spawn(async move {
                                server.serve_connection(socket, Some(peer)).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    /// Serve a single HTTP/2 connection until the peer closes it or the
    /// server drains.
    pub async fn serve_connection<T>(&self, io: T, peer: Option<SocketAddr>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(watch) = self.inner.drain_watch.read().clone() else {
            debug!(?peer, "server is shutting down, rejecting connection");
            return;
        };

        let mut connection = match self.inner.config.to_h2_builder().handshake::<_, Bytes>(io).await
        {
            Ok(connection) => connection,
            Err(e) => {
                debug!(?peer, error = %e, "HTTP/2 handshake failed");
                return;
            }
        };

        debug!(?peer, "new connection");

        // every call on this connection is cancelled when it goes away
        let connection_scope = ConnectionScope::new();
        let _guard = connection_scope.token().drop_guard();

        let mut shutdown = std::pin::pin!(watch.signaled());
        let mut draining = None;

        loop {
            tokio::select! {
                next = connection.accept() => {
                    match next {
                        Some(Ok((request, respond))) => {
                            self.dispatch(request, respond, &connection_scope);
                        }
                        Some(Err(e)) => {
                            debug!(?peer, error = %e, "connection error");
                            break;
                        }
                        None => break,
                    }
                }
                release = &mut shutdown, if draining.is_none() => {
                    debug!(?peer, "draining connection");
                    connection.graceful_shutdown();
                    // released when the connection is done
                    draining = Some(release);
                }
            }
        }

        debug!(?peer, "connection closed");
    }

    fn dispatch(
        &self,
        request: Request<RecvStream>,
        mut respond: SendResponse<Bytes>,
        connection: &ConnectionScope,
    ) {
        let (parts, body) = request.into_parts();

        if parts.method != Method::POST {
            debug!(method = %parts.method, "rejecting non-POST request");
            reject(respond, StatusCode::METHOD_NOT_ALLOWED);
            return;
        }

        if !transport::is_grpc_content_type(parts.headers.get(CONTENT_TYPE)) {
            debug!(content_type = ?parts.headers.get(CONTENT_TYPE), "rejecting non-gRPC request");
            reject(respond, StatusCode::UNSUPPORTED_MEDIA_TYPE);
            return;
        }

        let method = parts.uri.path().to_string();
        let route = match validate_method_name(&method) {
            Ok(()) => self.inner.registry.read().resolve(&method),
            Err(_) => None,
        };

        let Some(route) = route else {
            debug!(%method, "no handler for method");
            let status = Status::unimplemented(format!("unknown method {}", method));
            if let Err(e) = respond.send_response(transport::trailers_only(&status), true) {
                debug!(%method, error = %e, "failed to send trailers-only response");
            }
            return;
        };

        let (shape, handler) = match route {
            Route::Method(shape, handler) => (Some(shape), handler),
            Route::Fallback(handler) => (None, handler),
        };

        debug!(%method, ?shape, "dispatching call");

        let config = &self.inner.config;
        let scope = CallScope::new(connection);
        let (inbound, requests) = read_channel(config.max_pending_messages);
        let (response, queue) = write_channel(config.max_pending_messages);

        let call = ServerCall::new(
            CallContext::new(method.clone(), Metadata::from_headers(&parts.headers)),
            shape,
            requests,
            response.clone(),
        );

        // request messages
        let max_message_size = config.max_message_size;
        let inbound_scope = scope.clone();
        let inbound_response = response.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                res = transport::pump_inbound(body, &inbound, max_message_size, Side::Server) => res,
                _ = inbound_scope.cancelled() => Err(inbound_scope.cancelled_status(Side::Server)),
            };

            if let Err(status) = result {
                debug!(%status, "request stream failed");
                inbound_response.fail(status.clone());
                inbound.fail(status).await;
            }
        });

        // response messages
        tokio::spawn(transport::drive_response(respond, queue, scope));

        // application logic
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { handler(call).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    // the handler's return ends the call, even with the request still open
                    if !response.is_ended() {
                        debug!(%method, "handler returned without ending the response");
                        response.fail(Status::internal(
                            "handler completed without ending the response",
                        ));
                    }
                }
                Ok(Err(status)) => {
                    debug!(%method, %status, "handler returned an error");
                    response.fail(status);
                }
                Err(_) => {
                    error!(%method, "handler panicked");
                    response.fail(Status::internal("handler panicked"));
                }
            }
        });
    }

    /// Stop accepting connections and drain the live ones.
    ///
    /// Connections receive a GOAWAY and are closed once their in-flight
    /// calls complete. The server can serve again afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down grpc server");

        // stop the accept loops
        self.inner.cancellation_token.read().cancel();

        let drain_signal = self.inner.drain_signal.write().take();
        let drain_watch = self.inner.drain_watch.write().take();

        // only live connections hold the watch now
        drop(drain_watch);

        if let Some(signal) = drain_signal {
            debug!("draining live connections");
            signal.drain().await;
            info!("all connections drained");
        }

        // ready to serve again
        let (new_signal, new_watch) = drain::channel();
        *self.inner.drain_signal.write() = Some(new_signal);
        *self.inner.drain_watch.write() = Some(new_watch);
        *self.inner.cancellation_token.write() = CancellationToken::new();

        debug!("server shutdown complete");
    }
}

fn reject(mut respond: SendResponse<Bytes>, status: StatusCode) {
    let mut response = http::Response::new(());
    *response.status_mut() = status;
    if let Err(e) = respond.send_response(response, true) {
        debug!(error = %e, "failed to send HTTP error response");
    }
}
