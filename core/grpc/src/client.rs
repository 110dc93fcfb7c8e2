// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Client-side call handling
//!
//! A [`Client`] keeps one HTTP/2 connection per remote address and opens a
//! stream on it for every call. Calls are started synchronously: the
//! returned [`ClientCall`] can be written to right away while the connection
//! and the request headers are being set up in the background.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use h2::RecvStream;
use h2::client::SendRequest;
use http::header::{CONTENT_TYPE, HeaderValue, TE};
use http::{Method, Request, Response, StatusCode, Uri};
use tokio::net::TcpStream;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use slim_config::grpc::client::ClientConfig;

use crate::call::validate_method_name;
use crate::codec::{Decoder, Encoder};
use crate::status::Side;
use crate::stream::{OutboundQueue, ReadStream, WriteStream, read_channel, write_channel};
use crate::transport::{self, CallScope, ConnectionScope, GRPC_CONTENT_TYPE};
use crate::{Code, Metadata, Status};

/// An established HTTP/2 connection, cancelled once it closes.
struct CachedConnection {
    send_request: SendRequest<Bytes>,
    scope: ConnectionScope,
}

struct ClientInner {
    config: ClientConfig,
    connections: Mutex<HashMap<SocketAddr, CachedConnection>>,
}

/// gRPC client
///
/// Cloning is cheap: clones share the connection cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Response half of a call: the response headers and the stream of
/// response messages, which ends with the final status.
#[derive(Debug)]
pub struct ClientResponse {
    metadata: Metadata,
    messages: ReadStream,
}

impl ClientResponse {
    /// Metadata from the response headers.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn messages(&mut self) -> &mut ReadStream {
        &mut self.messages
    }

    pub fn into_messages(self) -> ReadStream {
        self.messages
    }

    pub fn into_parts(self) -> (Metadata, ReadStream) {
        (self.metadata, self.messages)
    }
}

/// Resolves once the response headers arrived, or with the status that
/// prevented the call from starting.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<ClientResponse, Status>>,
}

impl Future for ResponseFuture {
    type Output = Result<ClientResponse, Status>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Status::cancelled("call task stopped"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A call started by a [`Client`].
#[derive(Debug)]
pub struct ClientCall {
    method: String,
    request: WriteStream,
    response: ResponseFuture,
    token: CancellationToken,
}

impl ClientCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request messages. End the stream once the last one was written.
    pub fn request(&self) -> &WriteStream {
        &self.request
    }

    /// Cancel the call: the server sees a reset and both streams fail with
    /// CANCELLED.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the response. Dropping the request stream without ending it
    /// cancels the call, so this is meant for calls whose request stream was
    /// already ended.
    pub async fn response(self) -> Result<ClientResponse, Status> {
        let ClientCall {
            request, response, ..
        } = self;
        let result = response.await;
        drop(request);
        result
    }

    pub fn into_parts(self) -> (WriteStream, ResponseFuture) {
        (self.request, self.response)
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Start a call to `method` on the server at `addr`.
    ///
    /// Must be called within a tokio runtime.
    pub fn request(&self, addr: SocketAddr, method: &str) -> ClientCall {
        self.request_with_metadata(addr, method, Metadata::new())
    }

    /// Start a call carrying `metadata` in its request headers.
    pub fn request_with_metadata(
        &self,
        addr: SocketAddr,
        method: &str,
        metadata: Metadata,
    ) -> ClientCall {
        let (request, queue) = write_channel(self.inner.config.max_pending_messages);
        let (tx, rx) = oneshot::channel();
        let token = CancellationToken::new();

        let client = self.clone();
        let call_token = token.clone();
        let method_name = method.to_string();
        tokio::spawn(async move {
            client
                .start_call(addr, method_name, metadata, queue, call_token, tx)
                .await;
        });

        ClientCall {
            method: method.to_string(),
            request,
            response: ResponseFuture { rx },
            token,
        }
    }

    /// Start a call with a single request message.
    pub fn call(&self, addr: SocketAddr, method: &str, message: Bytes) -> ClientCall {
        let call = self.request(addr, method);
        // only fails if the call already failed, which the response reports
        let _ = call.request().end_with(message);
        call
    }

    /// Typed unary call
    pub async fn unary<Req, Res>(
        &self,
        addr: SocketAddr,
        method: &str,
        request: Req,
    ) -> Result<Res, Status>
    where
        Req: Encoder,
        Res: Decoder,
    {
        let call = self.call(addr, method, request.encode()?);
        let mut messages = call.response().await?.into_messages();
        Res::decode(messages.single().await?)
    }

    /// Typed unary-stream call
    pub async fn server_streaming<Req, Res>(
        &self,
        addr: SocketAddr,
        method: &str,
        request: Req,
    ) -> Result<BoxStream<'static, Result<Res, Status>>, Status>
    where
        Req: Encoder,
        Res: Decoder + Send + 'static,
    {
        let call = self.call(addr, method, request.encode()?);
        let messages = call.response().await?.into_messages();
        Ok(messages
            .map(|message| message.and_then(Res::decode))
            .boxed())
    }

    /// Typed stream-unary call
    pub async fn client_streaming<Req, Res, S>(
        &self,
        addr: SocketAddr,
        method: &str,
        requests: S,
    ) -> Result<Res, Status>
    where
        S: Stream<Item = Req> + Send,
        Req: Encoder,
        Res: Decoder,
    {
        let (writer, response) = self.request(addr, method).into_parts();
        write_all(&writer, requests).await?;

        let mut messages = response.await?.into_messages();
        Res::decode(messages.single().await?)
    }

    /// Typed stream-stream call. Requests are sent from a separate task so
    /// that responses can be consumed while the client is still sending.
    pub async fn bidi<Req, Res, S>(
        &self,
        addr: SocketAddr,
        method: &str,
        requests: S,
    ) -> Result<BoxStream<'static, Result<Res, Status>>, Status>
    where
        S: Stream<Item = Req> + Send + 'static,
        Req: Encoder + Send + 'static,
        Res: Decoder + Send + 'static,
    {
        let (writer, response) = self.request(addr, method).into_parts();

        tokio::spawn(async move {
            if let Err(status) = write_all(&writer, requests).await {
                debug!(%status, "failed to encode request, call cancelled");
            }
        });

        let messages = response.await?.into_messages();
        Ok(messages
            .map(|message| message.and_then(Res::decode))
            .boxed())
    }

    /// Close every cached connection. Calls in flight fail with CANCELLED.
    pub async fn close(&self) {
        let closed: Vec<_> = self.inner.connections.lock().drain().collect();
        for (addr, connection) in closed {
            debug!(%addr, "closing connection");
            connection.scope.close();
        }
    }

    async fn start_call(
        self,
        addr: SocketAddr,
        method: String,
        metadata: Metadata,
        queue: OutboundQueue,
        call_token: CancellationToken,
        reply: oneshot::Sender<Result<ClientResponse, Status>>,
    ) {
        let opened = tokio::select! {
            res = self.open_stream(addr, &method, &metadata) => res,
            _ = call_token.cancelled() => Err(Status::cancelled("call cancelled")),
        };

        let (response, stream, connection) = match opened {
            Ok(opened) => opened,
            Err(status) => {
                debug!(%addr, %method, %status, "failed to start call");
                queue.close(status.clone());
                let _ = reply.send(Err(status));
                return;
            }
        };

        let scope = CallScope::linked(&connection, call_token);
        tokio::spawn(transport::drive_request(stream, queue, scope.clone()));

        let head = tokio::select! {
            // a torn down connection also fails the response future
            biased;
            _ = scope.cancelled() => Err(scope.cancelled_status(Side::Client)),
            res = response => res.map_err(|e| Status::from_h2_error(&e, Side::Client)),
        };

        let result = head.and_then(|head| self.accept_response(head, scope.clone()));
        if let Err(status) = &result {
            debug!(%addr, %method, %status, "call failed before the response");
            scope.cancel();
        }

        let _ = reply.send(result);
    }

    /// Open a new HTTP/2 stream carrying the request headers.
    async fn open_stream(
        &self,
        addr: SocketAddr,
        method: &str,
        metadata: &Metadata,
    ) -> Result<
        (
            h2::client::ResponseFuture,
            h2::SendStream<Bytes>,
            ConnectionScope,
        ),
        Status,
    > {
        validate_method_name(method)
            .map_err(|_| Status::internal(format!("invalid method name {:?}", method)))?;
        let request = build_request(addr, method, metadata)?;

        let (send_request, connection) = self.connection(addr).await?;
        let mut send_request = send_request
            .ready()
            .await
            .map_err(|e| Status::from_h2_error(&e, Side::Client))?;

        let (response, stream) = send_request
            .send_request(request, false)
            .map_err(|e| Status::from_h2_error(&e, Side::Client))?;

        Ok((response, stream, connection))
    }

    /// Turn the response headers into a [`ClientResponse`] and start reading
    /// the response messages.
    fn accept_response(
        &self,
        response: Response<RecvStream>,
        scope: CallScope,
    ) -> Result<ClientResponse, Status> {
        let (parts, body) = response.into_parts();

        if parts.status != StatusCode::OK {
            return Err(status_from_http(parts.status));
        }

        let metadata = Metadata::from_headers(&parts.headers);
        let (inbound, messages) = read_channel(self.inner.config.max_pending_messages);

        // trailers-only response
        if let Some(status) = Status::from_header_map(&parts.headers) {
            inbound.set_trailers(metadata.clone());
            if !status.is_ok() {
                inbound.fail_now(status);
                scope.cancel();
            }
            return Ok(ClientResponse { metadata, messages });
        }

        if !transport::is_grpc_content_type(parts.headers.get(CONTENT_TYPE)) {
            return Err(Status::unknown(format!(
                "unexpected content-type {:?}",
                parts.headers.get(CONTENT_TYPE)
            )));
        }

        let max_message_size = self.inner.config.max_message_size;
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = scope.cancelled() => Err(scope.cancelled_status(Side::Client)),
                res = transport::pump_inbound(body, &inbound, max_message_size, Side::Client) => res,
            };

            let status = match result {
                Ok(Some(trailers)) => {
                    inbound.set_trailers(Metadata::from_headers(&trailers));
                    Status::from_header_map(&trailers)
                        .unwrap_or_else(|| Status::internal("missing grpc-status in trailers"))
                }
                Ok(None) => Status::internal("response ended without trailers"),
                Err(status) => status,
            };

            if !status.is_ok() {
                debug!(%status, "call finished with an error");
                scope.cancel();
                inbound.fail(status).await;
            }
        });

        Ok(ClientResponse { metadata, messages })
    }

    /// Cached connection to `addr`, connecting if there is none or the
    /// previous one closed.
    ///
    /// The cache is not locked while connecting.
    async fn connection(
        &self,
        addr: SocketAddr,
    ) -> Result<(SendRequest<Bytes>, ConnectionScope), Status> {
        if let Some(handle) = self.cached(addr) {
            return Ok(handle);
        }

        let connection = self.connect(addr).await?;

        let mut connections = self.inner.connections.lock();
        if let Some(cached) = connections.get(&addr)
            && !cached.scope.is_closed()
        {
            // another call connected first, keep a single connection
            debug!(%addr, "discarding duplicate connection");
            connection.scope.close();
            return Ok((cached.send_request.clone(), cached.scope.clone()));
        }

        let handle = (connection.send_request.clone(), connection.scope.clone());
        connections.insert(addr, connection);

        Ok(handle)
    }

    fn cached(&self, addr: SocketAddr) -> Option<(SendRequest<Bytes>, ConnectionScope)> {
        let mut connections = self.inner.connections.lock();

        match connections.get(&addr) {
            Some(cached) if !cached.scope.is_closed() => {
                Some((cached.send_request.clone(), cached.scope.clone()))
            }
            Some(_) => {
                debug!(%addr, "dropping closed connection");
                connections.remove(&addr);
                None
            }
            None => None,
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<CachedConnection, Status> {
        let timeout = self.inner.config.connect_timeout;

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Status::unavailable(format!("timed out connecting to {}", addr)))?
            .map_err(|e| Status::unavailable(format!("failed to connect to {}: {}", addr, e)))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(%addr, error = %e, "failed to set TCP_NODELAY");
        }

        let builder = self.inner.config.to_h2_builder();
        let (send_request, connection) =
            tokio::time::timeout(timeout, builder.handshake::<_, Bytes>(tcp))
                .await
                .map_err(|_| Status::unavailable(format!("HTTP/2 handshake with {} timed out", addr)))?
                .map_err(|e| Status::from_h2_error(&e, Side::Client))?;

        let scope = ConnectionScope::new();
        let driver_scope = scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = connection => {
                    if let Err(e) = res {
                        warn!(%addr, error = %e, "connection closed with an error");
                    } else {
                        debug!(%addr, "connection closed");
                    }
                }
                _ = driver_scope.closed() => {
                    debug!(%addr, "connection closed locally");
                }
            }
            // fails every call still running on this connection
            driver_scope.lost();
        });

        debug!(%addr, "connected");
        Ok(CachedConnection {
            send_request,
            scope,
        })
    }
}

/// Stream `requests` into `writer`, then end it. A transport failure stops
/// the relay quietly since the response carries the status of the call; an
/// encoding failure fails the call and is returned.
async fn write_all<S, Req>(writer: &WriteStream, requests: S) -> Result<(), Status>
where
    S: Stream<Item = Req>,
    Req: Encoder,
{
    futures::pin_mut!(requests);
    while let Some(request) = requests.next().await {
        let message = match request.encode() {
            Ok(message) => message,
            Err(status) => {
                writer.fail(status.clone());
                return Err(status);
            }
        };
        if writer.send(message).await.is_err() {
            return Ok(());
        }
    }

    let _ = writer.end();
    Ok(())
}

fn build_request(addr: SocketAddr, method: &str, metadata: &Metadata) -> Result<Request<()>, Status> {
    let uri = Uri::builder()
        .scheme("http")
        .authority(addr.to_string())
        .path_and_query(method)
        .build()
        .map_err(|e| Status::internal(format!("invalid request uri: {}", e)))?;

    let mut request = Request::new(());
    *request.method_mut() = Method::POST;
    *request.uri_mut() = uri;

    let headers = request.headers_mut();
    metadata.add_to_headers(headers);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    headers.insert(TE, HeaderValue::from_static("trailers"));

    Ok(request)
}

/// Status for a response that is not HTTP 200.
fn status_from_http(status: StatusCode) -> Status {
    let code = match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    };
    Status::new(code, format!("unexpected HTTP status {}", status))
}
