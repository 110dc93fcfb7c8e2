// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Method registry: full method name -> (shape, handler).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::Status;
use crate::call::{CallContext, CallShape, ServerCall, validate_method_name};
use crate::codec::{Decoder, Encoder};
use crate::stream::{ReadStream, WriteStream};

/// Handler invoked with every call routed to it.
///
/// An `Err(status)` return fails the response with that status unless it
/// was already ended.
pub type CallHandler =
    Arc<dyn Fn(ServerCall) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

/// Typed request messages handed to streaming handlers.
pub type RequestStream<T> = BoxStream<'static, Result<T, Status>>;

#[derive(Clone)]
struct Registration {
    shape: CallShape,
    handler: CallHandler,
}

/// Handler selected for a method.
#[derive(Clone)]
pub(crate) enum Route {
    Method(CallShape, CallHandler),
    Fallback(CallHandler),
}

/// Registry for RPC service methods
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Registration>,
    fallback: Option<CallHandler>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

fn boxed_handler<F, Fut>(handler: F) -> CallHandler
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(
        move |call: ServerCall| -> BoxFuture<'static, Result<(), Status>> {
            Box::pin(handler(call))
        },
    )
}

fn typed_requests<Req>(requests: ReadStream) -> RequestStream<Req>
where
    Req: Decoder + Send + 'static,
{
    requests
        .map(|message| message.and_then(Req::decode))
        .boxed()
}

/// Encode and send every item of `responses`, then end the response.
async fn send_all<S, Res>(responses: S, response: &WriteStream) -> Result<(), Status>
where
    S: Stream<Item = Result<Res, Status>> + Send,
    Res: Encoder,
{
    futures::pin_mut!(responses);
    while let Some(item) = responses.next().await {
        response.send(item?.encode()?).await?;
    }
    response.end()?;
    Ok(())
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler for `method`. A previous registration for the
    /// same name is replaced.
    pub fn register<F, Fut>(&mut self, method: &str, shape: CallShape, handler: F)
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register_handler(method, shape, boxed_handler(handler));
    }

    pub fn register_handler(&mut self, method: &str, shape: CallShape, handler: CallHandler) {
        if let Err(status) = validate_method_name(method) {
            // still registered: the server never routes a malformed path to it
            warn!(%method, %status, "registering handler for a malformed method name");
        }

        let previous = self
            .methods
            .insert(method.to_string(), Registration { shape, handler });
        if previous.is_some() {
            debug!(%method, %shape, "replaced method handler");
        } else {
            debug!(%method, %shape, "registered method handler");
        }
    }

    /// Register a unary-unary handler
    pub fn register_unary<F, Req, Res, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, CallShape::Unary, move |call: ServerCall| {
            let handler = Arc::clone(&handler);
            async move {
                let (context, mut requests, response) = call.into_parts();
                let request = Req::decode(requests.single().await?)?;
                let reply = handler(request, context).await?;
                response.end_with(reply.encode()?)?;
                Ok::<(), Status>(())
            }
        });
    }

    /// Register a unary-stream handler
    pub fn register_server_streaming<F, Req, Res, S, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, CallShape::ServerStreaming, move |call: ServerCall| {
            let handler = Arc::clone(&handler);
            async move {
                let (context, mut requests, response) = call.into_parts();
                let request = Req::decode(requests.single().await?)?;
                let replies = handler(request, context).await?;
                send_all(replies, &response).await
            }
        });
    }

    /// Register a stream-unary handler
    pub fn register_client_streaming<F, Req, Res, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, CallShape::ClientStreaming, move |call: ServerCall| {
            let handler = Arc::clone(&handler);
            async move {
                let (context, requests, response) = call.into_parts();
                let reply = handler(typed_requests(requests), context).await?;
                response.end_with(reply.encode()?)?;
                Ok::<(), Status>(())
            }
        });
    }

    /// Register a stream-stream handler
    pub fn register_bidi<F, Req, Res, S, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, CallShape::BidiStreaming, move |call: ServerCall| {
            let handler = Arc::clone(&handler);
            async move {
                let (context, requests, response) = call.into_parts();
                let replies = handler(typed_requests(requests), context).await?;
                send_all(replies, &response).await
            }
        });
    }

    /// Install the handler receiving every call without a specific
    /// registration. Replaces any previous catch-all.
    pub fn set_fallback<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.set_fallback_handler(boxed_handler(handler));
    }

    pub fn set_fallback_handler(&mut self, handler: CallHandler) {
        debug!("installed catch-all handler");
        self.fallback = Some(handler);
    }

    pub fn remove(&mut self, method: &str) -> bool {
        self.methods.remove(method).is_some()
    }

    /// Shape registered for `method`, if any.
    pub fn shape(&self, method: &str) -> Option<CallShape> {
        self.methods.get(method).map(|r| r.shape)
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.methods.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Pick the handler for `method`: a specific registration first, then
    /// the catch-all.
    pub(crate) fn resolve(&self, method: &str) -> Option<Route> {
        if let Some(registration) = self.methods.get(method) {
            return Some(Route::Method(
                registration.shape,
                registration.handler.clone(),
            ));
        }

        self.fallback.clone().map(Route::Fallback)
    }
}
