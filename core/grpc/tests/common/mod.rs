// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use slim_config::grpc::client::ClientConfig;
use slim_config::grpc::server::ServerConfig;
use slim_grpc::{
    CallContext, CallShape, Client, Code, Decoder, Encoder, Metadata, PassThrough,
    RequestStream, Server, ServerCall, Status, StreamError,
};

pub const SAY_HELLO: &str = "/helloworld.Greeter/SayHello";
pub const RANGE: &str = "/test.Items/Range";
pub const COLLECT: &str = "/test.Items/Collect";
pub const ECHO: &str = "/test.Items/Echo";
pub const FAIL: &str = "/test.Items/Fail";
pub const PANIC: &str = "/test.Items/Panic";
pub const TRAILERS: &str = "/test.Items/Trailers";
pub const HANG: &str = "/test.Items/Hang";
pub const WRITE_AFTER_END: &str = "/test.Items/WriteAfterEnd";
pub const FORGET: &str = "/test.Items/Forget";
pub const FLOOD: &str = "/test.Items/Flood";

/// Size of the values streamed by FLOOD, large enough to fill the HTTP/2
/// flow-control windows quickly.
pub const FLOOD_VALUE_LEN: usize = 1024;

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RangeRequest {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Item {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Summary {
    #[prost(uint32, tag = "1")]
    pub count: u32,
    #[prost(string, tag = "2")]
    pub last: String,
}

macro_rules! prost_codec {
    ($($message:ty),* $(,)?) => {
        $(
            impl Encoder for $message {
                fn encode(&self) -> Result<Bytes, Status> {
                    Ok(Bytes::from(prost::Message::encode_to_vec(self)))
                }
            }

            impl Decoder for $message {
                fn decode(buf: Bytes) -> Result<Self, Status> {
                    <$message as prost::Message>::decode(buf)
                        .map_err(|e| Status::internal(format!("failed to decode message: {}", e)))
                }
            }
        )*
    };
}

prost_codec!(HelloRequest, HelloReply, RangeRequest, Item, Summary);

pub fn item(value: impl Into<String>) -> Item {
    Item {
        value: value.into(),
    }
}

pub fn items(count: u32) -> Vec<Item> {
    (0..count).map(|i| item(format!("the-value-{}", i))).collect()
}

/// What the test handlers observed, reported back to the test body.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Received(String),
    Ended,
    Failed(Code),
    WriteAfterEnd(Option<StreamError>),
}

/// Server with every test method registered. Handler observations are sent
/// to `events`.
pub fn test_server(events: mpsc::UnboundedSender<Event>) -> Server {
    let server = Server::new(ServerConfig::with_endpoint("127.0.0.1:0"));

    server.register_unary(SAY_HELLO, |request: HelloRequest, _ctx: CallContext| async move {
        Ok(HelloReply {
            message: format!("Hello {}", request.name),
        })
    });

    server.register_server_streaming(RANGE, |request: RangeRequest, _ctx: CallContext| async move {
        Ok(futures::stream::iter(
            (0..request.count).map(|i| Ok(item(format!("the-value-{}", i)))),
        ))
    });

    server.register_client_streaming(
        COLLECT,
        |mut requests: RequestStream<Item>, _ctx: CallContext| async move {
            let mut summary = Summary::default();
            while let Some(next) = requests.next().await {
                summary.count += 1;
                summary.last = next?.value;
            }
            Ok::<Summary, Status>(summary)
        },
    );

    server.register_bidi(ECHO, |requests: RequestStream<Item>, _ctx: CallContext| async move {
        Ok(requests)
    });

    server.register_unary(FAIL, |_request: HelloRequest, _ctx: CallContext| async move {
        Err::<HelloReply, Status>(Status::invalid_argument("bad request"))
    });

    server.register_unary(PANIC, |request: HelloRequest, _ctx: CallContext| async move {
        if !request.name.is_empty() {
            panic!("refusing to greet {}", request.name);
        }
        Ok(HelloReply::default())
    });

    // echoes the request and returns the x-echo request header as a trailer
    server.register(TRAILERS, CallShape::Unary, |mut call: ServerCall| async move {
        let request = call.requests().single().await?;
        let echo = call.metadata().get("x-echo").unwrap_or_default().to_string();

        call.response().send(request).await?;
        let trailers: Metadata = [("x-echo", echo)].into_iter().collect();
        call.response().end_with_trailers(trailers)?;
        Ok::<(), Status>(())
    });

    let hang_events = events.clone();
    server.register(HANG, CallShape::BidiStreaming, move |mut call: ServerCall| {
        let events = hang_events.clone();
        async move {
            while let Some(message) = call.requests().next().await {
                match message {
                    Ok(message) => {
                        let value = Item::decode(message)?.value;
                        let _ = events.send(Event::Received(value));
                    }
                    Err(status) => {
                        let _ = events.send(Event::Failed(status.code()));
                        return Err(status);
                    }
                }
            }

            let _ = events.send(Event::Ended);
            call.response().end()?;
            Ok::<(), Status>(())
        }
    });

    // returns without ending its response
    server.register(FORGET, CallShape::BidiStreaming, |_call: ServerCall| async move {
        Ok::<(), Status>(())
    });

    // streams `count` large items, waiting for room whenever the response is
    // not writable; the number of waits is returned as the x-paused trailer
    server.register(FLOOD, CallShape::ServerStreaming, |mut call: ServerCall| async move {
        let count = RangeRequest::decode(call.requests().single().await?)?.count;
        let response = call.response().clone();

        let mut paused = 0u32;
        for i in 0..count {
            if !response.is_writable() {
                paused += 1;
                response.ready().await?;
            }
            response.write(flood_item(i).encode()?)?;
        }

        let trailers: Metadata = [("x-paused", paused.to_string())].into_iter().collect();
        response.end_with_trailers(trailers)?;
        Ok::<(), Status>(())
    });

    server.register(WRITE_AFTER_END, CallShape::Unary, move |mut call: ServerCall| {
        let events = events.clone();
        async move {
            let request = call.requests().single().await?;
            call.response().end_with(request)?;

            let late = call.response().write(Bytes::from_static(b"late"));
            let _ = events.send(Event::WriteAfterEnd(late.err()));
            Ok::<(), Status>(())
        }
    });

    server
}

pub fn flood_item(i: u32) -> Item {
    let prefix = format!("{}-", i);
    let padding = "x".repeat(FLOOD_VALUE_LEN - prefix.len());
    item(format!("{}{}", prefix, padding))
}

/// Serve `server` on an ephemeral local port.
pub async fn serve(server: &Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = server.clone();
    tokio::spawn(async move { server.serve(listener).await });

    addr
}

/// Start the test server, returning its address and the handler events.
pub async fn start_backend() -> (Server, SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = test_server(tx);
    let addr = serve(&server).await;
    (server, addr, rx)
}

/// Start the test server on a single connection. Aborting the returned task
/// drops that connection abruptly.
pub async fn start_backend_connection() -> (
    tokio::task::JoinHandle<()>,
    SocketAddr,
    mpsc::UnboundedReceiver<Event>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = test_server(tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (socket, peer) = listener.accept().await.unwrap();
        server.serve_connection(socket, Some(peer)).await;
    });

    (task, addr, rx)
}

/// Start a proxy forwarding every call to `upstream`.
pub async fn start_proxy(upstream: SocketAddr) -> (Server, SocketAddr) {
    let bridge = PassThrough::new(Client::new(ClientConfig::default()), upstream);

    let proxy = Server::new(ServerConfig::with_endpoint("127.0.0.1:0"));
    proxy.set_fallback_handler(bridge.handler());

    let addr = serve(&proxy).await;
    (proxy, addr)
}

pub fn client() -> Client {
    Client::new(ClientConfig::default())
}

/// Address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
