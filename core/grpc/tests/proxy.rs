// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::time::Duration;

use futures::StreamExt;
use tracing_test::traced_test;

use common::*;
use slim_grpc::{Code, Decoder, Encoder, Metadata};

#[tokio::test]
#[traced_test]
async fn test_unary_through_proxy() {
    let (_backend, backend_addr, _events) = start_backend().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;

    let reply: HelloReply = client()
        .unary(
            proxy_addr,
            SAY_HELLO,
            HelloRequest {
                name: "Julien".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(reply.message, "Hello Julien");
}

#[tokio::test]
#[traced_test]
async fn test_streaming_shapes_through_proxy() {
    let (_backend, backend_addr, _events) = start_backend().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;
    let client = client();

    let replies: Vec<Item> = client
        .server_streaming(proxy_addr, RANGE, RangeRequest { count: 128 })
        .await
        .unwrap()
        .map(|reply| reply.unwrap())
        .collect()
        .await;
    assert_eq!(replies, items(128));

    let summary: Summary = client
        .client_streaming(proxy_addr, COLLECT, futures::stream::iter(items(128)))
        .await
        .unwrap();
    assert_eq!(summary.count, 128);
    assert_eq!(summary.last, "the-value-127");

    let replies: Vec<Item> = client
        .bidi(proxy_addr, ECHO, futures::stream::iter(items(128)))
        .await
        .unwrap()
        .map(|reply| reply.unwrap())
        .collect()
        .await;
    assert_eq!(replies, items(128));
}

#[tokio::test]
#[traced_test]
async fn test_interleaved_bidi_through_proxy() {
    let (_backend, backend_addr, _events) = start_backend().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;

    let (requests, response) = client().request(proxy_addr, ECHO).into_parts();
    requests.send(item("ping").encode().unwrap()).await.unwrap();

    let mut messages = response.await.unwrap().into_messages();
    let echoed = Item::decode(messages.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(echoed, item("ping"));

    requests.end().unwrap();
    assert!(messages.next().await.is_none());
}

#[tokio::test]
#[traced_test]
async fn test_upstream_status_is_relayed() {
    let (_backend, backend_addr, _events) = start_backend().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;
    let client = client();

    let err = client
        .unary::<_, HelloReply>(proxy_addr, "/helloworld.Greeter/Missing", HelloRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let err = client
        .unary::<_, HelloReply>(proxy_addr, FAIL, HelloRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), Some("bad request"));
}

#[tokio::test]
#[traced_test]
async fn test_upstream_down_is_unavailable() {
    let (_proxy, proxy_addr) = start_proxy(unused_addr().await).await;

    let err = client()
        .unary::<_, HelloReply>(proxy_addr, SAY_HELLO, HelloRequest::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
#[traced_test]
async fn test_metadata_and_trailers_through_proxy() {
    let (_backend, backend_addr, _events) = start_backend().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;

    let metadata: Metadata = [("x-echo", "through-the-proxy")].into_iter().collect();
    let call = client().request_with_metadata(proxy_addr, TRAILERS, metadata);
    call.request()
        .end_with(item("payload").encode().unwrap())
        .unwrap();

    let mut messages = call.response().await.unwrap().into_messages();
    let reply = Item::decode(messages.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply, item("payload"));
    assert!(messages.next().await.is_none());

    let trailers = messages.trailers().unwrap();
    assert_eq!(trailers.get("x-echo"), Some("through-the-proxy"));
}

#[tokio::test]
#[traced_test]
async fn test_cancel_propagates_upstream() {
    let (_backend, backend_addr, mut events) = start_backend().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;

    let call = client().request(proxy_addr, HANG);
    call.request()
        .send(item("hello").encode().unwrap())
        .await
        .unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        Event::Received("hello".to_string())
    );

    call.cancel();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, Event::Failed(Code::Cancelled));
}

#[tokio::test]
#[traced_test]
async fn test_request_end_propagates_upstream() {
    let (_backend, backend_addr, mut events) = start_backend().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;

    let call = client().request(proxy_addr, HANG);
    call.request()
        .send(item("last").encode().unwrap())
        .await
        .unwrap();
    call.request().end().unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        Event::Received("last".to_string())
    );
    assert_eq!(events.recv().await.unwrap(), Event::Ended);

    let mut messages = call.response().await.unwrap().into_messages();
    assert!(messages.next().await.is_none());
}

#[tokio::test]
#[traced_test]
async fn test_upstream_loss_fails_the_downstream_call() {
    let (backend, backend_addr, mut events) = start_backend_connection().await;
    let (_proxy, proxy_addr) = start_proxy(backend_addr).await;

    let call = client().request(proxy_addr, HANG);
    call.request()
        .send(item("hello").encode().unwrap())
        .await
        .unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        Event::Received("hello".to_string())
    );

    // drops the only upstream connection mid-call
    backend.abort();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        match call.response().await {
            Ok(mut response) => response.messages().next().await.unwrap().unwrap_err(),
            Err(status) => status,
        }
    })
    .await
    .unwrap();
    assert_eq!(status.code(), Code::Unavailable);
}
