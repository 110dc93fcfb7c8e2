// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Per-call tasks moving messages between the call streams and HTTP/2.
//!
//! Every call runs one inbound pump (HTTP/2 DATA -> [`ReadStream`]) and one
//! outbound pump ([`WriteStream`] -> HTTP/2 DATA). Flow-control capacity is
//! only released back to the peer once the decoded messages were accepted
//! by the bounded inbound queue, which is what carries backpressure from a
//! slow consumer to the remote sender.
//!
//! [`ReadStream`]: crate::ReadStream
//! [`WriteStream`]: crate::WriteStream

use std::future::poll_fn;

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{FrameDecoder, encode_frame};
use crate::status::Side;
use crate::stream::{InboundSender, Outbound, OutboundQueue};
use crate::{Metadata, Status};

pub(crate) const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// True for `application/grpc` and its `+format` / parameter variants.
pub(crate) fn is_grpc_content_type(value: Option<&HeaderValue>) -> bool {
    let Some(value) = value.and_then(|v| v.to_str().ok()) else {
        return false;
    };

    match value.strip_prefix(GRPC_CONTENT_TYPE) {
        Some(rest) => rest.is_empty() || rest.starts_with('+') || rest.starts_with(';'),
        None => false,
    }
}

/// Cancellation of one HTTP/2 connection.
///
/// `closed` fires whenever the connection goes away. `local` only fires
/// when this side tore it down, and is the parent of `closed`.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionScope {
    local: CancellationToken,
    closed: CancellationToken,
}

impl ConnectionScope {
    pub(crate) fn new() -> Self {
        let local = CancellationToken::new();
        let closed = local.child_token();
        Self { local, closed }
    }

    /// Tear the connection down from this side.
    pub(crate) fn close(&self) {
        self.local.cancel();
    }

    /// The connection ended on its own (peer gone, I/O error).
    pub(crate) fn lost(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_locally(&self) -> bool {
        self.local.is_cancelled()
    }

    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Token cancelled together with the connection.
    pub(crate) fn token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Cancellation scope of a single call.
///
/// A call is cancelled on its own (explicit cancel, local failure) or
/// together with every other call of its connection.
#[derive(Debug, Clone)]
pub(crate) struct CallScope {
    connection: ConnectionScope,
    call: CancellationToken,
}

impl CallScope {
    /// Scope whose call token is a child of the connection token.
    pub(crate) fn new(connection: &ConnectionScope) -> Self {
        Self {
            connection: connection.clone(),
            call: connection.closed.child_token(),
        }
    }

    /// Scope for a call token created before the connection was known.
    pub(crate) fn linked(connection: &ConnectionScope, call: CancellationToken) -> Self {
        Self {
            connection: connection.clone(),
            call,
        }
    }

    pub(crate) fn cancel(&self) {
        self.call.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.call.is_cancelled() || self.connection.is_closed()
    }

    pub(crate) async fn cancelled(&self) {
        tokio::select! {
            _ = self.call.cancelled() => {}
            _ = self.connection.closed() => {}
        }
    }

    /// Status reported to the call streams once the scope was cancelled.
    ///
    /// Only a connection lost on the client side is UNAVAILABLE; a local
    /// teardown or a cancelled call is CANCELLED.
    pub(crate) fn cancelled_status(&self, side: Side) -> Status {
        if !self.connection.is_closed() {
            return Status::cancelled("call cancelled");
        }

        match side {
            Side::Client if !self.connection.closed_locally() => {
                Status::unavailable("connection lost")
            }
            _ => Status::cancelled("connection closed"),
        }
    }
}

/// Send `data` on `stream`, waiting for flow-control capacity as needed.
pub(crate) async fn send_data(
    stream: &mut SendStream<Bytes>,
    mut data: Bytes,
    side: Side,
) -> Result<(), Status> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());

        let available = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(available)) => available,
            Some(Err(e)) => return Err(Status::from_h2_error(&e, side)),
            None => return Err(Status::cancelled("stream closed while sending")),
        };
        if available == 0 {
            continue;
        }

        let chunk = data.split_to(available.min(data.len()));
        stream
            .send_data(chunk, false)
            .map_err(|e| Status::from_h2_error(&e, side))?;
    }

    Ok(())
}

/// Status for a RST_STREAM received from the peer.
pub(crate) fn reset_status(result: Result<Reason, h2::Error>, side: Side) -> Status {
    match result {
        Ok(reason) => Status::from_h2_error(&h2::Error::from(reason), side),
        Err(e) => Status::from_h2_error(&e, side),
    }
}

/// Decode the DATA frames of `body` into `inbound` until the peer ends the
/// stream. Returns the trailers sent by the peer, if any.
///
/// Messages are dropped once the reader went away, but the body is still
/// consumed so that the peer is not stalled on flow control.
pub(crate) async fn pump_inbound(
    mut body: RecvStream,
    inbound: &InboundSender,
    max_message_size: usize,
    side: Side,
) -> Result<Option<HeaderMap>, Status> {
    let mut decoder = FrameDecoder::new(max_message_size);
    let mut reader_gone = false;

    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| Status::from_h2_error(&e, side))?;
        let len = chunk.len();

        for message in decoder.decode(&chunk)? {
            if !reader_gone && !inbound.deliver(message).await {
                debug!("reader dropped, discarding inbound messages");
                reader_gone = true;
            }
        }

        // the connection is gone if this fails, which the next read reports
        let _ = body.flow_control().release_capacity(len);
    }

    decoder.finish()?;

    body.trailers()
        .await
        .map_err(|e| Status::from_h2_error(&e, side))
}

fn trailers_for(status: &Status, metadata: &Metadata) -> HeaderMap {
    let mut trailers = metadata.to_headers();
    status.add_to_headers(&mut trailers);
    trailers
}

/// Headers of a successful gRPC response.
pub(crate) fn response_head() -> http::Response<()> {
    let mut response = http::Response::new(());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    response
}

/// A response made of headers only, carrying the final status.
pub(crate) fn trailers_only(status: &Status) -> http::Response<()> {
    let mut response = response_head();
    status.add_to_headers(response.headers_mut());
    response
}

/// Drive the response half of a server call: headers first, then every
/// queued message, then the trailers carrying the status.
pub(crate) async fn drive_response(
    mut respond: h2::server::SendResponse<Bytes>,
    mut queue: OutboundQueue,
    scope: CallScope,
) {
    let mut stream = match respond.send_response(response_head(), false) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(error = %e, "failed to send response headers");
            queue.close(Status::from_h2_error(&e, Side::Server));
            scope.cancel();
            return;
        }
    };

    loop {
        let next = tokio::select! {
            next = queue.recv() => next,
            reset = poll_fn(|cx| stream.poll_reset(cx)) => {
                let status = reset_status(reset, Side::Server);
                debug!(%status, "response stream reset by peer");
                queue.close(status);
                break;
            }
            _ = scope.cancelled() => {
                let status = scope.cancelled_status(Side::Server);
                debug!(%status, "response cancelled");
                stream.send_reset(Reason::CANCEL);
                queue.close(status);
                break;
            }
        };

        match next {
            Some(Outbound::Message(message)) => {
                let sent = match encode_frame(&message) {
                    Ok(frame) => tokio::select! {
                        res = send_data(&mut stream, frame, Side::Server) => res,
                        _ = scope.cancelled() => Err(scope.cancelled_status(Side::Server)),
                    },
                    Err(status) => {
                        // the response cannot continue, report it to the caller
                        queue.release();
                        queue.close(status.clone());
                        let _ = stream.send_trailers(trailers_for(&status, &Metadata::new()));
                        break;
                    }
                };
                queue.release();

                if let Err(status) = sent {
                    debug!(%status, "failed to send response message");
                    stream.send_reset(Reason::CANCEL);
                    queue.close(status);
                    break;
                }
            }
            Some(Outbound::End(trailers)) => {
                if let Err(e) = stream.send_trailers(trailers_for(&Status::ok(), &trailers)) {
                    debug!(error = %e, "failed to send trailers");
                }
                break;
            }
            Some(Outbound::Fail(status, trailers)) => {
                debug!(%status, "response failed");
                if let Err(e) = stream.send_trailers(trailers_for(&status, &trailers)) {
                    debug!(error = %e, "failed to send trailers");
                }
                break;
            }
            None => {
                let status = Status::internal("handler completed without ending the response");
                debug!(%status, "response dropped");
                let _ = stream.send_trailers(trailers_for(&status, &Metadata::new()));
                break;
            }
        }
    }

    // stop reading a request the response no longer depends on
    scope.cancel();
}

/// Drive the request half of a client call.
///
/// Dropping every request handle without ending the stream, or failing it,
/// cancels the call.
pub(crate) async fn drive_request(
    mut stream: SendStream<Bytes>,
    mut queue: OutboundQueue,
    scope: CallScope,
) {
    loop {
        let next = tokio::select! {
            next = queue.recv() => next,
            reset = poll_fn(|cx| stream.poll_reset(cx)) => {
                let status = match reset {
                    Ok(Reason::NO_ERROR) => Status::cancelled("server stopped reading the request"),
                    other => reset_status(other, Side::Client),
                };
                debug!(%status, "request stream reset by peer");
                queue.close(status);
                return;
            }
            _ = scope.cancelled() => {
                stream.send_reset(Reason::CANCEL);
                queue.close(scope.cancelled_status(Side::Client));
                return;
            }
        };

        match next {
            Some(Outbound::Message(message)) => {
                let sent = match encode_frame(&message) {
                    Ok(frame) => tokio::select! {
                        res = send_data(&mut stream, frame, Side::Client) => res,
                        _ = scope.cancelled() => Err(scope.cancelled_status(Side::Client)),
                    },
                    Err(status) => Err(status),
                };
                queue.release();

                if let Err(status) = sent {
                    debug!(%status, "failed to send request message");
                    stream.send_reset(Reason::CANCEL);
                    queue.close(status);
                    scope.cancel();
                    return;
                }
            }
            Some(Outbound::End(_)) => {
                if let Err(e) = stream.send_data(Bytes::new(), true) {
                    debug!(error = %e, "failed to end request stream");
                }
                return;
            }
            Some(Outbound::Fail(status, _)) => {
                debug!(%status, "request failed locally, cancelling call");
                stream.send_reset(Reason::CANCEL);
                queue.close(status);
                scope.cancel();
                return;
            }
            None => {
                debug!("request handles dropped before the end, cancelling call");
                stream.send_reset(Reason::CANCEL);
                scope.cancel();
                return;
            }
        }
    }
}
