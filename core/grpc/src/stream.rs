// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The two directions of a call as seen by application code.
//!
//! A [`ReadStream`] yields the messages received from the peer, in order,
//! followed by either the end of the stream or a single error. A
//! [`WriteStream`] queues messages in front of the transport; the queue is
//! bounded so that a slow peer pushes back on the producer.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::{Metadata, Status};

/// Errors returned synchronously by [`WriteStream`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("the stream has already been ended")]
    Ended,
    #[error("the outbound queue is full")]
    Full,
    #[error("the stream was closed: {0}")]
    Closed(Status),
}

impl From<StreamError> for Status {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Ended => Status::internal("write after the end of the stream"),
            StreamError::Full => Status::resource_exhausted("outbound queue is full"),
            StreamError::Closed(status) => status,
        }
    }
}

/// Items travelling from a [`WriteStream`] to the task driving the transport.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Bytes),
    End(Metadata),
    Fail(Status, Metadata),
}

#[derive(Debug)]
struct WriteState {
    // guards the end-of-stream decision so that no message can be queued
    // behind an End or Fail
    ended: Mutex<bool>,
    closed: Mutex<Option<Status>>,
    pending: AtomicUsize,
    capacity: usize,
    drained: Notify,
}

/// Sending half of a call direction.
///
/// Clones share the same queue and the same end-of-stream state.
#[derive(Debug, Clone)]
pub struct WriteStream {
    tx: mpsc::UnboundedSender<Outbound>,
    state: Arc<WriteState>,
}

/// Transport side of a [`WriteStream`].
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<WriteState>,
}

/// Create a write stream that accepts up to `capacity` messages not yet
/// handed to the transport.
pub(crate) fn write_channel(capacity: usize) -> (WriteStream, OutboundQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(WriteState {
        ended: Mutex::new(false),
        closed: Mutex::new(None),
        pending: AtomicUsize::new(0),
        capacity: capacity.max(1),
        drained: Notify::new(),
    });

    (
        WriteStream {
            tx,
            state: state.clone(),
        },
        OutboundQueue { rx, state },
    )
}

impl WriteStream {
    /// Queue a message.
    ///
    /// Fails with [`StreamError::Ended`] once the stream was ended, with
    /// [`StreamError::Closed`] when the transport side is gone and with
    /// [`StreamError::Full`] while the queue is at capacity.
    pub fn write(&self, message: Bytes) -> Result<(), StreamError> {
        let ended = self.state.ended.lock();
        if *ended {
            return Err(StreamError::Ended);
        }
        self.check_open()?;

        let capacity = self.state.capacity;
        self.state
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < capacity).then_some(pending + 1)
            })
            .map_err(|_| StreamError::Full)?;

        self.push_message(message)
    }

    /// Queue a message, waiting for room in the queue first.
    pub async fn send(&self, message: Bytes) -> Result<(), StreamError> {
        loop {
            self.ready().await?;
            match self.write(message.clone()) {
                Err(StreamError::Full) => continue,
                res => return res,
            }
        }
    }

    /// End the stream without a final message.
    pub fn end(&self) -> Result<(), StreamError> {
        self.finish(None, Metadata::new())
    }

    /// Queue a final message and end the stream.
    ///
    /// The final message is accepted even when the queue is full.
    pub fn end_with(&self, message: Bytes) -> Result<(), StreamError> {
        self.finish(Some(message), Metadata::new())
    }

    /// End the stream, attaching trailing metadata. Only responses carry
    /// trailers; on a request stream the metadata is ignored.
    pub fn end_with_trailers(&self, trailers: Metadata) -> Result<(), StreamError> {
        self.finish(None, trailers)
    }

    /// Terminate the stream with an error status.
    ///
    /// Returns false when the stream had already been ended or failed, in
    /// which case nothing is sent.
    pub fn fail(&self, status: Status) -> bool {
        self.fail_with_trailers(status, Metadata::new())
    }

    pub fn fail_with_trailers(&self, status: Status, trailers: Metadata) -> bool {
        let mut ended = self.state.ended.lock();
        if *ended {
            return false;
        }
        *ended = true;
        self.tx.send(Outbound::Fail(status, trailers)).is_ok()
    }

    /// True when a call to [`WriteStream::write`] would currently succeed.
    pub fn is_writable(&self) -> bool {
        !*self.state.ended.lock()
            && self.state.closed.lock().is_none()
            && self.state.pending.load(Ordering::Acquire) < self.state.capacity
    }

    /// True once the stream was ended or failed through any clone.
    pub fn is_ended(&self) -> bool {
        *self.state.ended.lock()
    }

    /// Wait until the queue has room for another message.
    pub async fn ready(&self) -> Result<(), StreamError> {
        loop {
            let notified = self.state.drained.notified();
            tokio::pin!(notified);
            // register before checking so that a concurrent release is not missed
            notified.as_mut().enable();

            if *self.state.ended.lock() {
                return Err(StreamError::Ended);
            }
            self.check_open()?;
            if self.state.pending.load(Ordering::Acquire) < self.state.capacity {
                return Ok(());
            }

            notified.await;
        }
    }

    /// Wait until the transport side is gone and return the status it
    /// closed with. A stream is closed once its call finished or was reset.
    pub async fn closed(&self) -> Status {
        loop {
            let notified = self.state.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(status) = self.state.closed.lock().clone() {
                return status;
            }

            notified.await;
        }
    }

    fn finish(&self, message: Option<Bytes>, trailers: Metadata) -> Result<(), StreamError> {
        let mut ended = self.state.ended.lock();
        if *ended {
            return Err(StreamError::Ended);
        }
        self.check_open()?;

        if let Some(message) = message {
            self.state.pending.fetch_add(1, Ordering::AcqRel);
            self.push_message(message)?;
        }

        *ended = true;
        self.push(Outbound::End(trailers))
    }

    fn check_open(&self) -> Result<(), StreamError> {
        match self.state.closed.lock().as_ref() {
            Some(status) => Err(StreamError::Closed(status.clone())),
            None => Ok(()),
        }
    }

    /// Push a message already counted in `pending`, giving the slot back
    /// when the transport side is gone.
    fn push_message(&self, message: Bytes) -> Result<(), StreamError> {
        self.push(Outbound::Message(message)).inspect_err(|_| {
            self.state.pending.fetch_sub(1, Ordering::AcqRel);
        })
    }

    fn push(&self, item: Outbound) -> Result<(), StreamError> {
        self.tx.send(item).map_err(|_| {
            let status = self
                .state
                .closed
                .lock()
                .clone()
                .unwrap_or_else(|| Status::cancelled("stream closed"));
            StreamError::Closed(status)
        })
    }
}

impl OutboundQueue {
    pub(crate) async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// A message left the queue and was handed to the transport.
    pub(crate) fn release(&self) {
        self.state.pending.fetch_sub(1, Ordering::AcqRel);
        self.state.drained.notify_waiters();
    }

    /// The transport side is gone: further writes fail with `status`.
    pub(crate) fn close(&self, status: Status) {
        {
            let mut closed = self.state.closed.lock();
            if closed.is_none() {
                *closed = Some(status);
            }
        }
        self.state.drained.notify_waiters();
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.close(Status::cancelled("stream closed"));
    }
}

/// Receiving half of a call direction.
///
/// Yields `Ok(message)` items in arrival order. The stream then either ends
/// (`None`) or yields exactly one `Err(status)` and ends.
#[derive(Debug)]
pub struct ReadStream {
    rx: mpsc::Receiver<Result<Bytes, Status>>,
    done: bool,
    trailers: Arc<Mutex<Option<Metadata>>>,
}

/// Producer side of a [`ReadStream`].
#[derive(Debug, Clone)]
pub(crate) struct InboundSender {
    tx: mpsc::Sender<Result<Bytes, Status>>,
    trailers: Arc<Mutex<Option<Metadata>>>,
}

/// Create a read stream buffering up to `capacity` undelivered messages.
pub(crate) fn read_channel(capacity: usize) -> (InboundSender, ReadStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let trailers = Arc::new(Mutex::new(None));

    (
        InboundSender {
            tx,
            trailers: trailers.clone(),
        },
        ReadStream {
            rx,
            done: false,
            trailers,
        },
    )
}

impl InboundSender {
    /// Deliver a message. Returns false when the reader is gone.
    pub(crate) async fn deliver(&self, message: Bytes) -> bool {
        self.tx.send(Ok(message)).await.is_ok()
    }

    /// Terminate the stream with an error.
    pub(crate) async fn fail(&self, status: Status) {
        let _ = self.tx.send(Err(status)).await;
    }

    /// Terminate a stream that has not buffered anything yet.
    pub(crate) fn fail_now(&self, status: Status) {
        let _ = self.tx.try_send(Err(status));
    }

    pub(crate) fn set_trailers(&self, trailers: Metadata) {
        *self.trailers.lock() = Some(trailers);
    }
}

impl ReadStream {
    /// Trailing metadata sent by the peer, available once the stream is over.
    pub fn trailers(&self) -> Option<Metadata> {
        self.trailers.lock().clone()
    }

    /// True once the end or an error was yielded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Read a single message and require the stream to end right after it.
    pub async fn single(&mut self) -> Result<Bytes, Status> {
        let message = match self.next().await {
            Some(message) => message?,
            None => return Err(Status::internal("expected one message, got none")),
        };

        match self.next().await {
            None => Ok(message),
            Some(Ok(_)) => Err(Status::internal("expected one message, got more")),
            Some(Err(status)) => Err(status),
        }
    }
}

impl Stream for ReadStream {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Err(status))) => {
                self.done = true;
                Poll::Ready(Some(Err(status)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl futures::stream::FusedStream for ReadStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}
