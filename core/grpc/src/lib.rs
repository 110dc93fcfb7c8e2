// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! gRPC call handling over HTTP/2.
//!
//! The crate provides the pieces needed to serve and issue gRPC calls of
//! every shape without generated code:
//!
//! - [`Server`] accepts HTTP/2 connections and dispatches each call to the
//!   handler registered for its method in a [`MethodRegistry`]
//! - [`Client`] opens calls towards a remote server
//! - [`PassThrough`] bridges the two, relaying calls to an upstream server
//!   without decoding them
//!
//! Messages are opaque [`bytes::Bytes`] at the transport level. Typed
//! handlers and client helpers go through the [`Encoder`] and [`Decoder`]
//! traits.

mod call;
mod client;
mod codec;
mod metadata;
mod proxy;
mod registry;
mod server;
mod status;
mod stream;
mod transport;

pub use call::{CallContext, CallShape, ServerCall, validate_method_name};
pub use client::{Client, ClientCall, ClientResponse, ResponseFuture};
pub use codec::{Codec, Decoder, Encoder, FRAME_HEADER_LEN, FrameDecoder, encode_frame};
pub use metadata::Metadata;
pub use proxy::PassThrough;
pub use registry::{CallHandler, MethodRegistry, RequestStream};
pub use server::Server;
pub use status::{Code, Side, Status};
pub use stream::{ReadStream, StreamError, WriteStream};
