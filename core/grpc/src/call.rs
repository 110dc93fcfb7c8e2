// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::stream::{ReadStream, WriteStream};
use crate::{Metadata, Status};

/// Cardinality of the two directions of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// One request, one response
    Unary,
    /// One request, a stream of responses
    ServerStreaming,
    /// A stream of requests, one response
    ClientStreaming,
    /// Independent streams in both directions
    BidiStreaming,
}

impl CallShape {
    pub fn client_streams(&self) -> bool {
        matches!(self, CallShape::ClientStreaming | CallShape::BidiStreaming)
    }

    pub fn server_streams(&self) -> bool {
        matches!(self, CallShape::ServerStreaming | CallShape::BidiStreaming)
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallShape::Unary => "unary",
            CallShape::ServerStreaming => "server-streaming",
            CallShape::ClientStreaming => "client-streaming",
            CallShape::BidiStreaming => "bidi-streaming",
        };
        f.write_str(name)
    }
}

/// Check that `method` has the `/package.Service/Method` form.
pub fn validate_method_name(method: &str) -> Result<(), Status> {
    let malformed = || Status::unimplemented(format!("malformed method name: {:?}", method));

    let rest = method.strip_prefix('/').ok_or_else(malformed)?;
    let (service, name) = rest.split_once('/').ok_or_else(malformed)?;

    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'?' && b != b'#')
    };

    if valid_part(service) && valid_part(name) {
        Ok(())
    } else {
        Err(malformed())
    }
}

/// What a handler knows about the call besides its messages.
#[derive(Debug, Clone)]
pub struct CallContext {
    method: String,
    metadata: Metadata,
}

impl CallContext {
    pub fn new(method: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            method: method.into(),
            metadata,
        }
    }

    /// Full method name, `/package.Service/Method`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request metadata sent by the caller.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// A call accepted by the server.
///
/// The handler reads the request messages from [`ServerCall::requests`] and
/// answers through [`ServerCall::response`]. The response must be ended (or
/// failed) exactly once; a handler returning `Err(status)` fails it for the
/// handler.
#[derive(Debug)]
pub struct ServerCall {
    context: CallContext,
    shape: Option<CallShape>,
    requests: ReadStream,
    response: WriteStream,
}

impl ServerCall {
    pub(crate) fn new(
        context: CallContext,
        shape: Option<CallShape>,
        requests: ReadStream,
        response: WriteStream,
    ) -> Self {
        Self {
            context,
            shape,
            requests,
            response,
        }
    }

    pub fn method(&self) -> &str {
        self.context.method()
    }

    /// Shape of the registered method, `None` for calls routed to the
    /// catch-all handler.
    pub fn shape(&self) -> Option<CallShape> {
        self.shape
    }

    pub fn metadata(&self) -> &Metadata {
        self.context.metadata()
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn requests(&mut self) -> &mut ReadStream {
        &mut self.requests
    }

    pub fn response(&self) -> &WriteStream {
        &self.response
    }

    pub fn into_parts(self) -> (CallContext, ReadStream, WriteStream) {
        (self.context, self.requests, self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn test_validate_method_name() {
        assert!(validate_method_name("/helloworld.Greeter/SayHello").is_ok());
        assert!(validate_method_name("/svc/m").is_ok());

        for bad in [
            "",
            "/",
            "//",
            "helloworld.Greeter/SayHello",
            "/helloworld.Greeter",
            "/helloworld.Greeter/",
            "/a/b/c",
            "/a b/c",
            "/svc/m?x=1",
        ] {
            let err = validate_method_name(bad).unwrap_err();
            assert_eq!(err.code(), Code::Unimplemented, "{:?}", bad);
        }
    }

    #[test]
    fn test_call_shape_directions() {
        assert!(!CallShape::Unary.client_streams());
        assert!(!CallShape::Unary.server_streams());
        assert!(CallShape::ServerStreaming.server_streams());
        assert!(CallShape::ClientStreaming.client_streams());
        assert!(CallShape::BidiStreaming.client_streams());
        assert!(CallShape::BidiStreaming.server_streams());
        assert_eq!(CallShape::BidiStreaming.to_string(), "bidi-streaming");
    }
}
