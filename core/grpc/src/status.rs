// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Terminal call status and its representation on the wire.
//!
//! Every call ends with a [`Status`]. On HTTP/2 the status travels in the
//! `grpc-status` / `grpc-message` fields of the trailers (or of the response
//! headers for a trailers-only response).

use std::fmt;
use std::fmt::Write;

use http::{HeaderMap, HeaderValue};

pub(crate) const GRPC_STATUS: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE: &str = "grpc-message";

/// gRPC status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum Code {
    #[default]
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    // indexed by numeric value
    const ALL: [Code; 17] = [
        Code::Ok,
        Code::Cancelled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    pub fn from_i32(value: i32) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Code::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code.as_i32()
    }
}

/// Which end of a call observed a transport failure.
///
/// A vanished peer means the caller went away when seen from the server,
/// and that the service is unreachable when seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Terminal status of a call: a code and an optional human readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: Option<String>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn with_code(code: Code) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn ok() -> Self {
        Self::with_code(Code::Ok)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Read the status carried by a trailers (or trailers-only headers) map.
    ///
    /// Returns `None` when no `grpc-status` field is present. A field that is
    /// not a known numeric code is reported as UNKNOWN.
    pub fn from_header_map(headers: &HeaderMap) -> Option<Status> {
        let raw = headers.get(GRPC_STATUS)?;

        let message = headers
            .get(GRPC_MESSAGE)
            .map(|value| percent_decode(value.as_bytes()))
            .filter(|message| !message.is_empty());

        let code = raw
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<i32>().ok())
            .and_then(Code::from_i32);

        Some(match code {
            Some(code) => Status { code, message },
            None => Status::unknown(format!(
                "invalid grpc-status value: {}",
                String::from_utf8_lossy(raw.as_bytes())
            )),
        })
    }

    /// Write `grpc-status` and, when set, the percent-encoded `grpc-message`.
    pub fn add_to_headers(&self, headers: &mut HeaderMap) {
        headers.insert(GRPC_STATUS, HeaderValue::from(self.code.as_i32()));

        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            // percent encoding only produces visible ASCII
            if let Ok(value) = HeaderValue::from_str(&percent_encode(message)) {
                headers.insert(GRPC_MESSAGE, value);
            }
        }
    }

    /// Map a transport error to the status observed by one end of a call.
    pub fn from_h2_error(err: &h2::Error, side: Side) -> Status {
        let peer_gone = || match side {
            Side::Client => Status::unavailable(format!("connection lost: {}", err)),
            Side::Server => Status::cancelled(format!("peer went away: {}", err)),
        };

        if err.is_io() || err.is_go_away() {
            return peer_gone();
        }

        match err.reason() {
            Some(h2::Reason::CANCEL) => Status::cancelled("stream cancelled by peer"),
            Some(h2::Reason::REFUSED_STREAM) => Status::unavailable("stream refused by peer"),
            Some(h2::Reason::ENHANCE_YOUR_CALM) => {
                Status::resource_exhausted("peer asked to reduce load")
            }
            Some(h2::Reason::INADEQUATE_SECURITY) => {
                Status::permission_denied("inadequate transport security")
            }
            _ => Status::internal(format!("transport error: {}", err)),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "Status {{ code: {}, message: \"{}\" }}", self.code, message),
            None => write!(f, "Status {{ code: {} }}", self.code),
        }
    }
}

impl std::error::Error for Status {}

impl From<Code> for Status {
    fn from(code: Code) -> Self {
        Self::with_code(code)
    }
}

impl From<h2::Error> for Status {
    fn from(err: h2::Error) -> Self {
        Status::from_h2_error(&err, Side::Client)
    }
}

fn percent_encode(message: &str) -> String {
    let mut encoded = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            encoded.push(byte as char);
        } else {
            // writing to a String cannot fail
            let _ = write!(encoded, "%{:02X}", byte);
        }
    }
    encoded
}

fn percent_decode(raw: &[u8]) -> String {
    fn hex(byte: u8) -> Option<u8> {
        (byte as char).to_digit(16).map(|d| d as u8)
    }

    let mut decoded = Vec::with_capacity(raw.len());
    let mut idx = 0;
    while idx < raw.len() {
        if raw[idx] == b'%'
            && idx + 2 < raw.len()
            && let (Some(hi), Some(lo)) = (hex(raw[idx + 1]), hex(raw[idx + 2]))
        {
            decoded.push(hi << 4 | lo);
            idx += 3;
            continue;
        }
        decoded.push(raw[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
