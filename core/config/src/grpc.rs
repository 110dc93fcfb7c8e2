// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod errors;
pub mod server;

mod duration;

/// Default upper bound for a single decoded gRPC message (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default number of messages that may be queued in front of a stream's
/// flow-control window before writers see backpressure.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 32;

/// Largest value HTTP/2 accepts for a flow-control window.
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Strip an optional `http://` scheme from an endpoint string.
pub(crate) fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .strip_prefix("http://")
        .unwrap_or(endpoint)
        .trim_end_matches('/')
}
