// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Call metadata: the application-level headers and trailers of a call.

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Header names owned by the protocol layer. They never show up in
/// [`Metadata`] and cannot be overridden through it.
const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "te",
    "user-agent",
    "grpc-status",
    "grpc-message",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
    "grpc-status-details-bin",
];

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.contains(&name)
}

/// Key/value metadata attached to a call.
///
/// Keys are lower-case ASCII header names. Iteration order is the
/// lexicographic key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries
            .insert(key.into().to_ascii_lowercase(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another set of entries into this one. Entries of `other` win.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Collect the application entries of an HTTP/2 header block.
    ///
    /// Pseudo headers never reach a `HeaderMap`; protocol headers and
    /// values that are not valid UTF-8 are skipped.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut metadata = Metadata::new();
        for (name, value) in headers {
            if is_reserved(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                metadata
                    .entries
                    .insert(name.as_str().to_string(), value.to_string());
            }
        }
        metadata
    }

    /// Append every entry to an HTTP/2 header block.
    ///
    /// Entries whose name or value cannot be carried in HTTP/2 are dropped
    /// with a warning, as are attempts to set protocol headers.
    pub fn add_to_headers(&self, headers: &mut HeaderMap) {
        for (key, value) in &self.entries {
            if is_reserved(key) {
                warn!(%key, "ignoring reserved metadata key");
                continue;
            }

            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(%key, "dropping metadata entry not representable as a header"),
            }
        }
    }

    pub fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(self.entries.len());
        self.add_to_headers(&mut headers);
        headers
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}
