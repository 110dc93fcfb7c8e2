// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Standalone gRPC pass-through proxy: a server whose catch-all handler
//! relays every call to a single upstream.

pub mod args;
pub mod build_info;
pub mod config;
pub mod runner;
pub mod runtime;
pub mod service;
pub mod signal;
