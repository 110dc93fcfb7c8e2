// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod configuration;

#[async_trait::async_trait]
pub trait Component {
    // Error type for component operations
    type Error: std::error::Error + Send + Sync + 'static;

    // Get name of the component
    fn identifier(&self) -> &str;

    // start the component
    async fn start(&mut self) -> Result<(), Self::Error>;

    // stop the component, draining in-flight work
    async fn shutdown(&mut self) -> Result<(), Self::Error>;
}
