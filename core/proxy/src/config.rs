// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0
//
// ConfigLoader parses the configuration file once and exposes cached
// accessors for the tracing, runtime and proxy sections. Only the proxy
// section is mandatory, and it is validated when requested.

use std::collections::HashSet;

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::runtime::RuntimeConfiguration;
use crate::service::ProxyConfig;
use slim_config::component::configuration::Configuration;
use slim_config::grpc::errors::ConfigError;
use slim_tracing::TracingConfiguration;

#[derive(Error, Debug)]
pub enum ProxyError {
    // File / I/O
    #[error("not found: {0}")]
    NotFound(String),

    // Parsing / structural validity
    #[error("invalid configuration - impossible to parse yaml")]
    InvalidYaml,
    #[error("invalid configuration - key {0} not valid")]
    InvalidKey(String),
    #[error("invalid configuration - {0}")]
    Invalid(String),
    #[error("yaml parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("invalid configuration - missing proxy")]
    MissingProxy,
    #[error("{0}")]
    Config(#[from] ConfigError),

    // Runtime / lifecycle
    #[error("failed to build runtime: {0}")]
    Runtime(std::io::Error),
    #[error("proxy already started")]
    AlreadyStarted,
    #[error("proxy not started")]
    NotStarted,
}

lazy_static! {
    static ref CONFIG_KEYS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("tracing");
        s.insert("runtime");
        s.insert("proxy");
        s
    };
}

pub struct ConfigLoader {
    root: Value,
    tracing: Option<TracingConfiguration>,
    runtime: Option<RuntimeConfiguration>,
    proxy: Option<ProxyConfig>,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root_keys = self
            .root
            .as_mapping()
            .map(|m| {
                m.keys()
                    .filter_map(|k| k.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();

        f.debug_struct("ConfigLoader")
            .field("root_keys", &root_keys)
            .field("tracing_loaded", &self.tracing.is_some())
            .field("runtime_loaded", &self.runtime.is_some())
            .field("proxy_loaded", &self.proxy.is_some())
            .finish()
    }
}

/// Deserialize an optional section, falling back to its default.
fn section_or_default<T>(root: &Value, key: &str) -> T
where
    T: DeserializeOwned + Default + std::fmt::Debug,
{
    let cfg = match root.get(key).cloned() {
        Some(value) => serde_yaml::from_value(value).unwrap_or_else(|e| {
            warn!(error = %e, section = %key, "invalid section, falling back to default");
            T::default()
        }),
        None => T::default(),
    };
    debug!(?cfg, section = %key, "configuration loaded");
    cfg
}

impl ConfigLoader {
    pub fn new(file_path: &str) -> Result<Self, ProxyError> {
        let config_str = std::fs::read_to_string(file_path)
            .map_err(|e| ProxyError::NotFound(format!("{}: {}", file_path, e)))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ProxyError> {
        let root: Value = serde_yaml::from_str(config_str).map_err(|_| ProxyError::InvalidYaml)?;

        // an empty document is an empty configuration
        let root = match root {
            Value::Null => Value::Mapping(Mapping::new()),
            other => other,
        };

        let mapping = root.as_mapping().ok_or(ProxyError::InvalidYaml)?;
        for key in mapping.keys() {
            let k = key.as_str().ok_or(ProxyError::InvalidYaml)?;
            if !CONFIG_KEYS.contains(k) {
                return Err(ProxyError::InvalidKey(k.to_string()));
            }
        }

        Ok(Self {
            root,
            tracing: None,
            runtime: None,
            proxy: None,
        })
    }

    pub fn tracing(&mut self) -> &TracingConfiguration {
        let root = &self.root;
        self.tracing
            .get_or_insert_with(|| section_or_default(root, "tracing"))
    }

    pub fn runtime(&mut self) -> &RuntimeConfiguration {
        let root = &self.root;
        self.runtime
            .get_or_insert_with(|| section_or_default(root, "runtime"))
    }

    /// The validated proxy section.
    pub fn proxy(&mut self) -> Result<&ProxyConfig, ProxyError> {
        let proxy = match self.proxy.take() {
            Some(proxy) => proxy,
            None => {
                let value = self.root.get("proxy").cloned().ok_or(ProxyError::MissingProxy)?;
                let proxy: ProxyConfig = serde_yaml::from_value(value)?;
                proxy.validate()?;
                debug!(?proxy, "proxy configuration loaded");
                proxy
            }
        };

        Ok(self.proxy.insert(proxy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn testdata(file: &str) -> String {
        format!("{}/testdata/{}", env!("CARGO_MANIFEST_DIR"), file)
    }

    #[test]
    fn test_load_full_config() {
        let mut loader = ConfigLoader::new(&testdata("config.yaml")).unwrap();

        assert_eq!(loader.tracing().log_level(), "debug");
        assert_eq!(loader.runtime().n_cores(), 1);
        assert_eq!(loader.runtime().drain_timeout(), Duration::from_secs(5));

        let proxy = loader.proxy().unwrap();
        assert_eq!(proxy.server.endpoint, "127.0.0.1:0");
        assert_eq!(proxy.upstream.endpoint, "http://127.0.0.1:50051");
        assert_eq!(proxy.upstream.connect_timeout, Duration::from_secs(2));

        // cached
        assert!(loader.proxy().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new(&testdata("does-not-exist.yaml")).unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[test]
    fn test_invalid_key() {
        let err = ConfigLoader::new(&testdata("config-invalid-key.yaml")).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidKey(k) if k == "services"));
    }

    #[test]
    fn test_missing_proxy_section() {
        let mut loader = ConfigLoader::new(&testdata("config-no-proxy.yaml")).unwrap();

        // the optional sections still load
        assert_eq!(loader.tracing().log_level(), "warn");
        assert_eq!(loader.runtime(), &RuntimeConfiguration::default());

        assert!(matches!(loader.proxy(), Err(ProxyError::MissingProxy)));
    }

    #[test]
    fn test_invalid_sections() {
        // a broken optional section falls back to its default
        let mut loader = ConfigLoader::from_yaml("runtime:\n  n_cores: many\n").unwrap();
        assert_eq!(loader.runtime(), &RuntimeConfiguration::default());

        // a proxy without upstream endpoint is rejected
        let mut loader = ConfigLoader::from_yaml(
            "proxy:\n  server:\n    endpoint: 127.0.0.1:0\n  upstream:\n    endpoint: \"\"\n",
        )
        .unwrap();
        assert!(matches!(
            loader.proxy(),
            Err(ProxyError::Config(ConfigError::MissingEndpoint))
        ));

        assert!(matches!(
            ConfigLoader::from_yaml("- a\n- b\n"),
            Err(ProxyError::InvalidYaml)
        ));
    }

    #[test]
    fn test_empty_document() {
        let mut loader = ConfigLoader::from_yaml("").unwrap();
        assert_eq!(loader.tracing(), &TracingConfiguration::default());
        assert!(matches!(loader.proxy(), Err(ProxyError::MissingProxy)));
    }
}
