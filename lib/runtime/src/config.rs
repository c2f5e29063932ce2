// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/canopy/etc/canopy.toml`
//! 3. TOML file from the `CANOPY_CONFIG_PATH` environment variable
//! 4. Environment variables prefixed with `CANOPY_TRANSPORT_`
//!
//! ```toml
//! [transport]
//! host = "10.0.0.4"
//! port = 0
//! max_frame_size = 16777216
//! ```

use std::time::Duration;

use derive_builder::Builder;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

/// ENV used to point at an optional TOML configuration file
const CONFIG_PATH_ENV: &str = "CANOPY_CONFIG_PATH";

/// System-wide configuration file
const SYSTEM_CONFIG_PATH: &str = "/opt/canopy/etc/canopy.toml";

/// Maximum frame size (16 MB)
const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Settings for the TCP links owned by a remote manager.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Builder)]
#[builder(default, setter(into))]
#[serde(default)]
pub struct TransportConfig {
    /// Interface the listener binds and advertises.
    #[validate(length(min = 1))]
    pub host: String,

    /// Listener port; 0 picks an ephemeral port.
    pub port: u16,

    /// Largest frame accepted or sent on a link, in bytes.
    #[validate(range(min = 64))]
    pub max_frame_size: usize,

    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Disable Nagle's algorithm on every link.
    pub nodelay: bool,

    /// TCP keepalive probe time; 0 disables keepalive.
    pub keepalive_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_ms: 5_000,
            nodelay: true,
            keepalive_secs: 60,
        }
    }
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RuntimeConfig {
    #[validate(nested)]
    #[serde(default)]
    pub transport: TransportConfig,
}

impl RuntimeConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // CANOPY_TRANSPORT_HOST, CANOPY_TRANSPORT_PORT, ...
            .merge(
                Env::prefixed("CANOPY_TRANSPORT_")
                    .map(|k| format!("transport.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from the default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}
