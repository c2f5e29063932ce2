// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group settings, loaded the same way as the runtime configuration:
//! code defaults, then `[group]` in the TOML files, then environment
//! variables prefixed with `CANOPY_GROUP_`.

use std::time::Duration;

use canopy_runtime::config::ConfigError;
use canopy_runtime::RuntimeConfig;
use figment::{
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

const DEFAULT_FAN_OUT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GroupConfig {
    /// Maximum children per tree node.
    #[validate(range(min = 1))]
    pub fan_out: usize,

    /// Upper bound on a single receive; unset waits forever.
    pub receive_timeout_ms: Option<u64>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            fan_out: DEFAULT_FAN_OUT,
            receive_timeout_ms: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Section {
    #[serde(default)]
    group: GroupConfig,
}

impl GroupConfig {
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }

    /// Figment with the runtime's file sources plus `CANOPY_GROUP_*`.
    pub fn figment() -> Figment {
        RuntimeConfig::figment()
            .join(Serialized::defaults(Section::default()))
            // CANOPY_GROUP_FAN_OUT, CANOPY_GROUP_RECEIVE_TIMEOUT_MS
            .merge(
                Env::prefixed("CANOPY_GROUP_")
                    .map(|k| format!("group.{}", k.as_str().to_lowercase()).into()),
            )
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let section: Section = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        section.group.validate()?;
        Ok(section.group)
    }
}
