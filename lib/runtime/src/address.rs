// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network identity of a [`RemoteManager`](crate::RemoteManager).

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Host and port of one remote manager.
///
/// Two managers are distinguishable only by this address, so it is used as the
/// key for connection caching and for source-bound observer dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteAddress(SocketAddr);

impl RemoteAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accepts `host:port` and `tcp://host:port`; host names are resolved and the
/// first address wins.
impl FromStr for RemoteAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s.trim().strip_prefix("tcp://").unwrap_or(s.trim());

        if let Ok(parsed) = addr.parse::<SocketAddr>() {
            return Ok(Self(parsed));
        }

        addr.to_socket_addrs()
            .with_context(|| format!("failed to parse remote address '{s}'"))?
            .next()
            .map(Self)
            .ok_or_else(|| anyhow::anyhow!("no addresses resolved for '{s}'"))
    }
}

impl TryFrom<String> for RemoteAddress {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RemoteAddress> for String {
    fn from(value: RemoteAddress) -> Self {
        value.to_string()
    }
}
