// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Task name service.
//!
//! Maps task identifiers to the [`RemoteAddress`] of the remote manager the
//! task listens on. The group layer treats the service as opaque.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::address::RemoteAddress;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamingError {
    #[error("task '{0}' is not registered with the name service")]
    Unresolved(String),
}

#[async_trait]
pub trait NameClient: Send + Sync {
    /// Publish `address` for `task_id`, replacing any earlier entry.
    async fn register(&self, task_id: &str, address: RemoteAddress) -> Result<(), NamingError>;

    /// Remove `task_id`. Removing an unknown task is not an error.
    async fn unregister(&self, task_id: &str) -> Result<(), NamingError>;

    async fn lookup(&self, task_id: &str) -> Result<RemoteAddress, NamingError>;

    /// Resolve several tasks at once; fails on the first unresolved id.
    async fn lookup_all(&self, task_ids: &[String]) -> Result<Vec<RemoteAddress>, NamingError> {
        let mut addresses = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            addresses.push(self.lookup(task_id).await?);
        }
        Ok(addresses)
    }
}

/// In-process name service shared between all clones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNameRegistry {
    entries: Arc<RwLock<HashMap<String, RemoteAddress>>>,
}

impl InMemoryNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl NameClient for InMemoryNameRegistry {
    async fn register(&self, task_id: &str, address: RemoteAddress) -> Result<(), NamingError> {
        if let Some(previous) = self.entries.write().insert(task_id.to_string(), address) {
            debug!(task_id, %previous, "Re-registered task at {}", address);
        } else {
            debug!(task_id, "Registered task at {}", address);
        }
        Ok(())
    }

    async fn unregister(&self, task_id: &str) -> Result<(), NamingError> {
        if self.entries.write().remove(task_id).is_some() {
            debug!(task_id, "Unregistered task");
        }
        Ok(())
    }

    async fn lookup(&self, task_id: &str) -> Result<RemoteAddress, NamingError> {
        self.entries
            .read()
            .get(task_id)
            .copied()
            .ok_or_else(|| NamingError::Unresolved(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> RemoteAddress {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = InMemoryNameRegistry::new();
        registry.register("task-a", addr(7001)).await.unwrap();

        assert_eq!(registry.lookup("task-a").await.unwrap(), addr(7001));

        registry.unregister("task-a").await.unwrap();
        assert_eq!(
            registry.lookup("task-a").await.unwrap_err(),
            NamingError::Unresolved("task-a".to_string())
        );

        // unregistering twice is harmless
        registry.unregister("task-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let registry = InMemoryNameRegistry::new();
        let other = registry.clone();

        registry.register("task-b", addr(7002)).await.unwrap();
        assert_eq!(other.lookup("task-b").await.unwrap(), addr(7002));

        other.register("task-b", addr(7003)).await.unwrap();
        assert_eq!(registry.lookup("task-b").await.unwrap(), addr(7003));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_all_fails_on_first_missing() {
        let registry = InMemoryNameRegistry::new();
        registry.register("a", addr(7010)).await.unwrap();
        registry.register("b", addr(7011)).await.unwrap();

        let found = registry
            .lookup_all(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(found, vec![addr(7010), addr(7011)]);

        let err = registry
            .lookup_all(&["a".to_string(), "zz".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err, NamingError::Unresolved("zz".to_string()));
    }
}
