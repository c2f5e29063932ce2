// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use tracing::debug;

use super::OperatorContext;
use crate::error::GroupError;
use crate::topology::TaskConfiguration;

/// Root end of a broadcast.
pub struct BroadcastSender<T> {
    ctx: OperatorContext<T>,
}

impl<T: Clone + Send + Sync + 'static> BroadcastSender<T> {
    pub(crate) fn new(ctx: OperatorContext<T>) -> Self {
        Self { ctx }
    }

    /// Send `value` to every child, in children order. Each child relays it
    /// further down its own subtree.
    pub async fn send(&self, value: T) -> Result<(), GroupError> {
        debug!(operator = self.ctx.name(), children = self.ctx.children().len(), "Broadcasting");
        self.ctx.send_to_all(self.ctx.children(), value).await
    }

    pub fn operator_name(&self) -> &str {
        self.ctx.name()
    }

    pub fn topology(&self) -> &TaskConfiguration {
        self.ctx.topology()
    }
}

/// Non-root end of a broadcast.
pub struct BroadcastReceiver<T> {
    ctx: OperatorContext<T>,
}

impl<T: Clone + Send + Sync + 'static> BroadcastReceiver<T> {
    pub(crate) fn new(ctx: OperatorContext<T>) -> Self {
        Self { ctx }
    }

    /// Wait for the value from the parent. Chunks are relayed to this
    /// task's children as they arrive, so the whole subtree has been
    /// served by the time this returns.
    pub async fn receive(&self) -> Result<T, GroupError> {
        let parent = self.ctx.parent()?;
        self.ctx.receive_from(parent, self.ctx.children()).await
    }

    pub fn operator_name(&self) -> &str {
        self.ctx.name()
    }

    pub fn topology(&self) -> &TaskConfiguration {
        self.ctx.topology()
    }
}
