// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use tracing::{debug, warn};

use super::OperatorContext;
use crate::error::GroupError;
use crate::topology::TaskConfiguration;

/// Split `elements` into `parts` contiguous runs whose lengths differ by at
/// most one; the earlier runs take the remainder.
pub fn split_contiguous<E>(elements: Vec<E>, parts: usize) -> Vec<Vec<E>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = elements.len() / parts;
    let remainder = elements.len() % parts;

    let mut rest = elements.into_iter();
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < remainder);
            rest.by_ref().take(len).collect()
        })
        .collect()
}

/// Root end of a scatter.
///
/// The elements are cut into one contiguous share per child. A child keeps
/// the front of its share and passes the rest down its subtree.
pub struct ScatterSender<E> {
    ctx: OperatorContext<Vec<E>>,
}

impl<E: Send + Sync + 'static> ScatterSender<E> {
    pub(crate) fn new(ctx: OperatorContext<Vec<E>>) -> Self {
        Self { ctx }
    }

    pub async fn send(&self, elements: Vec<E>) -> Result<(), GroupError> {
        let children = self.ctx.children();
        if children.is_empty() {
            warn!(operator = self.ctx.name(), dropped = elements.len(), "Scatter root has no children");
            return Ok(());
        }

        debug!(operator = self.ctx.name(), elements = elements.len(), "Scattering");
        let shares = split_contiguous(elements, children.len());
        for (child, share) in children.iter().zip(shares) {
            self.ctx.send_to(child, share).await?;
        }
        Ok(())
    }

    pub fn operator_name(&self) -> &str {
        self.ctx.name()
    }

    pub fn topology(&self) -> &TaskConfiguration {
        self.ctx.topology()
    }
}

/// Non-root end of a scatter.
pub struct ScatterReceiver<E> {
    ctx: OperatorContext<Vec<E>>,
}

impl<E: Send + Sync + 'static> ScatterReceiver<E> {
    pub(crate) fn new(ctx: OperatorContext<Vec<E>>) -> Self {
        Self { ctx }
    }

    /// Receive this subtree's share, forward the children's portions and
    /// return the elements kept here.
    pub async fn receive(&self) -> Result<Vec<E>, GroupError> {
        let parent = self.ctx.parent()?;
        let share = self.ctx.receive_from(parent, &[]).await?;

        let children = self.ctx.children();
        let mut parts = split_contiguous(share, children.len() + 1).into_iter();
        let kept = parts.next().unwrap_or_default();
        for (child, part) in children.iter().zip(parts) {
            self.ctx.send_to(child, part).await?;
        }
        Ok(kept)
    }

    pub fn operator_name(&self) -> &str {
        self.ctx.name()
    }

    pub fn topology(&self) -> &TaskConfiguration {
        self.ctx.topology()
    }
}
