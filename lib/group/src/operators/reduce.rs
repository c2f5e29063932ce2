// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::debug;

use super::reduce_function::ReduceFunction;
use super::OperatorContext;
use crate::error::GroupError;
use crate::topology::TaskConfiguration;

/// Non-root end of a reduce.
///
/// Each sender folds its own value with its children's partial results and
/// passes one value up to its parent.
pub struct ReduceSender<T> {
    ctx: OperatorContext<T>,
    function: Arc<dyn ReduceFunction<T>>,
}

impl<T: Send + Sync + 'static> ReduceSender<T> {
    pub(crate) fn new(ctx: OperatorContext<T>, function: Arc<dyn ReduceFunction<T>>) -> Self {
        Self { ctx, function }
    }

    pub async fn send(&self, value: T) -> Result<(), GroupError> {
        let parent = self.ctx.parent()?.to_string();

        let mut values = Vec::with_capacity(self.ctx.children().len() + 1);
        values.push(value);
        values.extend(self.ctx.gather_children().await?);

        debug!(operator = self.ctx.name(), inputs = values.len(), %parent, "Sending partial reduction");
        let partial = self.function.reduce(values)?;
        self.ctx.send_to(&parent, partial).await
    }

    pub fn operator_name(&self) -> &str {
        self.ctx.name()
    }

    pub fn topology(&self) -> &TaskConfiguration {
        self.ctx.topology()
    }
}

/// Root end of a reduce. The root contributes no value of its own.
pub struct ReduceReceiver<T> {
    ctx: OperatorContext<T>,
    function: Arc<dyn ReduceFunction<T>>,
}

impl<T: Send + Sync + 'static> ReduceReceiver<T> {
    pub(crate) fn new(ctx: OperatorContext<T>, function: Arc<dyn ReduceFunction<T>>) -> Self {
        Self { ctx, function }
    }

    /// Wait for every child's partial result and fold them. A root without
    /// children fails with [`GroupError::EmptyReduction`].
    pub async fn reduce(&self) -> Result<T, GroupError> {
        let values = self.ctx.gather_children().await?;
        debug!(operator = self.ctx.name(), inputs = values.len(), "Reducing at root");
        self.function.reduce(values)
    }

    pub fn operator_name(&self) -> &str {
        self.ctx.name()
    }

    pub fn topology(&self) -> &TaskConfiguration {
        self.ctx.topology()
    }
}
