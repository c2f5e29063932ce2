// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tree-structured collective operators.
//!
//! Every endpoint is bound to one operator and one task's place in that
//! operator's tree. Values are encoded with the operator's codec and split
//! by its pipeline converter before they leave the task.

mod broadcast;
mod reduce;
pub mod reduce_function;
mod scatter;
mod spec;

use std::sync::Arc;

use canopy_runtime::Codec;
use futures::future::try_join_all;
use tracing::trace;

pub use broadcast::{BroadcastReceiver, BroadcastSender};
pub use reduce::{ReduceReceiver, ReduceSender};
pub use reduce_function::{
    DoubleSum, IntegerSum, Max, Min, ReduceFunction, ReduceFunctionKind, Reducible, Sum, Summable,
};
pub use scatter::{split_contiguous, ScatterReceiver, ScatterSender};
pub use spec::{OperatorKind, OperatorSpec, PipelineSpec};

use crate::client::GroupChannel;
use crate::error::GroupError;
use crate::message::ChunkHeader;
use crate::pipeline::{ChunkAssembler, PipelineDataConverter, PipelineMessage};
use crate::topology::TaskConfiguration;

type Frame = (ChunkHeader, Vec<u8>);

/// Operator endpoint state shared by every operator kind.
pub(crate) struct OperatorContext<T> {
    name: String,
    topology: TaskConfiguration,
    channel: Arc<GroupChannel>,
    codec: Arc<dyn Codec<T>>,
    converter: Arc<dyn PipelineDataConverter<T>>,
}

impl<T: Send + Sync + 'static> OperatorContext<T> {
    pub(crate) fn new(
        name: String,
        topology: TaskConfiguration,
        channel: Arc<GroupChannel>,
        codec: Arc<dyn Codec<T>>,
        converter: Arc<dyn PipelineDataConverter<T>>,
    ) -> Self {
        Self {
            name,
            topology,
            channel,
            codec,
            converter,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn topology(&self) -> &TaskConfiguration {
        &self.topology
    }

    pub(crate) fn children(&self) -> &[String] {
        &self.topology.children
    }

    /// The parent task. Only the root lacks one, and the root never
    /// receives from above.
    pub(crate) fn parent(&self) -> Result<&str, GroupError> {
        self.topology
            .parent
            .as_deref()
            .ok_or_else(|| GroupError::NotReceiver {
                task: self.topology.task_id.clone(),
                operator: self.name.clone(),
            })
    }

    fn encode(&self, value: T) -> Result<Vec<Frame>, GroupError> {
        self.converter
            .to_pipeline(value)
            .into_iter()
            .map(|chunk| {
                let header = ChunkHeader {
                    index: chunk.index,
                    is_last: chunk.is_last,
                };
                Ok((header, self.codec.encode(&chunk.data)?.to_vec()))
            })
            .collect()
    }

    async fn send_frames(&self, destination: &str, frames: &[Frame]) -> Result<(), GroupError> {
        for (header, payload) in frames {
            self.channel
                .send(&self.name, destination, *header, payload.clone())
                .await?;
        }
        trace!(operator = %self.name, destination, chunks = frames.len(), "Sent value");
        Ok(())
    }

    pub(crate) async fn send_to(&self, destination: &str, value: T) -> Result<(), GroupError> {
        let frames = self.encode(value)?;
        self.send_frames(destination, &frames).await
    }

    /// Send the same value to each destination, encoding it once.
    pub(crate) async fn send_to_all(&self, destinations: &[String], value: T) -> Result<(), GroupError> {
        let frames = self.encode(value)?;
        for destination in destinations {
            self.send_frames(destination, &frames).await?;
        }
        Ok(())
    }

    /// Receive one complete value from `source`, forwarding each raw chunk
    /// to `forward_to` as soon as it arrives.
    pub(crate) async fn receive_from(
        &self,
        source: &str,
        forward_to: &[String],
    ) -> Result<T, GroupError> {
        let mut assembler = ChunkAssembler::new();
        let mut chunks = Vec::new();

        loop {
            let message = self.channel.receive(&self.name, source).await?;
            let done = assembler.accept(message.chunk.index, message.chunk.is_last)?;

            for child in forward_to {
                self.channel
                    .send(&self.name, child, message.chunk, message.payload.clone())
                    .await?;
            }

            let data = self.codec.decode(&message.payload)?;
            chunks.push(PipelineMessage::new(message.chunk.index, done, data));
            if done {
                break;
            }
        }

        trace!(operator = %self.name, source, chunks = chunks.len(), "Received value");
        self.converter.from_pipeline(chunks)
    }

    /// One value from every child, collected concurrently. Results are in
    /// children order.
    pub(crate) async fn gather_children(&self) -> Result<Vec<T>, GroupError> {
        try_join_all(
            self.topology
                .children
                .iter()
                .map(|child| self.receive_from(child, &[])),
        )
        .await
    }
}
