// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::num::NonZeroUsize;

use canopy_runtime::CodecKind;
use serde::{Deserialize, Serialize};

use super::reduce_function::ReduceFunctionKind;
use crate::topology::OperatorRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorKind {
    Broadcast,
    Reduce,
    Scatter,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorKind::Broadcast => write!(f, "broadcast"),
            OperatorKind::Reduce => write!(f, "reduce"),
            OperatorKind::Scatter => write!(f, "scatter"),
        }
    }
}

/// How an operator's values travel: whole, or as fixed-size chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PipelineSpec {
    #[default]
    Whole,
    Chunked { chunk_size: NonZeroUsize },
}

/// Static description of one named operator in a group.
///
/// The distinguished task (broadcast and scatter sender, reduce receiver)
/// becomes the root of the operator's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperatorSpec {
    Broadcast {
        sender_id: String,
        #[serde(default)]
        codec: CodecKind,
        #[serde(default)]
        pipeline: PipelineSpec,
    },
    Reduce {
        receiver_id: String,
        #[serde(default)]
        codec: CodecKind,
        reduce_function: ReduceFunctionKind,
        #[serde(default)]
        pipeline: PipelineSpec,
    },
    Scatter {
        sender_id: String,
        #[serde(default)]
        codec: CodecKind,
        #[serde(default)]
        pipeline: PipelineSpec,
    },
}

impl OperatorSpec {
    pub fn broadcast(sender_id: impl Into<String>) -> Self {
        OperatorSpec::Broadcast {
            sender_id: sender_id.into(),
            codec: CodecKind::default(),
            pipeline: PipelineSpec::default(),
        }
    }

    pub fn reduce(receiver_id: impl Into<String>, reduce_function: ReduceFunctionKind) -> Self {
        OperatorSpec::Reduce {
            receiver_id: receiver_id.into(),
            codec: CodecKind::default(),
            reduce_function,
            pipeline: PipelineSpec::default(),
        }
    }

    pub fn scatter(sender_id: impl Into<String>) -> Self {
        OperatorSpec::Scatter {
            sender_id: sender_id.into(),
            codec: CodecKind::default(),
            pipeline: PipelineSpec::default(),
        }
    }

    pub fn with_codec(mut self, kind: CodecKind) -> Self {
        match &mut self {
            OperatorSpec::Broadcast { codec, .. }
            | OperatorSpec::Reduce { codec, .. }
            | OperatorSpec::Scatter { codec, .. } => *codec = kind,
        }
        self
    }

    pub fn with_pipeline(mut self, spec: PipelineSpec) -> Self {
        match &mut self {
            OperatorSpec::Broadcast { pipeline, .. }
            | OperatorSpec::Reduce { pipeline, .. }
            | OperatorSpec::Scatter { pipeline, .. } => *pipeline = spec,
        }
        self
    }

    /// Shorthand for `with_pipeline(PipelineSpec::Chunked { .. })`.
    pub fn with_chunk_size(self, chunk_size: NonZeroUsize) -> Self {
        self.with_pipeline(PipelineSpec::Chunked { chunk_size })
    }

    pub fn kind(&self) -> OperatorKind {
        match self {
            OperatorSpec::Broadcast { .. } => OperatorKind::Broadcast,
            OperatorSpec::Reduce { .. } => OperatorKind::Reduce,
            OperatorSpec::Scatter { .. } => OperatorKind::Scatter,
        }
    }

    /// The distinguished task, placed at the root of the tree.
    pub fn root_task_id(&self) -> &str {
        match self {
            OperatorSpec::Broadcast { sender_id, .. } | OperatorSpec::Scatter { sender_id, .. } => {
                sender_id
            }
            OperatorSpec::Reduce { receiver_id, .. } => receiver_id,
        }
    }

    pub fn codec(&self) -> CodecKind {
        match self {
            OperatorSpec::Broadcast { codec, .. }
            | OperatorSpec::Reduce { codec, .. }
            | OperatorSpec::Scatter { codec, .. } => *codec,
        }
    }

    pub fn pipeline(&self) -> PipelineSpec {
        match self {
            OperatorSpec::Broadcast { pipeline, .. }
            | OperatorSpec::Reduce { pipeline, .. }
            | OperatorSpec::Scatter { pipeline, .. } => *pipeline,
        }
    }

    pub fn reduce_function(&self) -> Option<ReduceFunctionKind> {
        match self {
            OperatorSpec::Reduce {
                reduce_function, ..
            } => Some(*reduce_function),
            _ => None,
        }
    }

    /// Role of `task_id` in this operator. The root of a reduce receives;
    /// every other reduce task sends. Broadcast and scatter are the reverse.
    pub fn role_of(&self, task_id: &str) -> OperatorRole {
        let is_root = task_id == self.root_task_id();
        match (self.kind(), is_root) {
            (OperatorKind::Reduce, true) => OperatorRole::Receiver,
            (OperatorKind::Reduce, false) => OperatorRole::Sender,
            (_, true) => OperatorRole::Sender,
            (_, false) => OperatorRole::Receiver,
        }
    }
}
