// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group communication errors.
//!
//! Topology and role errors are programming errors and are returned to the
//! caller as-is. Nothing in this crate retries; recovery is a re-placement
//! followed by a replayed round.

use canopy_runtime::config::ConfigError;
use canopy_runtime::{CodecError, NamingError, TransportError};

use crate::operators::OperatorKind;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("task '{0}' has already been added")]
    DuplicateTask(String),

    #[error("task '{0}' is not part of the topology")]
    UnknownTask(String),

    #[error("task '{0}' could not be resolved to an address")]
    UnresolvedTask(String),

    #[error("task '{task}' is not the root of operator '{operator}'")]
    NotRoot { task: String, operator: String },

    #[error("task '{task}' receives the result of operator '{operator}' and cannot send")]
    NotSender { task: String, operator: String },

    #[error("task '{task}' is the sender of operator '{operator}' and cannot receive")]
    NotReceiver { task: String, operator: String },

    #[error("cannot reduce an empty sequence")]
    EmptyReduction,

    #[error("reduction overflowed its value type")]
    ReductionOverflow,

    /// `expected: None` means the sequence was already complete;
    /// `actual: None` means it ended before its last chunk.
    #[error("chunk out of order: expected {expected:?}, got {actual:?}")]
    OutOfOrderChunk {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("fan-out must be at least 1, got {0}")]
    InvalidFanOut(usize),

    #[error("operator '{0}' is not defined in this group")]
    UnknownOperator(String),

    #[error("operator '{0}' is already defined in this group")]
    DuplicateOperator(String),

    #[error("operator '{operator}' is a {actual} operator, not {expected}")]
    WrongOperatorKind {
        operator: String,
        expected: OperatorKind,
        actual: OperatorKind,
    },

    #[error("task '{0}' has no listening address to publish")]
    NotListening(String),

    #[error("timed out waiting for '{operator}' data from task '{source_task}'")]
    Timeout {
        operator: String,
        source_task: String,
    },

    #[error("connection to '{0}' is closed")]
    ConnectionClosed(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] CodecError),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<TransportError> for GroupError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::ConnectionClosed(address) => {
                GroupError::ConnectionClosed(address.to_string())
            }
            TransportError::Serialization(e) => GroupError::Serialization(e),
            other => GroupError::Transport(other),
        }
    }
}

impl From<NamingError> for GroupError {
    fn from(error: NamingError) -> Self {
        match error {
            NamingError::Unresolved(task) => GroupError::UnresolvedTask(task),
        }
    }
}
