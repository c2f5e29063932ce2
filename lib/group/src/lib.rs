// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Canopy Group
//!
//! Tree-structured collective operations over the canopy runtime.
//!
//! The driver places tasks into one fan-out tree per operator and hands
//! each task a [`GroupConfiguration`]. A task turns that bundle into a
//! [`CommunicationGroupClient`] and asks it for the broadcast, reduce or
//! scatter endpoint matching its role.
//!
//! ```no_run
//! # async fn run() -> Result<(), canopy_group::GroupError> {
//! use std::sync::Arc;
//! use canopy_group::{CommunicationGroupClient, CommunicationGroupDriver, GroupConfig};
//! use canopy_runtime::{InMemoryNameRegistry, TransportConfig};
//!
//! let mut driver = CommunicationGroupDriver::new("training", 2)?;
//! driver.add_broadcast("model", "root")?;
//! driver.add_task("root")?;
//! driver.add_task("worker-1")?;
//!
//! let naming = Arc::new(InMemoryNameRegistry::new());
//! let client = CommunicationGroupClient::listen(
//!     driver.task_configuration("root")?,
//!     TransportConfig::default(),
//!     naming,
//!     &GroupConfig::default(),
//! )
//! .await?;
//! client.broadcast_sender::<i64>("model")?.send(42).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod message;
pub mod operators;
pub mod pipeline;
pub mod topology;

pub use client::CommunicationGroupClient;
pub use config::GroupConfig;
pub use driver::{CommunicationGroupDriver, GroupConfiguration, OperatorConfiguration};
pub use error::GroupError;
pub use message::{ChunkHeader, GroupMessage};
pub use operators::{
    BroadcastReceiver, BroadcastSender, OperatorKind, OperatorSpec, PipelineSpec, ReduceFunction,
    ReduceFunctionKind, ReduceReceiver, ReduceSender, Reducible, ScatterReceiver, ScatterSender,
};
pub use pipeline::{GroupData, PipelineDataConverter, PipelineMessage};
pub use topology::{OperatorRole, TaskConfiguration, TopologyBuilder};
