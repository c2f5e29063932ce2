// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Driver side of a communication group.
//!
//! The driver owns one [`TopologyBuilder`] per named operator and keeps
//! them in step as tasks join, fail and get replaced. For each task it
//! emits a [`GroupConfiguration`]: the bundle a task needs to build its
//! [`CommunicationGroupClient`](crate::CommunicationGroupClient).

use std::collections::{BTreeMap, HashSet};

use canopy_runtime::CodecError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::GroupConfig;
use crate::error::GroupError;
use crate::operators::{OperatorKind, OperatorSpec};
use crate::topology::{TaskConfiguration, TopologyBuilder};

/// One operator as seen by one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfiguration {
    pub spec: OperatorSpec,
    pub topology: TaskConfiguration,
}

/// Everything a task needs to join a group.
///
/// `epoch` counts re-placements; bundles from one epoch only exchange
/// messages with bundles from the same or a later one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfiguration {
    pub group_name: String,
    pub task_id: String,
    #[serde(default)]
    pub epoch: u64,
    pub operators: BTreeMap<String, OperatorConfiguration>,
}

impl GroupConfiguration {
    pub fn operator(&self, name: &str) -> Result<&OperatorConfiguration, GroupError> {
        self.operators
            .get(name)
            .ok_or_else(|| GroupError::UnknownOperator(name.to_string()))
    }

    /// Every task this task exchanges messages with, across all operators.
    pub fn neighbors(&self) -> HashSet<&str> {
        self.operators
            .values()
            .flat_map(|op| {
                op.topology
                    .parent
                    .iter()
                    .chain(op.topology.children.iter())
                    .map(String::as_str)
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String, GroupError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()).into())
    }

    pub fn from_json(json: &str) -> Result<Self, GroupError> {
        serde_json::from_str(json).map_err(|e| CodecError::Decode(e.to_string()).into())
    }
}

#[derive(Debug, Clone)]
pub struct CommunicationGroupDriver {
    group_name: String,
    fan_out: usize,
    epoch: u64,
    members: Vec<String>,
    operators: BTreeMap<String, TopologyBuilder>,
}

impl CommunicationGroupDriver {
    pub fn new(group_name: impl Into<String>, fan_out: usize) -> Result<Self, GroupError> {
        if fan_out == 0 {
            return Err(GroupError::InvalidFanOut(fan_out));
        }
        Ok(Self {
            group_name: group_name.into(),
            fan_out,
            epoch: 0,
            members: Vec::new(),
            operators: BTreeMap::new(),
        })
    }

    pub fn from_config(group_name: impl Into<String>, config: &GroupConfig) -> Result<Self, GroupError> {
        Self::new(group_name, config.fan_out)
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Bumped by every replace or remove.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }

    pub fn topology(&self, operator: &str) -> Option<&TopologyBuilder> {
        self.operators.get(operator)
    }

    /// Define a named operator. Tasks already in the group are placed into
    /// its tree in their join order.
    pub fn add_operator(
        &mut self,
        name: impl Into<String>,
        spec: OperatorSpec,
    ) -> Result<&mut Self, GroupError> {
        let name = name.into();
        if self.operators.contains_key(&name) {
            return Err(GroupError::DuplicateOperator(name));
        }

        let mut topology = TopologyBuilder::new(name.clone(), spec, self.fan_out)?;
        for task_id in &self.members {
            topology.add_task(task_id)?;
        }

        info!(group = %self.group_name, operator = %name, kind = %topology.spec().kind(), "Added operator");
        self.operators.insert(name, topology);
        Ok(self)
    }

    pub fn add_broadcast(
        &mut self,
        name: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Result<&mut Self, GroupError> {
        self.add_operator(name, OperatorSpec::broadcast(sender_id))
    }

    pub fn add_scatter(
        &mut self,
        name: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Result<&mut Self, GroupError> {
        self.add_operator(name, OperatorSpec::scatter(sender_id))
    }

    pub fn add_task(&mut self, task_id: &str) -> Result<(), GroupError> {
        if self.members.iter().any(|m| m == task_id) {
            return Err(GroupError::DuplicateTask(task_id.to_string()));
        }
        for topology in self.operators.values_mut() {
            topology.add_task(task_id)?;
        }
        self.members.push(task_id.to_string());
        info!(group = %self.group_name, task_id, "Task joined");
        Ok(())
    }

    /// Swap a failed task for its replacement in every operator.
    pub fn replace_task(&mut self, failed: &str, replacement: &str) -> Result<(), GroupError> {
        if !self.members.iter().any(|m| m == failed) {
            return Err(GroupError::UnknownTask(failed.to_string()));
        }
        if self.members.iter().any(|m| m == replacement) {
            return Err(GroupError::DuplicateTask(replacement.to_string()));
        }
        for topology in self.operators.values_mut() {
            topology.replace_task(failed, replacement)?;
        }
        self.members.retain(|m| m != failed);
        self.members.push(replacement.to_string());
        self.epoch += 1;
        info!(group = %self.group_name, failed, replacement, epoch = self.epoch, "Task replaced");
        Ok(())
    }

    pub fn remove_task(&mut self, task_id: &str) -> Result<(), GroupError> {
        if !self.members.iter().any(|m| m == task_id) {
            return Err(GroupError::UnknownTask(task_id.to_string()));
        }
        for topology in self.operators.values_mut() {
            topology.remove_task(task_id)?;
        }
        self.members.retain(|m| m != task_id);
        self.epoch += 1;
        info!(group = %self.group_name, task_id, epoch = self.epoch, "Task removed");
        Ok(())
    }

    /// Build the configuration bundle for `task_id`.
    ///
    /// Fails with [`GroupError::UnknownTask`] for a non-member, and for a
    /// member still waiting on some operator's root.
    pub fn task_configuration(&self, task_id: &str) -> Result<GroupConfiguration, GroupError> {
        if !self.members.iter().any(|m| m == task_id) {
            return Err(GroupError::UnknownTask(task_id.to_string()));
        }

        let operators = self
            .operators
            .iter()
            .map(|(name, topology)| {
                Ok((
                    name.clone(),
                    OperatorConfiguration {
                        spec: topology.spec().clone(),
                        topology: topology.task_configuration(task_id)?,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>, GroupError>>()?;

        Ok(GroupConfiguration {
            group_name: self.group_name.clone(),
            task_id: task_id.to_string(),
            epoch: self.epoch,
            operators,
        })
    }

    /// Operators whose root has not joined yet.
    pub fn waiting_operators(&self) -> Vec<(&str, OperatorKind)> {
        self.operators
            .iter()
            .filter(|(_, topology)| !topology.is_placed(topology.root_task_id()))
            .map(|(name, topology)| (name.as_str(), topology.spec().kind()))
            .collect()
    }
}
