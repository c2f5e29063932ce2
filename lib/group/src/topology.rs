// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fan-out tree placement for one operator.
//!
//! Tasks are placed breadth-first: each new task becomes a child of the
//! earliest-placed node that still has fewer than `fan_out` children. The
//! operator's distinguished task is always the root. Tasks that join before
//! the root are parked and placed, in join order, once the root arrives.
//!
//! Removing or replacing a task rebuilds the tree by replaying the join
//! order, so all survivors end up in a valid tree again.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::GroupError;
use crate::operators::OperatorSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorRole {
    Sender,
    Receiver,
}

/// One task's view of an operator tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfiguration {
    pub task_id: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub role: OperatorRole,
}

impl TaskConfiguration {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone)]
struct TaskNode {
    parent: Option<String>,
    children: Vec<String>,
    depth: usize,
}

#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    operator_name: String,
    spec: OperatorSpec,
    fan_out: usize,

    /// Every member in join order, placed or parked.
    members: Vec<String>,
    known: HashSet<String>,

    nodes: HashMap<String, TaskNode>,
    /// Placed tasks in placement order; the root is first.
    placement: Vec<String>,
    /// Index into `placement` of the earliest node that may still take a child.
    frontier: usize,
}

impl TopologyBuilder {
    pub fn new(
        operator_name: impl Into<String>,
        spec: OperatorSpec,
        fan_out: usize,
    ) -> Result<Self, GroupError> {
        if fan_out == 0 {
            return Err(GroupError::InvalidFanOut(fan_out));
        }
        Ok(Self {
            operator_name: operator_name.into(),
            spec,
            fan_out,
            members: Vec::new(),
            known: HashSet::new(),
            nodes: HashMap::new(),
            placement: Vec::new(),
            frontier: 0,
        })
    }

    pub fn operator_name(&self) -> &str {
        &self.operator_name
    }

    pub fn spec(&self) -> &OperatorSpec {
        &self.spec
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    pub fn root_task_id(&self) -> &str {
        self.spec.root_task_id()
    }

    pub fn add_task(&mut self, task_id: &str) -> Result<(), GroupError> {
        if !self.known.insert(task_id.to_string()) {
            return Err(GroupError::DuplicateTask(task_id.to_string()));
        }
        self.members.push(task_id.to_string());
        self.place(task_id);
        Ok(())
    }

    /// Replace `failed` with `replacement`, which joins after every
    /// surviving member.
    pub fn replace_task(&mut self, failed: &str, replacement: &str) -> Result<(), GroupError> {
        if !self.known.contains(failed) {
            return Err(GroupError::UnknownTask(failed.to_string()));
        }
        if self.known.contains(replacement) {
            return Err(GroupError::DuplicateTask(replacement.to_string()));
        }

        let mut order: Vec<String> = self
            .members
            .iter()
            .filter(|id| id.as_str() != failed)
            .cloned()
            .collect();
        order.push(replacement.to_string());

        debug!(
            operator = %self.operator_name,
            failed,
            replacement,
            "Replacing task and rebuilding topology"
        );
        self.rebuild(order)
    }

    /// Remove `task_id` and re-place the survivors.
    pub fn remove_task(&mut self, task_id: &str) -> Result<(), GroupError> {
        if !self.known.contains(task_id) {
            return Err(GroupError::UnknownTask(task_id.to_string()));
        }
        let order: Vec<String> = self
            .members
            .iter()
            .filter(|id| id.as_str() != task_id)
            .cloned()
            .collect();

        debug!(operator = %self.operator_name, task_id, "Removing task and rebuilding topology");
        self.rebuild(order)
    }

    pub fn task_configuration(&self, task_id: &str) -> Result<TaskConfiguration, GroupError> {
        let node = self
            .nodes
            .get(task_id)
            .ok_or_else(|| GroupError::UnknownTask(task_id.to_string()))?;

        Ok(TaskConfiguration {
            task_id: task_id.to_string(),
            parent: node.parent.clone(),
            children: node.children.clone(),
            role: self.spec.role_of(task_id),
        })
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.known.contains(task_id)
    }

    pub fn is_placed(&self, task_id: &str) -> bool {
        self.nodes.contains_key(task_id)
    }

    /// Members in join order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Placed tasks in placement order.
    pub fn placed(&self) -> &[String] {
        &self.placement
    }

    /// Members waiting for the root to join.
    pub fn parked(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|id| !self.nodes.contains_key(id.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn parent_of(&self, task_id: &str) -> Option<&str> {
        self.nodes.get(task_id)?.parent.as_deref()
    }

    pub fn children_of(&self, task_id: &str) -> &[String] {
        self.nodes
            .get(task_id)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Height of the placed tree: 0 for a lone root, `None` before the root
    /// has joined.
    pub fn depth(&self) -> Option<usize> {
        if !self.nodes.contains_key(self.root_task_id()) {
            return None;
        }
        self.nodes.values().map(|node| node.depth).max()
    }

    fn place(&mut self, task_id: &str) {
        let root = self.spec.root_task_id().to_string();

        if task_id == root {
            self.nodes.insert(
                root.clone(),
                TaskNode {
                    parent: None,
                    children: Vec::new(),
                    depth: 0,
                },
            );
            self.placement.push(root.clone());
            trace!(operator = %self.operator_name, task_id, "Placed root");

            let parked: Vec<String> = self
                .members
                .iter()
                .filter(|id| **id != root)
                .cloned()
                .collect();
            for id in parked {
                self.place_child(&id);
            }
        } else if self.nodes.contains_key(&root) {
            self.place_child(task_id);
        } else {
            trace!(operator = %self.operator_name, task_id, "Parked until root joins");
        }
    }

    fn place_child(&mut self, task_id: &str) {
        while let Some(candidate) = self.placement.get(self.frontier) {
            let slot = self
                .nodes
                .get(candidate)
                .filter(|node| node.children.len() < self.fan_out)
                .map(|node| node.depth + 1);

            if let Some(depth) = slot {
                let parent = candidate.clone();
                if let Some(node) = self.nodes.get_mut(&parent) {
                    node.children.push(task_id.to_string());
                }
                self.nodes.insert(
                    task_id.to_string(),
                    TaskNode {
                        parent: Some(parent.clone()),
                        children: Vec::new(),
                        depth,
                    },
                );
                self.placement.push(task_id.to_string());
                trace!(operator = %self.operator_name, task_id, %parent, depth, "Placed task");
                return;
            }
            self.frontier += 1;
        }
    }

    fn rebuild(&mut self, order: Vec<String>) -> Result<(), GroupError> {
        self.members.clear();
        self.known.clear();
        self.nodes.clear();
        self.placement.clear();
        self.frontier = 0;

        for task_id in order {
            self.add_task(&task_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::ReduceFunctionKind;
    use rstest::rstest;

    fn broadcast(fan_out: usize) -> TopologyBuilder {
        TopologyBuilder::new("bcast", OperatorSpec::broadcast("R"), fan_out).unwrap()
    }

    fn with_tasks(fan_out: usize, tasks: &[&str]) -> TopologyBuilder {
        let mut topology = broadcast(fan_out);
        for task in tasks {
            topology.add_task(task).unwrap();
        }
        topology
    }

    fn names(count: usize) -> Vec<String> {
        std::iter::once("R".to_string())
            .chain((1..count).map(|i| format!("t{i}")))
            .collect()
    }

    /// Smallest h with 1 + F + ... + F^h >= n.
    fn expected_depth(n: usize, fan_out: usize) -> usize {
        let mut capacity = 1;
        let mut level = 1;
        let mut h = 0;
        while capacity < n {
            level *= fan_out;
            capacity += level;
            h += 1;
        }
        h
    }

    /// Walk up from `task_id`; returns false on a cycle or dangling parent.
    fn reaches_root(topology: &TopologyBuilder, task_id: &str) -> bool {
        let mut current = task_id;
        for _ in 0..=topology.len() {
            match topology.parent_of(current) {
                None => return current == topology.root_task_id(),
                Some(parent) => current = parent,
            }
        }
        false
    }

    #[test]
    fn test_zero_fan_out_is_rejected() {
        assert!(matches!(
            TopologyBuilder::new("op", OperatorSpec::broadcast("R"), 0),
            Err(GroupError::InvalidFanOut(0))
        ));
    }

    #[test]
    fn test_single_root() {
        let topology = with_tasks(3, &["R"]);
        let config = topology.task_configuration("R").unwrap();
        assert!(config.is_root());
        assert!(config.is_leaf());
        assert_eq!(config.role, OperatorRole::Sender);
        assert_eq!(topology.depth(), Some(0));
    }

    #[test]
    fn test_four_tasks_fan_out_three() {
        let topology = with_tasks(3, &["R", "A", "B", "C"]);

        assert_eq!(topology.children_of("R"), ["A", "B", "C"]);
        for child in ["A", "B", "C"] {
            let config = topology.task_configuration(child).unwrap();
            assert_eq!(config.parent.as_deref(), Some("R"));
            assert!(config.is_leaf());
            assert_eq!(config.role, OperatorRole::Receiver);
        }
        assert_eq!(topology.depth(), Some(1));
    }

    #[test]
    fn test_breadth_first_placement() {
        let topology = with_tasks(2, &["R", "a", "b", "c", "d", "e"]);

        assert_eq!(topology.children_of("R"), ["a", "b"]);
        assert_eq!(topology.children_of("a"), ["c", "d"]);
        assert_eq!(topology.children_of("b"), ["e"]);
        assert_eq!(topology.depth(), Some(2));
    }

    #[test]
    fn test_late_root() {
        let mut topology = broadcast(2);
        for task in ["child1", "child2", "child3"] {
            topology.add_task(task).unwrap();
        }
        assert_eq!(topology.parked(), ["child1", "child2", "child3"]);
        assert_eq!(topology.depth(), None);
        assert!(matches!(
            topology.task_configuration("child1"),
            Err(GroupError::UnknownTask(_))
        ));

        topology.add_task("R").unwrap();

        assert!(topology.parked().is_empty());
        assert_eq!(topology.children_of("R"), ["child1", "child2"]);
        assert_eq!(topology.children_of("child1"), ["child3"]);
        assert_eq!(topology.parent_of("child3"), Some("child1"));
    }

    #[test]
    fn test_duplicate_task() {
        let mut topology = with_tasks(2, &["R", "A"]);
        assert!(matches!(
            topology.add_task("A"),
            Err(GroupError::DuplicateTask(t)) if t == "A"
        ));
        assert_eq!(topology.len(), 2);
    }

    #[test]
    fn test_unknown_task() {
        let mut topology = with_tasks(2, &["R"]);
        assert!(matches!(
            topology.task_configuration("ghost"),
            Err(GroupError::UnknownTask(_))
        ));
        assert!(matches!(
            topology.remove_task("ghost"),
            Err(GroupError::UnknownTask(_))
        ));
        assert!(matches!(
            topology.replace_task("ghost", "D"),
            Err(GroupError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_replace_leaf() {
        let mut topology = with_tasks(3, &["R", "A", "B", "C"]);
        topology.replace_task("B", "D").unwrap();

        assert_eq!(topology.children_of("R"), ["A", "C", "D"]);
        assert!(!topology.contains("B"));
        assert_eq!(topology.parent_of("D"), Some("R"));
        assert_eq!(topology.members(), ["R", "A", "C", "D"]);
    }

    #[test]
    fn test_replace_with_existing_member_fails() {
        let mut topology = with_tasks(3, &["R", "A", "B"]);
        assert!(matches!(
            topology.replace_task("B", "A"),
            Err(GroupError::DuplicateTask(t)) if t == "A"
        ));
        assert_eq!(topology.members(), ["R", "A", "B"]);
    }

    #[test]
    fn test_replace_interior_node_keeps_descendants_connected() {
        let mut topology = with_tasks(2, &["R", "a", "b", "c", "d", "e"]);
        topology.replace_task("a", "x").unwrap();

        for task in ["b", "c", "d", "e", "x"] {
            assert!(reaches_root(&topology, task), "{task} is detached");
        }
        assert_eq!(topology.children_of("R"), ["b", "c"]);
        assert_eq!(topology.depth(), Some(2));
    }

    #[test]
    fn test_removing_root_parks_everyone() {
        let mut topology = with_tasks(2, &["R", "a", "b", "c"]);
        topology.remove_task("R").unwrap();

        assert_eq!(topology.parked(), ["a", "b", "c"]);
        assert!(topology.placed().is_empty());

        // placing the root again makes one connected tree
        topology.add_task("R").unwrap();
        for task in ["a", "b", "c"] {
            assert!(reaches_root(&topology, task));
        }
    }

    #[rstest]
    #[case(2, 7)]
    #[case(3, 10)]
    #[case(4, 4)]
    fn test_cutting_root_leaves_one_component_per_child(
        #[case] fan_out: usize,
        #[case] count: usize,
    ) {
        let ids = names(count);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let topology = with_tasks(fan_out, &refs);

        // every non-root task hangs under exactly one of the root's children
        let tops: Vec<&str> = ids[1..]
            .iter()
            .map(|id| {
                let mut current = id.as_str();
                while let Some(parent) = topology.parent_of(current) {
                    if parent == "R" {
                        break;
                    }
                    current = parent;
                }
                current
            })
            .collect();

        let components: HashSet<&str> = tops.into_iter().collect();
        assert_eq!(components.len(), topology.children_of("R").len());
    }

    #[test]
    fn test_reduce_root_receives() {
        let spec = OperatorSpec::reduce("R", ReduceFunctionKind::Sum);
        let mut topology = TopologyBuilder::new("sum", spec, 2).unwrap();
        topology.add_task("A").unwrap();
        topology.add_task("R").unwrap();

        assert_eq!(
            topology.task_configuration("R").unwrap().role,
            OperatorRole::Receiver
        );
        assert_eq!(
            topology.task_configuration("A").unwrap().role,
            OperatorRole::Sender
        );
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 1)]
    #[case(2, 7)]
    #[case(2, 8)]
    #[case(3, 13)]
    #[case(3, 14)]
    #[case(4, 30)]
    #[case(1, 6)]
    fn test_shape_properties(#[case] fan_out: usize, #[case] count: usize) {
        let ids = names(count);
        let mut topology = broadcast(fan_out);
        // root joins in the middle to exercise parking
        let (before, after) = ids.split_at(count / 2);
        for id in after.iter().chain(before.iter()).filter(|id| *id != "R") {
            topology.add_task(id).unwrap();
        }
        topology.add_task("R").unwrap();

        assert_eq!(topology.placed().len(), count);
        assert_eq!(topology.depth(), Some(expected_depth(count, fan_out)));

        let mut roots = 0;
        for id in &ids {
            let config = topology.task_configuration(id).unwrap();
            assert!(config.children.len() <= fan_out);
            assert!(reaches_root(&topology, id));
            if config.is_root() {
                roots += 1;
            }
            for child in &config.children {
                assert_eq!(topology.parent_of(child), Some(id.as_str()));
            }
        }
        assert_eq!(roots, 1);
    }
}
