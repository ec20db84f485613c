// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
	error::{EngineError, EngineErrorKind, EngineResult},
	ids::StageId,
	provider::AgentKind,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OnFailure {
	Abort,
	Skip,
	ContinueWithNull,
}

impl Default for OnFailure {
	/// Per DESIGN.md: a stage that doesn't declare an `onFailure` policy
	/// defaults to ABORT.
	fn default() -> Self {
		OnFailure::Abort
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageNode {
	pub stage_id: StageId,
	pub agent_kind: AgentKind,
	pub dependencies: HashSet<StageId>,
	pub parallel_group: Option<String>,
	#[serde(default)]
	pub on_failure: OnFailure,
}

impl StageNode {
	pub fn new(stage_id: StageId, agent_kind: AgentKind) -> Self {
		Self {
			stage_id,
			agent_kind,
			dependencies: HashSet::new(),
			parallel_group: None,
			on_failure: OnFailure::default(),
		}
	}

	pub fn depends_on(mut self, stage_id: StageId) -> Self {
		self.dependencies.insert(stage_id);
		self
	}

	pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
		self.on_failure = on_failure;
		self
	}

	pub fn in_parallel_group(mut self, group: impl Into<String>) -> Self {
		self.parallel_group = Some(group.into());
		self
	}
}

/// A directed acyclic graph of [`StageNode`]s. Construction validates
/// acyclicity, full dependency closure, a single unique source stage, and
/// unique stage ids.
#[derive(Clone, Debug)]
pub struct StageGraph {
	nodes: HashMap<StageId, StageNode>,
	order: Vec<StageId>,
}

impl StageGraph {
	pub fn build(nodes: Vec<StageNode>) -> EngineResult<Self> {
		let mut by_id = HashMap::new();
		for node in nodes {
			if by_id.insert(node.stage_id, node).is_some() {
				return Err(invalid("duplicate stage id in StageGraph"));
			}
		}
		for node in by_id.values() {
			for dep in &node.dependencies {
				if !by_id.contains_key(dep) {
					return Err(invalid(format!(
						"stage {} depends on unknown stage {}",
						node.stage_id, dep
					)));
				}
			}
		}
		let order = topological_order(&by_id)?;
		let roots: Vec<&StageId> = by_id
			.values()
			.filter(|n| n.dependencies.is_empty())
			.map(|n| &n.stage_id)
			.collect();
		if roots.len() != 1 {
			return Err(invalid(format!(
				"StageGraph must have exactly one source stage, found {}",
				roots.len()
			)));
		}
		Ok(Self { nodes: by_id, order })
	}

	pub fn node(&self, stage_id: StageId) -> Option<&StageNode> {
		self.nodes.get(&stage_id)
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn all_stage_ids(&self) -> impl Iterator<Item = &StageId> {
		self.order.iter()
	}

	/// Stages with no dependencies.
	pub fn roots(&self) -> Vec<StageId> {
		self.nodes.values().filter(|n| n.dependencies.is_empty()).map(|n| n.stage_id).collect()
	}

	/// Stages whose dependencies are all in `done` and which are themselves
	/// neither in `done` nor in `in_flight`.
	pub fn unblocked(&self, done: &HashSet<StageId>, in_flight: &HashSet<StageId>) -> Vec<StageId> {
		self.nodes
			.values()
			.filter(|n| {
				!done.contains(&n.stage_id)
					&& !in_flight.contains(&n.stage_id)
					&& n.dependencies.iter().all(|dep| done.contains(dep))
			})
			.map(|n| n.stage_id)
			.collect()
	}

	/// Transitive successors of `stage_id`, used to skip on ABORT/SKIP.
	pub fn descendants(&self, stage_id: StageId) -> HashSet<StageId> {
		let mut children: HashMap<StageId, Vec<StageId>> = HashMap::new();
		for node in self.nodes.values() {
			for dep in &node.dependencies {
				children.entry(*dep).or_default().push(node.stage_id);
			}
		}
		let mut out = HashSet::new();
		let mut stack = vec![stage_id];
		while let Some(current) = stack.pop() {
			if let Some(next) = children.get(&current) {
				for &child in next {
					if out.insert(child) {
						stack.push(child);
					}
				}
			}
		}
		out
	}
}

fn invalid(msg: impl std::fmt::Display) -> EngineError {
	EngineError::from_msg(EngineErrorKind::InvalidInput, msg)
}

fn topological_order(nodes: &HashMap<StageId, StageNode>) -> EngineResult<Vec<StageId>> {
	let mut in_degree: HashMap<StageId, usize> =
		nodes.keys().map(|id| (*id, 0usize)).collect();
	for node in nodes.values() {
		*in_degree.get_mut(&node.stage_id).unwrap() = node.dependencies.len();
	}
	let mut children: HashMap<StageId, Vec<StageId>> = HashMap::new();
	for node in nodes.values() {
		for dep in &node.dependencies {
			children.entry(*dep).or_default().push(node.stage_id);
		}
	}
	let mut queue: Vec<StageId> =
		in_degree.iter().filter(|(_, &deg)| deg == 0).map(|(id, _)| *id).collect();
	let mut order = Vec::with_capacity(nodes.len());
	while let Some(id) = queue.pop() {
		order.push(id);
		if let Some(next) = children.get(&id) {
			for &child in next {
				let deg = in_degree.get_mut(&child).unwrap();
				*deg -= 1;
				if *deg == 0 {
					queue.push(child);
				}
			}
		}
	}
	if order.len() != nodes.len() {
		return Err(invalid("StageGraph contains a cycle"));
	}
	Ok(order)
}
