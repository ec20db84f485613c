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

use std::{
	collections::{HashMap, HashSet},
	time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

use crate::{
	ids::{PipelineId, StageId, UserId},
	payload::Payload,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
	pub pipeline_id: PipelineId,
	pub user_id: UserId,
	pub document_reference: String,
	pub enabled_stages: HashSet<StageId>,
	#[serde(default)]
	pub stage_overrides: HashMap<StageId, Payload>,
	pub cancellation_deadline: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PipelineStatus {
	Initialising,
	Running,
	Completed,
	Failed,
	Cancelled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StageStatus {
	Pending,
	Ready,
	Running,
	Completed,
	Skipped,
	Failed,
}

impl StageStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			StageStatus::Completed | StageStatus::Skipped | StageStatus::Failed
		)
	}
}

/// Runtime projection of a pipeline run, owned exclusively by the
/// Orchestrator and checkpointed after every stage transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineState {
	pub pipeline_id: PipelineId,
	pub status: PipelineStatus,
	pub stage_status: HashMap<StageId, StageStatus>,
	pub stage_result: HashMap<StageId, Payload>,
	/// Stages whose FAILED status was tolerated by an `OnFailure::Skip`
	/// policy. Excluded from `derive_terminal_status`'s FAILED check, since
	/// the pipeline is FAILED iff some stage is FAILED *and* its `onFailure`
	/// is ABORT — a skipped failure must not fail the whole pipeline.
	#[serde(default)]
	pub skip_tolerated_failures: HashSet<StageId>,
	pub created_at: SystemTime,
	pub updated_at: SystemTime,
	pub error: Option<String>,
}

impl PipelineState {
	pub fn new(pipeline_id: PipelineId, stages: impl IntoIterator<Item = StageId>) -> Self {
		let now = SystemTime::now();
		Self {
			pipeline_id,
			status: PipelineStatus::Initialising,
			stage_status: stages.into_iter().map(|id| (id, StageStatus::Pending)).collect(),
			stage_result: HashMap::new(),
			skip_tolerated_failures: HashSet::new(),
			created_at: now,
			updated_at: now,
			error: None,
		}
	}

	pub fn set_stage_status(&mut self, stage_id: StageId, status: StageStatus) {
		self.stage_status.insert(stage_id, status);
		self.updated_at = SystemTime::now();
	}

	/// Records that `stage_id`'s FAILED status came from an `OnFailure::Skip`
	/// policy, so it should not fail the whole pipeline.
	pub fn mark_skip_tolerated(&mut self, stage_id: StageId) {
		self.skip_tolerated_failures.insert(stage_id);
		self.updated_at = SystemTime::now();
	}

	pub fn set_stage_result(&mut self, stage_id: StageId, result: Payload) {
		self.stage_result.insert(stage_id, result);
		self.updated_at = SystemTime::now();
	}

	pub fn set_status(&mut self, status: PipelineStatus) {
		self.status = status;
		self.updated_at = SystemTime::now();
	}

	pub fn fail(&mut self, error: impl Into<String>) {
		self.status = PipelineStatus::Failed;
		self.error = Some(error.into());
		self.updated_at = SystemTime::now();
	}

	/// True when every stage is terminal — the main loop's stopping condition
	/// for computing final pipeline status.
	pub fn all_stages_terminal(&self) -> bool {
		self.stage_status.values().all(|s| s.is_terminal())
	}

	/// Derives the final pipeline status from stage statuses, per the
	/// invariants in the data model: COMPLETED iff every stage is terminal and
	/// at least one is COMPLETED; FAILED iff at least one stage is FAILED and
	/// its `onFailure` was ABORT — stages whose failure was tolerated by
	/// `OnFailure::Skip` (see `skip_tolerated_failures`) don't count.
	pub fn derive_terminal_status(&self) -> PipelineStatus {
		let hard_failed = self
			.stage_status
			.iter()
			.any(|(id, status)| *status == StageStatus::Failed && !self.skip_tolerated_failures.contains(id));
		if hard_failed {
			return PipelineStatus::Failed;
		}
		if self.stage_status.values().any(|s| *s == StageStatus::Completed) {
			return PipelineStatus::Completed;
		}
		PipelineStatus::Failed
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineResult {
	pub pipeline_id: PipelineId,
	pub status: PipelineStatus,
	pub stage_result: HashMap<StageId, Payload>,
	pub error: Option<String>,
}

impl From<PipelineState> for PipelineResult {
	fn from(state: PipelineState) -> Self {
		Self {
			pipeline_id: state.pipeline_id,
			status: state.status,
			stage_result: state.stage_result,
			error: state.error,
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn completed_iff_all_terminal_and_one_completed() {
		let s1 = StageId::new();
		let mut state = PipelineState::new(PipelineId::new(), [s1]);
		state.set_stage_status(s1, StageStatus::Completed);
		state.set_stage_result(s1, Payload::new(json!(1)));
		assert!(state.all_stages_terminal());
		assert_eq!(state.derive_terminal_status(), PipelineStatus::Completed);
	}

	#[test]
	fn failed_when_any_stage_failed() {
		let s1 = StageId::new();
		let s2 = StageId::new();
		let mut state = PipelineState::new(PipelineId::new(), [s1, s2]);
		state.set_stage_status(s1, StageStatus::Completed);
		state.set_stage_status(s2, StageStatus::Failed);
		assert_eq!(state.derive_terminal_status(), PipelineStatus::Failed);
	}

	#[test]
	fn skip_tolerated_failure_does_not_fail_pipeline() {
		let s1 = StageId::new();
		let s2 = StageId::new();
		let mut state = PipelineState::new(PipelineId::new(), [s1, s2]);
		state.set_stage_status(s1, StageStatus::Completed);
		state.set_stage_status(s2, StageStatus::Failed);
		state.mark_skip_tolerated(s2);
		assert_eq!(state.derive_terminal_status(), PipelineStatus::Completed);
	}
}
