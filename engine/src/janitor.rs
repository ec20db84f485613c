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

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
	error::EngineResult,
	memory_store::MemoryStore,
	progress::{PipelineProgressEvent, ProgressBus},
	task_store::TaskStore,
};

/// A completed sweep's tallies, for logging and tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JanitorSweepReport {
	pub timed_out: usize,
	pub completed_tasks_deleted: usize,
	pub memory_entries_deleted: usize,
}

/// Periodically reclaims stale `TaskStore`/`MemoryStore` state. Runs
/// alongside the engine rather than inside any single pipeline run, mirroring
/// the teacher's readiness-reporting background loop: a plain
/// `tokio::time::interval` ticking a sweep function for the process lifetime.
pub struct Janitor {
	task_store: Arc<dyn TaskStore>,
	memory_store: Arc<dyn MemoryStore>,
	progress: ProgressBus,
	task_timeout: Duration,
	task_retention: Duration,
	memory_retention: Duration,
}

impl Janitor {
	pub fn new(
		task_store: Arc<dyn TaskStore>,
		memory_store: Arc<dyn MemoryStore>,
		progress: ProgressBus,
		task_timeout: Duration,
		task_retention: Duration,
		memory_retention: Duration,
	) -> Self {
		Self { task_store, memory_store, progress, task_timeout, task_retention, memory_retention }
	}

	/// Runs one sweep: times out tasks stuck RUNNING past `task_timeout`,
	/// deletes terminal task rows older than `task_retention`, and deletes
	/// memory entries whose last update is older than `memory_retention`.
	pub async fn tick(&self) -> EngineResult<JanitorSweepReport> {
		let timed_out_tasks = self.task_store.find_timed_out(self.task_timeout).await?;
		for task in &timed_out_tasks {
			self.task_store.timeout(task.task_id).await?;
			self.progress
				.publish(PipelineProgressEvent {
					pipeline_id: task.pipeline_id,
					stage_id: Some(task.stage_id),
					status: "TIMED_OUT".to_string(),
					timestamp: std::time::SystemTime::now(),
					error: Some(format!("task exceeded {:?} without completing", self.task_timeout)),
				})
				.await;
			warn!(task_id = %task.task_id, pipeline_id = %task.pipeline_id, "janitor timed out a stuck task");
		}

		let cutoff = std::time::SystemTime::now()
			.checked_sub(self.task_retention)
			.unwrap_or(std::time::SystemTime::UNIX_EPOCH);
		let completed_tasks_deleted = self.task_store.delete_completed_older_than(cutoff).await?;

		let memory_entries_deleted = self.memory_store.delete_stale(self.memory_retention).await?;

		let report = JanitorSweepReport {
			timed_out: timed_out_tasks.len(),
			completed_tasks_deleted,
			memory_entries_deleted,
		};
		debug!(?report, "janitor sweep complete");
		Ok(report)
	}

	/// Ticks `self.tick()` on `interval` for the life of the process. Intended
	/// to be spawned once at engine startup; a sweep error is logged and the
	/// loop continues rather than aborting the whole engine over one bad tick.
	pub async fn run_forever(self: Arc<Self>, interval: Duration) {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			if let Err(err) = self.tick().await {
				warn!(error = %err, "janitor sweep failed");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::{
		ids::{PipelineId, StageId, UserId},
		memory_store::InMemoryMemoryStore,
		payload::Payload,
		provider::AgentKind,
		task_store::{AgentTask, InMemoryTaskStore},
	};

	#[tokio::test]
	async fn sweep_times_out_stuck_tasks_and_deletes_stale_state() {
		let task_store = Arc::new(InMemoryTaskStore::new());
		let memory_store = Arc::new(InMemoryMemoryStore::new());

		let mut task = AgentTask::new(
			AgentKind::PaperProcessor,
			UserId("u1".into()),
			PipelineId::new(),
			StageId::new(),
			Payload::new(json!({"x": 1})),
		);
		let task_id = task.task_id;
		task_store.create(task.clone()).await.unwrap();
		task_store.start(task_id).await.unwrap();
		task.status = crate::task_store::TaskStatus::Running;

		memory_store.put("stale_key", Payload::new(json!(1))).await.unwrap();

		let janitor = Janitor::new(
			task_store.clone(),
			memory_store.clone(),
			ProgressBus::new(),
			Duration::from_secs(0),
			Duration::from_secs(0),
			Duration::from_secs(0),
		);

		let report = janitor.tick().await.unwrap();
		assert_eq!(report.timed_out, 1);
		assert!(report.memory_entries_deleted >= 1);

		let row = task_store.get(task_id).await.unwrap().unwrap();
		assert_eq!(row.status, crate::task_store::TaskStatus::TimedOut);
	}
}
