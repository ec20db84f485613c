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
	collections::HashMap,
	path::PathBuf,
	sync::Arc,
	time::{Duration, SystemTime},
};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::{
	error::{redb_error, EngineError, EngineErrorKind, EngineResult},
	ids::{PipelineId, StageId, TaskId, UserId},
	payload::Payload,
	provider::AgentKind,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskStatus {
	Pending,
	Running,
	Completed,
	Failed,
	TimedOut,
	Cancelled,
}

impl TaskStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
		)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentTask {
	pub task_id: TaskId,
	pub agent_kind: AgentKind,
	pub user_id: UserId,
	pub pipeline_id: PipelineId,
	pub stage_id: StageId,
	pub input: Payload,
	pub status: TaskStatus,
	pub result: Option<Payload>,
	pub error: Option<String>,
	pub created_at: SystemTime,
	pub started_at: Option<SystemTime>,
	pub completed_at: Option<SystemTime>,
	pub attempts: u32,
}

impl AgentTask {
	pub fn new(
		agent_kind: AgentKind,
		user_id: UserId,
		pipeline_id: PipelineId,
		stage_id: StageId,
		input: Payload,
	) -> Self {
		Self {
			task_id: TaskId::new(),
			agent_kind,
			user_id,
			pipeline_id,
			stage_id,
			input,
			status: TaskStatus::Pending,
			result: None,
			error: None,
			created_at: SystemTime::now(),
			started_at: None,
			completed_at: None,
			attempts: 0,
		}
	}
}

/// Durable record of every agent invocation, for recovery, cleanup and
/// observability. Writes on a single task are linearisable; writes across
/// tasks need not be serialised.
#[async_trait]
pub trait TaskStore: Send + Sync {
	async fn create(&self, task: AgentTask) -> EngineResult<()>;
	async fn start(&self, task_id: TaskId) -> EngineResult<()>;
	async fn complete(&self, task_id: TaskId, result: Payload) -> EngineResult<()>;
	async fn fail(&self, task_id: TaskId, error: String) -> EngineResult<()>;
	async fn timeout(&self, task_id: TaskId) -> EngineResult<()>;
	async fn cancel(&self, task_id: TaskId) -> EngineResult<()>;
	async fn get(&self, task_id: TaskId) -> EngineResult<Option<AgentTask>>;
	async fn find_timed_out(&self, threshold: Duration) -> EngineResult<Vec<AgentTask>>;
	async fn delete_completed_older_than(&self, cutoff: SystemTime) -> EngineResult<usize>;
}

fn state_violation(status: TaskStatus) -> EngineError {
	EngineError::from_msg(
		EngineErrorKind::StateViolation,
		format!("task is already terminal (status={status:?})"),
	)
}

/// Applies one transition to `task` in place, honoring monotonic-terminal and
/// idempotent-terminal-transition invariants. Shared by every `TaskStore`
/// implementation so the rules live in exactly one place.
fn apply_transition(task: &mut AgentTask, next: Transition) -> EngineResult<()> {
	if task.status.is_terminal() {
		let repeats_same_terminal = match (&next, task.status) {
			(Transition::Complete(result), TaskStatus::Completed) =>
				task.result.as_ref() == Some(result),
			(Transition::Fail(_), TaskStatus::Failed) => true,
			(Transition::Timeout, TaskStatus::TimedOut) => true,
			(Transition::Cancel, TaskStatus::Cancelled) => true,
			_ => false,
		};
		return if repeats_same_terminal { Ok(()) } else { Err(state_violation(task.status)) };
	}
	match next {
		Transition::Start => {
			task.status = TaskStatus::Running;
			task.started_at = Some(SystemTime::now());
			task.attempts += 1;
		},
		Transition::Complete(result) => {
			task.status = TaskStatus::Completed;
			task.result = Some(result);
			task.completed_at = Some(SystemTime::now());
		},
		Transition::Fail(error) => {
			task.status = TaskStatus::Failed;
			task.error = Some(error);
			task.completed_at = Some(SystemTime::now());
		},
		Transition::Timeout => {
			task.status = TaskStatus::TimedOut;
			task.completed_at = Some(SystemTime::now());
		},
		Transition::Cancel => {
			task.status = TaskStatus::Cancelled;
			task.completed_at = Some(SystemTime::now());
		},
	}
	Ok(())
}

enum Transition {
	Start,
	Complete(Payload),
	Fail(String),
	Timeout,
	Cancel,
}

/// `tokio::sync::Mutex<HashMap<..>>`-keyed store, per-task exclusion via a
/// row-level `Mutex<AgentTask>` guarded by an outer map lock, mirroring the
/// "multiple readers, serialised writers per key" policy.
#[derive(Default)]
pub struct InMemoryTaskStore {
	rows: RwLock<HashMap<TaskId, Mutex<AgentTask>>>,
}

impl InMemoryTaskStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
	async fn create(&self, task: AgentTask) -> EngineResult<()> {
		let mut rows = self.rows.write().await;
		rows.insert(task.task_id, Mutex::new(task));
		Ok(())
	}

	async fn start(&self, task_id: TaskId) -> EngineResult<()> {
		let rows = self.rows.read().await;
		let row = rows.get(&task_id).ok_or_else(|| missing(task_id))?;
		apply_transition(&mut *row.lock().await, Transition::Start)
	}

	async fn complete(&self, task_id: TaskId, result: Payload) -> EngineResult<()> {
		let rows = self.rows.read().await;
		let row = rows.get(&task_id).ok_or_else(|| missing(task_id))?;
		apply_transition(&mut *row.lock().await, Transition::Complete(result))
	}

	async fn fail(&self, task_id: TaskId, error: String) -> EngineResult<()> {
		let rows = self.rows.read().await;
		let row = rows.get(&task_id).ok_or_else(|| missing(task_id))?;
		apply_transition(&mut *row.lock().await, Transition::Fail(error))
	}

	async fn timeout(&self, task_id: TaskId) -> EngineResult<()> {
		let rows = self.rows.read().await;
		let row = rows.get(&task_id).ok_or_else(|| missing(task_id))?;
		apply_transition(&mut *row.lock().await, Transition::Timeout)
	}

	async fn cancel(&self, task_id: TaskId) -> EngineResult<()> {
		let rows = self.rows.read().await;
		let row = rows.get(&task_id).ok_or_else(|| missing(task_id))?;
		apply_transition(&mut *row.lock().await, Transition::Cancel)
	}

	async fn get(&self, task_id: TaskId) -> EngineResult<Option<AgentTask>> {
		let rows = self.rows.read().await;
		match rows.get(&task_id) {
			Some(row) => Ok(Some(row.lock().await.clone())),
			None => Ok(None),
		}
	}

	async fn find_timed_out(&self, threshold: Duration) -> EngineResult<Vec<AgentTask>> {
		let rows = self.rows.read().await;
		let now = SystemTime::now();
		let mut out = Vec::new();
		for row in rows.values() {
			let task = row.lock().await;
			if task.status == TaskStatus::Running {
				if let Some(started_at) = task.started_at {
					if now.duration_since(started_at).unwrap_or_default() >= threshold {
						out.push(task.clone());
					}
				}
			}
		}
		Ok(out)
	}

	async fn delete_completed_older_than(&self, cutoff: SystemTime) -> EngineResult<usize> {
		let mut rows = self.rows.write().await;
		let mut to_delete = Vec::new();
		for (task_id, row) in rows.iter() {
			let task = row.lock().await;
			if task.status.is_terminal() {
				if let Some(completed_at) = task.completed_at {
					if completed_at < cutoff {
						to_delete.push(*task_id);
					}
				}
			}
		}
		for task_id in &to_delete {
			rows.remove(task_id);
		}
		Ok(to_delete.len())
	}
}

fn missing(task_id: TaskId) -> EngineError {
	EngineError::from_msg(EngineErrorKind::Internal, format!("unknown task {task_id}"))
}

const TABLE_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("engine_tasks");

/// redb-backed durable `TaskStore`, standing in for "the reference embedder
/// uses a relational store" (§6.5): a real crash-safe implementation without
/// fabricating a dependency the teacher doesn't already carry.
pub struct RedbTaskStore {
	db: Arc<Database>,
}

impl RedbTaskStore {
	pub fn open(dir_path: PathBuf) -> EngineResult<Self> {
		if !dir_path.exists() {
			std::fs::create_dir_all(&dir_path)
				.map_err(|e| EngineError::new(EngineErrorKind::Internal, Arc::new(e.into())))?;
		}
		let db_path = dir_path.join("engine_tasks.redb");
		let db = Database::create(db_path).map_err(redb_error)?;
		let write_txn = db.begin_write().map_err(redb_error)?;
		write_txn.open_table(TABLE_TASKS).map_err(redb_error)?;
		write_txn.commit().map_err(redb_error)?;
		Ok(Self { db: Arc::new(db) })
	}

	fn read_row(&self, task_id: TaskId) -> EngineResult<Option<AgentTask>> {
		let read_txn = self.db.begin_read().map_err(redb_error)?;
		let table = read_txn.open_table(TABLE_TASKS).map_err(redb_error)?;
		match table.get(task_id.to_string().as_str()).map_err(redb_error)? {
			Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
			None => Ok(None),
		}
	}

	fn write_row(&self, task: &AgentTask) -> EngineResult<()> {
		let write_txn = self.db.begin_write().map_err(redb_error)?;
		{
			let mut table = write_txn.open_table(TABLE_TASKS).map_err(redb_error)?;
			let encoded = serde_json::to_vec(task)?;
			table
				.insert(task.task_id.to_string().as_str(), encoded.as_slice())
				.map_err(redb_error)?;
		}
		write_txn.commit().map_err(redb_error)?;
		Ok(())
	}

	fn transition(&self, task_id: TaskId, next: Transition) -> EngineResult<()> {
		let mut task = self.read_row(task_id)?.ok_or_else(|| missing(task_id))?;
		apply_transition(&mut task, next)?;
		self.write_row(&task)
	}
}

#[async_trait]
impl TaskStore for RedbTaskStore {
	async fn create(&self, task: AgentTask) -> EngineResult<()> {
		self.write_row(&task)
	}

	async fn start(&self, task_id: TaskId) -> EngineResult<()> {
		self.transition(task_id, Transition::Start)
	}

	async fn complete(&self, task_id: TaskId, result: Payload) -> EngineResult<()> {
		self.transition(task_id, Transition::Complete(result))
	}

	async fn fail(&self, task_id: TaskId, error: String) -> EngineResult<()> {
		self.transition(task_id, Transition::Fail(error))
	}

	async fn timeout(&self, task_id: TaskId) -> EngineResult<()> {
		self.transition(task_id, Transition::Timeout)
	}

	async fn cancel(&self, task_id: TaskId) -> EngineResult<()> {
		self.transition(task_id, Transition::Cancel)
	}

	async fn get(&self, task_id: TaskId) -> EngineResult<Option<AgentTask>> {
		self.read_row(task_id)
	}

	async fn find_timed_out(&self, threshold: Duration) -> EngineResult<Vec<AgentTask>> {
		let now = SystemTime::now();
		let read_txn = self.db.begin_read().map_err(redb_error)?;
		let table = read_txn.open_table(TABLE_TASKS).map_err(redb_error)?;
		let mut out = Vec::new();
		for entry in table.iter().map_err(redb_error)? {
			let (_, value) = entry.map_err(redb_error)?;
			let task: AgentTask = serde_json::from_slice(value.value())?;
			if task.status == TaskStatus::Running {
				if let Some(started_at) = task.started_at {
					if now.duration_since(started_at).unwrap_or_default() >= threshold {
						out.push(task);
					}
				}
			}
		}
		Ok(out)
	}

	async fn delete_completed_older_than(&self, cutoff: SystemTime) -> EngineResult<usize> {
		let to_delete: Vec<TaskId> = {
			let read_txn = self.db.begin_read().map_err(redb_error)?;
			let table = read_txn.open_table(TABLE_TASKS).map_err(redb_error)?;
			let mut ids = Vec::new();
			for entry in table.iter().map_err(redb_error)? {
				let (_, value) = entry.map_err(redb_error)?;
				let task: AgentTask = serde_json::from_slice(value.value())?;
				if task.status.is_terminal() {
					if let Some(completed_at) = task.completed_at {
						if completed_at < cutoff {
							ids.push(task.task_id);
						}
					}
				}
			}
			ids
		};
		let write_txn = self.db.begin_write().map_err(redb_error)?;
		{
			let mut table = write_txn.open_table(TABLE_TASKS).map_err(redb_error)?;
			for task_id in &to_delete {
				table.remove(task_id.to_string().as_str()).map_err(redb_error)?;
			}
		}
		write_txn.commit().map_err(redb_error)?;
		Ok(to_delete.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn new_task() -> AgentTask {
		AgentTask::new(
			AgentKind::PaperProcessor,
			UserId("u1".into()),
			PipelineId::new(),
			StageId::new(),
			Payload::null(),
		)
	}

	#[tokio::test]
	async fn lifecycle_happy_path() {
		let store = InMemoryTaskStore::new();
		let task = new_task();
		let id = task.task_id;
		store.create(task).await.unwrap();
		store.start(id).await.unwrap();
		store.complete(id, Payload::null()).await.unwrap();
		let row = store.get(id).await.unwrap().unwrap();
		assert_eq!(row.status, TaskStatus::Completed);
		assert_eq!(row.attempts, 1);
	}

	#[tokio::test]
	async fn terminal_transitions_are_idempotent() {
		let store = InMemoryTaskStore::new();
		let task = new_task();
		let id = task.task_id;
		store.create(task).await.unwrap();
		store.start(id).await.unwrap();
		store.complete(id, Payload::null()).await.unwrap();
		store.complete(id, Payload::null()).await.unwrap();
		let row = store.get(id).await.unwrap().unwrap();
		assert_eq!(row.status, TaskStatus::Completed);
	}

	#[tokio::test]
	async fn non_terminal_transition_from_terminal_is_state_violation() {
		let store = InMemoryTaskStore::new();
		let task = new_task();
		let id = task.task_id;
		store.create(task).await.unwrap();
		store.start(id).await.unwrap();
		store.complete(id, Payload::null()).await.unwrap();
		let err = store.start(id).await.unwrap_err();
		assert_eq!(err.kind(), EngineErrorKind::StateViolation);
	}

	#[tokio::test]
	async fn completing_with_a_different_result_after_terminal_is_a_violation() {
		use serde_json::json;
		let store = InMemoryTaskStore::new();
		let task = new_task();
		let id = task.task_id;
		store.create(task).await.unwrap();
		store.start(id).await.unwrap();
		store.complete(id, Payload::new(json!({"a": 1}))).await.unwrap();
		let err = store.complete(id, Payload::new(json!({"a": 2}))).await.unwrap_err();
		assert_eq!(err.kind(), EngineErrorKind::StateViolation);
	}

	#[tokio::test]
	async fn find_timed_out_returns_only_stale_running_tasks() {
		let store = InMemoryTaskStore::new();
		let task = new_task();
		let id = task.task_id;
		store.create(task).await.unwrap();
		store.start(id).await.unwrap();
		let found = store.find_timed_out(Duration::from_secs(0)).await.unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].task_id, id);
	}
}
