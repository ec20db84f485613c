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
	path::PathBuf,
	sync::Arc,
};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::Mutex;

use crate::{
	agent_runner::AgentRunner,
	cancel::CancelSignal,
	error::{redb_error, EngineError, EngineErrorKind, EngineResult},
	ids::{PipelineId, StageId},
	payload::Payload,
	pipeline::{PipelineConfig, PipelineResult, PipelineState, PipelineStatus, StageStatus},
	progress::{PipelineProgressEvent, ProgressBus},
	stage_graph::{OnFailure, StageGraph},
};

/// Builds a stage's `input` from the stage's own override (if any) and the
/// results of its already-completed upstream dependencies. Supplied by the
/// embedder alongside `PipelineConfig`.
pub trait StageInputProjection: Send + Sync {
	fn project(&self, stage_id: StageId, upstream_results: &HashMap<StageId, Payload>) -> Payload;
}

/// Durable projection of `PipelineState`, checkpointed after every stage
/// transition. Diagnostics/UI only — restart-from-checkpoint is out of scope.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
	async fn save(&self, state: &PipelineState) -> EngineResult<()>;
	async fn load(&self, pipeline_id: PipelineId) -> EngineResult<Option<PipelineState>>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
	rows: Mutex<HashMap<PipelineId, PipelineState>>,
}

impl InMemoryCheckpointStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
	async fn save(&self, state: &PipelineState) -> EngineResult<()> {
		self.rows.lock().await.insert(state.pipeline_id, state.clone());
		Ok(())
	}

	async fn load(&self, pipeline_id: PipelineId) -> EngineResult<Option<PipelineState>> {
		Ok(self.rows.lock().await.get(&pipeline_id).cloned())
	}
}

const TABLE_CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("engine_checkpoints");

pub struct RedbCheckpointStore {
	db: Arc<Database>,
}

impl RedbCheckpointStore {
	pub fn open(dir_path: PathBuf) -> EngineResult<Self> {
		if !dir_path.exists() {
			std::fs::create_dir_all(&dir_path)
				.map_err(|e| EngineError::new(EngineErrorKind::Internal, Arc::new(e.into())))?;
		}
		let db_path = dir_path.join("engine_checkpoints.redb");
		let db = Database::create(db_path).map_err(redb_error)?;
		let write_txn = db.begin_write().map_err(redb_error)?;
		write_txn.open_table(TABLE_CHECKPOINTS).map_err(redb_error)?;
		write_txn.commit().map_err(redb_error)?;
		Ok(Self { db: Arc::new(db) })
	}
}

#[async_trait]
impl CheckpointStore for RedbCheckpointStore {
	async fn save(&self, state: &PipelineState) -> EngineResult<()> {
		let write_txn = self.db.begin_write().map_err(redb_error)?;
		{
			let mut table = write_txn.open_table(TABLE_CHECKPOINTS).map_err(redb_error)?;
			let encoded = serde_json::to_vec(state)?;
			table.insert(state.pipeline_id.to_string().as_str(), encoded.as_slice()).map_err(redb_error)?;
		}
		write_txn.commit().map_err(redb_error)?;
		Ok(())
	}

	async fn load(&self, pipeline_id: PipelineId) -> EngineResult<Option<PipelineState>> {
		let read_txn = self.db.begin_read().map_err(redb_error)?;
		let table = read_txn.open_table(TABLE_CHECKPOINTS).map_err(redb_error)?;
		match table.get(pipeline_id.to_string().as_str()).map_err(redb_error)? {
			Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
			None => Ok(None),
		}
	}
}

/// Drives a single pipeline run from `PipelineConfig` to `PipelineResult`
/// through its `StageGraph`. Grounded on a DAG-aware spawn/join/cancel shape:
/// dispatch the frontier in topological order, enforce concurrency via one
/// task per ready stage, join via an mpsc "done" channel, and propagate
/// cancellation through `CancelSignal` the same way `tokio_util`'s
/// `CancellationToken` would.
pub struct Orchestrator {
	pub graph: StageGraph,
	pub runner: Arc<AgentRunner>,
	pub checkpoints: Arc<dyn CheckpointStore>,
	pub progress: ProgressBus,
}

struct StageOutcome {
	stage_id: StageId,
	status: StageStatus,
	result: Option<Payload>,
	error: Option<String>,
}

impl Orchestrator {
	pub fn new(
		graph: StageGraph,
		runner: Arc<AgentRunner>,
		checkpoints: Arc<dyn CheckpointStore>,
		progress: ProgressBus,
	) -> Self {
		Self { graph, runner, checkpoints, progress }
	}

	async fn checkpoint(&self, state: &PipelineState) -> EngineResult<()> {
		self.checkpoints.save(state).await
	}

	async fn publish_pipeline(&self, pipeline_id: PipelineId, status: &str, error: Option<String>) {
		self.progress
			.publish(PipelineProgressEvent {
				pipeline_id,
				stage_id: None,
				status: status.to_string(),
				timestamp: std::time::SystemTime::now(),
				error,
			})
			.await;
	}

	pub async fn run(
		&self,
		config: PipelineConfig,
		projection: Arc<dyn StageInputProjection>,
		cancel: CancelSignal,
	) -> EngineResult<PipelineResult> {
		let pipeline_id = config.pipeline_id;
		let enabled: HashSet<StageId> =
			self.graph.all_stage_ids().filter(|id| config.enabled_stages.contains(id)).copied().collect();

		let mut state = PipelineState::new(pipeline_id, enabled.iter().copied());
		self.checkpoint(&state).await?;
		self.publish_pipeline(pipeline_id, "INITIALISING", None).await;

		state.set_status(PipelineStatus::Running);
		self.checkpoint(&state).await?;
		self.publish_pipeline(pipeline_id, "RUNNING", None).await;

		let mut frontier: Vec<StageId> =
			self.graph.roots().into_iter().filter(|id| enabled.contains(id)).collect();
		let mut done: HashSet<StageId> = HashSet::new();
		let mut dispatched: HashSet<StageId> = HashSet::new();
		let mut handles: Vec<tokio::task::JoinHandle<StageOutcome>> = Vec::new();
		let mut stage_cancels: HashMap<StageId, CancelSignal> = HashMap::new();

		'main: while !frontier.is_empty() || !handles.is_empty() {
			if cancel.is_cancelled() {
				self.cancel_and_skip(&mut state, &mut handles, &mut stage_cancels, &enabled, &done).await;
				break 'main;
			}

			for stage_id in frontier.drain(..) {
				if dispatched.contains(&stage_id) {
					continue;
				}
				dispatched.insert(stage_id);
				state.set_stage_status(stage_id, StageStatus::Ready);
				self.checkpoint(&state).await?;
				self.publish_stage(pipeline_id, stage_id, "READY").await;

				let node = self.graph.node(stage_id).cloned().expect("dispatched stage exists in graph");
				let stage_cancel = cancel.child();
				stage_cancels.insert(stage_id, stage_cancel.clone());
				let input = projection.project(stage_id, &state.stage_result);
				let runner = self.runner.clone();
				let user_id = config.user_id.clone();

				state.set_stage_status(stage_id, StageStatus::Running);
				self.checkpoint(&state).await?;
				self.publish_stage(pipeline_id, stage_id, "RUNNING").await;

				handles.push(tokio::spawn(async move {
					match runner.run(node.agent_kind, user_id, pipeline_id, stage_id, input, &stage_cancel).await {
						Ok(outcome) => StageOutcome {
							stage_id,
							status: StageStatus::Completed,
							result: Some(outcome.result),
							error: None,
						},
						Err(err) =>
							StageOutcome { stage_id, status: StageStatus::Failed, result: None, error: Some(err.to_string()) },
					}
				}));
			}

			if handles.is_empty() {
				break 'main;
			}

			// Wait for at least one dispatched stage to finish.
			let (outcome, _index, remaining) = futures::future::select_all(handles).await;
			handles = remaining;
			let outcome = outcome.map_err(|e| EngineError::new(EngineErrorKind::Internal, Arc::new(e.into())))?;

			let stage_id = outcome.stage_id;
			stage_cancels.remove(&stage_id);
			let node = self.graph.node(stage_id).cloned().expect("finished stage exists in graph");

			match outcome.status {
				StageStatus::Completed => {
					done.insert(stage_id);
					state.set_stage_status(stage_id, StageStatus::Completed);
					if let Some(result) = outcome.result {
						state.set_stage_result(stage_id, result);
					}
					self.checkpoint(&state).await?;
					self.publish_stage(pipeline_id, stage_id, "COMPLETED").await;
					for next in self.graph.unblocked(&done, &dispatched) {
						if enabled.contains(&next) {
							frontier.push(next);
						}
					}
				},
				StageStatus::Failed => match node.on_failure {
					OnFailure::Abort => {
						state.set_stage_status(stage_id, StageStatus::Failed);
						state.error = outcome.error.clone();
						self.checkpoint(&state).await?;
						self.publish_stage(pipeline_id, stage_id, "FAILED").await;
						self.cancel_and_skip(&mut state, &mut handles, &mut stage_cancels, &enabled, &done).await;
						state.fail(outcome.error.unwrap_or_else(|| "stage failed".to_string()));
						self.checkpoint(&state).await?;
						break 'main;
					},
					OnFailure::Skip => {
						state.set_stage_status(stage_id, StageStatus::Failed);
						state.mark_skip_tolerated(stage_id);
						self.publish_stage(pipeline_id, stage_id, "FAILED").await;
						done.insert(stage_id);
						for descendant in self.graph.descendants(stage_id) {
							state.set_stage_status(descendant, StageStatus::Skipped);
							done.insert(descendant);
							dispatched.insert(descendant);
							self.publish_stage(pipeline_id, descendant, "SKIPPED").await;
						}
						self.checkpoint(&state).await?;
						for next in self.graph.unblocked(&done, &dispatched) {
							if enabled.contains(&next) {
								frontier.push(next);
							}
						}
					},
					OnFailure::ContinueWithNull => {
						done.insert(stage_id);
						state.set_stage_status(stage_id, StageStatus::Completed);
						state.set_stage_result(stage_id, Payload::null());
						self.checkpoint(&state).await?;
						self.publish_stage(pipeline_id, stage_id, "COMPLETED").await;
						for next in self.graph.unblocked(&done, &dispatched) {
							if enabled.contains(&next) {
								frontier.push(next);
							}
						}
					},
				},
				_ => unreachable!("stage tasks only resolve to COMPLETED or FAILED"),
			}
		}

		if cancel.is_cancelled() && state.status != PipelineStatus::Cancelled {
			state.set_status(PipelineStatus::Cancelled);
		} else if state.status == PipelineStatus::Running {
			let terminal = state.derive_terminal_status();
			state.set_status(terminal);
		}
		self.checkpoint(&state).await?;
		self.publish_pipeline(pipeline_id, &format!("{:?}", state.status).to_uppercase(), state.error.clone()).await;

		Ok(state.into())
	}

	async fn publish_stage(&self, pipeline_id: PipelineId, stage_id: StageId, status: &str) {
		self.progress
			.publish(PipelineProgressEvent {
				pipeline_id,
				stage_id: Some(stage_id),
				status: status.to_string(),
				timestamp: std::time::SystemTime::now(),
				error: None,
			})
			.await;
	}

	/// Cancels every in-flight stage and marks every stage that never started
	/// (or is still in flight) as SKIPPED, per the ABORT/external-cancel path.
	async fn cancel_and_skip(
		&self,
		state: &mut PipelineState,
		handles: &mut Vec<tokio::task::JoinHandle<StageOutcome>>,
		stage_cancels: &mut HashMap<StageId, CancelSignal>,
		enabled: &HashSet<StageId>,
		done: &HashSet<StageId>,
	) {
		for cancel in stage_cancels.values() {
			cancel.cancel();
		}
		for handle in handles.drain(..) {
			let _ = handle.await;
		}
		stage_cancels.clear();
		for stage_id in enabled {
			if !done.contains(stage_id) {
				let status = state.stage_status.get(stage_id).copied().unwrap_or(StageStatus::Pending);
				if !status.is_terminal() {
					state.set_stage_status(*stage_id, StageStatus::Skipped);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait as async_trait_alias;
	use serde_json::json;

	use super::*;
	use crate::{
		agent::{AgentCapability, AgentRegistry},
		breaker::{BreakerConfig, CircuitBreaker},
		memory_store::InMemoryMemoryStore,
		provider::{AgentKind, Provider},
		rate_limiter::RateLimiter,
		retry::RetryPolicy,
		stage_graph::StageNode,
		task_store::InMemoryTaskStore,
		usage::NoopUsageSink,
	};

	struct EchoAgent(Provider);

	#[async_trait_alias]
	impl AgentCapability for EchoAgent {
		fn provider(&self) -> Provider {
			self.0
		}

		async fn invoke(&self, input: &Payload, _cancel: &CancelSignal) -> EngineResult<Payload> {
			Ok(input.clone())
		}
	}

	struct IdentityProjection;
	impl StageInputProjection for IdentityProjection {
		fn project(&self, _stage_id: StageId, _upstream: &HashMap<StageId, Payload>) -> Payload {
			Payload::new(json!({"doc": "x"}))
		}
	}

	fn test_runner() -> Arc<AgentRunner> {
		let mut agents = AgentRegistry::new();
		for kind in AgentKind::ALL {
			agents.register(kind, Arc::new(EchoAgent(kind.preferred_provider())));
		}
		Arc::new(AgentRunner::new(
			agents,
			Arc::new(RateLimiter::with_default_caps()),
			Arc::new(CircuitBreaker::new(BreakerConfig::default())),
			Arc::new(InMemoryTaskStore::new()),
			Arc::new(InMemoryMemoryStore::new()),
			ProgressBus::new(),
			Arc::new(NoopUsageSink),
			RetryPolicy::for_test(),
		))
	}

	#[tokio::test]
	async fn linear_success_completes_every_stage() {
		let s1 = StageId::new();
		let s2 = StageId::new();
		let graph = StageGraph::build(vec![
			StageNode::new(s1, AgentKind::PaperProcessor),
			StageNode::new(s2, AgentKind::ContentSummariser).depends_on(s1),
		])
		.unwrap();
		let orchestrator =
			Orchestrator::new(graph, test_runner(), Arc::new(InMemoryCheckpointStore::new()), ProgressBus::new());
		let config = PipelineConfig {
			pipeline_id: PipelineId::new(),
			user_id: crate::ids::UserId("u1".into()),
			document_reference: "doc".into(),
			enabled_stages: [s1, s2].into_iter().collect(),
			stage_overrides: HashMap::new(),
			cancellation_deadline: None,
		};
		let result = orchestrator.run(config, Arc::new(IdentityProjection), CancelSignal::new()).await.unwrap();
		assert_eq!(result.status, PipelineStatus::Completed);
		assert_eq!(result.stage_result.len(), 2);
	}

	#[tokio::test]
	async fn abort_failure_skips_remaining_stages() {
		struct FailingAgent;
		#[async_trait_alias]
		impl AgentCapability for FailingAgent {
			fn provider(&self) -> Provider {
				Provider::Openai
			}

			async fn invoke(&self, _input: &Payload, _cancel: &CancelSignal) -> EngineResult<Payload> {
				Err(EngineError::from_msg(EngineErrorKind::InvalidInput, "bad input"))
			}
		}

		let s1 = StageId::new();
		let s2 = StageId::new();
		let graph = StageGraph::build(vec![
			StageNode::new(s1, AgentKind::PaperProcessor),
			StageNode::new(s2, AgentKind::ContentSummariser).depends_on(s1),
		])
		.unwrap();

		let mut agents = AgentRegistry::new();
		agents.register(AgentKind::PaperProcessor, Arc::new(FailingAgent));
		agents.register(AgentKind::ContentSummariser, Arc::new(EchoAgent(Provider::Anthropic)));
		let runner = Arc::new(AgentRunner::new(
			agents,
			Arc::new(RateLimiter::with_default_caps()),
			Arc::new(CircuitBreaker::new(BreakerConfig::default())),
			Arc::new(InMemoryTaskStore::new()),
			Arc::new(InMemoryMemoryStore::new()),
			ProgressBus::new(),
			Arc::new(NoopUsageSink),
			RetryPolicy::for_test(),
		));

		let orchestrator =
			Orchestrator::new(graph, runner, Arc::new(InMemoryCheckpointStore::new()), ProgressBus::new());
		let config = PipelineConfig {
			pipeline_id: PipelineId::new(),
			user_id: crate::ids::UserId("u1".into()),
			document_reference: "doc".into(),
			enabled_stages: [s1, s2].into_iter().collect(),
			stage_overrides: HashMap::new(),
			cancellation_deadline: None,
		};
		let result = orchestrator.run(config, Arc::new(IdentityProjection), CancelSignal::new()).await.unwrap();
		assert_eq!(result.status, PipelineStatus::Failed);
		assert!(!result.stage_result.contains_key(&s2));
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_stops_in_flight_stages_promptly() {
		struct SleepyAgent(Arc<AtomicUsize>);
		#[async_trait_alias]
		impl AgentCapability for SleepyAgent {
			fn provider(&self) -> Provider {
				Provider::Anthropic
			}

			async fn invoke(&self, input: &Payload, cancel: &CancelSignal) -> EngineResult<Payload> {
				self.0.fetch_add(1, Ordering::SeqCst);
				cancel.sleep(std::time::Duration::from_secs(10)).await?;
				Ok(input.clone())
			}
		}

		let started = Arc::new(AtomicUsize::new(0));
		let s1 = StageId::new();
		let graph = StageGraph::build(vec![StageNode::new(s1, AgentKind::ContentSummariser)]).unwrap();
		let mut agents = AgentRegistry::new();
		agents.register(AgentKind::ContentSummariser, Arc::new(SleepyAgent(started.clone())));
		let runner = Arc::new(AgentRunner::new(
			agents,
			Arc::new(RateLimiter::with_default_caps()),
			Arc::new(CircuitBreaker::new(BreakerConfig::default())),
			Arc::new(InMemoryTaskStore::new()),
			Arc::new(InMemoryMemoryStore::new()),
			ProgressBus::new(),
			Arc::new(NoopUsageSink),
			RetryPolicy::for_test(),
		));
		let orchestrator =
			Orchestrator::new(graph, runner, Arc::new(InMemoryCheckpointStore::new()), ProgressBus::new());
		let config = PipelineConfig {
			pipeline_id: PipelineId::new(),
			user_id: crate::ids::UserId("u1".into()),
			document_reference: "doc".into(),
			enabled_stages: [s1].into_iter().collect(),
			stage_overrides: HashMap::new(),
			cancellation_deadline: None,
		};
		let cancel = CancelSignal::new();
		let cancel2 = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(50)).await;
			cancel2.cancel();
		});
		let result = orchestrator.run(config, Arc::new(IdentityProjection), cancel).await.unwrap();
		assert_eq!(result.status, PipelineStatus::Cancelled);
		assert_eq!(started.load(Ordering::SeqCst), 1);
	}
}
