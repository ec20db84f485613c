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

use std::{collections::HashMap, sync::Arc, time::Instant};

use tokio::sync::{broadcast, Mutex};

use crate::{
	agent::AgentRegistry,
	breaker::CircuitBreaker,
	cancel::CancelSignal,
	error::{EngineError, EngineErrorKind, EngineResult},
	ids::{PipelineId, StageId, TaskId, UserId},
	memory_store::{result_cache_key, MemoryStore},
	payload::{Fingerprint, Payload},
	progress::{PipelineProgressEvent, ProgressBus, UsageEvent},
	provider::AgentKind,
	rate_limiter::RateLimiter,
	retry::{execute_with_retry_using, RetryPolicy},
	task_store::{AgentTask, TaskStore},
	usage::UsageSink,
};

/// A terminal outcome of a single `AgentRunner` invocation, carrying the
/// task id so callers can look the full row up from the `TaskStore`.
#[derive(Clone, Debug)]
pub struct AgentOutcome {
	pub task_id: TaskId,
	pub result: Payload,
	pub cached: bool,
}

/// `fingerprint -> broadcast sender for the in-flight call's outcome`.
/// Entries are removed on completion; late joiners subscribe before the
/// entry is looked up again, so there's no lost-wakeup window.
type CoalesceMap = Mutex<HashMap<(AgentKind, Fingerprint), broadcast::Sender<Result<Payload, String>>>>;

/// Composes `RateLimiter` + `CircuitBreaker` + `RetryController` +
/// `MemoryStore` result cache + fingerprint coalescing around one agent
/// invocation. Owns no durable state itself — it borrows `TaskStore` and
/// `MemoryStore` from the caller, mirroring the teacher's "one mutex-guarded
/// registry plus explicit request/response" concurrency shape rather than a
/// full actor mailbox, since every invocation here is a single request.
pub struct AgentRunner {
	pub agents: AgentRegistry,
	pub rate_limiter: Arc<RateLimiter>,
	pub breaker: Arc<CircuitBreaker>,
	pub task_store: Arc<dyn TaskStore>,
	pub memory_store: Arc<dyn MemoryStore>,
	pub progress: ProgressBus,
	pub usage: Arc<dyn UsageSink>,
	pub retry_policy: RetryPolicy,
	in_flight: CoalesceMap,
}

impl AgentRunner {
	pub fn new(
		agents: AgentRegistry,
		rate_limiter: Arc<RateLimiter>,
		breaker: Arc<CircuitBreaker>,
		task_store: Arc<dyn TaskStore>,
		memory_store: Arc<dyn MemoryStore>,
		progress: ProgressBus,
		usage: Arc<dyn UsageSink>,
		retry_policy: RetryPolicy,
	) -> Self {
		Self {
			agents,
			rate_limiter,
			breaker,
			task_store,
			memory_store,
			progress,
			usage,
			retry_policy,
			in_flight: Mutex::new(HashMap::new()),
		}
	}

	async fn publish(&self, pipeline_id: PipelineId, stage_id: StageId, status: &str, error: Option<String>) {
		self.progress
			.publish(PipelineProgressEvent {
				pipeline_id,
				stage_id: Some(stage_id),
				status: status.to_string(),
				timestamp: std::time::SystemTime::now(),
				error,
			})
			.await;
	}

	/// Runs one agent call to completion, returning the final task id and
	/// result (or the terminal error). See spec/data-model for the exact
	/// step ordering: cache check, task creation, breaker admission, retry
	/// loop {start, acquire, invoke, record}, cancellation at any point.
	pub async fn run(
		&self,
		kind: AgentKind,
		user_id: UserId,
		pipeline_id: PipelineId,
		stage_id: StageId,
		input: Payload,
		cancel: &CancelSignal,
	) -> EngineResult<AgentOutcome> {
		cancel.check()?;
		let fingerprint = Fingerprint::of(&input);
		let cache_key = result_cache_key(kind, fingerprint);

		// 1. Cache check.
		if let Some(cached) = self.memory_store.get(&cache_key).await? {
			let task = self.record_cache_hit(kind, &user_id, pipeline_id, stage_id, input, cached.clone()).await?;
			self.emit_usage(&task, true).await;
			return Ok(AgentOutcome { task_id: task.task_id, result: cached, cached: true });
		}

		// Coalesce concurrent same-fingerprint calls.
		let coalesce_key = (kind, fingerprint);
		let mut receiver = {
			let mut in_flight = self.in_flight.lock().await;
			if let Some(tx) = in_flight.get(&coalesce_key) {
				Some(tx.subscribe())
			} else {
				let (tx, _rx) = broadcast::channel(1);
				in_flight.insert(coalesce_key, tx);
				None
			}
		};

		if let Some(rx) = receiver.take() {
			return self.join_in_flight(rx, kind, &user_id, pipeline_id, stage_id, input).await;
		}

		let result = self.execute(kind, &user_id, pipeline_id, stage_id, input.clone(), cancel).await;

		let broadcast_value = result.as_ref().map(|o| o.result.clone()).map_err(|e| format!("{e}"));
		if let Some(tx) = self.in_flight.lock().await.remove(&coalesce_key) {
			let _ = tx.send(broadcast_value);
		}
		result
	}

	async fn join_in_flight(
		&self,
		mut rx: broadcast::Receiver<Result<Payload, String>>,
		kind: AgentKind,
		user_id: &UserId,
		pipeline_id: PipelineId,
		stage_id: StageId,
		input: Payload,
	) -> EngineResult<AgentOutcome> {
		match rx.recv().await {
			Ok(Ok(result)) => {
				let task = self
					.record_cache_hit(kind, user_id, pipeline_id, stage_id, input, result.clone())
					.await?;
				Ok(AgentOutcome { task_id: task.task_id, result, cached: true })
			},
			Ok(Err(msg)) => Err(EngineError::from_msg(EngineErrorKind::TransientProvider, msg)),
			Err(_) => Err(EngineError::from_msg(EngineErrorKind::Internal, "in-flight call vanished")),
		}
	}

	/// Creates (or reuses) a task row recording a cache-hit completion, so
	/// `cached=true` completions always leave a full terminal task record.
	async fn record_cache_hit(
		&self,
		kind: AgentKind,
		user_id: &UserId,
		pipeline_id: PipelineId,
		stage_id: StageId,
		input: Payload,
		result: Payload,
	) -> EngineResult<AgentTask> {
		let mut task = AgentTask::new(kind, user_id.clone(), pipeline_id, stage_id, input);
		self.task_store.create(task.clone()).await?;
		self.task_store.start(task.task_id).await?;
		self.task_store.complete(task.task_id, result.clone()).await?;
		self.publish(pipeline_id, stage_id, "COMPLETED", None).await;
		task.result = Some(result);
		Ok(task)
	}

	async fn execute(
		&self,
		kind: AgentKind,
		user_id: &UserId,
		pipeline_id: PipelineId,
		stage_id: StageId,
		input: Payload,
		cancel: &CancelSignal,
	) -> EngineResult<AgentOutcome> {
		let agent = self.agents.get(kind)?;
		let provider = agent.provider();
		let fingerprint = Fingerprint::of(&input);
		let cache_key = result_cache_key(kind, fingerprint);

		let task = AgentTask::new(kind, user_id.clone(), pipeline_id, stage_id, input.clone());
		let task_id = task.task_id;
		self.task_store.create(task).await?;
		self.publish(pipeline_id, stage_id, "PENDING", None).await;

		let started = Instant::now();

		// Breaker admission gates the whole retry sequence once, up front
		// (spec §4.6 step 3), not each attempt: a breaker that flips OPEN
		// between attempts (e.g. from concurrent tasks on the same
		// AgentKind) must not convert an already-admitted, in-progress retry
		// sequence into a BREAKER_OPEN failure. Each attempt still records
		// its own success/failure below, as spec step 4.d/e requires.
		if !self.breaker.admit(kind).await {
			let err = EngineError::from_msg(EngineErrorKind::BreakerOpen, "breaker open");
			self.task_store.fail(task_id, err.to_string()).await?;
			self.publish(pipeline_id, stage_id, "FAILED", Some(err.to_string())).await;
			if let Some(task) = self.task_store.get(task_id).await? {
				self.emit_usage_with(&task, false, started.elapsed().as_millis() as u64).await;
			}
			return Err(err);
		}

		let outcome = execute_with_retry_using(
			&self.retry_policy,
			cancel,
			|err: &EngineError| agent.retriable(err),
			|| {
				let agent = agent.clone();
				let rate_limiter = self.rate_limiter.clone();
				let task_store = self.task_store.clone();
				let breaker = self.breaker.clone();
				let input = input.clone();
				async move {
					task_store.start(task_id).await?;
					rate_limiter.acquire(provider, 1, cancel).await?;
					let result = agent.invoke(&input, cancel).await;
					match &result {
						Ok(_) => breaker.record_success(kind).await,
						Err(_) => breaker.record_failure(kind).await,
					}
					result
				}
			},
		)
		.await;

		let duration_ms = started.elapsed().as_millis() as u64;

		match outcome {
			Ok(retry_outcome) => {
				self.task_store.complete(task_id, retry_outcome.value.clone()).await?;
				self.memory_store.put(&cache_key, retry_outcome.value.clone()).await?;
				self.publish(pipeline_id, stage_id, "COMPLETED", None).await;
				if let Some(task) = self.task_store.get(task_id).await? {
					self.emit_usage_with(&task, false, duration_ms).await;
				}
				Ok(AgentOutcome { task_id, result: retry_outcome.value, cached: false })
			},
			Err(err) => {
				if err.kind() == EngineErrorKind::Cancelled {
					self.task_store.cancel(task_id).await?;
					self.publish(pipeline_id, stage_id, "CANCELLED", Some(err.to_string())).await;
				} else {
					self.task_store.fail(task_id, err.to_string()).await?;
					self.publish(pipeline_id, stage_id, "FAILED", Some(err.to_string())).await;
				}
				if let Some(task) = self.task_store.get(task_id).await? {
					self.emit_usage_with(&task, false, duration_ms).await;
				}
				Err(err)
			},
		}
	}

	async fn emit_usage(&self, task: &AgentTask, cached: bool) {
		self.emit_usage_with(task, cached, 0).await;
	}

	async fn emit_usage_with(&self, task: &AgentTask, cached: bool, duration_ms: u64) {
		self.usage
			.record(UsageEvent {
				user_id: task.user_id.0.clone(),
				agent_kind: task.agent_kind.to_string(),
				provider: task.agent_kind.preferred_provider().to_string(),
				task_id: task.task_id.to_string(),
				attempts: task.attempts,
				duration_ms,
				success: task.status == crate::task_store::TaskStatus::Completed,
				cached,
			})
			.await;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;
	use serde_json::json;

	use super::*;
	use crate::{
		agent::AgentCapability, breaker::BreakerConfig, memory_store::InMemoryMemoryStore,
		provider::Provider, task_store::InMemoryTaskStore, usage::NoopUsageSink,
	};

	struct CountingAgent {
		calls: Arc<AtomicUsize>,
		fail_times: usize,
	}

	#[async_trait]
	impl AgentCapability for CountingAgent {
		fn provider(&self) -> Provider {
			Provider::Openai
		}

		async fn invoke(&self, input: &Payload, _cancel: &CancelSignal) -> EngineResult<Payload> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst);
			if n < self.fail_times {
				return Err(EngineError::from_msg(EngineErrorKind::TransientProvider, "flaky"));
			}
			Ok(input.clone())
		}
	}

	fn runner(calls: Arc<AtomicUsize>, fail_times: usize) -> AgentRunner {
		let mut agents = AgentRegistry::new();
		agents.register(AgentKind::PaperProcessor, Arc::new(CountingAgent { calls, fail_times }));
		AgentRunner::new(
			agents,
			Arc::new(RateLimiter::with_default_caps()),
			Arc::new(CircuitBreaker::new(BreakerConfig::default())),
			Arc::new(InMemoryTaskStore::new()),
			Arc::new(InMemoryMemoryStore::new()),
			ProgressBus::new(),
			Arc::new(NoopUsageSink),
			RetryPolicy::for_test(),
		)
	}

	#[tokio::test]
	async fn successful_call_completes_and_caches() {
		let calls = Arc::new(AtomicUsize::new(0));
		let runner = runner(calls.clone(), 0);
		let cancel = CancelSignal::new();
		let outcome = runner
			.run(
				AgentKind::PaperProcessor,
				UserId("u1".into()),
				PipelineId::new(),
				StageId::new(),
				Payload::new(json!({"doc": 1})),
				&cancel,
			)
			.await
			.unwrap();
		assert!(!outcome.cached);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn second_call_with_same_fingerprint_hits_cache() {
		let calls = Arc::new(AtomicUsize::new(0));
		let runner = runner(calls.clone(), 0);
		let cancel = CancelSignal::new();
		let input = Payload::new(json!({"doc": 1}));
		let pipeline_a = PipelineId::new();
		let pipeline_b = PipelineId::new();
		runner
			.run(AgentKind::PaperProcessor, UserId("u1".into()), pipeline_a, StageId::new(), input.clone(), &cancel)
			.await
			.unwrap();
		let second = runner
			.run(AgentKind::PaperProcessor, UserId("u1".into()), pipeline_b, StageId::new(), input, &cancel)
			.await
			.unwrap();
		assert!(second.cached);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn retries_then_succeeds() {
		let calls = Arc::new(AtomicUsize::new(0));
		let runner = runner(calls.clone(), 2);
		let cancel = CancelSignal::new();
		let outcome = runner
			.run(
				AgentKind::PaperProcessor,
				UserId("u1".into()),
				PipelineId::new(),
				StageId::new(),
				Payload::new(json!({"doc": 2})),
				&cancel,
			)
			.await
			.unwrap();
		assert!(!outcome.cached);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	struct StubbornAgent {
		calls: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl AgentCapability for StubbornAgent {
		fn provider(&self) -> Provider {
			Provider::Openai
		}

		async fn invoke(&self, _input: &Payload, _cancel: &CancelSignal) -> EngineResult<Payload> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Err(EngineError::from_msg(EngineErrorKind::TransientProvider, "always flaky"))
		}

		/// Overrides the default transient-is-retriable classification: this
		/// agent knows its own "flaky" failures are actually unrecoverable.
		fn retriable(&self, _err: &EngineError) -> bool {
			false
		}
	}

	#[tokio::test]
	async fn agent_retriable_override_short_circuits_the_retry_loop() {
		let calls = Arc::new(AtomicUsize::new(0));
		let mut agents = AgentRegistry::new();
		agents.register(AgentKind::PaperProcessor, Arc::new(StubbornAgent { calls: calls.clone() }));
		let runner = AgentRunner::new(
			agents,
			Arc::new(RateLimiter::with_default_caps()),
			Arc::new(CircuitBreaker::new(BreakerConfig::default())),
			Arc::new(InMemoryTaskStore::new()),
			Arc::new(InMemoryMemoryStore::new()),
			ProgressBus::new(),
			Arc::new(NoopUsageSink),
			RetryPolicy::for_test(),
		);
		let cancel = CancelSignal::new();
		let err = runner
			.run(
				AgentKind::PaperProcessor,
				UserId("u1".into()),
				PipelineId::new(),
				StageId::new(),
				Payload::new(json!({"doc": 3})),
				&cancel,
			)
			.await
			.unwrap_err();
		assert_eq!(err.kind(), EngineErrorKind::TransientProvider);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
