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

//! Multi-agent pipeline orchestration engine: a `StageGraph` of `AgentKind`
//! stages driven by an `Orchestrator`, with per-agent rate limiting, circuit
//! breaking, retry, result caching, and usage/progress reporting composed
//! around each call by the `AgentRunner`.

pub mod agent;
pub mod agent_runner;
pub mod breaker;
pub mod cancel;
pub mod config;
pub mod error;
pub mod ids;
pub mod janitor;
pub mod memory_store;
pub mod orchestrator;
pub mod payload;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod rate_limiter;
pub mod retry;
pub mod stage_graph;
pub mod task_store;
pub mod usage;

pub use agent::{AgentCapability, AgentRegistry};
pub use agent_runner::{AgentOutcome, AgentRunner};
pub use breaker::{BreakerConfig, BreakerPhase, BreakerSnapshot, CircuitBreaker};
pub use cancel::CancelSignal;
pub use config::{AgentConfigEntry, EngineConfig, ObservabilityConfig, RateLimiterConfigEntry, DEFAULT_CONFIG_PATH};
pub use error::{redb_error, EngineError, EngineErrorKind, EngineResult};
pub use ids::{PipelineId, StageId, TaskId, UserId};
pub use janitor::{Janitor, JanitorSweepReport};
pub use memory_store::{
	config_cache_key, result_cache_key, InMemoryMemoryStore, MemoryEntry, MemoryStore, RedbMemoryStore,
};
pub use orchestrator::{
	CheckpointStore, InMemoryCheckpointStore, Orchestrator, RedbCheckpointStore, StageInputProjection,
};
pub use payload::{Fingerprint, Payload};
pub use pipeline::{PipelineConfig, PipelineResult, PipelineState, PipelineStatus, StageStatus};
pub use progress::{PipelineProgressEvent, ProgressBus, ProgressSubscription, UsageEvent, UsageTags};
pub use provider::{AgentKind, Provider};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStatus};
pub use retry::{execute_with_retry, execute_with_retry_using, RetryOutcome, RetryPolicy};
pub use stage_graph::{OnFailure, StageGraph, StageNode};
pub use task_store::{AgentTask, InMemoryTaskStore, RedbTaskStore, TaskStatus, TaskStore};
pub use usage::{LoggingUsageSink, NoopUsageSink, UsageSink};
