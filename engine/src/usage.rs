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

use async_trait::async_trait;
use tracing::info;

use crate::progress::UsageEvent;

/// Embedder-supplied callback invoked on every terminal `AgentTask`. The
/// engine never computes prices; it only reports `{userId, agentKind,
/// provider, taskId, attempts, durationMs, success, cached}`.
#[async_trait]
pub trait UsageSink: Send + Sync {
	async fn record(&self, event: UsageEvent);
}

/// Default sink for embedders that don't care about usage accounting.
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
	async fn record(&self, _event: UsageEvent) {}
}

/// `tracing`-backed sink for local development, mirroring the teacher's
/// pattern of shipping both a real and a dev-friendly implementation of every
/// boundary trait.
pub struct LoggingUsageSink;

#[async_trait]
impl UsageSink for LoggingUsageSink {
	async fn record(&self, event: UsageEvent) {
		info!(
			user_id = %event.user_id,
			agent_kind = %event.agent_kind,
			provider = %event.provider,
			task_id = %event.task_id,
			attempts = event.attempts,
			duration_ms = event.duration_ms,
			success = event.success,
			cached = event.cached,
			"agent task usage"
		);
	}
}
