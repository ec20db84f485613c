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

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
	cancel::CancelSignal,
	error::{EngineError, EngineErrorKind, EngineResult},
	payload::Payload,
	provider::{AgentKind, Provider},
};

/// Embedder-supplied implementation of one [`AgentKind`]. The engine calls
/// `invoke` under rate-limit/breaker/retry/cache orchestration; it never calls
/// a provider API directly.
#[async_trait]
pub trait AgentCapability: Send + Sync {
	/// The provider this agent calls, used to select the rate limiter window
	/// and circuit breaker. Usually `kind.preferred_provider()`, but an
	/// embedder may route a kind to an alternate provider.
	fn provider(&self) -> Provider;

	/// Runs the agent against `input`, cooperatively observing `cancel`.
	async fn invoke(&self, input: &Payload, cancel: &CancelSignal) -> EngineResult<Payload>;

	/// Whether `err` should be retried by the AgentRunner's retry loop.
	/// Defaults to the error's own `EngineErrorKind` classification; agents
	/// wrapping a provider SDK that exposes finer-grained transience may
	/// override this.
	fn retriable(&self, err: &EngineError) -> bool {
		matches!(
			err.kind(),
			EngineErrorKind::TransientProvider | EngineErrorKind::RateLimitedExternal
		)
	}
}

/// One-time registration of an [`AgentCapability`] per [`AgentKind`]. Built at
/// startup; the engine has no hot-reload path for agent implementations.
#[derive(Clone, Default)]
pub struct AgentRegistry {
	agents: HashMap<AgentKind, Arc<dyn AgentCapability>>,
}

impl AgentRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, kind: AgentKind, agent: Arc<dyn AgentCapability>) {
		self.agents.insert(kind, agent);
	}

	pub fn get(&self, kind: AgentKind) -> EngineResult<Arc<dyn AgentCapability>> {
		self.agents
			.get(&kind)
			.cloned()
			.ok_or_else(|| EngineError::from_msg(EngineErrorKind::Internal, format!("no agent registered for {kind}")))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	struct EchoAgent;

	#[async_trait]
	impl AgentCapability for EchoAgent {
		fn provider(&self) -> Provider {
			Provider::Openai
		}

		async fn invoke(&self, input: &Payload, _cancel: &CancelSignal) -> EngineResult<Payload> {
			Ok(input.clone())
		}
	}

	#[tokio::test]
	async fn registered_agent_is_invokable() {
		let mut registry = AgentRegistry::new();
		registry.register(AgentKind::PaperProcessor, Arc::new(EchoAgent));
		let agent = registry.get(AgentKind::PaperProcessor).unwrap();
		let cancel = CancelSignal::new();
		let input = Payload::new(json!({"x": 1}));
		let output = agent.invoke(&input, &cancel).await.unwrap();
		assert_eq!(output, input);
	}

	#[test]
	fn unregistered_kind_is_an_internal_error() {
		let registry = AgentRegistry::new();
		let err = registry.get(AgentKind::ResearchAgent).unwrap_err();
		assert_eq!(err.kind(), EngineErrorKind::Internal);
	}
}
