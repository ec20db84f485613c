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

use std::{collections::HashMap, num::NonZeroU32, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{breaker::BreakerConfig, provider::Provider, provider::AgentKind, rate_limiter::RateLimiterConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config/engine.config.yaml";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
	#[serde(default)]
	pub rate_limits: HashMap<Provider, RateLimiterConfigEntry>,
	#[serde(default)]
	pub agents: HashMap<AgentKind, AgentConfigEntry>,
	#[serde(default = "EngineConfig::default_janitor_interval_secs")]
	janitor_interval_secs: NonZeroU32,
	#[serde(default = "EngineConfig::default_task_retention_secs")]
	task_retention_secs: NonZeroU32,
	#[serde(default = "EngineConfig::default_memory_retention_secs")]
	memory_retention_secs: NonZeroU32,
	#[serde(default)]
	pub observability: ObservabilityConfig,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterConfigEntry {
	pub per_second: u32,
	pub per_minute: u32,
}

impl From<RateLimiterConfigEntry> for RateLimiterConfig {
	fn from(entry: RateLimiterConfigEntry) -> Self {
		RateLimiterConfig { per_second: entry.per_second, per_minute: entry.per_minute }
	}
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigEntry {
	#[serde(default = "AgentConfigEntry::default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default = "AgentConfigEntry::default_initial_delay_ms")]
	pub initial_delay_ms: u64,
	#[serde(default = "AgentConfigEntry::default_max_delay_ms")]
	pub max_delay_ms: u64,
	#[serde(default = "AgentConfigEntry::default_failure_threshold")]
	pub failure_threshold: u32,
	#[serde(default = "AgentConfigEntry::default_open_duration_secs")]
	pub open_duration_secs: u64,
	#[serde(default = "AgentConfigEntry::default_timeout_secs")]
	pub timeout_secs: u64,
}

impl AgentConfigEntry {
	fn default_max_attempts() -> u32 {
		3
	}

	fn default_initial_delay_ms() -> u64 {
		200
	}

	fn default_max_delay_ms() -> u64 {
		20_000
	}

	fn default_failure_threshold() -> u32 {
		5
	}

	fn default_open_duration_secs() -> u64 {
		30
	}

	fn default_timeout_secs() -> u64 {
		60
	}

	pub fn breaker_config(&self) -> BreakerConfig {
		BreakerConfig {
			failure_threshold: self.failure_threshold,
			open_duration: Duration::from_secs(self.open_duration_secs),
		}
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}
}

impl Default for AgentConfigEntry {
	fn default() -> Self {
		Self {
			max_attempts: Self::default_max_attempts(),
			initial_delay_ms: Self::default_initial_delay_ms(),
			max_delay_ms: Self::default_max_delay_ms(),
			failure_threshold: Self::default_failure_threshold(),
			open_duration_secs: Self::default_open_duration_secs(),
			timeout_secs: Self::default_timeout_secs(),
		}
	}
}

/// Whether progress/usage events are also mirrored to `tracing` spans, beyond
/// being delivered through the `ProgressBus`/`UsageSink`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
	#[serde(default = "ObservabilityConfig::default_enabled")]
	pub enabled: bool,
}

impl ObservabilityConfig {
	fn default_enabled() -> bool {
		true
	}
}

impl Default for ObservabilityConfig {
	fn default() -> Self {
		Self { enabled: Self::default_enabled() }
	}
}

impl EngineConfig {
	fn default_janitor_interval_secs() -> NonZeroU32 {
		NonZeroU32::new(60).unwrap()
	}

	fn default_task_retention_secs() -> NonZeroU32 {
		NonZeroU32::new(7 * 24 * 3600).unwrap()
	}

	fn default_memory_retention_secs() -> NonZeroU32 {
		NonZeroU32::new(24 * 3600).unwrap()
	}

	pub fn janitor_interval(&self) -> Duration {
		Duration::from_secs(self.janitor_interval_secs.get() as u64)
	}

	pub fn task_retention(&self) -> Duration {
		Duration::from_secs(self.task_retention_secs.get() as u64)
	}

	pub fn memory_retention(&self) -> Duration {
		Duration::from_secs(self.memory_retention_secs.get() as u64)
	}

	pub fn rate_limiter_caps(&self) -> HashMap<Provider, RateLimiterConfig> {
		Provider::ALL
			.into_iter()
			.map(|provider| {
				let cap = self
					.rate_limits
					.get(&provider)
					.cloned()
					.map(RateLimiterConfig::from)
					.unwrap_or_else(|| RateLimiterConfig::for_provider(provider));
				(provider, cap)
			})
			.collect()
	}

	pub fn agent_config(&self, kind: AgentKind) -> AgentConfigEntry {
		self.agents.get(&kind).cloned().unwrap_or_default()
	}

	pub fn load_from_yaml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let path = path.as_ref();
		let raw = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read engine config at `{}`", path.display()))?;
		let config: EngineConfig = serde_yaml::from_str(&raw)
			.with_context(|| format!("failed to parse engine config at `{}`", path.display()))?;
		Ok(config)
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			rate_limits: HashMap::new(),
			agents: HashMap::new(),
			janitor_interval_secs: Self::default_janitor_interval_secs(),
			task_retention_secs: Self::default_task_retention_secs(),
			memory_retention_secs: Self::default_memory_retention_secs(),
			observability: ObservabilityConfig::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_has_sane_values() {
		let config = EngineConfig::default();
		assert_eq!(config.janitor_interval(), Duration::from_secs(60));
		assert!(config.observability.enabled);
		let caps = config.rate_limiter_caps();
		assert_eq!(caps.len(), 3);
	}

	#[test]
	fn loads_yaml_with_partial_overrides() {
		let yaml = r#"
rate_limits:
  OPENAI:
    per_second: 1
    per_minute: 60
agents:
  PAPER_PROCESSOR:
    max_attempts: 5
"#;
		let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
		let openai = config.rate_limits.get(&Provider::Openai).unwrap();
		assert_eq!(openai.per_second, 1);
		let paper = config.agent_config(AgentKind::PaperProcessor);
		assert_eq!(paper.max_attempts, 5);
		assert_eq!(paper.failure_threshold, AgentConfigEntry::default_failure_threshold());
	}

	#[test]
	fn rejects_unknown_fields() {
		let yaml = "bogus_field: true";
		let result: Result<EngineConfig, _> = serde_yaml::from_str(yaml);
		assert!(result.is_err());
	}
}
