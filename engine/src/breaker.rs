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

use std::{collections::HashMap, future::Future, time::Duration};

use tokio::{sync::Mutex, time::Instant};

use crate::{
	error::{EngineError, EngineErrorKind},
	provider::AgentKind,
};

/// CLOSED/OPEN/HALF_OPEN state, one machine per `AgentKind`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerPhase {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerSnapshot {
	pub phase: BreakerPhase,
	pub failure_count: u32,
	pub success_count: u32,
	pub opened_at: Option<Instant>,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
	pub failure_threshold: u32,
	pub open_duration: Duration,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		Self { failure_threshold: 5, open_duration: Duration::from_secs(30) }
	}
}

struct BreakerMachine {
	config: BreakerConfig,
	phase: BreakerPhase,
	failure_count: u32,
	success_count: u32,
	opened_at: Option<Instant>,
}

impl BreakerMachine {
	fn new(config: BreakerConfig) -> Self {
		Self {
			config,
			phase: BreakerPhase::Closed,
			failure_count: 0,
			success_count: 0,
			opened_at: None,
		}
	}

	fn snapshot(&self) -> BreakerSnapshot {
		BreakerSnapshot {
			phase: self.phase,
			failure_count: self.failure_count,
			success_count: self.success_count,
			opened_at: self.opened_at,
		}
	}

	/// Returns `true` if a call should be admitted, transitioning OPEN→HALF_OPEN
	/// when `open_duration` has elapsed since `opened_at`.
	fn admit(&mut self, now: Instant) -> bool {
		match self.phase {
			BreakerPhase::Closed => true,
			BreakerPhase::Open => {
				let opened_at = self.opened_at.expect("OPEN implies opened_at is set");
				if now.saturating_duration_since(opened_at) >= self.config.open_duration {
					self.phase = BreakerPhase::HalfOpen;
					true
				} else {
					false
				}
			},
			BreakerPhase::HalfOpen => false,
		}
	}

	fn record_success(&mut self) {
		match self.phase {
			BreakerPhase::Closed => {
				self.failure_count = 0;
			},
			BreakerPhase::HalfOpen => {
				self.phase = BreakerPhase::Closed;
				self.failure_count = 0;
				self.success_count += 1;
				self.opened_at = None;
			},
			BreakerPhase::Open => {},
		}
	}

	fn record_failure(&mut self, now: Instant) {
		match self.phase {
			BreakerPhase::Closed => {
				self.failure_count += 1;
				if self.failure_count >= self.config.failure_threshold {
					self.phase = BreakerPhase::Open;
					self.opened_at = Some(now);
				}
			},
			BreakerPhase::HalfOpen => {
				self.phase = BreakerPhase::Open;
				self.opened_at = Some(now);
			},
			BreakerPhase::Open => {},
		}
	}
}

/// Per-agent-kind failure isolation. CLOSED counts consecutive failures; at
/// `failure_threshold` it trips to OPEN for `open_duration`, after which the
/// next call becomes a single HALF_OPEN probe.
pub struct CircuitBreaker {
	machines: Mutex<HashMap<AgentKind, BreakerMachine>>,
	default_config: BreakerConfig,
}

impl CircuitBreaker {
	pub fn new(default_config: BreakerConfig) -> Self {
		Self { machines: Mutex::new(HashMap::new()), default_config }
	}

	pub fn with_per_kind_config(configs: HashMap<AgentKind, BreakerConfig>) -> Self {
		let machines =
			configs.into_iter().map(|(kind, cfg)| (kind, BreakerMachine::new(cfg))).collect();
		Self { machines: Mutex::new(machines), default_config: BreakerConfig::default() }
	}

	/// Returns `true` if a call on `kind` should be admitted right now,
	/// transitioning OPEN→HALF_OPEN when `open_duration` has elapsed.
	pub async fn admit(&self, kind: AgentKind) -> bool {
		let mut machines = self.machines.lock().await;
		let machine =
			machines.entry(kind).or_insert_with(|| BreakerMachine::new(self.default_config));
		machine.admit(Instant::now())
	}

	/// Runs `op` if admitted; records the outcome. Returns `BREAKER_OPEN`
	/// without invoking `op` if the breaker is tripped.
	pub async fn execute_with_breaker<T, E, F, Fut>(
		&self,
		kind: AgentKind,
		op: F,
	) -> Result<T, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: From<EngineError>,
	{
		if !self.admit(kind).await {
			return Err(EngineError::from_msg(EngineErrorKind::BreakerOpen, "breaker open").into());
		}
		match op().await {
			Ok(value) => {
				self.record_success(kind).await;
				Ok(value)
			},
			Err(error) => {
				self.record_failure(kind).await;
				Err(error)
			},
		}
	}

	pub async fn record_success(&self, kind: AgentKind) {
		let mut machines = self.machines.lock().await;
		machines.entry(kind).or_insert_with(|| BreakerMachine::new(self.default_config)).record_success();
	}

	pub async fn record_failure(&self, kind: AgentKind) {
		let mut machines = self.machines.lock().await;
		machines
			.entry(kind)
			.or_insert_with(|| BreakerMachine::new(self.default_config))
			.record_failure(Instant::now());
	}

	pub async fn state(&self, kind: AgentKind) -> BreakerSnapshot {
		let mut machines = self.machines.lock().await;
		machines.entry(kind).or_insert_with(|| BreakerMachine::new(self.default_config)).snapshot()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fast_config() -> BreakerConfig {
		BreakerConfig { failure_threshold: 3, open_duration: Duration::from_millis(50) }
	}

	#[tokio::test]
	async fn trips_after_threshold_consecutive_failures() {
		let breaker = CircuitBreaker::new(fast_config());
		for _ in 0..3 {
			breaker.record_failure(AgentKind::PaperProcessor).await;
		}
		assert_eq!(breaker.state(AgentKind::PaperProcessor).await.phase, BreakerPhase::Open);
	}

	#[tokio::test]
	async fn success_resets_failure_count_while_closed() {
		let breaker = CircuitBreaker::new(fast_config());
		breaker.record_failure(AgentKind::PaperProcessor).await;
		breaker.record_failure(AgentKind::PaperProcessor).await;
		breaker.record_success(AgentKind::PaperProcessor).await;
		assert_eq!(breaker.state(AgentKind::PaperProcessor).await.failure_count, 0);
		assert_eq!(breaker.state(AgentKind::PaperProcessor).await.phase, BreakerPhase::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_probe_success_closes_and_failure_reopens() {
		let breaker = CircuitBreaker::new(fast_config());
		for _ in 0..3 {
			breaker.record_failure(AgentKind::PaperProcessor).await;
		}
		tokio::time::advance(Duration::from_millis(60)).await;

		let result: Result<(), EngineError> = breaker
			.execute_with_breaker(AgentKind::PaperProcessor, || async { Ok(()) })
			.await;
		assert!(result.is_ok());
		assert_eq!(breaker.state(AgentKind::PaperProcessor).await.phase, BreakerPhase::Closed);

		for _ in 0..3 {
			breaker.record_failure(AgentKind::PaperProcessor).await;
		}
		tokio::time::advance(Duration::from_millis(60)).await;
		let result: Result<(), EngineError> = breaker
			.execute_with_breaker(AgentKind::PaperProcessor, || async {
				Err(EngineError::from_msg(EngineErrorKind::TransientProvider, "boom"))
			})
			.await;
		assert!(result.is_err());
		assert_eq!(breaker.state(AgentKind::PaperProcessor).await.phase, BreakerPhase::Open);
	}

	#[tokio::test]
	async fn open_breaker_short_circuits_without_invoking_op() {
		let breaker = CircuitBreaker::new(fast_config());
		for _ in 0..3 {
			breaker.record_failure(AgentKind::PaperProcessor).await;
		}
		let mut invoked = false;
		let result: Result<(), EngineError> = breaker
			.execute_with_breaker(AgentKind::PaperProcessor, || async {
				invoked = true;
				Ok(())
			})
			.await;
		assert!(!invoked);
		assert_eq!(result.unwrap_err().kind(), EngineErrorKind::BreakerOpen);
	}
}
