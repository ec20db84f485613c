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
	collections::{HashMap, VecDeque},
	sync::Arc,
	time::Duration,
};

use common::metrics::{counter_vec, gauge_vec, IntCounterVec, IntGaugeVec};
use once_cell::sync::Lazy;
use tokio::{
	sync::{oneshot, Mutex},
	task::JoinHandle,
	time::Instant,
};

use crate::{
	cancel::CancelSignal,
	error::{EngineError, EngineErrorKind},
	provider::Provider,
};

const RECLAIM_TICK: Duration = Duration::from_millis(25);

/// Per-provider caps: `(per_second, per_minute)`.
#[derive(Clone, Copy, Debug)]
pub struct RateLimiterConfig {
	pub per_second: u32,
	pub per_minute: u32,
}

impl Default for RateLimiterConfig {
	/// The OPENAI defaults used by the source system; prefer
	/// [`RateLimiterConfig::for_provider`] when the provider is known.
	fn default() -> Self {
		Self { per_second: 3, per_minute: 200 }
	}
}

impl RateLimiterConfig {
	/// Per-provider configured caps (spec §4.1): OPENAI 3/s & 200/min,
	/// ANTHROPIC 5/s & 1000/min, PERPLEXITY 10/s & 600/min.
	pub fn for_provider(provider: Provider) -> Self {
		match provider {
			Provider::Openai => Self { per_second: 3, per_minute: 200 },
			Provider::Anthropic => Self { per_second: 5, per_minute: 1000 },
			Provider::Perplexity => Self { per_second: 10, per_minute: 600 },
		}
	}
}

/// Snapshot of a provider's [`RateWindow`].
#[derive(Clone, Copy, Debug)]
pub struct RateLimiterStatus {
	pub available_second: u32,
	pub available_minute: u32,
	pub queue_length: usize,
	pub requests_in_last_minute: u32,
	pub last_grant_at: Option<Instant>,
}

struct Waiter {
	permits: u32,
	cancel: CancelSignal,
	tx: Option<oneshot::Sender<()>>,
}

struct RateWindow {
	capacity_second: u32,
	capacity_minute: u32,
	available_second: u32,
	available_minute: u32,
	last_second_reset: Instant,
	last_minute_reset: Instant,
	queue: VecDeque<Waiter>,
	grants_last_minute: VecDeque<Instant>,
	last_grant_at: Option<Instant>,
}

impl RateWindow {
	fn new(caps: RateLimiterConfig, now: Instant) -> Self {
		Self {
			capacity_second: caps.per_second,
			capacity_minute: caps.per_minute,
			available_second: caps.per_second,
			available_minute: caps.per_minute,
			last_second_reset: now,
			last_minute_reset: now,
			queue: VecDeque::new(),
			grants_last_minute: VecDeque::new(),
			last_grant_at: None,
		}
	}

	fn replenish(&mut self, now: Instant) {
		if now.saturating_duration_since(self.last_second_reset) >= Duration::from_secs(1) {
			self.available_second = self.capacity_second;
			self.last_second_reset = now;
		}
		if now.saturating_duration_since(self.last_minute_reset) >= Duration::from_secs(60) {
			self.available_minute = self.capacity_minute;
			self.last_minute_reset = now;
		}
		while let Some(front) = self.grants_last_minute.front() {
			if now.saturating_duration_since(*front) >= Duration::from_secs(60) {
				self.grants_last_minute.pop_front();
			} else {
				break;
			}
		}
	}

	fn try_grant(&mut self, permits: u32, now: Instant) -> bool {
		if self.available_second >= permits && self.available_minute >= permits {
			self.available_second -= permits;
			self.available_minute -= permits;
			self.last_grant_at = Some(now);
			self.grants_last_minute.push_back(now);
			true
		} else {
			false
		}
	}

	fn drain_queue(&mut self, now: Instant) {
		loop {
			let Some(front) = self.queue.front() else { break };
			if front.cancel.is_cancelled() {
				self.queue.pop_front();
				continue;
			}
			if self.try_grant(front.permits, now) {
				let mut waiter = self.queue.pop_front().expect("front checked above");
				if let Some(tx) = waiter.tx.take() {
					let _ = tx.send(());
				}
			} else {
				// FIFO: once the head cannot be granted, stop — granting a later,
				// smaller request would jump the queue.
				break;
			}
		}
	}

	fn status(&self) -> RateLimiterStatus {
		RateLimiterStatus {
			available_second: self.available_second,
			available_minute: self.available_minute,
			queue_length: self.queue.len(),
			requests_in_last_minute: self.grants_last_minute.len() as u32,
			last_grant_at: self.last_grant_at,
		}
	}

	fn reset(&mut self, now: Instant) {
		self.available_second = self.capacity_second;
		self.available_minute = self.capacity_minute;
		self.last_second_reset = now;
		self.last_minute_reset = now;
		self.grants_last_minute.clear();
		for mut waiter in self.queue.drain(..) {
			drop(waiter.tx.take());
		}
	}
}

struct Metrics {
	available: IntGaugeVec<1>,
	queue_depth: IntGaugeVec<1>,
	grants_total: IntCounterVec<1>,
	cancellations_total: IntCounterVec<1>,
}

/// Registered with the global Prometheus registry exactly once per process,
/// regardless of how many `RateLimiter`s are constructed (every test and every
/// config reload builds a fresh one).
static METRICS: Lazy<Metrics> = Lazy::new(|| Metrics {
	available: gauge_vec(
		"rate_limiter_available_permits",
		"permits currently available",
		"engine",
		"rate_limiter",
		&[],
		["provider"],
	),
	queue_depth: gauge_vec(
		"rate_limiter_queue_depth",
		"waiters queued for a permit",
		"engine",
		"rate_limiter",
		&[],
		["provider"],
	),
	grants_total: counter_vec(
		"rate_limiter_grants_total",
		"permits granted",
		"engine",
		"rate_limiter",
		&[],
		["provider"],
	),
	cancellations_total: counter_vec(
		"rate_limiter_cancellations_total",
		"waiters removed from the queue by cancellation",
		"engine",
		"rate_limiter",
		&[],
		["provider"],
	),
});

/// Dual-window (per-second, per-minute) admission control, one per Provider.
/// Fixed-window replenishment, FIFO queued acquisition, cancellable waiters.
pub struct RateLimiter {
	windows: Arc<HashMap<Provider, Mutex<RateWindow>>>,
	reclaimer: JoinHandle<()>,
}

impl RateLimiter {
	pub fn new(caps: HashMap<Provider, RateLimiterConfig>) -> Self {
		let now = Instant::now();
		let windows: HashMap<Provider, Mutex<RateWindow>> = caps
			.into_iter()
			.map(|(provider, cfg)| (provider, Mutex::new(RateWindow::new(cfg, now))))
			.collect();
		let windows = Arc::new(windows);
		Lazy::force(&METRICS);
		let reclaimer = tokio::spawn(reclaim_loop(windows.clone()));
		Self { windows, reclaimer }
	}

	/// Per spec §6 default caps: OPENAI 3/s & 200/min, ANTHROPIC 5/s & 1000/min,
	/// PERPLEXITY 10/s & 600/min.
	pub fn with_default_caps() -> Self {
		let caps = Provider::ALL.into_iter().map(|p| (p, RateLimiterConfig::for_provider(p))).collect();
		Self::new(caps)
	}

	fn window(&self, provider: Provider) -> &Mutex<RateWindow> {
		self.windows.get(&provider).unwrap_or_else(|| {
			panic!("no rate limiter configuration registered for provider {provider}")
		})
	}

	/// Completes when `permits` have been granted on `provider`, or fails with
	/// CANCELLED if `cancel` fires first.
	pub async fn acquire(
		&self,
		provider: Provider,
		permits: u32,
		cancel: &CancelSignal,
	) -> Result<(), EngineError> {
		cancel.check()?;
		let label = provider.to_string();
		let rx = {
			let mut window = self.window(provider).lock().await;
			let now = Instant::now();
			window.replenish(now);
			if window.queue.is_empty() && window.try_grant(permits, now) {
				METRICS.grants_total.with_label_values([label.as_str()]).inc();
				self.refresh_gauges(&label, &window);
				return Ok(());
			}
			let (tx, rx) = oneshot::channel();
			window.queue.push_back(Waiter { permits, cancel: cancel.clone(), tx: Some(tx) });
			self.refresh_gauges(&label, &window);
			rx
		};
		match rx.await {
			Ok(()) => {
				METRICS.grants_total.with_label_values([label.as_str()]).inc();
				Ok(())
			},
			Err(_) => {
				METRICS.cancellations_total.with_label_values([label.as_str()]).inc();
				Err(EngineError::from_msg(EngineErrorKind::Cancelled, "acquire cancelled"))
			},
		}
	}

	fn refresh_gauges(&self, label: &str, window: &RateWindow) {
		METRICS
			.available
			.with_label_values([label])
			.set(window.available_second.min(window.available_minute) as i64);
		METRICS.queue_depth.with_label_values([label]).set(window.queue.len() as i64);
	}

	pub async fn status(&self, provider: Provider) -> RateLimiterStatus {
		let mut window = self.window(provider).lock().await;
		window.replenish(Instant::now());
		window.status()
	}

	/// Restores one provider's window to full capacity, or every provider's if
	/// `provider` is `None`, draining queued waiters with CANCELLED.
	pub async fn reset(&self, provider: Option<Provider>) {
		let now = Instant::now();
		match provider {
			Some(provider) => {
				self.window(provider).lock().await.reset(now);
			},
			None => {
				for window in self.windows.values() {
					window.lock().await.reset(now);
				}
			},
		}
	}
}

impl Drop for RateLimiter {
	fn drop(&mut self) {
		self.reclaimer.abort();
	}
}

async fn reclaim_loop(windows: Arc<HashMap<Provider, Mutex<RateWindow>>>) {
	let mut ticker = tokio::time::interval(RECLAIM_TICK);
	loop {
		ticker.tick().await;
		let now = Instant::now();
		for window in windows.values() {
			let mut window = window.lock().await;
			window.replenish(now);
			window.drain_queue(now);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration as StdDuration;

	use super::*;

	fn caps(per_second: u32, per_minute: u32) -> HashMap<Provider, RateLimiterConfig> {
		let mut m = HashMap::new();
		m.insert(Provider::Openai, RateLimiterConfig { per_second, per_minute });
		m
	}

	#[tokio::test(start_paused = true)]
	async fn grants_immediately_within_capacity() {
		let limiter = RateLimiter::new(caps(3, 200));
		let cancel = CancelSignal::new();
		for _ in 0..3 {
			limiter.acquire(Provider::Openai, 1, &cancel).await.unwrap();
		}
		let status = limiter.status(Provider::Openai).await;
		assert_eq!(status.available_second, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn queues_and_replenishes_fifo() {
		let limiter = Arc::new(RateLimiter::new(caps(1, 60)));
		let cancel = CancelSignal::new();
		limiter.acquire(Provider::Openai, 1, &cancel).await.unwrap();

		let order = Arc::new(Mutex::new(Vec::new()));
		let mut handles = Vec::new();
		for i in 0..3 {
			let limiter = limiter.clone();
			let cancel = cancel.clone();
			let order = order.clone();
			handles.push(tokio::spawn(async move {
				limiter.acquire(Provider::Openai, 1, &cancel).await.unwrap();
				order.lock().await.push(i);
			}));
		}
		for _ in 0..3 {
			tokio::time::advance(StdDuration::from_millis(1100)).await;
		}
		for h in handles {
			h.await.unwrap();
		}
		assert_eq!(*order.lock().await, vec![0, 1, 2]);
	}

	#[tokio::test(start_paused = true)]
	async fn cancelled_waiter_is_removed_from_queue() {
		let limiter = Arc::new(RateLimiter::new(caps(1, 60)));
		let cancel = CancelSignal::new();
		limiter.acquire(Provider::Openai, 1, &cancel).await.unwrap();

		let waiter_cancel = CancelSignal::new();
		let limiter2 = limiter.clone();
		let waiter_cancel2 = waiter_cancel.clone();
		let handle =
			tokio::spawn(async move { limiter2.acquire(Provider::Openai, 1, &waiter_cancel2).await });
		tokio::time::advance(StdDuration::from_millis(50)).await;
		waiter_cancel.cancel();
		tokio::time::advance(StdDuration::from_millis(50)).await;
		let result = handle.await.unwrap();
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn reset_restores_capacity_and_drains_queue() {
		let limiter = RateLimiter::new(caps(1, 60));
		let cancel = CancelSignal::new();
		limiter.acquire(Provider::Openai, 1, &cancel).await.unwrap();
		limiter.reset(Some(Provider::Openai)).await;
		let status = limiter.status(Provider::Openai).await;
		assert_eq!(status.available_second, 1);
		assert_eq!(status.queue_length, 0);
	}
}
