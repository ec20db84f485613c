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

use std::time::Duration;

use common::TerimateSignal;

use crate::error::{EngineError, EngineErrorKind};

/// Cooperative cancellation token propagated from a pipeline to its stages and
/// from a stage to its AgentRunner's suspension points (rate-limit acquire,
/// retry backoff, the agent invocation itself).
///
/// A pipeline cancel kills every descendant `CancelSignal`; a single stage
/// timing out kills only its own subtree, leaving siblings unaffected.
#[derive(Clone, Default)]
pub struct CancelSignal(TerimateSignal);

impl CancelSignal {
	pub fn new() -> Self {
		Self(TerimateSignal::default())
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.is_dead()
	}

	pub fn cancel(&self) {
		self.0.kill();
	}

	pub fn child(&self) -> CancelSignal {
		CancelSignal(self.0.child())
	}

	/// Returns `Err(CANCELLED)` if the signal has already fired.
	pub fn check(&self) -> Result<(), EngineError> {
		if self.is_cancelled() {
			return Err(EngineError::from_msg(EngineErrorKind::Cancelled, "cancelled"));
		}
		Ok(())
	}

	/// Sleeps for `duration`, returning early with `CANCELLED` if the signal
	/// fires during the sleep. Polls at a short interval since `TerimateSignal`
	/// has no native waker; good enough for the engine's suspension points,
	/// which are all bounded by retry/rate-limit delays in the tens of seconds.
	pub async fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
		const POLL: Duration = Duration::from_millis(5);
		let mut remaining = duration;
		loop {
			self.check()?;
			if remaining.is_zero() {
				return Ok(());
			}
			let step = remaining.min(POLL);
			tokio::time::sleep(step).await;
			remaining -= step;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn child_inherits_cancellation() {
		let parent = CancelSignal::new();
		let child = parent.child();
		assert!(!child.is_cancelled());
		parent.cancel();
		assert!(child.is_cancelled());
	}

	#[test]
	fn sibling_unaffected_by_sibling_cancellation() {
		let parent = CancelSignal::new();
		let a = parent.child();
		let b = parent.child();
		a.cancel();
		assert!(a.is_cancelled());
		assert!(!b.is_cancelled());
		assert!(!parent.is_cancelled());
	}

	#[tokio::test(start_paused = true)]
	async fn sleep_returns_cancelled_promptly() {
		let sig = CancelSignal::new();
		let sig2 = sig.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			sig2.cancel();
		});
		let result = sig.sleep(Duration::from_secs(10)).await;
		assert!(result.is_err());
	}
}
