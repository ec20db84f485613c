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

use std::{fmt::Debug, future::Future, time::Duration};

use common::{RetryParams, Retryable};
use tracing::debug;

use crate::{
	cancel::CancelSignal,
	error::{EngineError, EngineErrorKind},
};

/// Bounded exponential-backoff retry policy, wrapping [`common::retry::RetryParams`]
/// with the extra fields this spec names explicitly (the underlying formula and
/// defaults are unchanged).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
	pub params: RetryParams,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			params: RetryParams {
				base_delay: Duration::from_millis(10),
				max_delay: Duration::from_secs(20),
				max_attempts: 3,
			},
		}
	}
}

impl RetryPolicy {
	pub fn new(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
		Self { params: RetryParams { base_delay: initial_delay, max_delay, max_attempts } }
	}

	#[cfg(any(test, feature = "testsuite"))]
	pub fn for_test() -> Self {
		Self { params: RetryParams::for_test() }
	}
}

/// Outcome of a single attempt at `executeWithRetry`'s `op`, reported back to
/// the caller so `AgentRunner` can record `attempts` on the `AgentTask`.
pub struct RetryOutcome<T> {
	pub value: T,
	pub attempts: usize,
}

/// Re-executes `op` on retriable failure with exponential backoff and full
/// jitter (`common::retry::RetryParams::compute_delay`), honoring `cancel`
/// during the backoff sleep. A non-retriable failure or cancellation
/// short-circuits immediately.
pub async fn execute_with_retry<T, E, F, Fut>(
	policy: &RetryPolicy,
	cancel: &CancelSignal,
	op: F,
) -> Result<RetryOutcome<T>, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: Retryable + Debug + From<EngineError>,
{
	execute_with_retry_using(policy, cancel, E::is_retryable, op).await
}

/// Same as [`execute_with_retry`], but the retriability of a failure is
/// decided by the caller-supplied `is_retryable` predicate instead of `E`'s
/// own [`Retryable`] impl — this is how `AgentRunner` honors a registered
/// agent's `AgentCapability::retriable` override (spec §4.6/§7: "AgentRunner
/// converts provider errors into the kinds above via the registered
/// `retriable` predicate").
pub async fn execute_with_retry_using<T, E, F, Fut>(
	policy: &RetryPolicy,
	cancel: &CancelSignal,
	is_retryable: impl Fn(&E) -> bool,
	mut op: F,
) -> Result<RetryOutcome<T>, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: Debug + From<EngineError>,
{
	let mut attempts = 0usize;
	loop {
		if cancel.is_cancelled() {
			return Err(EngineError::from_msg(EngineErrorKind::Cancelled, "cancelled before attempt").into());
		}
		attempts += 1;
		let result = op().await;
		let error = match result {
			Ok(value) => return Ok(RetryOutcome { value, attempts }),
			Err(error) => error,
		};
		if !is_retryable(&error) || attempts >= policy.params.max_attempts {
			return Err(error);
		}
		let delay = policy.params.compute_delay(attempts);
		debug!(attempts, delay_ms = %delay.as_millis(), "agent call failed, retrying");
		if cancel.sleep(delay).await.is_err() {
			return Err(
				EngineError::from_msg(EngineErrorKind::Cancelled, "cancelled during backoff").into(),
			);
		}
	}
}
