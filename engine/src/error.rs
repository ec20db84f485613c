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

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use common::Retryable;

/// Error kinds an agent invocation, task transition, or pipeline run can fail with.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EngineErrorKind {
	/// Transport or 5xx-class failure from the provider. Retriable.
	TransientProvider,
	/// Provider-side throttling. Retriable after backoff.
	RateLimitedExternal,
	/// The stage exceeded its deadline.
	Timeout,
	/// Admission refused by the circuit breaker.
	BreakerOpen,
	/// The agent validated and rejected its input.
	InvalidInput,
	/// Cooperative abort.
	Cancelled,
	/// A non-terminal transition was attempted on a terminal TaskStore row.
	StateViolation,
	/// Engine bug; terminal for the whole pipeline.
	Internal,
}

/// Generic EngineError.
#[derive(Debug, Clone, Error)]
#[error("engine error(kind={kind:?}, source={source})")]
#[allow(missing_docs)]
pub struct EngineError {
	pub kind: EngineErrorKind,
	#[source]
	pub source: Arc<anyhow::Error>,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
	pub fn new(kind: EngineErrorKind, source: Arc<anyhow::Error>) -> Self {
		EngineError { kind, source }
	}

	pub fn from_msg<C>(kind: EngineErrorKind, msg: C) -> Self
	where
		C: fmt::Display,
	{
		EngineError { kind, source: Arc::new(anyhow::anyhow!("{msg}")) }
	}

	/// Adds some context to the wrapped error.
	pub fn add_context<C>(self, ctx: C) -> Self
	where
		C: fmt::Display + Send + Sync + 'static,
	{
		EngineError {
			kind: self.kind,
			source: Arc::new(anyhow::anyhow!("{ctx}").context(self.source)),
		}
	}

	pub fn kind(&self) -> EngineErrorKind {
		self.kind
	}
}

impl Retryable for EngineError {
	fn is_retryable(&self) -> bool {
		matches!(self.kind, EngineErrorKind::TransientProvider | EngineErrorKind::RateLimitedExternal)
	}
}

/// Wraps any redb error (`DatabaseError`, `TransactionError`, `TableError`,
/// `StorageError`, `CommitError`, ...) as INTERNAL. redb's error types are
/// distinct per call site, so call sites convert explicitly with this helper
/// rather than relying on blanket `From` impls, following the teacher's own
/// `StorageError`-construction style in `storage::metastore::MetaStore`.
pub fn redb_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> EngineError {
	EngineError::new(EngineErrorKind::Internal, Arc::new(anyhow::Error::from(err)))
}

impl From<serde_json::Error> for EngineError {
	fn from(err: serde_json::Error) -> EngineError {
		EngineError::new(EngineErrorKind::Internal, Arc::new(err.into()))
	}
}
