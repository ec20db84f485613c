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

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engine::{CancelSignal, Provider, RateLimiter, RateLimiterConfig};

fn bench_acquire_under_capacity(c: &mut Criterion) {
	let runtime = tokio::runtime::Runtime::new().unwrap();
	let mut caps = HashMap::new();
	caps.insert(Provider::Openai, RateLimiterConfig { per_second: 1_000_000, per_minute: 1_000_000 });
	let limiter = RateLimiter::new(caps);
	let cancel = CancelSignal::new();

	c.bench_function("rate_limiter_acquire_uncontended", |b| {
		b.to_async(&runtime).iter(|| async {
			black_box(limiter.acquire(Provider::Openai, 1, &cancel).await.unwrap());
		});
	});
}

fn bench_acquire_status(c: &mut Criterion) {
	let runtime = tokio::runtime::Runtime::new().unwrap();
	let limiter = RateLimiter::with_default_caps();

	c.bench_function("rate_limiter_status", |b| {
		b.to_async(&runtime).iter(|| async {
			black_box(limiter.status(Provider::Openai).await);
		});
	});
}

criterion_group!(benches, bench_acquire_under_capacity, bench_acquire_status);
criterion_main!(benches);
