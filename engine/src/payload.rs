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

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use siphasher::sip128::{Hash128, Hasher128, SipHasher13};

/// Opaque structured value carried through the engine as `input`/`result`/`data`.
/// The engine never inspects the interior; it only serializes, hashes and stores it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
	pub fn new(value: Value) -> Self {
		Self(value)
	}

	pub fn null() -> Self {
		Self(Value::Null)
	}

	pub fn into_inner(self) -> Value {
		self.0
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		canonical_json(&self.0).into_bytes()
	}
}

impl From<Value> for Payload {
	fn from(value: Value) -> Self {
		Self(value)
	}
}

/// A deterministic digest of a [`Payload`], used as the result-cache key and the
/// coalescing key. Two semantically equal payloads always hash identically,
/// regardless of object field order.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Fingerprint(u128);

impl Fingerprint {
	pub fn of(payload: &Payload) -> Self {
		let canonical = canonical_json(&payload.0);
		let mut hasher = SipHasher13::new_with_keys(0xf00d_cafe_0000_0001, 0xf00d_cafe_0000_0002);
		std::hash::Hash::hash(&canonical, &mut hasher);
		let Hash128 { h1, h2 } = hasher.finish128();
		Self(((h1 as u128) << 64) | h2 as u128)
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:032x}", self.0)
	}
}

impl fmt::Debug for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Fingerprint({self})")
	}
}

/// Serializes a `Value` with object keys sorted, so field order in the source
/// document never changes the digest.
fn canonical_json(value: &Value) -> String {
	let sorted = sort_keys(value);
	serde_json::to_string(&sorted).expect("serializing a Value never fails")
}

fn sort_keys(value: &Value) -> Value {
	match value {
		Value::Object(map) => {
			let mut entries: Vec<(&String, &Value)> = map.iter().collect();
			entries.sort_by(|(a, _), (b, _)| a.cmp(b));
			let mut sorted = serde_json::Map::new();
			for (k, v) in entries {
				sorted.insert(k.clone(), sort_keys(v));
			}
			Value::Object(sorted)
		},
		Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
		other => other.clone(),
	}
}
