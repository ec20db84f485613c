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
	collections::HashMap,
	path::PathBuf,
	sync::Arc,
	time::{Duration, SystemTime},
};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
	error::{redb_error, EngineError, EngineResult},
	payload::{Fingerprint, Payload},
	provider::AgentKind,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
	pub key: String,
	pub data: Payload,
	pub created_at: SystemTime,
	pub updated_at: SystemTime,
	pub ttl: Option<Duration>,
}

impl MemoryEntry {
	fn is_stale(&self, now: SystemTime, older_than: Duration) -> bool {
		now.duration_since(self.updated_at).unwrap_or_default() >= older_than
	}
}

/// Keyed blob store backing both the result cache and the config cache.
/// Not transactional against `TaskStore`: cache misses never produce
/// incorrect results because the cache only ever stores successful, terminal
/// results.
#[async_trait]
pub trait MemoryStore: Send + Sync {
	async fn get(&self, key: &str) -> EngineResult<Option<Payload>>;
	async fn put(&self, key: &str, data: Payload) -> EngineResult<()>;
	async fn put_if_absent(&self, key: &str, data: Payload) -> EngineResult<bool>;
	async fn delete_by_prefix(&self, prefix: &str) -> EngineResult<usize>;
	async fn delete_stale(&self, older_than: Duration) -> EngineResult<usize>;
}

/// `agent_<kind>_cache_<fingerprint>` — the result-cache key.
pub fn result_cache_key(kind: AgentKind, fingerprint: Fingerprint) -> String {
	format!("agent_{kind}_cache_{fingerprint}")
}

/// `user_<uid>_agent_<kind>` — the config-cache key.
pub fn config_cache_key(user_id: &str, kind: AgentKind) -> String {
	format!("user_{user_id}_agent_{kind}")
}

/// Small, mutex-guarded, owns-its-data store, generalized from the teacher's
/// `SimpleMemory` (a `Vec<Message>` behind one lock) to a keyed blob store.
#[derive(Default)]
pub struct InMemoryMemoryStore {
	entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl InMemoryMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
	async fn get(&self, key: &str) -> EngineResult<Option<Payload>> {
		let entries = self.entries.lock().await;
		Ok(entries.get(key).map(|entry| entry.data.clone()))
	}

	async fn put(&self, key: &str, data: Payload) -> EngineResult<()> {
		let mut entries = self.entries.lock().await;
		let now = SystemTime::now();
		entries
			.entry(key.to_string())
			.and_modify(|entry| {
				entry.data = data.clone();
				entry.updated_at = now;
			})
			.or_insert_with(|| MemoryEntry {
				key: key.to_string(),
				data,
				created_at: now,
				updated_at: now,
				ttl: None,
			});
		Ok(())
	}

	async fn put_if_absent(&self, key: &str, data: Payload) -> EngineResult<bool> {
		let mut entries = self.entries.lock().await;
		if entries.contains_key(key) {
			return Ok(false);
		}
		let now = SystemTime::now();
		entries.insert(
			key.to_string(),
			MemoryEntry { key: key.to_string(), data, created_at: now, updated_at: now, ttl: None },
		);
		Ok(true)
	}

	async fn delete_by_prefix(&self, prefix: &str) -> EngineResult<usize> {
		let mut entries = self.entries.lock().await;
		let to_delete: Vec<String> =
			entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
		for key in &to_delete {
			entries.remove(key);
		}
		Ok(to_delete.len())
	}

	async fn delete_stale(&self, older_than: Duration) -> EngineResult<usize> {
		let mut entries = self.entries.lock().await;
		let now = SystemTime::now();
		let to_delete: Vec<String> = entries
			.values()
			.filter(|entry| entry.is_stale(now, older_than))
			.map(|entry| entry.key.clone())
			.collect();
		for key in &to_delete {
			entries.remove(key);
		}
		Ok(to_delete.len())
	}
}

const TABLE_MEMORY: TableDefinition<&str, &[u8]> = TableDefinition::new("engine_memory");

/// redb-backed durable `MemoryStore`, same reasoning as `RedbTaskStore`.
pub struct RedbMemoryStore {
	db: Arc<Database>,
}

impl RedbMemoryStore {
	pub fn open(dir_path: PathBuf) -> EngineResult<Self> {
		if !dir_path.exists() {
			std::fs::create_dir_all(&dir_path)
				.map_err(|e| EngineError::new(crate::error::EngineErrorKind::Internal, Arc::new(e.into())))?;
		}
		let db_path = dir_path.join("engine_memory.redb");
		let db = Database::create(db_path).map_err(redb_error)?;
		let write_txn = db.begin_write().map_err(redb_error)?;
		write_txn.open_table(TABLE_MEMORY).map_err(redb_error)?;
		write_txn.commit().map_err(redb_error)?;
		Ok(Self { db: Arc::new(db) })
	}

	fn read_entry(&self, key: &str) -> EngineResult<Option<MemoryEntry>> {
		let read_txn = self.db.begin_read().map_err(redb_error)?;
		let table = read_txn.open_table(TABLE_MEMORY).map_err(redb_error)?;
		match table.get(key).map_err(redb_error)? {
			Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
			None => Ok(None),
		}
	}

	fn write_entry(&self, entry: &MemoryEntry) -> EngineResult<()> {
		let write_txn = self.db.begin_write().map_err(redb_error)?;
		{
			let mut table = write_txn.open_table(TABLE_MEMORY).map_err(redb_error)?;
			let encoded = serde_json::to_vec(entry)?;
			table.insert(entry.key.as_str(), encoded.as_slice()).map_err(redb_error)?;
		}
		write_txn.commit().map_err(redb_error)?;
		Ok(())
	}
}

#[async_trait]
impl MemoryStore for RedbMemoryStore {
	async fn get(&self, key: &str) -> EngineResult<Option<Payload>> {
		Ok(self.read_entry(key)?.map(|entry| entry.data))
	}

	async fn put(&self, key: &str, data: Payload) -> EngineResult<()> {
		let now = SystemTime::now();
		let created_at = self.read_entry(key)?.map(|entry| entry.created_at).unwrap_or(now);
		self.write_entry(&MemoryEntry {
			key: key.to_string(),
			data,
			created_at,
			updated_at: now,
			ttl: None,
		})
	}

	async fn put_if_absent(&self, key: &str, data: Payload) -> EngineResult<bool> {
		if self.read_entry(key)?.is_some() {
			return Ok(false);
		}
		let now = SystemTime::now();
		self.write_entry(&MemoryEntry {
			key: key.to_string(),
			data,
			created_at: now,
			updated_at: now,
			ttl: None,
		})?;
		Ok(true)
	}

	async fn delete_by_prefix(&self, prefix: &str) -> EngineResult<usize> {
		let to_delete: Vec<String> = {
			let read_txn = self.db.begin_read().map_err(redb_error)?;
			let table = read_txn.open_table(TABLE_MEMORY).map_err(redb_error)?;
			let mut keys = Vec::new();
			for entry in table.iter().map_err(redb_error)? {
				let (key, _) = entry.map_err(redb_error)?;
				if key.value().starts_with(prefix) {
					keys.push(key.value().to_string());
				}
			}
			keys
		};
		let write_txn = self.db.begin_write().map_err(redb_error)?;
		{
			let mut table = write_txn.open_table(TABLE_MEMORY).map_err(redb_error)?;
			for key in &to_delete {
				table.remove(key.as_str()).map_err(redb_error)?;
			}
		}
		write_txn.commit().map_err(redb_error)?;
		Ok(to_delete.len())
	}

	async fn delete_stale(&self, older_than: Duration) -> EngineResult<usize> {
		let now = SystemTime::now();
		let to_delete: Vec<String> = {
			let read_txn = self.db.begin_read().map_err(redb_error)?;
			let table = read_txn.open_table(TABLE_MEMORY).map_err(redb_error)?;
			let mut keys = Vec::new();
			for entry in table.iter().map_err(redb_error)? {
				let (key, value) = entry.map_err(redb_error)?;
				let parsed: MemoryEntry = serde_json::from_slice(value.value())?;
				if parsed.is_stale(now, older_than) {
					keys.push(key.value().to_string());
				}
			}
			keys
		};
		let write_txn = self.db.begin_write().map_err(redb_error)?;
		{
			let mut table = write_txn.open_table(TABLE_MEMORY).map_err(redb_error)?;
			for key in &to_delete {
				table.remove(key.as_str()).map_err(redb_error)?;
			}
		}
		write_txn.commit().map_err(redb_error)?;
		Ok(to_delete.len())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn put_then_get_round_trips() {
		let store = InMemoryMemoryStore::new();
		store.put("k1", Payload::new(json!({"x": 1}))).await.unwrap();
		let got = store.get("k1").await.unwrap().unwrap();
		assert_eq!(got, Payload::new(json!({"x": 1})));
	}

	#[tokio::test]
	async fn put_if_absent_only_inserts_once() {
		let store = InMemoryMemoryStore::new();
		assert!(store.put_if_absent("k1", Payload::new(json!(1))).await.unwrap());
		assert!(!store.put_if_absent("k1", Payload::new(json!(2))).await.unwrap());
		assert_eq!(store.get("k1").await.unwrap().unwrap(), Payload::new(json!(1)));
	}

	#[tokio::test]
	async fn delete_by_prefix_removes_matching_keys_only() {
		let store = InMemoryMemoryStore::new();
		store.put("agent_X_cache_1", Payload::null()).await.unwrap();
		store.put("agent_X_cache_2", Payload::null()).await.unwrap();
		store.put("user_u1_agent_X", Payload::null()).await.unwrap();
		let deleted = store.delete_by_prefix("agent_X_cache_").await.unwrap();
		assert_eq!(deleted, 2);
		assert!(store.get("user_u1_agent_X").await.unwrap().is_some());
	}

	#[test]
	fn key_constructors_match_spec_format() {
		assert_eq!(
			result_cache_key(AgentKind::PaperProcessor, Fingerprint::of(&Payload::null())),
			format!("agent_PAPER_PROCESSOR_cache_{}", Fingerprint::of(&Payload::null()))
		);
		assert_eq!(config_cache_key("u1", AgentKind::PaperProcessor), "user_u1_agent_PAPER_PROCESSOR");
	}
}
