// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable string-keyed storage.
//!
//! Mirrors the semantics of browser `localStorage`: synchronous, origin-scoped,
//! string values, JSON for anything structured.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::StorageError;

pub trait KeyValueStore: Send + Sync {
	fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
	fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
	fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Reads `key` and decodes it as JSON.
pub fn read_json<T: DeserializeOwned>(
	store: &dyn KeyValueStore,
	key: &str,
) -> Result<Option<T>, StorageError> {
	match store.get(key)? {
		Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
		None => Ok(None),
	}
}

/// Encodes `value` as JSON and writes it under `key`.
pub fn write_json<T: Serialize + ?Sized>(
	store: &dyn KeyValueStore,
	key: &str,
	value: &T,
) -> Result<(), StorageError> {
	let raw = serde_json::to_string(value)?;
	store.set(key, &raw)
}

/// In-process store, optionally with a byte quota across all values.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<BTreeMap<String, String>>,
	quota: Option<usize>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_quota(quota: usize) -> Self {
		Self {
			entries: Mutex::new(BTreeMap::new()),
			quota: Some(quota),
		}
	}

	fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
		self.entries.lock().unwrap_or_else(|e| e.into_inner())
	}
}

impl KeyValueStore for MemoryStore {
	fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
		Ok(self.entries().get(key).cloned())
	}

	fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
		let mut entries = self.entries();
		if let Some(quota) = self.quota {
			let others: usize = entries
				.iter()
				.filter(|(k, _)| k.as_str() != key)
				.map(|(k, v)| k.len() + v.len())
				.sum();
			let size = key.len() + value.len();
			if others + size > quota {
				return Err(StorageError::QuotaExceeded {
					key: key.to_string(),
					size,
				});
			}
		}
		entries.insert(key.to_string(), value.to_string());
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), StorageError> {
		self.entries().remove(key);
		Ok(())
	}
}

/// A store persisted as one JSON document, rewritten atomically on change.
pub struct FileStore {
	path: PathBuf,
	entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
	/// Opens (or creates) a store at `path`.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
		let path = path.into();
		let entries = if path.exists() {
			let contents = std::fs::read_to_string(&path)?;
			serde_json::from_str(&contents)?
		} else {
			debug!(path = %path.display(), "storage file not found, starting empty");
			BTreeMap::new()
		};

		Ok(Self {
			path,
			entries: Mutex::new(entries),
		})
	}

	/// Opens the store under the XDG state directory.
	pub fn from_xdg() -> Result<Self, StorageError> {
		let state_dir = dirs::state_dir()
			.or_else(|| dirs::data_dir().map(|d| d.join("state")))
			.ok_or(StorageError::StateDirNotFound)?;

		let dir = state_dir.join("trail");
		std::fs::create_dir_all(&dir)?;

		info!(dir = %dir.display(), "initialized analytics storage");

		Self::open(dir.join("storage.json"))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}

		let tmp_path = self.path.with_extension("json.tmp");
		let json = serde_json::to_string_pretty(entries)?;

		std::fs::write(&tmp_path, &json)?;
		std::fs::rename(&tmp_path, &self.path)?;

		debug!(path = %self.path.display(), keys = entries.len(), "saved analytics storage");
		Ok(())
	}

	fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
		self.entries.lock().unwrap_or_else(|e| e.into_inner())
	}
}

impl KeyValueStore for FileStore {
	fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
		Ok(self.entries().get(key).cloned())
	}

	fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
		let mut entries = self.entries();
		let previous = entries.insert(key.to_string(), value.to_string());
		if let Err(e) = self.persist(&entries) {
			match previous {
				Some(prev) => entries.insert(key.to_string(), prev),
				None => entries.remove(key),
			};
			return Err(e);
		}
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), StorageError> {
		let mut entries = self.entries();
		if entries.remove(key).is_some() {
			self.persist(&entries)?;
		}
		Ok(())
	}
}
