// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded durable queue of undelivered events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use trail_analytics_core::{EnrichedEvent, EventId};

use crate::error::StorageError;
use crate::storage::{read_json, write_json, KeyValueStore};

/// Events that could not be delivered, kept across page loads.
///
/// Appending beyond `capacity` drops the oldest events first.
#[derive(Clone)]
pub struct OfflineStore {
	store: Arc<dyn KeyValueStore>,
	key: String,
	capacity: usize,
	write_lock: Arc<Mutex<()>>,
}

impl OfflineStore {
	pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, capacity: usize) -> Self {
		Self {
			store,
			key: key.into(),
			capacity,
			write_lock: Arc::new(Mutex::new(())),
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn load(&self) -> Result<Vec<EnrichedEvent>, StorageError> {
		Ok(read_json(self.store.as_ref(), &self.key)?.unwrap_or_default())
	}

	/// Appends `events` and returns how many events are stored afterwards.
	pub fn append(&self, events: &[EnrichedEvent]) -> Result<usize, StorageError> {
		let _guard = self.write_guard();
		let mut stored = self.load()?;
		stored.extend_from_slice(events);

		if stored.len() > self.capacity {
			let overflow = stored.len() - self.capacity;
			stored.drain(..overflow);
			debug!(dropped = overflow, "offline store full, dropped oldest events");
		}

		write_json(self.store.as_ref(), &self.key, &stored)?;
		Ok(stored.len())
	}

	pub fn clear(&self) -> Result<(), StorageError> {
		let _guard = self.write_guard();
		self.store.remove(&self.key)
	}

	/// Removes `delivered` and keeps anything appended since they were loaded.
	/// Returns how many events remain.
	pub fn remove_delivered(&self, delivered: &[EnrichedEvent]) -> Result<usize, StorageError> {
		let _guard = self.write_guard();
		let ids: HashSet<EventId> = delivered.iter().map(|e| e.event_id).collect();
		let mut stored = self.load()?;
		stored.retain(|e| !ids.contains(&e.event_id));

		if stored.is_empty() {
			self.store.remove(&self.key)?;
		} else {
			write_json(self.store.as_ref(), &self.key, &stored)?;
		}
		Ok(stored.len())
	}

	fn write_guard(&self) -> MutexGuard<'_, ()> {
		self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn len(&self) -> usize {
		self.load().map(|events| events.len()).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::MemoryStore;
	use crate::test_support::custom_event;
	use proptest::prelude::*;

	fn offline(capacity: usize) -> OfflineStore {
		OfflineStore::new(Arc::new(MemoryStore::new()), "analytics_offline_data", capacity)
	}

	fn names(events: &[EnrichedEvent]) -> Vec<String> {
		events
			.iter()
			.map(|e| match &e.record.kind {
				trail_analytics_core::EventKind::Custom { event_name, .. } => event_name.clone(),
				other => other.name().to_string(),
			})
			.collect()
	}

	#[test]
	fn append_and_clear() {
		let store = offline(10);
		assert!(store.is_empty());
		assert_eq!(store.append(&[custom_event("a"), custom_event("b")]).unwrap(), 2);
		assert_eq!(store.append(&[custom_event("c")]).unwrap(), 3);
		assert_eq!(names(&store.load().unwrap()), vec!["a", "b", "c"]);

		store.clear().unwrap();
		assert!(store.is_empty());
	}

	#[test]
	fn remove_delivered_keeps_later_appends() {
		let store = offline(10);
		store.append(&[custom_event("a"), custom_event("b")]).unwrap();
		let drained = store.load().unwrap();
		store.append(&[custom_event("c")]).unwrap();

		assert_eq!(store.remove_delivered(&drained).unwrap(), 1);
		assert_eq!(names(&store.load().unwrap()), vec!["c"]);

		let rest = store.load().unwrap();
		assert_eq!(store.remove_delivered(&rest).unwrap(), 0);
		assert!(store.is_empty());
	}

	#[test]
	fn append_surfaces_storage_failures() {
		let store = OfflineStore::new(Arc::new(MemoryStore::with_quota(8)), "offline", 10);
		assert!(matches!(
			store.append(&[custom_event("a")]),
			Err(StorageError::QuotaExceeded { .. })
		));
	}

	proptest! {
		#[test]
		fn retains_most_recent_capacity_events(capacity in 1usize..20, extra in 0usize..20) {
			let store = offline(capacity);
			let total = capacity + extra;
			let events: Vec<_> = (0..total).map(|i| custom_event(&format!("e{i}"))).collect();

			for chunk in events.chunks(3) {
				store.append(chunk).unwrap();
			}

			let kept = names(&store.load().unwrap());
			let expected: Vec<String> = (extra..total).map(|i| format!("e{i}")).collect();
			prop_assert_eq!(kept, expected);
		}
	}
}
