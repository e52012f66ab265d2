// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process publish/subscribe between pipeline components.
//!
//! Two channels share one bus: analytics events (tracker to sender and any
//! other sink) and section transitions (for collaborators that keep their own
//! section model). Delivery is synchronous and in publish order.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use trail_analytics_core::{EventRecord, Timestamp};

/// A move from one page section to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionTransition {
	pub from: Option<String>,
	pub to: String,
	pub timestamp: Timestamp,
}

pub trait EventSubscriber: Send + Sync {
	fn on_event(&self, event: &EventRecord);

	fn on_section_change(&self, _transition: &SectionTransition) {}
}

#[derive(Clone, Default)]
pub struct EventBus {
	subscribers: Arc<RwLock<Vec<Arc<dyn EventSubscriber>>>>,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
		self
			.subscribers
			.write()
			.unwrap_or_else(|e| e.into_inner())
			.push(subscriber);
	}

	pub fn subscriber_count(&self) -> usize {
		self.snapshot().len()
	}

	pub fn publish(&self, event: &EventRecord) {
		for subscriber in self.snapshot() {
			subscriber.on_event(event);
		}
	}

	pub fn announce_section_change(&self, transition: &SectionTransition) {
		for subscriber in self.snapshot() {
			subscriber.on_section_change(transition);
		}
	}

	// Subscribers may publish from inside a callback, so the lock is never
	// held while delivering.
	fn snapshot(&self) -> Vec<Arc<dyn EventSubscriber>> {
		self
			.subscribers
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}
}
