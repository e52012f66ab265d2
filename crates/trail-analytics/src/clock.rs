// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wall-clock abstraction.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use trail_analytics_core::Timestamp;

/// Source of epoch-millisecond timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
	fn now_ms(&self) -> Timestamp;

	fn now(&self) -> DateTime<Utc> {
		Utc.timestamp_millis_opt(self.now_ms())
			.single()
			.unwrap_or_else(Utc::now)
	}
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> Timestamp {
		Utc::now().timestamp_millis()
	}

	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
	now: AtomicI64,
}

impl ManualClock {
	pub fn new(start_ms: Timestamp) -> Self {
		Self {
			now: AtomicI64::new(start_ms),
		}
	}

	pub fn advance(&self, by: Duration) {
		self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
	}

	pub fn advance_ms(&self, ms: i64) {
		self.now.fetch_add(ms, Ordering::SeqCst);
	}

	pub fn set(&self, now_ms: Timestamp) {
		self.now.store(now_ms, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> Timestamp {
		self.now.load(Ordering::SeqCst)
	}
}

/// Formats an epoch-ms timestamp as RFC 3339.
pub fn to_rfc3339(ms: Timestamp) -> String {
	Utc.timestamp_millis_opt(ms)
		.single()
		.map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn manual_clock_advances() {
		let clock = ManualClock::new(1_000);
		clock.advance(Duration::from_millis(250));
		clock.advance_ms(50);
		assert_eq!(clock.now_ms(), 1_300);
		clock.set(5);
		assert_eq!(clock.now_ms(), 5);
	}

	#[test]
	fn rfc3339_formats_millis_in_utc() {
		assert_eq!(to_rfc3339(0), "1970-01-01T00:00:00.000Z");
		assert_eq!(to_rfc3339(1_700_000_000_123), "2023-11-14T22:13:20.123Z");
	}
}
