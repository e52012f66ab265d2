// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Deferred start until the visitor first interacts with the page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
	Interaction,
	TimedOut,
}

/// A one-shot latch opened by the first click, key press, scroll or touch.
#[derive(Debug, Default)]
pub struct InteractionGate {
	opened: AtomicBool,
	notify: Notify,
}

impl InteractionGate {
	pub fn new() -> Self {
		Self::default()
	}

	/// Opens the gate. Later calls are no-ops.
	pub fn open(&self) {
		if !self.opened.swap(true, Ordering::SeqCst) {
			debug!("first user interaction");
			self.notify.notify_waiters();
		}
	}

	pub fn is_open(&self) -> bool {
		self.opened.load(Ordering::SeqCst)
	}

	/// Waits for the gate to open, giving up after `timeout`.
	pub async fn wait(&self, timeout: Duration) -> GateOutcome {
		let notified = self.notify.notified();
		tokio::pin!(notified);
		notified.as_mut().enable();

		if self.is_open() {
			return GateOutcome::Interaction;
		}

		match tokio::time::timeout(timeout, notified).await {
			Ok(()) => GateOutcome::Interaction,
			Err(_) => {
				debug!(timeout_ms = timeout.as_millis() as u64, "no interaction, starting anyway");
				GateOutcome::TimedOut
			}
		}
	}
}
