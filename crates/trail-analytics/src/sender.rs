// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event buffering and delivery.
//!
//! The sender enriches every event it receives, buffers it, and ships batches
//! through a [`Transport`]. A background loop flushes on a fixed interval and
//! whenever the buffer fills or a critical event arrives. Failed batches are
//! retried with exponential backoff and then demoted to the [`OfflineStore`],
//! which is drained once delivery works again.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use trail_analytics_core::{
	AnalyticsConfig, BatchMetadata, BatchPayload, BeaconPayload, Capabilities, Capability,
	EnrichedEvent, EventId, EventRecord, MemoryInfo, PageContext, PageInfo, PerformanceSnapshot,
	SessionId, SessionInfo, Timestamp, UserInfo, Viewport,
};
use trail_common_http::{backoff_delay, RetryConfig};

use crate::bus::EventSubscriber;
use crate::clock::SharedClock;
use crate::error::AnalyticsError;
use crate::offline::OfflineStore;
use crate::transport::{Beacon, Transport};

#[derive(Debug, Clone)]
pub struct SenderConfig {
	/// Buffer length that triggers an immediate flush.
	pub buffer_size: usize,
	pub flush_interval: Duration,
	/// Failed attempts before a batch is moved offline.
	pub max_retries: u32,
	pub retry: RetryConfig,
}

impl SenderConfig {
	pub fn from_config(config: &AnalyticsConfig) -> Self {
		Self {
			buffer_size: config.buffer_size,
			flush_interval: config.flush_interval(),
			max_retries: config.max_retries,
			retry: RetryConfig::doubling(config.max_retries, config.retry_base_delay()),
		}
	}
}

impl Default for SenderConfig {
	fn default() -> Self {
		Self {
			buffer_size: 10,
			flush_interval: Duration::from_secs(30),
			max_retries: 3,
			retry: RetryConfig::doubling(3, Duration::from_secs(1)),
		}
	}
}

/// Collaborators the sender delivers through.
pub struct SenderDeps {
	pub transport: Arc<dyn Transport>,
	pub beacon: Option<Arc<dyn Beacon>>,
	pub offline: OfflineStore,
	pub clock: SharedClock,
	pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderStats {
	pub total_events: u64,
	pub sent_events: u64,
	pub failed_events: u64,
	pub buffer_size: usize,
	pub is_online: bool,
	pub is_sending: bool,
	pub failed_attempts: u32,
	pub last_retry_delay_ms: Option<u64>,
}

/// Page facts stamped onto every event.
#[derive(Debug, Clone, Default)]
struct Enrichment {
	url: String,
	title: String,
	referrer: String,
	user_agent: String,
	viewport: Option<Viewport>,
	time_origin: Timestamp,
	memory: Option<MemoryInfo>,
	user_info: Option<UserInfo>,
	session_info: Option<SessionInfo>,
}

/// A pending retry. Cancelling only interrupts the wait, never a send that
/// has already taken events from the buffer.
struct RetryTimer {
	cancel: Arc<Notify>,
	_task: JoinHandle<()>,
}

impl RetryTimer {
	fn cancel(&self) {
		self.cancel.notify_one();
	}
}

#[derive(Default)]
struct Tasks {
	periodic: Option<JoinHandle<()>>,
	retry: Option<RetryTimer>,
}

struct SenderInner {
	config: SenderConfig,
	session_id: SessionId,
	transport: Arc<dyn Transport>,
	beacon: Option<Arc<dyn Beacon>>,
	offline: OfflineStore,
	clock: SharedClock,
	capabilities: Capabilities,

	enrichment: Mutex<Enrichment>,
	buffer: Mutex<Vec<EnrichedEvent>>,

	is_sending: AtomicBool,
	draining: AtomicBool,
	online: AtomicBool,
	shutdown: AtomicBool,
	failed_attempts: AtomicU32,
	total_events: AtomicU64,
	sent_events: AtomicU64,
	failed_events: AtomicU64,
	last_retry_delay: Mutex<Option<Duration>>,

	flush_notify: Notify,
	tasks: Mutex<Tasks>,
}

/// Clears a busy flag when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
	fn acquire(flag: &'a AtomicBool) -> Option<Self> {
		flag
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.ok()
			.map(|_| Self(flag))
	}
}

impl Drop for BusyGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

/// Buffered event sender. Cheap to clone; clones share the buffer.
#[derive(Clone)]
pub struct Sender {
	inner: Arc<SenderInner>,
}

impl Sender {
	pub fn new(config: SenderConfig, session_id: SessionId, deps: SenderDeps) -> Self {
		Self {
			inner: Arc::new(SenderInner {
				config,
				session_id,
				transport: deps.transport,
				beacon: deps.beacon,
				offline: deps.offline,
				clock: deps.clock,
				capabilities: deps.capabilities,
				enrichment: Mutex::new(Enrichment::default()),
				buffer: Mutex::new(Vec::new()),
				is_sending: AtomicBool::new(false),
				draining: AtomicBool::new(false),
				online: AtomicBool::new(true),
				shutdown: AtomicBool::new(false),
				failed_attempts: AtomicU32::new(0),
				total_events: AtomicU64::new(0),
				sent_events: AtomicU64::new(0),
				failed_events: AtomicU64::new(0),
				last_retry_delay: Mutex::new(None),
				flush_notify: Notify::new(),
				tasks: Mutex::new(Tasks::default()),
			}),
		}
	}

	pub fn session_id(&self) -> &SessionId {
		&self.inner.session_id
	}

	/// Attaches the session snapshot, starts the periodic flush loop and
	/// drains anything left offline by earlier visits.
	pub fn init(&self, page: &PageContext, user_info: Option<UserInfo>, session_info: Option<SessionInfo>) {
		{
			let mut enrichment = lock(&self.inner.enrichment);
			*enrichment = Enrichment {
				url: page.url.clone(),
				title: page.title.clone(),
				referrer: page.referrer.clone(),
				user_agent: page.user_agent.clone(),
				viewport: Some(page.viewport),
				time_origin: page.time_origin,
				memory: page.memory,
				user_info,
				session_info,
			};
		}

		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!("no async runtime, periodic flush disabled");
			return;
		};

		{
			let mut tasks = lock(&self.inner.tasks);
			if tasks.periodic.as_ref().is_some_and(|task| !task.is_finished()) {
				debug!("flush loop already running");
			} else {
				let sender = self.clone();
				tasks.periodic = Some(handle.spawn(async move { sender.run().await }));
			}
		}

		let sender = self.clone();
		handle.spawn(async move { sender.send_offline_data().await });

		info!(session_id = %self.inner.session_id, "sender initialized");
	}

	/// Enriches and buffers an event, requesting a flush when the buffer is
	/// full or the event is critical.
	pub fn add_event(&self, record: EventRecord) {
		if self.inner.shutdown.load(Ordering::SeqCst) {
			debug!(event = record.name(), "sender shut down, dropping event");
			return;
		}

		let critical = record.kind.is_critical();
		let name = record.name();
		let event = self.enrich(record);

		let len = {
			let mut buffer = lock(&self.inner.buffer);
			buffer.push(event);
			buffer.len()
		};
		self.inner.total_events.fetch_add(1, Ordering::SeqCst);
		debug!(event = name, buffered = len, "event added to buffer");

		if len >= self.inner.config.buffer_size || critical {
			self.inner.flush_notify.notify_one();
		}
	}

	/// Runs the flush loop until [`Sender::destroy`] is called.
	pub async fn run(&self) {
		let interval = self.inner.config.flush_interval;
		info!(
			flush_interval_secs = interval.as_secs(),
			buffer_size = self.inner.config.buffer_size,
			"starting analytics flush loop"
		);

		let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					if self.inner.shutdown.load(Ordering::SeqCst) {
						break;
					}
					if self.buffer_len() > 0 {
						debug!("periodic flush");
						self.flush().await;
					}
				}
				_ = self.inner.flush_notify.notified() => {
					if self.inner.shutdown.load(Ordering::SeqCst) {
						break;
					}
					self.flush().await;
				}
			}
		}

		info!("analytics flush loop stopped");
	}

	/// Sends the buffered events as one batch.
	///
	/// At most one flush runs at a time; the buffer is taken before any I/O.
	pub async fn flush(&self) {
		let Some(_sending) = BusyGuard::acquire(&self.inner.is_sending) else {
			debug!("flush already in progress");
			return;
		};

		let events = std::mem::take(&mut *lock(&self.inner.buffer));
		if events.is_empty() {
			return;
		}

		if !self.is_online() {
			debug!(count = events.len(), "offline, storing events");
			self.store_offline(&events);
			return;
		}

		let count = events.len() as u64;
		let payload = self.batch(events);
		let result = self.inner.transport.send(&payload).await;
		match result {
			Ok(()) => {
				self.inner.sent_events.fetch_add(count, Ordering::SeqCst);
				self.inner.failed_attempts.store(0, Ordering::SeqCst);
				info!(count, "flushed analytics events");
				drop(_sending);
				self.send_offline_data().await;
			}
			Err(e) => self.handle_send_error(payload.events, e),
		}
	}

	fn handle_send_error(&self, events: Vec<EnrichedEvent>, err: AnalyticsError) {
		self
			.inner
			.failed_events
			.fetch_add(events.len() as u64, Ordering::SeqCst);
		let attempts = self.inner.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
		warn!(attempt = attempts, error = %err, count = events.len(), "analytics send failed");

		if self.is_shut_down() {
			debug!(count = events.len(), "sender shut down, storing failed batch offline");
			self.store_offline(&events);
			self.inner.failed_attempts.store(0, Ordering::SeqCst);
			return;
		}

		if attempts < self.inner.config.max_retries {
			{
				let mut buffer = lock(&self.inner.buffer);
				let newer = std::mem::replace(&mut *buffer, events);
				buffer.extend(newer);
			}
			self.schedule_retry(backoff_delay(&self.inner.config.retry, attempts));
		} else {
			self.store_offline(&events);
			self.inner.failed_attempts.store(0, Ordering::SeqCst);
		}
	}

	fn schedule_retry(&self, delay: Duration) {
		*lock(&self.inner.last_retry_delay) = Some(delay);

		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!("no async runtime, retry not scheduled");
			return;
		};
		debug!(delay_ms = delay.as_millis() as u64, "scheduling retry");

		let cancel = Arc::new(Notify::new());
		let sender = self.clone();
		let task = handle.spawn({
			let cancel = cancel.clone();
			async move {
				tokio::select! {
					_ = cancel.notified() => {
						debug!("retry cancelled");
						return;
					}
					_ = tokio::time::sleep(delay) => {}
				}
				if sender.is_shut_down() {
					return;
				}
				debug!("retrying send");
				sender.flush().await;
			}
		});

		let timer = RetryTimer { cancel, _task: task };
		if let Some(previous) = lock(&self.inner.tasks).retry.replace(timer) {
			previous.cancel();
		}
	}

	fn cancel_retry(&self) {
		if let Some(timer) = lock(&self.inner.tasks).retry.take() {
			timer.cancel();
		}
	}

	/// Delivers everything in the offline store as one batch. Delivered events
	/// are removed only after the transport confirms them; anything stored
	/// while the batch was in flight stays.
	pub async fn send_offline_data(&self) {
		if !self.is_online() {
			return;
		}
		let Some(_draining) = BusyGuard::acquire(&self.inner.draining) else {
			return;
		};

		let events = match self.inner.offline.load() {
			Ok(events) => events,
			Err(e) => {
				warn!(error = %e, "failed to read offline events");
				return;
			}
		};
		if events.is_empty() {
			return;
		}

		let count = events.len() as u64;
		info!(count, "sending offline events");
		let payload = self.batch(events);
		match self.inner.transport.send(&payload).await {
			Ok(()) => {
				self.inner.sent_events.fetch_add(count, Ordering::SeqCst);
				match self.inner.offline.remove_delivered(&payload.events) {
					Ok(remaining) => debug!(remaining, "offline events delivered"),
					Err(e) => warn!(error = %e, "failed to remove delivered offline events"),
				}
			}
			Err(e) => warn!(error = %e, "failed to send offline events"),
		}
	}

	pub async fn handle_online(&self) {
		self.inner.online.store(true, Ordering::SeqCst);
		info!("network connection restored");

		self.send_offline_data().await;
		if self.buffer_len() > 0 {
			self.flush().await;
		}
	}

	pub fn handle_offline(&self) {
		self.inner.online.store(false, Ordering::SeqCst);
		info!("network connection lost");
		self.cancel_retry();
	}

	/// Hands the buffer to the beacon during teardown, or to the offline store
	/// if the beacon is missing or refuses it.
	pub fn final_flush(&self) {
		let events = std::mem::take(&mut *lock(&self.inner.buffer));
		if events.is_empty() {
			return;
		}

		if let Some(beacon) = &self.inner.beacon {
			let payload =
				BeaconPayload::final_flush(self.inner.session_id.clone(), events, self.now());
			if beacon.send_beacon(&payload) {
				info!(count = payload.events.len(), "final flush sent via beacon");
				return;
			}
			warn!("beacon refused final flush, storing offline");
			self.store_offline(&payload.events);
		} else {
			self.store_offline(&events);
		}
	}

	/// Stops background work and performs the final flush.
	///
	/// The flush loop and any pending retry stop at their next wait. A send
	/// already in flight finishes; if it fails, its batch goes offline.
	pub fn destroy(&self) {
		if self.inner.shutdown.swap(true, Ordering::SeqCst) {
			return;
		}

		self.cancel_retry();
		lock(&self.inner.tasks).periodic.take();
		self.inner.flush_notify.notify_one();
		self.final_flush();
		info!(session_id = %self.inner.session_id, "sender destroyed");
	}

	pub fn stats(&self) -> SenderStats {
		let last_retry_delay = *lock(&self.inner.last_retry_delay);
		SenderStats {
			total_events: self.total_events(),
			sent_events: self.inner.sent_events.load(Ordering::SeqCst),
			failed_events: self.inner.failed_events.load(Ordering::SeqCst),
			buffer_size: self.buffer_len(),
			is_online: self.is_online(),
			is_sending: self.inner.is_sending.load(Ordering::SeqCst),
			failed_attempts: self.inner.failed_attempts.load(Ordering::SeqCst),
			last_retry_delay_ms: last_retry_delay.map(|d| d.as_millis() as u64),
		}
	}

	pub fn total_events(&self) -> u64 {
		self.inner.total_events.load(Ordering::SeqCst)
	}

	pub fn buffer_len(&self) -> usize {
		lock(&self.inner.buffer).len()
	}

	pub fn clear_buffer(&self) {
		lock(&self.inner.buffer).clear();
	}

	pub fn is_online(&self) -> bool {
		self.inner.online.load(Ordering::SeqCst)
	}

	fn is_shut_down(&self) -> bool {
		self.inner.shutdown.load(Ordering::SeqCst)
	}

	fn enrich(&self, mut record: EventRecord) -> EnrichedEvent {
		let now = self.now();
		if record.timestamp == 0 {
			record.timestamp = now;
		}

		let enrichment = lock(&self.inner.enrichment);
		let capabilities = &self.inner.capabilities;
		let performance = capabilities
			.has(Capability::Performance)
			.then(|| PerformanceSnapshot {
				time_origin: enrichment.time_origin as f64,
				now: (now - enrichment.time_origin) as f64,
				memory: enrichment
					.memory
					.filter(|_| capabilities.has(Capability::PerformanceMemory)),
			});

		EnrichedEvent {
			record,
			session_id: self.inner.session_id.clone(),
			url: enrichment.url.clone(),
			user_agent: enrichment.user_agent.clone(),
			event_id: EventId::new(),
			page_info: PageInfo {
				title: enrichment.title.clone(),
				url: enrichment.url.clone(),
				referrer: enrichment.referrer.clone(),
				viewport: enrichment.viewport.unwrap_or(Viewport {
					width: 0,
					height: 0,
				}),
			},
			performance,
		}
	}

	fn batch(&self, events: Vec<EnrichedEvent>) -> BatchPayload {
		let enrichment = lock(&self.inner.enrichment);
		BatchPayload {
			session_id: self.inner.session_id.clone(),
			user_info: enrichment.user_info.clone(),
			session_info: enrichment.session_info.clone(),
			events,
			metadata: BatchMetadata {
				total_events: self.inner.total_events.load(Ordering::SeqCst),
				sent_events: self.inner.sent_events.load(Ordering::SeqCst),
				failed_events: self.inner.failed_events.load(Ordering::SeqCst),
				timestamp: self.now(),
			},
		}
	}

	fn store_offline(&self, events: &[EnrichedEvent]) {
		match self.inner.offline.append(events) {
			Ok(stored) => debug!(count = events.len(), stored, "stored events offline"),
			Err(e) => error!(error = %e, count = events.len(), "failed to store events offline"),
		}
	}

	fn now(&self) -> Timestamp {
		self.inner.clock.now_ms()
	}
}

impl EventSubscriber for Sender {
	fn on_event(&self, event: &EventRecord) {
		self.add_event(event.clone());
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::ManualClock;
	use crate::storage::MemoryStore;
	use crate::test_support::{custom_event, MockBeacon, MockTransport};
	use std::collections::HashSet;
	use trail_analytics_core::EventKind;

	struct Harness {
		sender: Sender,
		transport: Arc<MockTransport>,
		offline: OfflineStore,
	}

	fn harness(beacon: Option<Arc<dyn Beacon>>, capabilities: Capabilities) -> Harness {
		harness_with(Arc::new(MockTransport::default()), beacon, capabilities)
	}

	fn harness_with(
		transport: Arc<MockTransport>,
		beacon: Option<Arc<dyn Beacon>>,
		capabilities: Capabilities,
	) -> Harness {
		let offline = OfflineStore::new(Arc::new(MemoryStore::new()), "analytics_offline_data", 100);
		let sender = Sender::new(
			SenderConfig::default(),
			SessionId::from("session_1700000000000_test00000"),
			SenderDeps {
				transport: transport.clone(),
				beacon,
				offline: offline.clone(),
				clock: Arc::new(ManualClock::new(1_700_000_000_000)),
				capabilities,
			},
		);
		Harness {
			sender,
			transport,
			offline,
		}
	}

	fn page() -> PageContext {
		PageContext::new("https://example.org/#awards")
			.with_title("Home")
			.with_user_agent("Mozilla/5.0 test")
			.with_time_origin(1_699_999_999_000)
	}

	fn focus(ts: Timestamp) -> EventRecord {
		EventRecord::new(EventKind::PageFocus { inactive_time: 1 }, ts)
	}

	fn unload() -> EventRecord {
		EventRecord::new(EventKind::PageUnload { time_on_page: 10 }, 5)
	}

	async fn settle() {
		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	#[tokio::test(start_paused = true)]
	async fn full_buffer_triggers_exactly_one_flush() {
		let h = harness(None, Capabilities::none());
		h.sender.init(&page(), None, None);
		settle().await;

		for i in 0..10 {
			h.sender.add_event(focus(i + 1));
		}
		settle().await;

		let batches = h.transport.batches();
		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].events.len(), 10);
		assert_eq!(h.sender.buffer_len(), 0);
		assert_eq!(h.sender.stats().sent_events, 10);
	}

	#[tokio::test(start_paused = true)]
	async fn critical_event_flushes_immediately() {
		let h = harness(None, Capabilities::none());
		h.sender.init(&page(), None, None);
		settle().await;

		h.sender.add_event(unload());
		settle().await;

		let batches = h.transport.batches();
		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].events[0].name(), "page_unload");
	}

	#[tokio::test(start_paused = true)]
	async fn periodic_flush_ships_small_buffers() {
		let h = harness(None, Capabilities::none());
		h.sender.init(&page(), None, None);
		h.sender.add_event(focus(1));
		settle().await;
		assert!(h.transport.batches().is_empty());

		tokio::time::sleep(Duration::from_secs(31)).await;
		assert_eq!(h.transport.batches().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn retries_with_growing_delay_then_moves_offline() {
		let h = harness(None, Capabilities::none());
		h.transport.set_should_fail(true);

		h.sender.add_event(focus(1));
		h.sender.add_event(focus(2));
		h.sender.flush().await;
		assert_eq!(h.sender.buffer_len(), 2);
		assert_eq!(h.sender.stats().last_retry_delay_ms, Some(2_000));

		tokio::time::sleep(Duration::from_millis(2_100)).await;
		assert_eq!(h.transport.attempts(), 2);
		assert_eq!(h.sender.buffer_len(), 2);
		assert_eq!(h.sender.stats().last_retry_delay_ms, Some(4_000));

		tokio::time::sleep(Duration::from_millis(4_100)).await;
		assert_eq!(h.transport.attempts(), 3);
		assert_eq!(h.sender.buffer_len(), 0);
		assert_eq!(h.sender.stats().failed_attempts, 0);

		let stored = h.offline.load().unwrap();
		assert_eq!(stored.len(), 2);
		assert_eq!(stored[0].record.timestamp, 1);
		assert_eq!(stored[1].record.timestamp, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn retried_batch_stays_ahead_of_newer_events() {
		let h = harness(None, Capabilities::none());
		h.transport.set_should_fail(true);
		h.sender.add_event(focus(1));
		h.sender.flush().await;

		h.sender.add_event(focus(2));
		h.transport.set_should_fail(false);
		tokio::time::sleep(Duration::from_millis(2_100)).await;

		let batches = h.transport.batches();
		assert_eq!(batches.len(), 1);
		let stamps: Vec<_> = batches[0].events.iter().map(|e| e.record.timestamp).collect();
		assert_eq!(stamps, vec![1, 2]);
	}

	#[tokio::test]
	async fn offline_events_drain_when_back_online() {
		let h = harness(None, Capabilities::none());
		h.sender.handle_offline();
		h.sender.add_event(focus(1));
		h.sender.flush().await;
		assert_eq!(h.transport.attempts(), 0);
		assert_eq!(h.offline.len(), 1);

		h.sender.add_event(focus(2));
		h.sender.handle_online().await;

		let batches = h.transport.batches();
		assert_eq!(batches.len(), 2);
		assert_eq!(batches[0].events[0].record.timestamp, 1);
		assert_eq!(batches[1].events[0].record.timestamp, 2);
		assert!(h.offline.is_empty());
	}

	#[tokio::test]
	async fn offline_store_kept_when_drain_fails() {
		let h = harness(None, Capabilities::none());
		h.offline.append(&[custom_event("old")]).unwrap();
		h.transport.set_should_fail(true);

		h.sender.send_offline_data().await;
		assert_eq!(h.offline.len(), 1);
	}

	#[test]
	fn final_flush_prefers_beacon() {
		let beacon = Arc::new(MockBeacon::accepting());
		let h = harness(Some(beacon.clone()), Capabilities::none());
		h.sender.add_event(focus(1));
		h.sender.final_flush();

		let payloads = beacon.payloads();
		assert_eq!(payloads.len(), 1);
		assert_eq!(payloads[0].events.len(), 1);
		assert!(h.offline.is_empty());
		assert_eq!(h.sender.buffer_len(), 0);
	}

	#[test]
	fn final_flush_falls_back_to_offline() {
		let h = harness(Some(Arc::new(MockBeacon::refusing())), Capabilities::none());
		h.sender.add_event(focus(1));
		h.sender.final_flush();
		assert_eq!(h.offline.len(), 1);

		let h = harness(None, Capabilities::none());
		h.sender.add_event(focus(1));
		h.sender.final_flush();
		assert_eq!(h.offline.len(), 1);
	}

	#[tokio::test]
	async fn enrichment_stamps_session_and_page() {
		let h = harness(None, Capabilities::all().without(Capability::PerformanceMemory));
		h.sender.init(&page(), None, None);
		h.sender.add_event(EventRecord::new(EventKind::PageFocus { inactive_time: 0 }, 0));
		h.sender.add_event(focus(7));
		h.sender.flush().await;

		let events = &h.transport.batches()[0].events;
		assert_eq!(events[0].session_id.as_str(), "session_1700000000000_test00000");
		assert_eq!(events[0].url, "https://example.org/#awards");
		assert_eq!(events[0].page_info.title, "Home");
		assert_eq!(events[0].user_agent, "Mozilla/5.0 test");
		assert_eq!(events[0].record.timestamp, 1_700_000_000_000);
		assert_eq!(events[1].record.timestamp, 7);
		assert_ne!(events[0].event_id, events[1].event_id);

		let perf = events[0].performance.as_ref().unwrap();
		assert_eq!(perf.now, 1_000.0);
		assert!(perf.memory.is_none());
	}

	#[tokio::test]
	async fn performance_omitted_without_capability() {
		let h = harness(None, Capabilities::none());
		h.sender.add_event(focus(1));
		h.sender.flush().await;
		assert!(h.transport.batches()[0].events[0].performance.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn destroy_stops_loop_and_flushes_once() {
		let beacon = Arc::new(MockBeacon::accepting());
		let h = harness(Some(beacon.clone()), Capabilities::none());
		h.sender.init(&page(), None, None);
		h.sender.add_event(focus(1));

		h.sender.destroy();
		h.sender.destroy();
		h.sender.add_event(focus(2));

		tokio::time::sleep(Duration::from_secs(60)).await;
		assert!(h.transport.batches().is_empty());
		assert_eq!(beacon.payloads().len(), 1);
		assert_eq!(h.sender.buffer_len(), 0);
	}

	fn slow_transport() -> Arc<MockTransport> {
		Arc::new(MockTransport::slow(Duration::from_millis(100)))
	}

	#[tokio::test(start_paused = true)]
	async fn overlapping_flushes_send_each_event_once() {
		let h = harness_with(slow_transport(), None, Capabilities::none());
		for ts in 1..=3 {
			h.sender.add_event(focus(ts));
		}
		let first = {
			let sender = h.sender.clone();
			tokio::spawn(async move { sender.flush().await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(h.sender.stats().is_sending);

		h.sender.add_event(focus(4));
		h.sender.add_event(focus(5));
		h.sender.flush().await;
		assert_eq!(h.transport.attempts(), 1);
		assert_eq!(h.sender.buffer_len(), 2);

		first.await.unwrap();
		h.sender.flush().await;

		let batches = h.transport.batches();
		let stamps: Vec<Vec<Timestamp>> = batches
			.iter()
			.map(|b| b.events.iter().map(|e| e.record.timestamp).collect())
			.collect();
		assert_eq!(stamps, vec![vec![1, 2, 3], vec![4, 5]]);
		let ids: HashSet<EventId> = batches
			.iter()
			.flat_map(|b| b.events.iter().map(|e| e.event_id))
			.collect();
		assert_eq!(ids.len(), 5);
	}

	#[tokio::test(start_paused = true)]
	async fn events_stored_during_drain_survive_it() {
		let h = harness_with(slow_transport(), None, Capabilities::none());
		h.offline.append(&[custom_event("old")]).unwrap();

		let drain = {
			let sender = h.sender.clone();
			tokio::spawn(async move { sender.send_offline_data().await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;

		h.sender.handle_offline();
		h.sender.add_event(focus(1));
		h.sender.flush().await;
		assert_eq!(h.offline.len(), 2);

		drain.await.unwrap();
		let batches = h.transport.batches();
		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].events.len(), 1);

		let stored = h.offline.load().unwrap();
		assert_eq!(stored.len(), 1);
		assert_eq!(stored[0].record.timestamp, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn destroy_lets_in_flight_batch_finish() {
		let beacon = Arc::new(MockBeacon::accepting());
		let h = harness_with(slow_transport(), Some(beacon.clone()), Capabilities::none());
		h.sender.init(&page(), None, None);
		settle().await;

		h.sender.add_event(unload());
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(h.transport.attempts(), 1);

		h.sender.destroy();
		tokio::time::sleep(Duration::from_millis(200)).await;

		let batches = h.transport.batches();
		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].events[0].name(), "page_unload");
		assert!(beacon.payloads().is_empty());
		assert!(h.offline.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn failure_after_destroy_goes_offline_without_retry() {
		let h = harness_with(slow_transport(), None, Capabilities::none());
		h.transport.set_should_fail(true);
		h.sender.add_event(focus(1));

		let in_flight = {
			let sender = h.sender.clone();
			tokio::spawn(async move { sender.flush().await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		h.sender.destroy();
		in_flight.await.unwrap();

		assert_eq!(h.offline.len(), 1);
		assert_eq!(h.sender.buffer_len(), 0);
		let stats = h.sender.stats();
		assert_eq!(stats.last_retry_delay_ms, None);
		assert_eq!(stats.failed_attempts, 0);

		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(h.transport.attempts(), 1);
	}

	#[tokio::test]
	async fn subscriber_feeds_buffer() {
		let h = harness(None, Capabilities::none());
		let bus = crate::bus::EventBus::new();
		bus.subscribe(Arc::new(h.sender.clone()));
		bus.publish(&focus(3));
		assert_eq!(h.sender.buffer_len(), 1);
		assert_eq!(h.sender.total_events(), 1);
	}
}
