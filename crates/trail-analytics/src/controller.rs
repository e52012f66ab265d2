// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The analytics facade.
//!
//! [`Analytics`] owns one visit: it checks consent, waits for the first
//! interaction, collects the visitor snapshot, starts the tracker and sender,
//! and routes host signals to them. Every tracking call is a silent no-op
//! until initialization has succeeded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trail_analytics_core::{
	validate_event_name, AnalyticsConfig, Capabilities, Capability, ClickEvent, ErrorReport,
	EventKind, EventRecord, KeyEvent, LayoutSnapshot, PageContext, Session, SessionId,
	Timestamp,
};
use url::Url;

use crate::bus::EventBus;
use crate::clock::{SharedClock, SystemClock};
use crate::collector::Collector;
use crate::error::Result;
use crate::gate::{GateOutcome, InteractionGate};
use crate::geo::{default_providers, GeoLocator, GeoProvider};
use crate::offline::OfflineStore;
use crate::properties::Properties;
use crate::sender::{Sender, SenderConfig, SenderDeps, SenderStats};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::tracker::{Tracker, TrackerConfig};
use crate::transport::{Beacon, HttpBeacon, HttpTransport, LogTransport, Transport};

/// A browser signal forwarded by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostSignal {
	VisibilityChange { hidden: bool },
	BeforeUnload,
	Focus,
	Blur,
	Online,
	Offline,
	Scroll(LayoutSnapshot),
	Click(ClickEvent),
	KeyDown(KeyEvent),
	TouchStart,
	MouseMove,
	Error(ErrorReport),
}

impl HostSignal {
	/// Signals that count as the visitor's first interaction.
	fn is_interaction(&self) -> bool {
		matches!(
			self,
			HostSignal::Click(_) | HostSignal::KeyDown(_) | HostSignal::Scroll(_) | HostSignal::TouchStart
		)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
	pub session_id: SessionId,
	pub duration: u64,
	pub section_times: BTreeMap<String, u64>,
	pub total_events: u64,
	pub current_section: Option<String>,
}

/// Builds an [`Analytics`] instance, filling unset collaborators with
/// production defaults.
pub struct AnalyticsBuilder {
	config: AnalyticsConfig,
	clock: Option<SharedClock>,
	store: Option<Arc<dyn KeyValueStore>>,
	transport: Option<Arc<dyn Transport>>,
	beacon: Option<Arc<dyn Beacon>>,
	geo_providers: Option<Vec<Arc<dyn GeoProvider>>>,
	capabilities: Capabilities,
	bus: Option<EventBus>,
	client: Option<reqwest::Client>,
}

impl AnalyticsBuilder {
	pub fn new(config: AnalyticsConfig) -> Self {
		Self {
			config,
			clock: None,
			store: None,
			transport: None,
			beacon: None,
			geo_providers: None,
			capabilities: Capabilities::all(),
			bus: None,
			client: None,
		}
	}

	pub fn clock(mut self, clock: SharedClock) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn beacon(mut self, beacon: Arc<dyn Beacon>) -> Self {
		self.beacon = Some(beacon);
		self
	}

	pub fn geo_providers(mut self, providers: Vec<Arc<dyn GeoProvider>>) -> Self {
		self.geo_providers = Some(providers);
		self
	}

	pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
		self.capabilities = capabilities;
		self
	}

	/// Shares an existing bus, e.g. one the GA4 adapter already listens on.
	pub fn bus(mut self, bus: EventBus) -> Self {
		self.bus = Some(bus);
		self
	}

	pub fn http_client(mut self, client: reqwest::Client) -> Self {
		self.client = Some(client);
		self
	}

	pub fn build(self) -> Result<Analytics> {
		self.config.validate()?;
		let config = self.config;

		let client = match self.client {
			Some(client) => client,
			None => trail_common_http::new_client_with_timeout(config.request_timeout())?,
		};
		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
		let store = self
			.store
			.unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
		let bus = self.bus.unwrap_or_default();

		let transport: Arc<dyn Transport> = match (self.transport, config.endpoint.as_deref()) {
			(Some(transport), _) => transport,
			(None, Some(endpoint)) => Arc::new(HttpTransport::new(client.clone(), endpoint)?),
			(None, None) => {
				debug!("no collection endpoint configured, logging batches");
				Arc::new(LogTransport)
			}
		};

		let beacon = match self.beacon {
			Some(beacon) => Some(beacon),
			None if self.capabilities.has(Capability::Beacon) => config
				.resolved_beacon_url()
				.map(|url| HttpBeacon::new(client.clone(), &url))
				.transpose()?
				.map(|beacon| Arc::new(beacon) as Arc<dyn Beacon>),
			None => None,
		};

		let providers = match self.geo_providers {
			Some(providers) => providers,
			None if config.geo_lookup => default_providers(client.clone()),
			None => Vec::new(),
		};
		let geo = GeoLocator::new(providers, config.geo_timeout()).with_anonymize_ip(config.anonymize_ip);

		let start_time = clock.now_ms();
		let session_id = SessionId::generate(start_time);

		let collector = Collector::new(
			&config,
			store.clone(),
			geo,
			clock.clone(),
			self.capabilities.clone(),
		);
		let tracker = Tracker::new(TrackerConfig::from(&config), bus.clone(), clock.clone());
		let sender = Sender::new(
			SenderConfig::from_config(&config),
			session_id.clone(),
			SenderDeps {
				transport,
				beacon,
				offline: OfflineStore::new(
					store,
					config.offline_storage_key.clone(),
					config.max_offline_events,
				),
				clock: clock.clone(),
				capabilities: self.capabilities,
			},
		);

		debug!(session_id = %session_id, "analytics instance created");
		Ok(Analytics {
			inner: Arc::new(AnalyticsInner {
				config,
				session_id,
				start_time,
				clock,
				bus,
				collector,
				tracker,
				sender,
				gate: InteractionGate::new(),
				init_started: AtomicBool::new(false),
				initialized: AtomicBool::new(false),
				unloaded: AtomicBool::new(false),
				session: Mutex::new(None),
				page_host: Mutex::new(None),
			}),
		})
	}
}

struct AnalyticsInner {
	config: AnalyticsConfig,
	session_id: SessionId,
	start_time: Timestamp,
	clock: SharedClock,
	bus: EventBus,
	collector: Collector,
	tracker: Tracker,
	sender: Sender,
	gate: InteractionGate,
	init_started: AtomicBool,
	initialized: AtomicBool,
	unloaded: AtomicBool,
	session: Mutex<Option<Session>>,
	page_host: Mutex<Option<String>>,
}

/// Handle to one visit's analytics pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Analytics {
	inner: Arc<AnalyticsInner>,
}

impl Analytics {
	pub fn builder(config: AnalyticsConfig) -> AnalyticsBuilder {
		AnalyticsBuilder::new(config)
	}

	/// Starts the pipeline for `page`.
	///
	/// Only the first call does anything. Returns whether tracking is active.
	pub async fn init(&self, page: &PageContext) -> bool {
		let inner = &self.inner;
		if inner.init_started.swap(true, Ordering::SeqCst) {
			debug!("analytics already initialized");
			return self.is_initialized();
		}

		if !self.has_consent(page) {
			info!("analytics disabled by privacy settings");
			return false;
		}

		let outcome = inner.gate.wait(inner.config.interaction_gate_timeout()).await;
		debug!(?outcome, "starting analytics");

		let user_info = inner.collector.collect_user_info(page).await;
		let session_info =
			inner
				.collector
				.collect_session_info(page, &inner.session_id, inner.start_time);
		debug!(
			device_type = %user_info.device_type,
			visit_count = session_info.visit_count,
			"visitor snapshot collected"
		);

		inner.tracker.init(inner.session_id.clone(), page.layout.as_ref());
		inner.bus.subscribe(Arc::new(inner.sender.clone()));
		inner
			.sender
			.init(page, Some(user_info.clone()), Some(session_info.clone()));

		*lock(&inner.page_host) = Url::parse(&page.url)
			.ok()
			.and_then(|url| url.host_str().map(str::to_string));
		*lock(&inner.session) = Some(Session {
			session_id: inner.session_id.clone(),
			start_time: inner.start_time,
			user_info,
			session_info,
		});

		inner.initialized.store(true, Ordering::SeqCst);
		self.track_page_load(page);

		if outcome == GateOutcome::TimedOut {
			debug!("initialized without prior interaction");
		}
		info!(session_id = %inner.session_id, "analytics initialized");
		true
	}

	fn has_consent(&self, page: &PageContext) -> bool {
		let config = &self.inner.config;
		config.enabled && !(config.respect_do_not_track && page.do_not_track)
	}

	fn track_page_load(&self, page: &PageContext) {
		let load_time = page.timing.as_ref().and_then(|timing| timing.load_time());
		self.publish(EventKind::PageLoad {
			load_time,
			title: page.title.clone(),
			referrer: page.referrer.clone(),
		});
		debug!(load_time_ms = ?load_time, "page load tracked");
	}

	/// Routes a host signal. Interaction signals also open the start gate.
	pub async fn handle_signal(&self, signal: HostSignal) {
		if signal.is_interaction() {
			self.inner.gate.open();
		}
		if !self.is_initialized() {
			return;
		}

		let tracker = &self.inner.tracker;
		match signal {
			HostSignal::VisibilityChange { hidden: true } => {
				debug!("page hidden, pausing tracking");
				tracker.pause();
				self.inner.sender.flush().await;
			}
			HostSignal::VisibilityChange { hidden: false } => {
				debug!("page visible, resuming tracking");
				tracker.resume();
			}
			HostSignal::BeforeUnload => self.handle_page_unload(),
			HostSignal::Focus => tracker.handle_focus(),
			HostSignal::Blur => tracker.handle_blur(),
			HostSignal::Online => self.inner.sender.handle_online().await,
			HostSignal::Offline => self.inner.sender.handle_offline(),
			HostSignal::Scroll(layout) => tracker.handle_scroll(layout),
			HostSignal::Click(click) => tracker.handle_click(&click),
			HostSignal::KeyDown(key) => tracker.handle_key(&key),
			HostSignal::TouchStart => tracker.handle_touch(),
			HostSignal::MouseMove => tracker.handle_mouse_move(),
			HostSignal::Error(report) => tracker.handle_error(&report),
		}
	}

	fn handle_page_unload(&self) {
		let inner = &self.inner;
		if inner.unloaded.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("page unloading, final flush");

		let time_on_page = (self.now() - inner.start_time).max(0) as u64;
		self.publish(EventKind::PageUnload { time_on_page });
		inner.tracker.finalize_session();
		inner.sender.final_flush();
		inner.collector.record_activity(&inner.session_id);
	}

	/// Moves the tracker to `to_section`.
	pub fn track_section_change(&self, to_section: &str) {
		if !self.is_initialized() {
			return;
		}
		self.inner.tracker.set_section(to_section);
	}

	/// Records a link click reported by the navigation layer. `link_type`
	/// defaults to `external`.
	pub fn track_link_click(&self, url: &str, text: &str, link_type: Option<&str>) {
		if !self.is_initialized() {
			return;
		}

		let is_external = self.is_external(url);
		self.publish(EventKind::LinkClick {
			href: Some(url.to_string()),
			text: text.to_string(),
			is_external,
			target: None,
			link_type: Some(link_type.unwrap_or("external").to_string()),
		});
	}

	/// Records a named custom event.
	///
	/// Fails only when the name or properties are invalid.
	pub fn track_custom_event(&self, name: &str, properties: Properties) -> Result<()> {
		if !self.is_initialized() {
			return Ok(());
		}
		validate_event_name(name)?;
		properties.validate()?;

		self.publish(EventKind::Custom {
			event_name: name.to_string(),
			properties: properties.into_value(),
		});
		Ok(())
	}

	/// Reports an application error. Subject to the per-session error cap.
	pub fn track_error(&self, error_type: &str, message: &str) {
		if !self.is_initialized() {
			return;
		}
		self
			.inner
			.tracker
			.handle_error(&ErrorReport::new(error_type, message));
	}

	pub fn session_stats(&self) -> Option<SessionStats> {
		if !self.is_initialized() {
			return None;
		}
		let inner = &self.inner;
		Some(SessionStats {
			session_id: inner.session_id.clone(),
			duration: (self.now() - inner.start_time).max(0) as u64,
			section_times: inner.tracker.section_times(),
			total_events: inner.sender.total_events(),
			current_section: inner.tracker.current_section(),
		})
	}

	/// Runs the unload path, stops background work and marks the instance
	/// uninitialized.
	pub fn destroy(&self) {
		let inner = &self.inner;
		if inner.initialized.load(Ordering::SeqCst) {
			debug!("destroying analytics instance");
			self.handle_page_unload();
			inner.tracker.destroy();
			inner.sender.destroy();
		}
		inner.initialized.store(false, Ordering::SeqCst);
		info!(session_id = %inner.session_id, "analytics destroyed");
	}

	pub fn is_initialized(&self) -> bool {
		self.inner.initialized.load(Ordering::SeqCst)
	}

	pub fn session_id(&self) -> &SessionId {
		&self.inner.session_id
	}

	/// The visit snapshot, once initialized.
	pub fn session(&self) -> Option<Session> {
		lock(&self.inner.session).clone()
	}

	pub fn bus(&self) -> &EventBus {
		&self.inner.bus
	}

	pub fn tracker(&self) -> &Tracker {
		&self.inner.tracker
	}

	pub fn sender_stats(&self) -> SenderStats {
		self.inner.sender.stats()
	}

	fn publish(&self, kind: EventKind) {
		let record = EventRecord::new(kind, self.now()).with_section(self.inner.tracker.current_section());
		self.inner.bus.publish(&record);
	}

	fn is_external(&self, url: &str) -> bool {
		let Ok(parsed) = Url::parse(url) else {
			return false;
		};
		match (parsed.host_str(), lock(&self.inner.page_host).as_deref()) {
			(Some(link_host), Some(page_host)) => link_host != page_host,
			(Some(_), None) => true,
			_ => {
				warn!(url, "link without host");
				false
			}
		}
	}

	fn now(&self) -> Timestamp {
		self.inner.clock.now_ms()
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}
