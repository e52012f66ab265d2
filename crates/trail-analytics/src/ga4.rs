// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Google Analytics 4 adapter.
//!
//! The adapter keeps its own light session model (current section, section
//! entry times, first interaction) and reports an academic-site flavoured
//! event taxonomy: `section_enter`, `scroll`, `publication_click`,
//! `exception`, and so on. It listens on the same [`EventBus`] as the sender,
//! so one event model feeds both destinations.
//!
//! Events tracked before [`Ga4Adapter::init`] are queued and replayed after
//! the `session_start` event. Delivery runs on a background task that batches
//! events into Measurement Protocol requests.
//!
//! [`EventBus`]: crate::bus::EventBus

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use trail_analytics_core::{ConfigError, EventKind, EventRecord, Ga4Config, PageContext, Timestamp};
use trail_common_http::{retry, RetryConfig};
use url::Url;
use uuid::Uuid;

use crate::bus::{EventSubscriber, SectionTransition};
use crate::clock::{to_rfc3339, SharedClock};
use crate::error::{AnalyticsError, Result};
use crate::properties::Properties;
use crate::tracker::DEFAULT_SECTION;

/// Measurement Protocol accepts at most this many events per request.
pub const MAX_EVENTS_PER_REQUEST: usize = 25;

const SCROLL_MILESTONES: [u8; 4] = [25, 50, 75, 100];

/// Publication hosts and the publication type they imply, checked in order.
const PUBLICATION_HOSTS: [(&str, &str); 6] = [
	("arxiv.org", "preprint"),
	("doi.org", "journal"),
	("ieee.org", "conference"),
	("acm.org", "conference"),
	("github.com", "code"),
	("scholar.google", "profile"),
];

static NON_ALPHANUMERIC: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"[^a-z0-9\s]").expect("valid regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ga4Event {
	pub name: String,
	pub params: Map<String, Value>,
}

impl Ga4Event {
	pub fn new(name: impl Into<String>, params: Properties) -> Self {
		let params = match params.into_value() {
			Value::Object(map) => map,
			_ => Map::new(),
		};
		Self {
			name: name.into(),
			params,
		}
	}
}

/// One Measurement Protocol request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ga4Request {
	pub client_id: String,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub user_properties: Map<String, Value>,
	pub events: Vec<Ga4Event>,
}

/// Destination for GA4 requests.
#[async_trait]
pub trait Ga4Sink: Send + Sync {
	async fn send(&self, request: &Ga4Request) -> Result<()>;
}

/// Posts requests to the GA4 Measurement Protocol endpoint.
pub struct MeasurementProtocolSink {
	client: reqwest::Client,
	url: Url,
	retry: RetryConfig,
}

impl MeasurementProtocolSink {
	pub fn new(client: reqwest::Client, config: &Ga4Config) -> Result<Self> {
		let measurement_id = config
			.measurement_id
			.as_deref()
			.filter(|id| !id.is_empty())
			.ok_or_else(|| ConfigError::validation("ga4.measurement_id is required"))?;
		let api_secret = config
			.api_secret
			.as_deref()
			.filter(|secret| !secret.is_empty())
			.ok_or_else(|| ConfigError::validation("ga4.api_secret is required"))?;

		let url = Url::parse_with_params(
			&config.endpoint,
			&[("measurement_id", measurement_id), ("api_secret", api_secret)],
		)
		.map_err(|e| AnalyticsError::InvalidEndpoint(format!("{}: {e}", config.endpoint)))?;

		Ok(Self {
			client,
			url,
			retry: RetryConfig::default(),
		})
	}

	pub fn with_retry(mut self, retry: RetryConfig) -> Self {
		self.retry = retry;
		self
	}

	async fn post(&self, request: &Ga4Request) -> Result<()> {
		let response = self
			.client
			.post(self.url.clone())
			.json(request)
			.send()
			.await?;

		let status = response.status();
		if status.is_success() {
			return Ok(());
		}
		let message = response.text().await.unwrap_or_default();
		Err(AnalyticsError::ServerError {
			status: status.as_u16(),
			message,
		})
	}
}

#[async_trait]
impl Ga4Sink for MeasurementProtocolSink {
	async fn send(&self, request: &Ga4Request) -> Result<()> {
		for chunk in request.events.chunks(MAX_EVENTS_PER_REQUEST) {
			let body = Ga4Request {
				client_id: request.client_id.clone(),
				user_properties: request.user_properties.clone(),
				events: chunk.to_vec(),
			};
			retry(&self.retry, || self.post(&body)).await?;
			debug!(events = chunk.len(), "GA4 request delivered");
		}
		Ok(())
	}
}

#[derive(Debug)]
enum Ga4Command {
	Enqueue(Ga4Event),
	Flush(oneshot::Sender<()>),
	Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ga4SessionStats {
	pub session_duration: u64,
	pub sections_visited: Vec<String>,
	pub current_section: String,
	pub user_interacted: bool,
	pub measurement_id: Option<String>,
}

struct Ga4State {
	initialized: bool,
	pending: VecDeque<(String, Properties)>,
	session_start: Timestamp,
	page_location: String,
	user_agent_category: &'static str,
	current_section: String,
	section_start_times: BTreeMap<String, Timestamp>,
	user_interacted: bool,
	user_properties: Map<String, Value>,
}

struct Ga4Inner {
	config: Ga4Config,
	clock: SharedClock,
	sink: Arc<dyn Ga4Sink>,
	client_id: String,
	state: Mutex<Ga4State>,
	first_interaction: AtomicBool,
	tx: Mutex<Option<mpsc::Sender<Ga4Command>>>,
	task: Mutex<Option<JoinHandle<()>>>,
}

/// GA4 reporting client. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Ga4Adapter {
	inner: Arc<Ga4Inner>,
}

impl Ga4Adapter {
	pub fn new(config: Ga4Config, sink: Arc<dyn Ga4Sink>, clock: SharedClock) -> Self {
		let now = clock.now_ms();
		Self {
			inner: Arc::new(Ga4Inner {
				config,
				clock,
				sink,
				client_id: Uuid::new_v4().to_string(),
				state: Mutex::new(Ga4State {
					initialized: false,
					pending: VecDeque::new(),
					session_start: now,
					page_location: String::new(),
					user_agent_category: "desktop",
					current_section: DEFAULT_SECTION.to_string(),
					section_start_times: BTreeMap::new(),
					user_interacted: false,
					user_properties: Map::new(),
				}),
				first_interaction: AtomicBool::new(false),
				tx: Mutex::new(None),
				task: Mutex::new(None),
			}),
		}
	}

	pub fn client_id(&self) -> &str {
		&self.inner.client_id
	}

	pub fn is_initialized(&self) -> bool {
		self.state().initialized
	}

	/// Starts delivery, emits `session_start` and replays queued events.
	///
	/// Returns false when GA4 is disabled or no async runtime is available.
	pub fn init(&self, page: &PageContext) -> bool {
		if !self.inner.config.enabled {
			info!("GA4 disabled");
			return false;
		}
		if self.is_initialized() {
			return true;
		}
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!("no async runtime, GA4 not started");
			return false;
		};

		let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(MAX_EVENTS_PER_REQUEST));
		let task = {
			let inner = self.inner.clone();
			handle.spawn(async move { inner.run(rx).await })
		};
		*lock(&self.inner.tx) = Some(tx);
		if let Some(previous) = lock(&self.inner.task).replace(task) {
			previous.abort();
		}

		let now = self.now();
		let (session_data, pending) = {
			let mut state = self.state();
			state.initialized = true;
			state.session_start = now;
			state.page_location = page.url.clone();
			state.user_agent_category = categorize_user_agent(&page.user_agent);
			let section = state.current_section.clone();
			state.section_start_times.insert(section, now);

			let session_data = Properties::new()
				.insert("session_start", to_rfc3339(now))
				.insert("page_title", page.title.clone())
				.insert("page_location", page.url.clone())
				.insert("language", page.language.clone())
				.insert(
					"screen_resolution",
					format!("{}x{}", page.screen.width, page.screen.height),
				)
				.insert(
					"viewport_size",
					format!("{}x{}", page.viewport.width, page.viewport.height),
				)
				.insert(
					"timezone",
					page.timezone_name.clone().unwrap_or_else(|| "UTC".to_string()),
				)
				.insert("user_agent_category", state.user_agent_category);
			(session_data, std::mem::take(&mut state.pending))
		};

		self.track_event(
			"session_start",
			session_data.insert("site_type", "academic_homepage"),
		);
		for (name, params) in pending {
			self.track_event(&name, params);
		}

		info!(client_id = %self.inner.client_id, "GA4 integration initialized");
		true
	}

	/// Tracks an event with the common parameters attached. Before init the
	/// event is queued, dropping the oldest once the queue is full.
	pub fn track_event(&self, name: &str, params: Properties) {
		if !self.inner.config.enabled {
			return;
		}

		let event = {
			let mut state = self.state();
			if !state.initialized {
				if state.pending.len() >= self.inner.config.queue_capacity {
					if let Some((dropped, _)) = state.pending.pop_front() {
						warn!(event = %dropped, "GA4 pre-init queue full, dropped oldest");
					}
				}
				state.pending.push_back((name.to_string(), params));
				return;
			}

			let now = self.now();
			let common = Properties::new()
				.insert("timestamp", to_rfc3339(now))
				.insert("page_location", state.page_location.clone())
				.insert("current_section", state.current_section.clone())
				.insert("user_interacted", state.user_interacted)
				.insert("session_duration", elapsed(state.session_start, now));
			Ga4Event::new(name, params.merge(common))
		};

		debug!(event = name, "GA4 event");
		self.inner.enqueue(event);
	}

	/// Sends an event as-is, without the common parameters.
	fn send_raw(&self, name: &str, params: Properties) {
		if !self.is_initialized() {
			debug!(event = name, "GA4 not initialized, dropping raw event");
			return;
		}
		self.inner.enqueue(Ga4Event::new(name, params));
	}

	/// Emits the one-time `first_user_interaction` event.
	pub fn mark_interaction(&self) {
		if self.inner.first_interaction.swap(true, Ordering::SeqCst) {
			return;
		}
		let (interaction_time, section) = {
			let mut state = self.state();
			state.user_interacted = true;
			(elapsed(state.session_start, self.now()), state.current_section.clone())
		};
		self.track_event(
			"first_user_interaction",
			Properties::new()
				.insert("interaction_time", interaction_time)
				.insert("current_section", section),
		);
	}

	pub fn track_section_change(&self, from_section: Option<&str>, to_section: &str) {
		let now = self.now();
		let time_spent = {
			let mut state = self.state();
			let time_spent = from_section
				.and_then(|from| state.section_start_times.get(from))
				.map(|start| elapsed(*start, now))
				.unwrap_or(0);
			state.current_section = to_section.to_string();
			state.section_start_times.insert(to_section.to_string(), now);
			time_spent
		};

		if let Some(from) = from_section.filter(|_| time_spent > 0) {
			self.track_event(
				"section_exit",
				Properties::new()
					.insert("section_name", from)
					.insert("time_spent_seconds", (time_spent as f64 / 1000.0).round() as u64)
					.insert("engagement_level", categorize_engagement(time_spent)),
			);
		}

		self.track_event(
			"section_enter",
			Properties::new()
				.insert("section_name", to_section)
				.insert("from_section", from_section)
				.insert("navigation_method", "internal_link"),
		);
		self.track_event(
			"navigate",
			Properties::new()
				.insert("from", from_section)
				.insert("to", to_section)
				.insert("academic_section", to_section)
				.insert("visitor_type", "academic_visitor"),
		);
	}

	/// Reports a click on a publication link, plus a standard
	/// `select_content` event describing it as a content item.
	pub fn track_publication_click(&self, title: &str, url: &str) {
		let publication_type = identify_publication_type(url);
		let title = if title.trim().is_empty() {
			"Unknown Publication"
		} else {
			title
		};
		let short_title = truncate(title, 100);

		self.track_event(
			"publication_click",
			Properties::new()
				.insert("publication_type", publication_type)
				.insert("publication_title", short_title.clone())
				.insert("link_url", url)
				.insert("link_domain", link_domain(url))
				.insert("section", "publications")
				.insert("content_type", publication_type),
		);

		let id = content_id(title);
		let variant = self.state().current_section.clone();
		self.send_raw(
			"select_content",
			Properties::new()
				.insert("content_type", "academic_publication")
				.insert("content_id", id.clone())
				.insert(
					"items",
					json!([{
						"item_id": id,
						"item_name": short_title,
						"item_category": "publication",
						"item_category2": publication_type,
						"item_variant": variant,
					}]),
				),
		);
	}

	/// Reports scroll milestones (25, 50, 75, 100); other values are ignored.
	pub fn track_scroll(&self, percentage: u8, section: Option<&str>) {
		if !SCROLL_MILESTONES.contains(&percentage) {
			return;
		}
		let section = section
			.map(str::to_string)
			.unwrap_or_else(|| self.state().current_section.clone());
		let engagement = match percentage {
			75.. => "high",
			50.. => "medium",
			_ => "low",
		};
		self.track_event(
			"scroll",
			Properties::new()
				.insert("percent_scrolled", percentage)
				.insert("section_name", section)
				.insert("engagement_level", engagement),
		);
	}

	pub fn track_external_link(&self, url: &str, link_text: &str, context: Properties) {
		let domain = link_domain(url);
		let section = self.state().current_section.clone();
		self.track_event(
			"click",
			Properties::new()
				.insert("link_domain", domain.clone())
				.insert("link_url", url)
				.insert("link_text", truncate(link_text, 100))
				.insert("link_category", categorize_link_type(url))
				.insert("outbound", true)
				.insert("current_section", section)
				.merge(context),
		);
		self.send_raw(
			"click",
			Properties::new()
				.insert("event_category", "outbound_link")
				.insert("event_label", domain)
				.insert("value", 1),
		);
	}

	pub fn track_search(&self, search_term: &str, result_count: u64) {
		let term = truncate(search_term, 100);
		let section = self.state().current_section.clone();
		self.track_event(
			"search",
			Properties::new()
				.insert("search_term", term.clone())
				.insert("search_result_count", result_count)
				.insert("section", section),
		);
		self.send_raw("search", Properties::new().insert("search_term", term));
	}

	/// Reports a form interaction; a `submit` also emits `form_submit`.
	pub fn track_form_interaction(
		&self,
		form_action: &str,
		form_id: Option<&str>,
		field_count: usize,
		destination: Option<&str>,
	) {
		let form_id = form_id.filter(|id| !id.is_empty()).unwrap_or("unnamed_form");
		let section = self.state().current_section.clone();
		self.track_event(
			"form_interaction",
			Properties::new()
				.insert("form_action", form_action)
				.insert("form_id", form_id)
				.insert("form_fields", field_count)
				.insert("section", section),
		);

		if form_action == "submit" {
			self.send_raw(
				"form_submit",
				Properties::new()
					.insert("form_id", form_id)
					.insert("form_destination", destination.unwrap_or("unknown")),
			);
		}
	}

	pub fn track_error(&self, error_type: &str, message: &str, context: Properties) {
		let (section, category) = {
			let state = self.state();
			(state.current_section.clone(), state.user_agent_category)
		};
		self.track_event(
			"exception",
			Properties::new()
				.insert("description", truncate(&format!("{error_type}: {message}"), 150))
				.insert("fatal", false)
				.insert("error_type", error_type)
				.insert("section", section)
				.insert("user_agent_category", category)
				.merge(context),
		);
	}

	pub fn track_performance(&self, metric_name: &str, value: f64, context: Properties) {
		let section = self.state().current_section.clone();
		self.track_event(
			"timing_complete",
			Properties::new()
				.insert("name", metric_name)
				.insert("value", value.round() as i64)
				.insert("section", section)
				.merge(context),
		);
	}

	pub fn track_engagement_milestone(&self, milestone: &str, data: Properties) {
		let (duration, visited) = {
			let state = self.state();
			(
				elapsed(state.session_start, self.now()),
				state.section_start_times.len(),
			)
		};
		self.track_event(
			"engagement_milestone",
			Properties::new()
				.insert("milestone", milestone)
				.insert("session_duration", duration)
				.insert("sections_visited", visited)
				.merge(data),
		);
	}

	pub fn track_conversion(&self, conversion_name: &str, value: Option<f64>, params: Properties) {
		let section = self.state().current_section.clone();
		self.track_event(
			"conversion",
			Properties::new()
				.insert("event_category", "conversion")
				.insert("event_label", conversion_name)
				.insert("section", section)
				.merge(params)
				.insert_opt("value", value),
		);
	}

	/// Sets a user property sent with every subsequent request.
	pub fn set_user_property(&self, name: &str, value: impl Into<Value>) {
		self
			.state()
			.user_properties
			.insert(name.to_string(), json!({ "value": value.into() }));
	}

	pub fn session_stats(&self) -> Ga4SessionStats {
		let state = self.state();
		Ga4SessionStats {
			session_duration: elapsed(state.session_start, self.now()),
			sections_visited: state.section_start_times.keys().cloned().collect(),
			current_section: state.current_section.clone(),
			user_interacted: state.user_interacted,
			measurement_id: self.inner.config.measurement_id.clone(),
		}
	}

	/// Records a `manual_flush` event and delivers everything queued.
	pub async fn flush(&self) {
		let stats = self.session_stats();
		self.track_event(
			"manual_flush",
			Properties::new()
				.insert("triggered_at", self.now())
				.insert("session_stats", serde_json::to_value(&stats).unwrap_or(Value::Null)),
		);

		let (reply, done) = oneshot::channel();
		match self.inner.command(Ga4Command::Flush(reply)).await {
			Ok(()) => {
				let _ = done.await;
			}
			Err(e) => debug!(error = %e, "GA4 flush skipped"),
		}
	}

	/// Emits `session_end`, delivers what is queued and stops the delivery
	/// task.
	pub async fn destroy(&self) {
		if !self.is_initialized() {
			return;
		}

		let (duration, visited, section) = {
			let state = self.state();
			(
				elapsed(state.session_start, self.now()),
				state.section_start_times.len(),
				state.current_section.clone(),
			)
		};
		self.track_event(
			"session_end",
			Properties::new()
				.insert("session_duration", duration)
				.insert("sections_visited", visited)
				.insert("final_section", section),
		);

		let (reply, done) = oneshot::channel();
		match self.inner.command(Ga4Command::Shutdown(reply)).await {
			Ok(()) => {
				let _ = done.await;
			}
			Err(e) => debug!(error = %e, "GA4 delivery loop already stopped"),
		}
		lock(&self.inner.tx).take();
		lock(&self.inner.task).take();
		self.state().initialized = false;
		info!("GA4 integration destroyed");
	}

	fn state(&self) -> MutexGuard<'_, Ga4State> {
		lock(&self.inner.state)
	}

	fn now(&self) -> Timestamp {
		self.inner.clock.now_ms()
	}
}

impl Ga4Inner {
	fn enqueue(&self, event: Ga4Event) {
		let Some(tx) = lock(&self.tx).clone() else {
			debug!(event = %event.name, "GA4 delivery stopped, dropping event");
			return;
		};
		match tx.try_send(Ga4Command::Enqueue(event)) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(Ga4Command::Enqueue(event))) => {
				warn!(event = %event.name, "GA4 queue full, dropping event");
			}
			Err(_) => debug!("GA4 delivery task gone"),
		}
	}

	async fn command(&self, command: Ga4Command) -> Result<()> {
		let tx = lock(&self.tx).clone().ok_or(AnalyticsError::ClientShutdown)?;
		tx
			.send(command)
			.await
			.map_err(|_| AnalyticsError::ClientShutdown)
	}

	async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Ga4Command>) {
		let interval = self.config.flush_interval();
		info!(flush_interval_secs = interval.as_secs(), "starting GA4 delivery loop");

		let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut batch = Vec::new();

		loop {
			tokio::select! {
				_ = ticker.tick() => self.deliver(&mut batch).await,
				command = rx.recv() => match command {
					Some(Ga4Command::Enqueue(event)) => {
						batch.push(event);
						if batch.len() >= MAX_EVENTS_PER_REQUEST {
							self.deliver(&mut batch).await;
						}
					}
					Some(Ga4Command::Flush(reply)) => {
						self.deliver(&mut batch).await;
						let _ = reply.send(());
					}
					Some(Ga4Command::Shutdown(reply)) => {
						self.deliver(&mut batch).await;
						let _ = reply.send(());
						break;
					}
					None => {
						self.deliver(&mut batch).await;
						break;
					}
				}
			}
		}

		info!("GA4 delivery loop stopped");
	}

	async fn deliver(&self, batch: &mut Vec<Ga4Event>) {
		if batch.is_empty() {
			return;
		}
		let request = Ga4Request {
			client_id: self.client_id.clone(),
			user_properties: lock(&self.state).user_properties.clone(),
			events: std::mem::take(batch),
		};

		let result = self.sink.send(&request).await;
		match result {
			Ok(()) => debug!(events = request.events.len(), "GA4 events delivered"),
			Err(e) => warn!(error = %e, events = request.events.len(), "failed to deliver GA4 events"),
		}
	}
}

impl EventSubscriber for Ga4Adapter {
	fn on_event(&self, event: &EventRecord) {
		match &event.kind {
			EventKind::ScrollDepth { threshold, .. } => {
				self.track_scroll(*threshold, event.section.as_deref())
			}
			EventKind::LinkClick {
				href: Some(href),
				text,
				is_external: true,
				..
			} => {
				if identify_publication_type(href) == "unknown" {
					self.track_external_link(href, text, Properties::new());
				} else {
					self.track_publication_click(text, href);
				}
			}
			EventKind::Error {
				error_type,
				message,
				..
			} => self.track_error(error_type, message, Properties::new()),
			EventKind::PageLoad {
				load_time: Some(load_time),
				..
			} => self.track_performance("page_load_time", *load_time as f64, Properties::new()),
			EventKind::Click { .. } | EventKind::KeyPress { .. } | EventKind::NavigationClick { .. } => {
				self.mark_interaction()
			}
			EventKind::Custom {
				event_name,
				properties,
			} => self.track_event(event_name, Properties::from(properties.clone())),
			_ => {}
		}
	}

	fn on_section_change(&self, transition: &SectionTransition) {
		self.track_section_change(transition.from.as_deref(), &transition.to);
	}
}

/// Coarse user-agent bucket: `mobile`, `tablet`, `bot` or `desktop`.
pub fn categorize_user_agent(user_agent: &str) -> &'static str {
	let ua = user_agent.to_lowercase();
	if ua.contains("mobile") {
		"mobile"
	} else if ua.contains("tablet") {
		"tablet"
	} else if ua.contains("bot") || ua.contains("crawl") {
		"bot"
	} else {
		"desktop"
	}
}

pub fn identify_publication_type(url: &str) -> &'static str {
	PUBLICATION_HOSTS
		.iter()
		.find(|(host, _)| url.contains(host))
		.map(|(_, kind)| *kind)
		.unwrap_or("unknown")
}

pub fn categorize_link_type(url: &str) -> &'static str {
	let url = url.to_lowercase();
	if url.contains("github") {
		"code_repository"
	} else if url.contains("scholar.google") {
		"academic_profile"
	} else if url.contains("linkedin") {
		"professional_profile"
	} else if url.contains("arxiv") {
		"preprint"
	} else if url.contains("doi.org") {
		"journal_article"
	} else if url.contains("ieee") || url.contains("acm") {
		"conference_paper"
	} else {
		"general"
	}
}

/// Buckets time spent in a section.
pub fn categorize_engagement(time_spent_ms: u64) -> &'static str {
	match time_spent_ms / 1000 {
		0..10 => "very_low",
		10..30 => "low",
		30..120 => "medium",
		120..300 => "high",
		_ => "very_high",
	}
}

/// Slug used as a GA4 content id: lowercase alphanumerics joined by `_`,
/// at most 50 characters.
pub fn content_id(title: &str) -> String {
	let lower = title.to_lowercase();
	let stripped = NON_ALPHANUMERIC.replace_all(&lower, "");
	let slug = WHITESPACE.replace_all(&stripped, "_");
	slug.chars().take(50).collect()
}

fn link_domain(url: &str) -> String {
	Url::parse(url)
		.ok()
		.and_then(|u| u.host_str().map(str::to_string))
		.unwrap_or_else(|| "unknown".to_string())
}

fn truncate(s: &str, max_chars: usize) -> String {
	s.chars().take(max_chars).collect()
}

fn elapsed(start: Timestamp, now: Timestamp) -> u64 {
	(now - start).max(0) as u64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::EventBus;
	use crate::clock::ManualClock;
	use std::time::Duration;
	use trail_analytics_core::Ga4ConfigLayer;
	use wiremock::matchers::{body_partial_json, method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[derive(Default)]
	struct RecordingSink {
		requests: Mutex<Vec<Ga4Request>>,
	}

	impl RecordingSink {
		fn events(&self) -> Vec<Ga4Event> {
			lock(&self.requests)
				.iter()
				.flat_map(|r| r.events.clone())
				.collect()
		}

		fn names(&self) -> Vec<String> {
			self
				.events()
				.into_iter()
				.map(|e| e.name)
				.filter(|n| n != "manual_flush")
				.collect()
		}

		fn find(&self, name: &str) -> Ga4Event {
			self.events().into_iter().find(|e| e.name == name).unwrap()
		}
	}

	#[async_trait]
	impl Ga4Sink for RecordingSink {
		async fn send(&self, request: &Ga4Request) -> Result<()> {
			lock(&self.requests).push(request.clone());
			Ok(())
		}
	}

	fn config() -> Ga4Config {
		let mut config = Ga4ConfigLayer::default().finalize();
		config.enabled = true;
		config.measurement_id = Some("G-TEST".into());
		config.api_secret = Some("secret".into());
		config
	}

	fn adapter() -> (Ga4Adapter, Arc<RecordingSink>, Arc<ManualClock>) {
		let sink = Arc::new(RecordingSink::default());
		let clock = Arc::new(ManualClock::new(1_700_000_000_000));
		let adapter = Ga4Adapter::new(config(), sink.clone(), clock.clone());
		(adapter, sink, clock)
	}

	fn page() -> PageContext {
		PageContext::new("https://example.org/")
			.with_title("Home")
			.with_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Mobile/15E148")
			.with_screen(390, 844)
	}

	#[tokio::test]
	async fn queued_events_replay_after_session_start() {
		let (ga4, sink, _) = adapter();
		ga4.track_search("graph neural networks", 3);
		ga4.track_event("early", Properties::new());
		assert!(sink.events().is_empty());

		assert!(ga4.init(&page()));
		ga4.flush().await;

		assert_eq!(sink.names(), vec!["session_start", "search", "early"]);
		let start = sink.find("session_start");
		assert_eq!(start.params["site_type"], "academic_homepage");
		assert_eq!(start.params["user_agent_category"], "mobile");
		assert_eq!(start.params["screen_resolution"], "390x844");
	}

	#[tokio::test]
	async fn events_carry_common_parameters() {
		let (ga4, sink, clock) = adapter();
		ga4.init(&page());
		clock.advance(Duration::from_secs(4));
		ga4.track_conversion("cv_download", Some(1.5), Properties::new().insert("format", "pdf"));
		ga4.flush().await;

		let event = sink.find("conversion");
		assert_eq!(event.params["page_location"], "https://example.org/");
		assert_eq!(event.params["current_section"], "page-top");
		assert_eq!(event.params["session_duration"], 4_000);
		assert_eq!(event.params["user_interacted"], false);
		assert_eq!(event.params["format"], "pdf");
		assert_eq!(event.params["value"], 1.5);
		assert!(event.params.contains_key("timestamp"));
	}

	#[tokio::test]
	async fn section_change_reports_exit_enter_and_navigate() {
		let (ga4, sink, clock) = adapter();
		ga4.init(&page());
		clock.advance(Duration::from_secs(45));
		ga4.track_section_change(Some("page-top"), "publications");
		ga4.flush().await;

		assert_eq!(
			sink.names(),
			vec!["session_start", "section_exit", "section_enter", "navigate"]
		);
		let exit = sink.find("section_exit");
		assert_eq!(exit.params["time_spent_seconds"], 45);
		assert_eq!(exit.params["engagement_level"], "medium");
		assert_eq!(sink.find("navigate").params["current_section"], "publications");
		assert_eq!(ga4.session_stats().sections_visited, vec!["page-top", "publications"]);
	}

	#[tokio::test]
	async fn scroll_reports_milestones_only() {
		let (ga4, sink, _) = adapter();
		ga4.init(&page());
		ga4.track_scroll(30, None);
		ga4.track_scroll(75, Some("awards"));
		ga4.flush().await;

		let scrolls: Vec<_> = sink.events().into_iter().filter(|e| e.name == "scroll").collect();
		assert_eq!(scrolls.len(), 1);
		assert_eq!(scrolls[0].params["section_name"], "awards");
		assert_eq!(scrolls[0].params["engagement_level"], "high");
	}

	#[tokio::test]
	async fn publication_click_adds_select_content() {
		let (ga4, sink, _) = adapter();
		ga4.init(&page());
		ga4.track_publication_click("Deep Nets: A Survey!", "https://arxiv.org/abs/2401.00001");
		ga4.flush().await;

		let click = sink.find("publication_click");
		assert_eq!(click.params["publication_type"], "preprint");
		assert_eq!(click.params["link_domain"], "arxiv.org");

		let select = sink.find("select_content");
		assert_eq!(select.params["content_id"], "deep_nets_a_survey");
		assert_eq!(select.params["items"][0]["item_category2"], "preprint");
		assert!(!select.params.contains_key("session_duration"));
	}

	#[tokio::test]
	async fn bus_events_map_to_ga4_taxonomy() {
		let (ga4, sink, _) = adapter();
		ga4.init(&page());
		let bus = EventBus::new();
		bus.subscribe(Arc::new(ga4.clone()));

		bus.publish(
			&EventRecord::new(
				EventKind::ScrollDepth {
					threshold: 50,
					actual_depth: 52,
					user_interacted: true,
				},
				1,
			)
			.with_section(Some("awards".into())),
		);
		bus.publish(&EventRecord::new(
			EventKind::LinkClick {
				href: Some("https://github.com/example/repo".into()),
				text: "code".into(),
				is_external: true,
				target: None,
				link_type: None,
			},
			2,
		));
		bus.publish(&EventRecord::new(
			EventKind::LinkClick {
				href: Some("https://www.linkedin.com/in/someone".into()),
				text: "profile".into(),
				is_external: true,
				target: None,
				link_type: None,
			},
			3,
		));
		bus.announce_section_change(&SectionTransition {
			from: Some("page-top".into()),
			to: "awards".into(),
			timestamp: 4,
		});
		ga4.flush().await;

		let names = sink.names();
		assert!(names.contains(&"scroll".to_string()));
		assert!(names.contains(&"publication_click".to_string()));
		assert!(names.contains(&"section_enter".to_string()));
		let outbound = sink
			.events()
			.into_iter()
			.find(|e| e.name == "click" && e.params.contains_key("link_category"))
			.unwrap();
		assert_eq!(outbound.params["link_category"], "professional_profile");
		assert_eq!(ga4.session_stats().current_section, "awards");
	}

	#[tokio::test]
	async fn first_interaction_reported_once() {
		let (ga4, sink, _) = adapter();
		ga4.init(&page());
		ga4.mark_interaction();
		ga4.mark_interaction();
		ga4.flush().await;

		let count = sink.names().iter().filter(|n| *n == "first_user_interaction").count();
		assert_eq!(count, 1);
		assert!(ga4.session_stats().user_interacted);
	}

	#[tokio::test]
	async fn destroy_sends_session_end_and_stops() {
		let (ga4, sink, _) = adapter();
		ga4.init(&page());
		ga4.set_user_property("visitor_role", "researcher");
		ga4.destroy().await;

		let names = sink.names();
		assert_eq!(names.last().map(String::as_str), Some("session_end"));
		let requests = lock(&sink.requests).clone();
		assert_eq!(requests.last().unwrap().user_properties["visitor_role"]["value"], "researcher");

		ga4.track_event("after", Properties::new());
		assert!(!ga4.is_initialized());

		let (reply, _done) = oneshot::channel();
		let result = ga4.inner.command(Ga4Command::Flush(reply)).await;
		assert!(matches!(result, Err(AnalyticsError::ClientShutdown)));
		ga4.flush().await;
	}

	#[tokio::test]
	async fn disabled_adapter_is_inert() {
		let sink = Arc::new(RecordingSink::default());
		let ga4 = Ga4Adapter::new(
			Ga4ConfigLayer::default().finalize(),
			sink.clone(),
			Arc::new(ManualClock::new(0)),
		);
		assert!(!ga4.init(&page()));
		ga4.track_event("x", Properties::new());
		ga4.flush().await;
		assert!(sink.events().is_empty());
	}

	#[tokio::test]
	async fn pre_init_queue_is_bounded() {
		let sink = Arc::new(RecordingSink::default());
		let mut config = config();
		config.queue_capacity = 2;
		let ga4 = Ga4Adapter::new(config, sink.clone(), Arc::new(ManualClock::new(0)));
		for name in ["a", "b", "c"] {
			ga4.track_event(name, Properties::new());
		}
		ga4.init(&page());
		ga4.flush().await;
		assert_eq!(sink.names(), vec!["session_start", "b", "c"]);
	}

	#[test]
	fn categorization_helpers() {
		assert_eq!(categorize_user_agent("Googlebot/2.1"), "bot");
		assert_eq!(categorize_user_agent("Mozilla/5.0 (X11; Linux x86_64)"), "desktop");
		assert_eq!(identify_publication_type("https://doi.org/10.1/x"), "journal");
		assert_eq!(identify_publication_type("https://example.com"), "unknown");
		assert_eq!(categorize_link_type("https://dl.acm.org/doi/1"), "conference_paper");
		assert_eq!(categorize_link_type("https://GitHub.com/x"), "code_repository");
		assert_eq!(categorize_engagement(9_999), "very_low");
		assert_eq!(categorize_engagement(10_000), "low");
		assert_eq!(categorize_engagement(119_000), "medium");
		assert_eq!(categorize_engagement(299_000), "high");
		assert_eq!(categorize_engagement(300_000), "very_high");
		assert_eq!(content_id("  Hello,  World "), "_hello_world_");
		assert_eq!(content_id(&"a".repeat(80)).len(), 50);
	}

	#[tokio::test]
	async fn measurement_protocol_sink_posts_and_chunks() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/mp/collect"))
			.and(query_param("measurement_id", "G-TEST"))
			.and(query_param("api_secret", "secret"))
			.and(body_partial_json(json!({"client_id": "client-1"})))
			.respond_with(ResponseTemplate::new(204))
			.expect(2)
			.mount(&server)
			.await;

		let mut config = config();
		config.endpoint = format!("{}/mp/collect", server.uri());
		let sink = MeasurementProtocolSink::new(reqwest::Client::new(), &config).unwrap();
		let request = Ga4Request {
			client_id: "client-1".into(),
			user_properties: Map::new(),
			events: (0..30)
				.map(|i| Ga4Event::new(format!("e{i}"), Properties::new()))
				.collect(),
		};
		sink.send(&request).await.unwrap();
	}

	#[tokio::test]
	async fn measurement_protocol_sink_retries_transient_failures() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(503))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(204))
			.mount(&server)
			.await;

		let mut config = config();
		config.endpoint = format!("{}/mp/collect", server.uri());
		let sink = MeasurementProtocolSink::new(reqwest::Client::new(), &config)
			.unwrap()
			.with_retry(RetryConfig::doubling(3, Duration::from_millis(10)));
		let request = Ga4Request {
			client_id: "c".into(),
			user_properties: Map::new(),
			events: vec![Ga4Event::new("page_view", Properties::new())],
		};
		sink.send(&request).await.unwrap();
		assert_eq!(server.received_requests().await.unwrap().len(), 2);
	}

	#[test]
	fn measurement_protocol_sink_requires_credentials() {
		let mut config = config();
		config.api_secret = None;
		assert!(matches!(
			MeasurementProtocolSink::new(reqwest::Client::new(), &config),
			Err(AnalyticsError::Config(_))
		));
	}
}
