// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Behavioural tracking for one page session.
//!
//! The tracker owns the visitor's current section, per-section dwell time,
//! scroll-depth thresholds, click significance and focus state. It turns host
//! signals into [`EventRecord`]s and publishes them on the [`EventBus`].
//!
//! Tracking is a small state machine:
//!
//! ```text
//!            init/start             blur/hidden
//! Stopped ──────────────▶ Running ──────────────▶ Paused
//!    ▲                       ▲                       │
//!    │ destroy               └───── focus/visible ───┘
//! ```
//!
//! While running exactly one section timer is open; while paused none is.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use trail_analytics_core::{
	AnalyticsConfig, ClickEvent, Coordinates, ElementDescriptor, ElementInfo, ErrorReport,
	EventKind, EventRecord, KeyEvent, LayoutSnapshot, SessionId, Timestamp,
};

use crate::bus::{EventBus, SectionTransition};
use crate::clock::SharedClock;

pub const DEFAULT_SECTION: &str = "page-top";

const SIGNIFICANT_TAGS: [&str; 5] = ["a", "button", "input", "select", "textarea"];
const INTERACTIVE_CLASSES: [&str; 6] = ["btn", "button", "link", "nav", "menu", "clickable"];
const SPECIAL_KEYS: [&str; 12] = [
	"Tab",
	"Enter",
	"Escape",
	"Space",
	"ArrowUp",
	"ArrowDown",
	"ArrowLeft",
	"ArrowRight",
	"Home",
	"End",
	"PageUp",
	"PageDown",
];

const CLASS_NAME_LIMIT: usize = 50;
const ELEMENT_TEXT_LIMIT: usize = 30;
const LINK_TEXT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
	Stopped,
	Running,
	Paused,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
	/// Tracked sections in document order.
	pub sections: Vec<String>,
	pub default_section: String,
	pub scroll_depth_thresholds: Vec<u8>,
	pub scroll_throttle: Duration,
	pub scroll_end_delay: Duration,
	pub mouse_enable_delay: Duration,
	pub mouse_throttle: Duration,
	pub idle_threshold: Duration,
	pub max_error_events: u32,
}

impl Default for TrackerConfig {
	fn default() -> Self {
		Self {
			sections: ["page-top", "publications", "awards", "service"]
				.into_iter()
				.map(String::from)
				.collect(),
			default_section: DEFAULT_SECTION.to_string(),
			scroll_depth_thresholds: vec![25, 50, 75, 100],
			scroll_throttle: Duration::from_millis(500),
			scroll_end_delay: Duration::from_millis(150),
			mouse_enable_delay: Duration::from_secs(3),
			mouse_throttle: Duration::from_secs(2),
			idle_threshold: Duration::from_secs(5 * 60),
			max_error_events: 10,
		}
	}
}

impl From<&AnalyticsConfig> for TrackerConfig {
	fn from(config: &AnalyticsConfig) -> Self {
		let mut thresholds = config.scroll_depth_thresholds.clone();
		thresholds.sort_unstable();
		thresholds.dedup();

		Self {
			sections: config.sections.clone(),
			scroll_depth_thresholds: thresholds,
			max_error_events: config.max_error_events,
			..Self::default()
		}
	}
}

#[derive(Debug)]
struct TrackerState {
	session_id: Option<SessionId>,
	tracking: TrackingState,
	finalized: bool,

	current_section: Option<String>,
	section_started_at: Option<Timestamp>,
	/// Time accumulated in the current section visit across pauses.
	visit_elapsed: u64,
	section_times: BTreeMap<String, u64>,

	triggered_thresholds: BTreeSet<u8>,
	max_scroll_depth: u32,
	last_scroll_at: Option<Timestamp>,
	latest_layout: Option<LayoutSnapshot>,

	user_interacted: bool,
	interaction_started_at: Option<Timestamp>,
	last_interaction_at: Timestamp,
	last_mouse_at: Option<Timestamp>,
	significant_clicks: u32,

	page_active: bool,
	last_active_at: Timestamp,
	blurred_at: Option<Timestamp>,

	error_events: u32,
}

impl TrackerState {
	fn new() -> Self {
		Self {
			session_id: None,
			tracking: TrackingState::Stopped,
			finalized: false,
			current_section: None,
			section_started_at: None,
			visit_elapsed: 0,
			section_times: BTreeMap::new(),
			triggered_thresholds: BTreeSet::new(),
			max_scroll_depth: 0,
			last_scroll_at: None,
			latest_layout: None,
			user_interacted: false,
			interaction_started_at: None,
			last_interaction_at: 0,
			last_mouse_at: None,
			significant_clicks: 0,
			page_active: true,
			last_active_at: 0,
			blurred_at: None,
			error_events: 0,
		}
	}

	fn is_running(&self) -> bool {
		self.tracking == TrackingState::Running && !self.finalized
	}

	fn open_timer(&mut self, now: Timestamp) {
		if self.current_section.is_some() && self.section_started_at.is_none() {
			self.section_started_at = Some(now);
		}
	}

	fn close_timer(&mut self, now: Timestamp) {
		let (Some(section), Some(started)) = (&self.current_section, self.section_started_at.take())
		else {
			return;
		};
		let elapsed = (now - started).max(0) as u64;
		*self.section_times.entry(section.clone()).or_insert(0) += elapsed;
		self.visit_elapsed += elapsed;
		debug!(section = %section, elapsed_ms = elapsed, "closed section timer");
	}

	fn section_times_at(&self, now: Timestamp) -> BTreeMap<String, u64> {
		let mut times = self.section_times.clone();
		if let (Some(section), Some(started)) = (&self.current_section, self.section_started_at) {
			*times.entry(section.clone()).or_insert(0) += (now - started).max(0) as u64;
		}
		times
	}

	fn record(&self, kind: EventKind, now: Timestamp) -> EventRecord {
		EventRecord::new(kind, now).with_section(self.current_section.clone())
	}

	fn note_interaction(&mut self, now: Timestamp) {
		if !self.user_interacted {
			self.user_interacted = true;
			self.interaction_started_at = Some(now);
			debug!("first user interaction, full tracking enabled");
		}
		self.last_interaction_at = now;
	}
}

/// Events and transitions produced under the state lock, published after it
/// is released.
#[derive(Default)]
struct Outbox {
	events: Vec<EventRecord>,
	transitions: Vec<SectionTransition>,
}

struct TrackerInner {
	config: TrackerConfig,
	bus: EventBus,
	clock: SharedClock,
	state: Mutex<TrackerState>,
	scroll_end_task: Mutex<Option<JoinHandle<()>>>,
}

/// Session behaviour tracker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Tracker {
	inner: Arc<TrackerInner>,
}

impl Tracker {
	pub fn new(config: TrackerConfig, bus: EventBus, clock: SharedClock) -> Self {
		Self {
			inner: Arc::new(TrackerInner {
				config,
				bus,
				clock,
				state: Mutex::new(TrackerState::new()),
				scroll_end_task: Mutex::new(None),
			}),
		}
	}

	/// Binds the tracker to a session, picks the initial section and starts
	/// tracking. The initial section assignment emits no `section_change`.
	pub fn init(&self, session_id: SessionId, layout: Option<&LayoutSnapshot>) {
		let now = self.now();
		{
			let mut state = self.state();
			let initial = layout
				.map(|l| self.detect_section(l))
				.unwrap_or_else(|| self.inner.config.default_section.clone());

			state.session_id = Some(session_id.clone());
			state.current_section = Some(initial.clone());
			state.latest_layout = layout.cloned();
			state.last_active_at = now;
			state.last_interaction_at = now;
			debug!(section = %initial, "initial section");
		}
		self.start();
		info!(session_id = %session_id, "tracker initialized");
	}

	pub fn start(&self) {
		let now = self.now();
		let mut state = self.state();
		if state.tracking != TrackingState::Stopped || state.finalized {
			return;
		}
		state.tracking = TrackingState::Running;
		state.open_timer(now);
		debug!("tracking started");
	}

	pub fn pause(&self) {
		let now = self.now();
		let mut state = self.state();
		if !state.is_running() {
			return;
		}
		state.tracking = TrackingState::Paused;
		state.close_timer(now);
		debug!("tracking paused");
	}

	pub fn resume(&self) {
		let now = self.now();
		let mut state = self.state();
		if state.tracking != TrackingState::Paused || state.finalized {
			return;
		}
		state.tracking = TrackingState::Running;
		state.open_timer(now);
		debug!("tracking resumed");
	}

	/// Stops tracking and cancels pending timers. Does not emit a summary.
	pub fn destroy(&self) {
		let now = self.now();
		self.cancel_scroll_end();
		let mut state = self.state();
		state.close_timer(now);
		state.tracking = TrackingState::Stopped;
		debug!("tracker destroyed");
	}

	/// Handles a scroll signal. Throttled, but the latest layout is always
	/// kept and re-evaluated once scrolling settles.
	pub fn handle_scroll(&self, layout: LayoutSnapshot) {
		let now = self.now();
		let throttle = self.inner.config.scroll_throttle.as_millis() as i64;

		let outbox = {
			let mut state = self.state();
			if !state.is_running() {
				return;
			}
			state.latest_layout = Some(layout.clone());

			let throttled = state
				.last_scroll_at
				.is_some_and(|last| now - last < throttle);
			if throttled {
				None
			} else {
				state.last_scroll_at = Some(now);
				Some(self.evaluate_layout(&mut state, &layout, now))
			}
		};

		self.arm_scroll_end();
		if let Some(outbox) = outbox {
			self.dispatch(outbox);
		}
	}

	/// Re-evaluates the last seen layout once scrolling has stopped.
	pub fn scroll_end(&self) {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			if !state.is_running() {
				return;
			}
			let Some(layout) = state.latest_layout.clone() else {
				return;
			};
			self.evaluate_layout(&mut state, &layout, now)
		};
		self.dispatch(outbox);
	}

	/// Moves to `section` as if the visitor had scrolled there.
	pub fn set_section(&self, section: &str) {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			if state.tracking == TrackingState::Stopped || state.finalized {
				return;
			}
			let mut outbox = Outbox::default();
			self.change_section(&mut state, section, now, &mut outbox);
			outbox
		};
		self.dispatch(outbox);
	}

	pub fn handle_click(&self, click: &ClickEvent) {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			state.note_interaction(now);
			let mut outbox = Outbox::default();

			if state.tracking != TrackingState::Stopped && !state.finalized {
				if let Some(nav) = navigation_link(click) {
					outbox.events.push(state.record(
						EventKind::NavigationClick {
							target: nav.href.clone(),
							text: nav.text.trim().to_string(),
							from_section: state.current_section.clone(),
						},
						now,
					));
				}
			}

			if state.is_running() {
				if is_significant(click) {
					state.significant_clicks += 1;
					outbox.events.push(state.record(
						EventKind::Click {
							element: element_info(&click.target),
							coordinates: Coordinates {
								x: click.x,
								y: click.y,
							},
							click_count: state.significant_clicks,
						},
						now,
					));
				}

				if let Some(link) = click.closest(|el| el.tag_is("a")) {
					let href = link.href.clone();
					let is_external = href
						.as_deref()
						.is_some_and(|h| h.starts_with("http") || h.starts_with("//"));
					outbox.events.push(state.record(
						EventKind::LinkClick {
							href,
							text: truncate(link.text.trim(), LINK_TEXT_LIMIT),
							is_external,
							target: link.target.clone(),
							link_type: None,
						},
						now,
					));
				}
			}
			outbox
		};
		self.dispatch(outbox);
	}

	/// Records special keys only; everything else is just an interaction.
	pub fn handle_key(&self, key: &KeyEvent) {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			state.note_interaction(now);
			let mut outbox = Outbox::default();
			if state.is_running() && SPECIAL_KEYS.contains(&key.key.as_str()) {
				outbox.events.push(state.record(
					EventKind::KeyPress {
						key: key.key.clone(),
						ctrl_key: key.ctrl_key,
						alt_key: key.alt_key,
						shift_key: key.shift_key,
					},
					now,
				));
			}
			outbox
		};
		self.dispatch(outbox);
	}

	pub fn handle_touch(&self) {
		let now = self.now();
		self.state().note_interaction(now);
	}

	/// Detects activity resuming after a long idle period. Coordinates are
	/// never recorded.
	pub fn handle_mouse_move(&self) {
		let now = self.now();
		let config = &self.inner.config;
		let outbox = {
			let mut state = self.state();
			if !state.is_running() || !state.user_interacted {
				return;
			}
			let enabled_at = state.interaction_started_at.unwrap_or(now)
				+ config.mouse_enable_delay.as_millis() as i64;
			if now < enabled_at {
				return;
			}
			if state
				.last_mouse_at
				.is_some_and(|last| now - last < config.mouse_throttle.as_millis() as i64)
			{
				return;
			}
			state.last_mouse_at = Some(now);

			let mut outbox = Outbox::default();
			let idle = now - state.last_interaction_at;
			if idle > config.idle_threshold.as_millis() as i64 {
				outbox.events.push(EventRecord::new(
					EventKind::MouseActive {
						inactive_time: idle as u64,
					},
					now,
				));
			}
			state.last_interaction_at = now;
			outbox
		};
		self.dispatch(outbox);
	}

	pub fn handle_focus(&self) {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			let was_inactive = !state.page_active;
			state.page_active = true;
			state.last_active_at = now;

			let mut outbox = Outbox::default();
			if was_inactive {
				if state.tracking == TrackingState::Paused && !state.finalized {
					state.tracking = TrackingState::Running;
					state.open_timer(now);
				}
				let inactive_time = state
					.blurred_at
					.take()
					.map(|at| (now - at).max(0) as u64)
					.unwrap_or(0);
				outbox
					.events
					.push(EventRecord::new(EventKind::PageFocus { inactive_time }, now));
			}
			outbox
		};
		self.dispatch(outbox);
	}

	pub fn handle_blur(&self) {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			if !state.page_active {
				return;
			}
			state.page_active = false;
			state.blurred_at = Some(now);
			let active_time = (now - state.last_active_at).max(0) as u64;

			if state.is_running() {
				state.tracking = TrackingState::Paused;
				state.close_timer(now);
			}

			let mut outbox = Outbox::default();
			outbox
				.events
				.push(EventRecord::new(EventKind::PageBlur { active_time }, now));
			outbox
		};
		self.dispatch(outbox);
	}

	/// Reports a host error, up to the per-session cap.
	pub fn handle_error(&self, report: &ErrorReport) {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			if state.tracking == TrackingState::Stopped {
				return;
			}
			if state.error_events >= self.inner.config.max_error_events {
				debug!(message = %report.message, "error event cap reached, dropping");
				return;
			}
			state.error_events += 1;

			let mut outbox = Outbox::default();
			outbox.events.push(state.record(
				EventKind::Error {
					error_type: report.error_type.clone(),
					message: report.message.clone(),
					source: report.source.clone(),
					line: report.line,
					column: report.column,
				},
				now,
			));
			outbox
		};
		self.dispatch(outbox);
	}

	/// Closes the open section timer and emits the `session_end` summary.
	///
	/// Only the first call has any effect; returns whether it emitted.
	pub fn finalize_session(&self) -> bool {
		let now = self.now();
		let outbox = {
			let mut state = self.state();
			if state.finalized || state.session_id.is_none() {
				return false;
			}
			state.close_timer(now);
			state.finalized = true;

			let total_duration = state.section_times.values().sum();
			let interaction_duration = state
				.interaction_started_at
				.map(|at| (now - at).max(0) as u64)
				.unwrap_or(0);

			let mut outbox = Outbox::default();
			outbox.events.push(state.record(
				EventKind::SessionEnd {
					total_duration,
					section_times: state.section_times.clone(),
					max_scroll_depth: state.max_scroll_depth,
					significant_clicks: state.significant_clicks,
					user_interacted: state.user_interacted,
					interaction_duration,
				},
				now,
			));
			info!(total_duration_ms = total_duration, "session finalized");
			outbox
		};
		self.cancel_scroll_end();
		self.dispatch(outbox);
		true
	}

	/// Per-section dwell time including the in-flight interval.
	pub fn section_times(&self) -> BTreeMap<String, u64> {
		let now = self.now();
		self.state().section_times_at(now)
	}

	pub fn total_session_time(&self) -> u64 {
		self.section_times().values().sum()
	}

	pub fn current_section(&self) -> Option<String> {
		self.state().current_section.clone()
	}

	pub fn state_kind(&self) -> TrackingState {
		self.state().tracking
	}

	pub fn is_finalized(&self) -> bool {
		self.state().finalized
	}

	pub fn max_scroll_depth(&self) -> u32 {
		self.state().max_scroll_depth
	}

	pub fn significant_clicks(&self) -> u32 {
		self.state().significant_clicks
	}

	pub fn user_interacted(&self) -> bool {
		self.state().user_interacted
	}

	fn evaluate_layout(
		&self,
		state: &mut TrackerState,
		layout: &LayoutSnapshot,
		now: Timestamp,
	) -> Outbox {
		let mut outbox = Outbox::default();
		let section = self.detect_section(layout);
		self.change_section(state, &section, now, &mut outbox);
		self.evaluate_scroll_depth(state, layout, now, &mut outbox);
		outbox
	}

	/// The last configured section whose top has crossed the viewport midpoint.
	fn detect_section(&self, layout: &LayoutSnapshot) -> String {
		let midpoint = layout.scroll_y + layout.viewport_height / 2.0;
		self.inner
			.config
			.sections
			.iter()
			.filter(|id| layout.section_top(id).is_some_and(|top| top <= midpoint))
			.last()
			.cloned()
			.unwrap_or_else(|| self.inner.config.default_section.clone())
	}

	fn change_section(&self, state: &mut TrackerState, to: &str, now: Timestamp, outbox: &mut Outbox) {
		if state.current_section.as_deref() == Some(to) {
			return;
		}

		let running = state.is_running();
		if running {
			state.close_timer(now);
		}
		let time_spent = std::mem::take(&mut state.visit_elapsed);
		let from = state.current_section.replace(to.to_string());
		if running {
			state.open_timer(now);
		}
		state.triggered_thresholds.clear();

		debug!(from = ?from, to, time_spent_ms = time_spent, "section change");

		outbox.transitions.push(SectionTransition {
			from: from.clone(),
			to: to.to_string(),
			timestamp: now,
		});
		if from.is_some() {
			outbox.events.push(state.record(
				EventKind::SectionChange {
					from_section: from,
					to_section: to.to_string(),
					time_spent,
				},
				now,
			));
		}
	}

	fn evaluate_scroll_depth(
		&self,
		state: &mut TrackerState,
		layout: &LayoutSnapshot,
		now: Timestamp,
		outbox: &mut Outbox,
	) {
		if !state.user_interacted {
			return;
		}
		let Some(depth) = scroll_percent(layout) else {
			return;
		};
		state.max_scroll_depth = state.max_scroll_depth.max(depth);

		for &threshold in &self.inner.config.scroll_depth_thresholds {
			if depth >= u32::from(threshold) && state.triggered_thresholds.insert(threshold) {
				outbox.events.push(state.record(
					EventKind::ScrollDepth {
						threshold,
						actual_depth: depth,
						user_interacted: true,
					},
					now,
				));
			}
		}
	}

	fn arm_scroll_end(&self) {
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			return;
		};
		let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
		let delay = self.inner.config.scroll_end_delay;
		let task = handle.spawn(async move {
			tokio::time::sleep(delay).await;
			if let Some(inner) = weak.upgrade() {
				Tracker { inner }.scroll_end();
			}
		});

		let previous = self
			.inner
			.scroll_end_task
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.replace(task);
		if let Some(previous) = previous {
			previous.abort();
		}
	}

	fn cancel_scroll_end(&self) {
		let task = self
			.inner
			.scroll_end_task
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.take();
		if let Some(task) = task {
			task.abort();
		}
	}

	fn dispatch(&self, outbox: Outbox) {
		for transition in &outbox.transitions {
			self.inner.bus.announce_section_change(transition);
		}
		for event in &outbox.events {
			self.inner.bus.publish(event);
		}
	}

	fn state(&self) -> MutexGuard<'_, TrackerState> {
		self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn now(&self) -> Timestamp {
		self.inner.clock.now_ms()
	}
}

/// Scrolled percentage of the scrollable height, or `None` when the document
/// does not scroll.
pub fn scroll_percent(layout: &LayoutSnapshot) -> Option<u32> {
	let scrollable = layout.scrollable_height();
	if scrollable <= 0.0 {
		return None;
	}
	let pct = (layout.scroll_y / scrollable * 100.0).round();
	Some(pct.clamp(0.0, 100.0) as u32)
}

/// Whether a click landed on (or inside) something interactive.
pub fn is_significant(click: &ClickEvent) -> bool {
	let target = &click.target;
	if target.tag_is("html") || target.tag_is("body") {
		return false;
	}

	if SIGNIFICANT_TAGS.iter().any(|tag| target.tag_is(tag)) {
		return true;
	}

	let interactive_ancestor = click.closest(|el| {
		el.tag_is("a") || el.tag_is("button") || el.role.as_deref() == Some("button") || el.has_onclick
	});
	if interactive_ancestor.is_some() {
		return true;
	}

	let classes = target.class_name.to_lowercase();
	INTERACTIVE_CLASSES.iter().any(|c| classes.contains(c))
}

// A `nav-link` inside a `navbar-nav` container.
fn navigation_link(click: &ClickEvent) -> Option<&ElementDescriptor> {
	let mut path = click.path();
	let link = path.find(|el| el.has_class("nav-link"))?;
	path.any(|el| el.has_class("navbar-nav")).then_some(link)
}

fn element_info(el: &ElementDescriptor) -> ElementInfo {
	let text = el.text.trim();
	ElementInfo {
		tag_name: el.tag.to_lowercase(),
		id: el.id.clone().filter(|id| !id.is_empty()),
		class_name: (!el.class_name.is_empty()).then(|| truncate(&el.class_name, CLASS_NAME_LIMIT)),
		text: (!text.is_empty()).then(|| truncate(text, ELEMENT_TEXT_LIMIT)),
		href: el.href.clone(),
	}
}

fn truncate(s: &str, max_chars: usize) -> String {
	s.chars().take(max_chars).collect()
}
