// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Visitor and session snapshots.
//!
//! The collector runs once per page load. It turns the host's [`PageContext`]
//! into a [`UserInfo`] (device, browser, location) and a [`SessionInfo`]
//! (visit bookkeeping kept in the durable store).

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};
use trail_analytics_core::{
	AnalyticsConfig, Capabilities, DeviceType, PageContext, SessionId, SessionInfo, Timestamp,
	Timezone, UserInfo, UtmParams,
};
use url::Url;

use crate::clock::{to_rfc3339, SharedClock};
use crate::error::StorageError;
use crate::geo::GeoLocator;
use crate::storage::KeyValueStore;

pub const LAST_ACTIVITY_KEY: &str = "analytics_last_activity";
pub const VISIT_COUNT_KEY: &str = "analytics_visit_count";
pub const FIRST_VISIT_KEY: &str = "analytics_first_visit";
pub const PREVIOUS_SESSION_KEY: &str = "analytics_previous_session_id";

const UNKNOWN_TIMEZONE: &str = "Unknown";

static TABLET_UA: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"(?i)tablet|ipad|playbook|silk").expect("valid regex"));

static MOBILE_UA: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)mobile|iphone|ipod|android.*mobile|windows.*phone|blackberry|bb10")
		.expect("valid regex")
});

static VERSION_NUMBER: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("valid regex"));

static LONG_NUMBER: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\b\d{4,}\b").expect("valid regex"));

pub struct Collector {
	store: Arc<dyn KeyValueStore>,
	geo: GeoLocator,
	clock: SharedClock,
	capabilities: Capabilities,
	session_timeout: Duration,
	mask_user_agent: bool,
}

impl Collector {
	pub fn new(
		config: &AnalyticsConfig,
		store: Arc<dyn KeyValueStore>,
		geo: GeoLocator,
		clock: SharedClock,
		capabilities: Capabilities,
	) -> Self {
		Self {
			store,
			geo,
			clock,
			capabilities,
			session_timeout: config.session_timeout(),
			mask_user_agent: config.mask_user_agent,
		}
	}

	/// Builds the visitor snapshot. Never fails: location degrades to the
	/// timezone fallback.
	pub async fn collect_user_info(&self, page: &PageContext) -> UserInfo {
		let timezone = timezone(page);
		let location = self.geo.locate(&timezone.name, self.clock.now_ms()).await;

		let user_agent = if self.mask_user_agent {
			mask_user_agent(&page.user_agent)
		} else {
			page.user_agent.clone()
		};

		let languages = if page.languages.is_empty() {
			vec![page.language.clone()]
		} else {
			page.languages.clone()
		};

		UserInfo {
			user_agent,
			platform: page.platform.clone(),
			screen_resolution: format!("{}x{}", page.screen.width, page.screen.height),
			window_size: format!("{}x{}", page.viewport.width, page.viewport.height),
			device_type: device_type(&page.user_agent, page.screen.width),
			device_pixel_ratio: page.device_pixel_ratio,
			language: page.language.clone(),
			languages,
			timezone,
			cookie_enabled: page.cookie_enabled,
			connection: page.connection.clone(),
			referrer: page.referrer.clone(),
			utm_params: utm_params(&page.url),
			capabilities: self.capabilities.basic(),
			location,
			collected_at: to_rfc3339(self.clock.now_ms()),
		}
	}

	/// Builds the session snapshot and records this visit.
	///
	/// Prior state is read before anything is written, so the returned flags
	/// describe the visitor as they were before this page load.
	pub fn collect_session_info(
		&self,
		page: &PageContext,
		session_id: &SessionId,
		start_time: Timestamp,
	) -> SessionInfo {
		let now = self.clock.now_ms();

		let last_activity = self.read(LAST_ACTIVITY_KEY).and_then(|v| v.parse::<i64>().ok());
		let is_new_session = match last_activity {
			Some(last) => now - last > self.session_timeout.as_millis() as i64,
			None => true,
		};
		let previous_session_id = self.read(PREVIOUS_SESSION_KEY);
		let is_returning_visitor = self.read(FIRST_VISIT_KEY).is_some();
		let visit_count = self
			.read(VISIT_COUNT_KEY)
			.and_then(|v| v.parse::<u64>().ok())
			.unwrap_or(0)
			+ 1;

		self.write(VISIT_COUNT_KEY, &visit_count.to_string());
		self.record_activity(session_id);
		if !is_returning_visitor {
			self.write(FIRST_VISIT_KEY, &to_rfc3339(now));
		}

		let (hash, pathname, search) = location_parts(&page.url);

		debug!(
			session_id = %session_id,
			visit_count,
			is_new_session,
			is_returning_visitor,
			"collected session info"
		);

		SessionInfo {
			session_id: session_id.clone(),
			start_time,
			start_time_iso: to_rfc3339(start_time),
			url: page.url.clone(),
			title: page.title.clone(),
			hash,
			pathname,
			search,
			is_new_session,
			previous_session_id,
			visit_count,
			is_returning_visitor,
		}
	}

	/// Stamps the last-activity time used for session-timeout decisions.
	pub fn record_activity(&self, session_id: &SessionId) {
		self.write(LAST_ACTIVITY_KEY, &self.clock.now_ms().to_string());
		self.write(PREVIOUS_SESSION_KEY, session_id.as_str());
	}

	fn read(&self, key: &str) -> Option<String> {
		self.store.get(key).unwrap_or_else(|e| {
			log_storage_error("read", key, &e);
			None
		})
	}

	fn write(&self, key: &str, value: &str) {
		if let Err(e) = self.store.set(key, value) {
			log_storage_error("write", key, &e);
		}
	}
}

fn log_storage_error(op: &str, key: &str, err: &StorageError) {
	warn!(op, key, error = %err, "visit bookkeeping unavailable");
}

/// Classifies the device from its user agent, then from screen width.
pub fn device_type(user_agent: &str, screen_width: u32) -> DeviceType {
	let ua = user_agent.to_ascii_lowercase();

	if TABLET_UA.is_match(&ua) || is_android_tablet(&ua) || is_windows_touch(&ua) {
		return DeviceType::Tablet;
	}

	if MOBILE_UA.is_match(&ua) {
		return DeviceType::Mobile;
	}

	match screen_width {
		w if w < 768 => DeviceType::Mobile,
		w if w < 1024 => DeviceType::Tablet,
		_ => DeviceType::Desktop,
	}
}

// "android" with no "mobile" anywhere after it.
fn is_android_tablet(ua: &str) -> bool {
	ua.rfind("android")
		.is_some_and(|i| !ua[i..].contains("mobile"))
}

// "windows" followed by "touch" with no "phone" after it.
fn is_windows_touch(ua: &str) -> bool {
	ua.match_indices("windows").any(|(i, _)| {
		let rest = &ua[i..];
		!rest.contains("phone") && rest.contains("touch")
	})
}

pub fn timezone(page: &PageContext) -> Timezone {
	Timezone {
		name: page
			.timezone_name
			.clone()
			.unwrap_or_else(|| UNKNOWN_TIMEZONE.to_string()),
		offset: page.timezone_offset_minutes,
		offset_string: offset_string(page.timezone_offset_minutes),
	}
}

/// Formats minutes east of UTC as `+HH:MM` / `-HH:MM`.
pub fn offset_string(offset_minutes: i32) -> String {
	let sign = if offset_minutes >= 0 { '+' } else { '-' };
	let abs = offset_minutes.unsigned_abs();
	format!("{sign}{:02}:{:02}", abs / 60, abs % 60)
}

pub fn utm_params(page_url: &str) -> UtmParams {
	let mut utm = UtmParams::default();
	let Ok(url) = Url::parse(page_url) else {
		return utm;
	};

	for (key, value) in url.query_pairs() {
		let slot = match key.as_ref() {
			"utm_source" => &mut utm.source,
			"utm_medium" => &mut utm.medium,
			"utm_campaign" => &mut utm.campaign,
			"utm_term" => &mut utm.term,
			"utm_content" => &mut utm.content,
			_ => continue,
		};
		if slot.is_none() {
			*slot = Some(value.into_owned());
		}
	}
	utm
}

/// Replaces version numbers and long digit runs.
pub fn mask_user_agent(user_agent: &str) -> String {
	let masked = VERSION_NUMBER.replace_all(user_agent, "x.x.x");
	LONG_NUMBER.replace_all(&masked, "xxxx").into_owned()
}

// (hash, pathname, search) as the browser location object reports them.
fn location_parts(page_url: &str) -> (String, String, String) {
	match Url::parse(page_url) {
		Ok(url) => (
			url.fragment()
				.filter(|f| !f.is_empty())
				.map(|f| format!("#{f}"))
				.unwrap_or_default(),
			url.path().to_string(),
			url.query()
				.filter(|q| !q.is_empty())
				.map(|q| format!("?{q}"))
				.unwrap_or_default(),
		),
		Err(_) => (String::new(), String::new(), String::new()),
	}
}
