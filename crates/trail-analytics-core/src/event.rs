// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event types for visit telemetry.
//!
//! Every observation the pipeline makes is an [`EventRecord`]: a tagged
//! [`EventKind`] plus the time it happened and the page section it happened
//! in. Records are immutable once built. The sender turns them into
//! [`EnrichedEvent`]s at enqueue time by attaching session and page context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::session::SessionId;

/// Maximum length of a custom event name.
pub const MAX_EVENT_NAME_LENGTH: usize = 200;

/// Maximum size of custom event properties in bytes (64KB).
pub const MAX_PROPERTIES_SIZE: usize = 64 * 1024;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Unique identifier for an enriched event.
///
/// Uses UUIDv7 so identifiers sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for EventId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for EventId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for EventId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Compact description of a clicked element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
	pub tag_name: String,
	pub id: Option<String>,
	pub class_name: Option<String>,
	pub text: Option<String>,
	pub href: Option<String>,
}

/// Viewport-relative pointer position of a click.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
	pub x: f64,
	pub y: f64,
}

/// The type-specific payload of an event.
///
/// Serialized with a `type` tag so the wire format reads
/// `{"type": "scroll_depth", "threshold": 50, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
	PageLoad {
		load_time: Option<u64>,
		title: String,
		referrer: String,
	},
	SectionChange {
		from_section: Option<String>,
		to_section: String,
		/// Milliseconds spent in `from_section` during the visit that just ended.
		time_spent: u64,
	},
	ScrollDepth {
		threshold: u8,
		actual_depth: u32,
		user_interacted: bool,
	},
	Click {
		element: ElementInfo,
		coordinates: Coordinates,
		click_count: u32,
	},
	LinkClick {
		href: Option<String>,
		text: String,
		is_external: bool,
		target: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		link_type: Option<String>,
	},
	NavigationClick {
		target: Option<String>,
		text: String,
		from_section: Option<String>,
	},
	PageFocus {
		inactive_time: u64,
	},
	PageBlur {
		active_time: u64,
	},
	MouseActive {
		inactive_time: u64,
	},
	KeyPress {
		key: String,
		ctrl_key: bool,
		alt_key: bool,
		shift_key: bool,
	},
	Error {
		error_type: String,
		message: String,
		source: Option<String>,
		line: Option<u32>,
		column: Option<u32>,
	},
	PageUnload {
		time_on_page: u64,
	},
	SessionEnd {
		total_duration: u64,
		section_times: BTreeMap<String, u64>,
		max_scroll_depth: u32,
		significant_clicks: u32,
		user_interacted: bool,
		interaction_duration: u64,
	},
	#[serde(rename = "custom_event")]
	Custom {
		event_name: String,
		properties: serde_json::Value,
	},
}

impl EventKind {
	/// The wire name of this event kind.
	pub fn name(&self) -> &'static str {
		match self {
			EventKind::PageLoad { .. } => "page_load",
			EventKind::SectionChange { .. } => "section_change",
			EventKind::ScrollDepth { .. } => "scroll_depth",
			EventKind::Click { .. } => "click",
			EventKind::LinkClick { .. } => "link_click",
			EventKind::NavigationClick { .. } => "navigation_click",
			EventKind::PageFocus { .. } => "page_focus",
			EventKind::PageBlur { .. } => "page_blur",
			EventKind::MouseActive { .. } => "mouse_active",
			EventKind::KeyPress { .. } => "key_press",
			EventKind::Error { .. } => "error",
			EventKind::PageUnload { .. } => "page_unload",
			EventKind::SessionEnd { .. } => "session_end",
			EventKind::Custom { .. } => "custom_event",
		}
	}

	/// Critical events are flushed immediately regardless of buffer fill.
	pub fn is_critical(&self) -> bool {
		matches!(
			self,
			EventKind::SessionEnd { .. }
				| EventKind::PageUnload { .. }
				| EventKind::Error { .. }
				| EventKind::PageLoad { .. }
		)
	}
}

/// A single observation, as emitted onto the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
	#[serde(flatten)]
	pub kind: EventKind,
	pub timestamp: Timestamp,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub section: Option<String>,
}

impl EventRecord {
	pub fn new(kind: EventKind, timestamp: Timestamp) -> Self {
		Self {
			kind,
			timestamp,
			section: None,
		}
	}

	pub fn with_section(mut self, section: Option<String>) -> Self {
		self.section = section;
		self
	}

	pub fn name(&self) -> &'static str {
		self.kind.name()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
	pub width: u32,
	pub height: u32,
}

/// Page context attached to every enriched event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
	pub title: String,
	pub url: String,
	pub referrer: String,
	pub viewport: Viewport,
}

/// JS heap figures, when the host exposes them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
	pub used_js_heap_size: u64,
	pub total_js_heap_size: u64,
	pub js_heap_size_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
	pub time_origin: f64,
	/// Milliseconds since `time_origin`.
	pub now: f64,
	pub memory: Option<MemoryInfo>,
}

/// An event record plus the session and page context it was captured in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedEvent {
	#[serde(flatten)]
	pub record: EventRecord,
	pub session_id: SessionId,
	pub url: String,
	pub user_agent: String,
	pub event_id: EventId,
	pub page_info: PageInfo,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub performance: Option<PerformanceSnapshot>,
}

impl EnrichedEvent {
	pub fn name(&self) -> &'static str {
		self.record.name()
	}
}

/// Validates a custom event name.
///
/// Names start with a lowercase ASCII letter and contain only lowercase
/// alphanumerics and underscores.
pub fn validate_event_name(name: &str) -> Result<()> {
	if name.is_empty() || name.len() > MAX_EVENT_NAME_LENGTH {
		return Err(CoreError::InvalidEventName(name.to_string()));
	}

	let mut chars = name.chars();
	match chars.next() {
		Some(c) if c.is_ascii_lowercase() => {}
		_ => return Err(CoreError::InvalidEventName(name.to_string())),
	}

	if chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
		Ok(())
	} else {
		Err(CoreError::InvalidEventName(name.to_string()))
	}
}

/// Validates that custom properties serialize within [`MAX_PROPERTIES_SIZE`].
pub fn validate_properties_size(properties: &serde_json::Value) -> Result<()> {
	let size = serde_json::to_string(properties)?.len();
	if size > MAX_PROPERTIES_SIZE {
		return Err(CoreError::PropertiesTooLarge(size, MAX_PROPERTIES_SIZE));
	}
	Ok(())
}
