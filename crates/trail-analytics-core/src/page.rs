// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Snapshots of host (browser) state handed to the pipeline.
//!
//! The pipeline never reads the DOM itself. The host describes the page,
//! its layout and each input signal with these plain values.

use serde::{Deserialize, Serialize};

use crate::event::{MemoryInfo, Timestamp, Viewport};
use crate::user::ConnectionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenSize {
	pub width: u32,
	pub height: u32,
}

/// Environment facts read once when the page loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
	pub url: String,
	pub title: String,
	pub referrer: String,
	pub user_agent: String,
	pub platform: String,
	pub language: String,
	pub languages: Vec<String>,
	pub screen: ScreenSize,
	pub viewport: Viewport,
	pub device_pixel_ratio: f64,
	/// IANA zone name, when the host can resolve it.
	pub timezone_name: Option<String>,
	/// Minutes east of UTC.
	pub timezone_offset_minutes: i32,
	pub cookie_enabled: bool,
	pub do_not_track: bool,
	pub connection: Option<ConnectionInfo>,
	/// Epoch-ms at which navigation started.
	pub time_origin: Timestamp,
	pub timing: Option<NavigationTiming>,
	pub memory: Option<MemoryInfo>,
	pub layout: Option<LayoutSnapshot>,
}

impl PageContext {
	/// A desktop page at `url` with neutral defaults for everything else.
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			title: String::new(),
			referrer: String::new(),
			user_agent: String::new(),
			platform: String::new(),
			language: "en-US".to_string(),
			languages: vec!["en-US".to_string()],
			screen: ScreenSize {
				width: 1920,
				height: 1080,
			},
			viewport: Viewport {
				width: 1280,
				height: 800,
			},
			device_pixel_ratio: 1.0,
			timezone_name: None,
			timezone_offset_minutes: 0,
			cookie_enabled: true,
			do_not_track: false,
			connection: None,
			time_origin: 0,
			timing: None,
			memory: None,
			layout: None,
		}
	}

	pub fn with_title(mut self, title: impl Into<String>) -> Self {
		self.title = title.into();
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = user_agent.into();
		self
	}

	pub fn with_screen(mut self, width: u32, height: u32) -> Self {
		self.screen = ScreenSize { width, height };
		self
	}

	pub fn with_timezone(mut self, name: impl Into<String>, offset_minutes: i32) -> Self {
		self.timezone_name = Some(name.into());
		self.timezone_offset_minutes = offset_minutes;
		self
	}

	pub fn with_do_not_track(mut self, do_not_track: bool) -> Self {
		self.do_not_track = do_not_track;
		self
	}

	pub fn with_layout(mut self, layout: LayoutSnapshot) -> Self {
		self.layout = Some(layout);
		self
	}

	pub fn with_time_origin(mut self, time_origin: Timestamp) -> Self {
		self.time_origin = time_origin;
		self
	}

	pub fn with_timing(mut self, timing: NavigationTiming) -> Self {
		self.timing = Some(timing);
		self
	}
}

/// Absolute document offset of a tracked page section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionBounds {
	pub id: String,
	pub top: f64,
}

/// Scroll position and geometry at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSnapshot {
	pub scroll_y: f64,
	pub viewport_height: f64,
	pub document_height: f64,
	pub sections: Vec<SectionBounds>,
}

impl LayoutSnapshot {
	pub fn new(scroll_y: f64, viewport_height: f64, document_height: f64) -> Self {
		Self {
			scroll_y,
			viewport_height,
			document_height,
			sections: Vec::new(),
		}
	}

	pub fn with_section(mut self, id: impl Into<String>, top: f64) -> Self {
		self.sections.push(SectionBounds {
			id: id.into(),
			top,
		});
		self
	}

	/// Same geometry scrolled to `scroll_y`.
	pub fn scrolled_to(&self, scroll_y: f64) -> Self {
		Self {
			scroll_y,
			..self.clone()
		}
	}

	pub fn section_top(&self, id: &str) -> Option<f64> {
		self.sections.iter().find(|s| s.id == id).map(|s| s.top)
	}

	/// Height that can actually be scrolled through.
	pub fn scrollable_height(&self) -> f64 {
		self.document_height - self.viewport_height
	}
}

/// One DOM element on a click path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
	pub tag: String,
	pub id: Option<String>,
	pub class_name: String,
	pub text: String,
	pub href: Option<String>,
	pub target: Option<String>,
	pub role: Option<String>,
	pub has_onclick: bool,
}

impl ElementDescriptor {
	pub fn new(tag: impl Into<String>) -> Self {
		Self {
			tag: tag.into(),
			..Default::default()
		}
	}

	pub fn with_id(mut self, id: impl Into<String>) -> Self {
		self.id = Some(id.into());
		self
	}

	pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
		self.class_name = class_name.into();
		self
	}

	pub fn with_text(mut self, text: impl Into<String>) -> Self {
		self.text = text.into();
		self
	}

	pub fn with_href(mut self, href: impl Into<String>) -> Self {
		self.href = Some(href.into());
		self
	}

	pub fn with_target(mut self, target: impl Into<String>) -> Self {
		self.target = Some(target.into());
		self
	}

	pub fn with_role(mut self, role: impl Into<String>) -> Self {
		self.role = Some(role.into());
		self
	}

	pub fn with_onclick(mut self) -> Self {
		self.has_onclick = true;
		self
	}

	pub fn tag_is(&self, tag: &str) -> bool {
		self.tag.eq_ignore_ascii_case(tag)
	}

	pub fn has_class(&self, class: &str) -> bool {
		self.class_name.split_whitespace().any(|c| c == class)
	}
}

/// A click, with the target element and its ancestors nearest-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
	pub target: ElementDescriptor,
	pub ancestors: Vec<ElementDescriptor>,
	pub x: f64,
	pub y: f64,
}

impl ClickEvent {
	pub fn on(target: ElementDescriptor) -> Self {
		Self {
			target,
			ancestors: Vec::new(),
			x: 0.0,
			y: 0.0,
		}
	}

	pub fn inside(mut self, ancestor: ElementDescriptor) -> Self {
		self.ancestors.push(ancestor);
		self
	}

	pub fn at(mut self, x: f64, y: f64) -> Self {
		self.x = x;
		self.y = y;
		self
	}

	/// The target followed by its ancestors.
	pub fn path(&self) -> impl Iterator<Item = &ElementDescriptor> {
		std::iter::once(&self.target).chain(self.ancestors.iter())
	}

	/// Nearest element on the path (target included) matching `pred`.
	pub fn closest(&self, pred: impl Fn(&ElementDescriptor) -> bool) -> Option<&ElementDescriptor> {
		self.path().find(|el| pred(*el))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
	pub key: String,
	pub ctrl_key: bool,
	pub alt_key: bool,
	pub shift_key: bool,
}

impl KeyEvent {
	pub fn new(key: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			..Default::default()
		}
	}
}

/// An uncaught script error or rejected promise seen by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
	pub error_type: String,
	pub message: String,
	pub source: Option<String>,
	pub line: Option<u32>,
	pub column: Option<u32>,
}

impl ErrorReport {
	pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			error_type: error_type.into(),
			message: message.into(),
			source: None,
			line: None,
			column: None,
		}
	}
}

/// Navigation timing marks, all epoch-ms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationTiming {
	pub navigation_start: Timestamp,
	pub domain_lookup_start: Timestamp,
	pub domain_lookup_end: Timestamp,
	pub connect_start: Timestamp,
	pub connect_end: Timestamp,
	pub request_start: Timestamp,
	pub response_start: Timestamp,
	pub response_end: Timestamp,
	pub dom_loading: Timestamp,
	pub dom_content_loaded_event_end: Timestamp,
	pub dom_complete: Timestamp,
	pub load_event_end: Timestamp,
	pub navigation_type: u8,
	pub redirect_count: u32,
}

/// Durations derived from [`NavigationTiming`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
	pub load_time: i64,
	pub dom_content_loaded_time: i64,
	pub dns_time: i64,
	pub connect_time: i64,
	pub request_time: i64,
	pub response_time: i64,
	pub dom_ready: i64,
	pub navigation_type: u8,
	pub redirect_count: u32,
	pub collected_at: Timestamp,
}

impl NavigationTiming {
	/// Page load time, if the load event has completed.
	pub fn load_time(&self) -> Option<u64> {
		(self.load_event_end > 0 && self.load_event_end >= self.navigation_start)
			.then(|| (self.load_event_end - self.navigation_start) as u64)
	}

	pub fn summary(&self, collected_at: Timestamp) -> PerformanceSummary {
		PerformanceSummary {
			load_time: self.load_event_end - self.navigation_start,
			dom_content_loaded_time: self.dom_content_loaded_event_end - self.navigation_start,
			dns_time: self.domain_lookup_end - self.domain_lookup_start,
			connect_time: self.connect_end - self.connect_start,
			request_time: self.response_start - self.request_start,
			response_time: self.response_end - self.response_start,
			dom_ready: self.dom_complete - self.dom_loading,
			navigation_type: self.navigation_type,
			redirect_count: self.redirect_count,
			collected_at,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityInfo {
	pub hidden: bool,
	pub has_focus: bool,
}

impl VisibilityInfo {
	pub fn visibility_state(&self) -> &'static str {
		if self.hidden {
			"hidden"
		} else {
			"visible"
		}
	}

	pub fn is_active(&self) -> bool {
		!self.hidden && self.has_focus
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn closest_includes_target_then_ancestors() {
		let click = ClickEvent::on(ElementDescriptor::new("span").with_text("Paper"))
			.inside(ElementDescriptor::new("a").with_href("https://arxiv.org"))
			.inside(ElementDescriptor::new("li"));

		let link = click.closest(|el| el.tag_is("a")).unwrap();
		assert_eq!(link.href.as_deref(), Some("https://arxiv.org"));
		assert!(click.closest(|el| el.tag_is("button")).is_none());
	}

	#[test]
	fn has_class_matches_whole_tokens() {
		let el = ElementDescriptor::new("a").with_class("nav-link active");
		assert!(el.has_class("nav-link"));
		assert!(!el.has_class("nav"));
	}

	#[test]
	fn load_time_requires_completed_load() {
		let mut timing = NavigationTiming {
			navigation_start: 1_000,
			..Default::default()
		};
		assert_eq!(timing.load_time(), None);
		timing.load_event_end = 1_850;
		assert_eq!(timing.load_time(), Some(850));
	}

	#[test]
	fn performance_summary_derives_durations() {
		let timing = NavigationTiming {
			navigation_start: 0,
			domain_lookup_start: 10,
			domain_lookup_end: 30,
			connect_start: 30,
			connect_end: 70,
			request_start: 70,
			response_start: 120,
			response_end: 200,
			dom_loading: 210,
			dom_content_loaded_event_end: 400,
			dom_complete: 600,
			load_event_end: 650,
			navigation_type: 0,
			redirect_count: 1,
		};
		let summary = timing.summary(5_000);
		assert_eq!(summary.load_time, 650);
		assert_eq!(summary.dns_time, 20);
		assert_eq!(summary.connect_time, 40);
		assert_eq!(summary.request_time, 50);
		assert_eq!(summary.response_time, 80);
		assert_eq!(summary.dom_ready, 390);
		assert_eq!(summary.collected_at, 5_000);
	}

	#[test]
	fn visibility_is_active_only_when_visible_and_focused() {
		let info = VisibilityInfo {
			hidden: false,
			has_focus: true,
		};
		assert!(info.is_active());
		assert_eq!(info.visibility_state(), "visible");
		assert!(!VisibilityInfo {
			hidden: true,
			has_focus: true
		}
		.is_active());
	}
}
