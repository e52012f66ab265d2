// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Visitor, device and location snapshot types.

use serde::{Deserialize, Serialize};

use crate::capability::BasicCapabilities;
use crate::event::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
	Mobile,
	Tablet,
	Desktop,
}

impl DeviceType {
	pub fn as_str(&self) -> &'static str {
		match self {
			DeviceType::Mobile => "mobile",
			DeviceType::Tablet => "tablet",
			DeviceType::Desktop => "desktop",
		}
	}
}

impl std::fmt::Display for DeviceType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timezone {
	pub name: String,
	/// Minutes east of UTC.
	pub offset: i32,
	/// `+HH:MM` / `-HH:MM`.
	pub offset_string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
	pub effective_type: Option<String>,
	pub downlink: Option<f64>,
	pub rtt: Option<u32>,
	pub save_data: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParams {
	pub source: Option<String>,
	pub medium: Option<String>,
	pub campaign: Option<String>,
	pub term: Option<String>,
	pub content: Option<String>,
}

impl UtmParams {
	pub fn is_empty(&self) -> bool {
		self.source.is_none()
			&& self.medium.is_none()
			&& self.campaign.is_none()
			&& self.term.is_none()
			&& self.content.is_none()
	}
}

/// How precise a [`Location`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationAccuracy {
	/// Resolved by an IP geolocation provider.
	City,
	/// Inferred from the visitor's timezone name.
	Timezone,
}

/// Approximate visitor location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
	pub ip: Option<String>,
	pub country: Option<String>,
	pub country_code: Option<String>,
	pub region: Option<String>,
	pub city: Option<String>,
	pub latitude: Option<f64>,
	pub longitude: Option<f64>,
	pub timezone: Option<String>,
	pub isp: Option<String>,
	pub source: String,
	pub accuracy: LocationAccuracy,
	pub timestamp: Timestamp,
}

impl Location {
	pub fn is_fallback(&self) -> bool {
		self.accuracy == LocationAccuracy::Timezone
	}
}

/// One-shot device and browser snapshot for a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
	pub user_agent: String,
	pub platform: String,
	pub screen_resolution: String,
	pub window_size: String,
	pub device_type: DeviceType,
	pub device_pixel_ratio: f64,
	pub language: String,
	pub languages: Vec<String>,
	pub timezone: Timezone,
	pub cookie_enabled: bool,
	pub connection: Option<ConnectionInfo>,
	pub referrer: String,
	pub utm_params: UtmParams,
	pub capabilities: BasicCapabilities,
	pub location: Location,
	pub collected_at: String,
}
